//! Learning-rate schedule for the position parameter group.
//!
//! Log-space exponential interpolation from `lr_init` to `lr_final` over
//! `max_steps`, with an optional smooth warm-up: for the first
//! `delay_steps` iterations the rate is scaled by
//! `delay_mult + (1 - delay_mult) * sin(π/2 · step/delay_steps)`.
//! Applied once per iteration, to the position group only.

/// Continuous learning-rate decay with warm-up delay.
#[derive(Clone, Copy, Debug)]
pub struct ExponLrSchedule {
    pub lr_init: f32,
    pub lr_final: f32,
    pub delay_steps: u32,
    pub delay_mult: f32,
    pub max_steps: u32,
}

impl ExponLrSchedule {
    pub fn new(
        lr_init: f32,
        lr_final: f32,
        delay_steps: u32,
        delay_mult: f32,
        max_steps: u32,
    ) -> Self {
        Self {
            lr_init,
            lr_final,
            delay_steps,
            delay_mult,
            max_steps,
        }
    }

    /// Learning rate at `step`.
    ///
    /// Returns 0 for negative steps or an inactive (all-zero) schedule; past
    /// `max_steps` the rate holds at `lr_final`.
    pub fn lr(&self, step: i64) -> f32 {
        if step < 0 || (self.lr_init == 0.0 && self.lr_final == 0.0) {
            return 0.0;
        }
        let step = step as f32;

        let delay_rate = if self.delay_steps > 0 {
            let progress = (step / self.delay_steps as f32).clamp(0.0, 1.0);
            self.delay_mult
                + (1.0 - self.delay_mult) * (0.5 * std::f32::consts::PI * progress).sin()
        } else {
            1.0
        };

        let t = (step / self.max_steps.max(1) as f32).clamp(0.0, 1.0);
        let log_lerp = (self.lr_init.ln() * (1.0 - t) + self.lr_final.ln() * t).exp();

        delay_rate * log_lerp
    }
}
