//! Stochastic opacity activation: a Gumbel-sigmoid relaxation applied to
//! the opacity logits for most of training.
//!
//! Math: sigmoid is the two-logit softmax of (a, 0); adding a pair of
//! independent Gumbel(0,1) samples to the logits and re-normalizing gives
//!
//!   gumbel_sigm(a) = sigmoid((a + g1 - g2) / T)
//!
//! and the Gumbel difference collapses to a single stable expression
//!
//!   g1 - g2 = -ln( ln(u1 + ε) / ln(u2 + ε) )
//!
//! for uniforms u1, u2. As T → 0 the draw converges to a Bernoulli with
//! success probability sigmoid(a); at T = 1 the soft output is a smooth
//! approximation usable for backpropagation.

use crate::core::math::sigmoid;
use crate::optim::TrainError;
use rand::Rng;

/// Which function currently computes opacity from its logit.
///
/// Transitions are one-directional:
/// `Stochastic → HardSigmoid → Disabled`. Once the gate leaves a mode it
/// can never return to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateMode {
    /// Gumbel-sigmoid relaxation; used for most of training.
    Stochastic,
    /// Deterministic sigmoid, no noise; stabilization before the hard cut.
    HardSigmoid,
    /// The gate is no longer consulted; opacity is a plain sigmoid.
    Disabled,
}

/// One gate evaluation: the forward value and its reported derivative.
#[derive(Clone, Copy, Debug)]
pub struct GateSample {
    /// Forward value. Binary for the hard variant, in (0,1) otherwise.
    pub value: f32,
    /// The underlying soft relaxation (equals `value` for soft draws).
    pub soft: f32,
    /// d(value)/d(logit) as reported to the optimizer. For the hard variant
    /// this is the soft derivative (straight-through estimator).
    pub grad: f32,
}

/// Sample the Gumbel-sigmoid relaxation of `logit > 0`.
///
/// With `hard`, the forward value is thresholded at 0.5 to exactly 0 or 1
/// while the gradient still flows through the soft value unchanged.
pub fn gumbel_sigmoid<R: Rng>(
    logit: f32,
    temperature: f32,
    eps: f32,
    hard: bool,
    rng: &mut R,
) -> GateSample {
    debug_assert!(temperature > 0.0);

    let u1: f32 = rng.gen();
    let u2: f32 = rng.gen();
    let noise = -(((u1 + eps).ln() / (u2 + eps).ln()) + eps).ln();

    let soft = sigmoid((logit + noise) / temperature);
    let grad = soft * (1.0 - soft) / temperature;

    let value = if hard {
        if soft > 0.5 {
            1.0
        } else {
            0.0
        }
    } else {
        soft
    };

    GateSample { value, soft, grad }
}

/// The opacity activation, dispatched through a single call site that
/// switches on the current [`GateMode`].
#[derive(Clone, Debug)]
pub struct OpacityGate {
    mode: GateMode,
    pub temperature: f32,
    pub eps: f32,
}

impl OpacityGate {
    /// A zero or negative temperature is a configuration error, rejected
    /// before training starts.
    pub fn new(temperature: f32, eps: f32) -> Result<Self, TrainError> {
        if !(temperature > 0.0) {
            return Err(TrainError::InvalidConfig(format!(
                "gate temperature must be > 0, got {temperature}"
            )));
        }
        Ok(Self {
            mode: GateMode::Stochastic,
            temperature,
            eps,
        })
    }

    pub fn mode(&self) -> GateMode {
        self.mode
    }

    /// Activate one opacity logit under the current mode.
    pub fn activate<R: Rng>(&self, logit: f32, rng: &mut R) -> GateSample {
        match self.mode {
            GateMode::Stochastic => {
                gumbel_sigmoid(logit, self.temperature, self.eps, false, rng)
            }
            GateMode::HardSigmoid | GateMode::Disabled => {
                let s = sigmoid(logit);
                GateSample {
                    value: s,
                    soft: s,
                    grad: s * (1.0 - s),
                }
            }
        }
    }

    /// `Stochastic → HardSigmoid`. Returns true if the mode changed; a gate
    /// already past Stochastic is left untouched (transitions never revert).
    pub fn switch_to_hard_sigmoid(&mut self) -> bool {
        if self.mode == GateMode::Stochastic {
            self.mode = GateMode::HardSigmoid;
            true
        } else {
            false
        }
    }

    /// Terminal transition after the one-time hard mask prune.
    pub fn disable(&mut self) {
        self.mode = GateMode::Disabled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_low_temperature_converges_to_sigmoid() {
        let mut rng = StdRng::seed_from_u64(7);
        let logit = 0.8f32;
        let draws = 20_000;
        let mean: f32 = (0..draws)
            .map(|_| gumbel_sigmoid(logit, 0.01, 1e-10, false, &mut rng).value)
            .sum::<f32>()
            / draws as f32;
        assert_relative_eq!(mean, sigmoid(logit), epsilon = 0.02);
    }

    #[test]
    fn test_hard_variant_is_binary_with_soft_gradient() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..1000 {
            let sample = gumbel_sigmoid(0.3, 1.0, 1e-10, true, &mut rng);
            assert!(sample.value == 0.0 || sample.value == 1.0);
            // Straight-through: the reported gradient is the soft one.
            assert_relative_eq!(
                sample.grad,
                sample.soft * (1.0 - sample.soft) / 1.0,
                epsilon = 1e-6
            );
        }
    }

    #[test]
    fn test_extreme_logits_saturate() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut ones = 0usize;
        let mut zeros = 0usize;
        for _ in 0..500 {
            if gumbel_sigmoid(10.0, 1.0, 1e-10, true, &mut rng).value == 1.0 {
                ones += 1;
            }
            if gumbel_sigmoid(-10.0, 1.0, 1e-10, true, &mut rng).value == 0.0 {
                zeros += 1;
            }
        }
        // Disagreement probability is vanishingly small at |logit| = 10.
        assert!(ones >= 498);
        assert!(zeros >= 498);
    }

    #[test]
    fn test_mode_transitions_are_one_way() {
        let mut gate = OpacityGate::new(1.0, 1e-10).unwrap();
        assert_eq!(gate.mode(), GateMode::Stochastic);

        assert!(gate.switch_to_hard_sigmoid());
        assert_eq!(gate.mode(), GateMode::HardSigmoid);
        // Re-requesting the switch is a no-op.
        assert!(!gate.switch_to_hard_sigmoid());

        gate.disable();
        assert_eq!(gate.mode(), GateMode::Disabled);
        assert!(!gate.switch_to_hard_sigmoid());
        assert_eq!(gate.mode(), GateMode::Disabled);
    }

    #[test]
    fn test_zero_temperature_rejected() {
        assert!(OpacityGate::new(0.0, 1e-10).is_err());
        assert!(OpacityGate::new(-1.0, 1e-10).is_err());
        assert!(OpacityGate::new(f32::NAN, 1e-10).is_err());
    }

    #[test]
    fn test_deterministic_modes_are_plain_sigmoid() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut gate = OpacityGate::new(1.0, 1e-10).unwrap();
        gate.switch_to_hard_sigmoid();
        let s = gate.activate(0.4, &mut rng);
        assert_relative_eq!(s.value, sigmoid(0.4), epsilon = 1e-6);
        gate.disable();
        let s = gate.activate(0.4, &mut rng);
        assert_relative_eq!(s.value, sigmoid(0.4), epsilon = 1e-6);
    }
}
