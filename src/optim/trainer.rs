//! Training orchestration.
//!
//! One iteration, in fixed order (later steps depend on earlier ones):
//! 1. service the interactive viewer (best-effort),
//! 2. advance the position learning rate and the SH degree warm-up,
//! 3. pick the next training view from the shuffled working set,
//! 4. render and compute the L1 + D-SSIM loss,
//! 5. backpropagate through the rasterizer,
//! 6. accumulate view-space gradient statistics for visible points,
//! 7. densify/prune inside the densification window,
//! 8. run the scheduled hard mask prune,
//! 9. step the optimizer,
//! 10. apply gate-mode transitions,
//! 11. checkpoint.

use crate::core::math::sigmoid;
use crate::core::{Camera, SplatCloud, SH_DEGREE_MAX};
use crate::io::checkpoint::Checkpoint;
use crate::optim::adam::SplatOptimizer;
use crate::optim::density::{DensifyReport, DensifyStats, DensityController};
use crate::optim::gate::{GateMode, GateSample, OpacityGate};
use crate::optim::loss::l1_dssim_loss;
use crate::optim::mask::MaskPruner;
use crate::optim::schedule::ExponLrSchedule;
use crate::optim::{ParamGrads, TrainError};
use crate::viewer::ViewerBridge;
use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Output of one forward render.
#[derive(Clone, Debug)]
pub struct RenderedFrame {
    /// Linear RGB, row-major, `width * height` pixels.
    pub pixels: Vec<Vector3<f32>>,
    pub width: u32,
    pub height: u32,
    /// Screen-space radius per point (0 for culled points).
    pub radii: Vec<f32>,
    /// Whether each point contributed to this frame.
    pub visibility: Vec<bool>,
}

/// Gradients reported by the rasterizer's backward pass, indexed like the
/// point set.
#[derive(Clone, Debug)]
pub struct RasterGrads {
    pub d_position: Vec<Vector3<f32>>,
    pub d_scale: Vec<Vector3<f32>>,
    pub d_rotation: Vec<Vector3<f32>>,
    /// dL/d(effective opacity), before the gate chain rule.
    pub d_effective_opacity: Vec<f32>,
    pub d_sh: Vec<[Vector3<f32>; crate::core::SH_COEFF_COUNT]>,
    /// Norm of the view-space (2D mean) gradient, consumed by the
    /// densification statistics.
    pub viewspace_norm: Vec<f32>,
}

/// The external rendering contract: forward image plus analytic gradients.
///
/// The trainer owns opacity activation (the gate); the rasterizer receives
/// pre-activated effective opacities and reports gradients with respect to
/// them.
pub trait Rasterizer {
    fn render(
        &self,
        cloud: &SplatCloud,
        effective_opacity: &[f32],
        camera: &Camera,
        sh_degree: u32,
    ) -> RenderedFrame;

    #[allow(clippy::too_many_arguments)]
    fn backward(
        &self,
        cloud: &SplatCloud,
        effective_opacity: &[f32],
        camera: &Camera,
        sh_degree: u32,
        frame: &RenderedFrame,
        d_pixels: &[Vector3<f32>],
    ) -> RasterGrads;
}

/// One training view: a posed camera and its target image in linear RGB.
#[derive(Clone, Debug)]
pub struct TrainView {
    pub camera: Camera,
    pub target: Vec<Vector3<f32>>,
}

/// Pseudo-random view selection without replacement: a shuffled working
/// set, refilled and reshuffled when exhausted.
#[derive(Clone, Debug)]
pub struct ViewSampler {
    order: Vec<usize>,
    cursor: usize,
}

impl ViewSampler {
    pub fn new(view_count: usize) -> Self {
        Self {
            order: (0..view_count).collect(),
            cursor: view_count, // force a shuffle on the first draw
        }
    }

    pub fn next(&mut self, rng: &mut StdRng) -> usize {
        if self.cursor >= self.order.len() {
            self.order.shuffle(rng);
            self.cursor = 0;
        }
        let idx = self.order[self.cursor];
        self.cursor += 1;
        idx
    }
}

/// The resolved training configuration, assembled externally and handed to
/// the core as a plain struct. Persisted once at startup as `config.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub iterations: u64,

    pub position_lr_init: f32,
    pub position_lr_final: f32,
    /// Warm-up length for the position rate; 0 disables the warm-up.
    pub position_lr_delay_steps: u32,
    pub position_lr_delay_mult: f32,
    pub position_lr_max_steps: u32,
    pub feature_lr: f32,
    pub opacity_lr: f32,
    pub mask_lr: f32,
    pub scaling_lr: f32,
    pub rotation_lr: f32,

    pub lambda_dssim: f32,
    pub percent_dense: f32,
    pub min_opacity: f32,

    pub densification_interval: u64,
    pub opacity_reset_interval: u64,
    pub densify_from_iter: u64,
    pub densify_until_iter: u64,
    pub densify_grad_threshold: f32,
    /// Screen-space radius prune threshold, active once the first opacity
    /// reset has happened.
    pub size_threshold_px: f32,

    /// Iterations at which the one-time hard mask prune fires.
    pub prune_iterations: Vec<u64>,
    pub gate_temperature: f32,
    pub gate_eps: f32,
    /// Scheduled Stochastic → HardSigmoid switch (equality test).
    pub gate_switch_iteration: Option<u64>,

    pub white_background: bool,
    pub sh_degree_interval: u64,
    pub checkpoint_interval: u64,
    pub log_interval: u64,
    pub seed: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            iterations: 30_000,
            position_lr_init: 0.000_16,
            position_lr_final: 0.000_001_6,
            position_lr_delay_steps: 0,
            position_lr_delay_mult: 0.01,
            position_lr_max_steps: 30_000,
            feature_lr: 0.0025,
            opacity_lr: 0.05,
            mask_lr: 0.05,
            scaling_lr: 0.005,
            rotation_lr: 0.001,
            lambda_dssim: 0.2,
            percent_dense: 0.01,
            min_opacity: 0.005,
            densification_interval: 100,
            opacity_reset_interval: 3000,
            densify_from_iter: 500,
            densify_until_iter: 15_000,
            densify_grad_threshold: 0.0002,
            size_threshold_px: 20.0,
            prune_iterations: vec![25_000],
            gate_temperature: 1.0,
            gate_eps: 1e-10,
            gate_switch_iteration: None,
            white_background: false,
            sh_degree_interval: 1000,
            checkpoint_interval: 7000,
            log_interval: 100,
            seed: 0,
        }
    }
}

impl TrainerConfig {
    pub fn validate(&self) -> Result<(), TrainError> {
        if self.iterations == 0 {
            return Err(TrainError::InvalidConfig("iterations must be > 0".into()));
        }
        if self.densification_interval == 0 {
            return Err(TrainError::InvalidConfig(
                "densification_interval must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.lambda_dssim) {
            return Err(TrainError::InvalidConfig(format!(
                "lambda_dssim must be in [0,1], got {}",
                self.lambda_dssim
            )));
        }
        if !(self.gate_temperature > 0.0) {
            return Err(TrainError::InvalidConfig(format!(
                "gate temperature must be > 0, got {}",
                self.gate_temperature
            )));
        }
        Ok(())
    }
}

/// Per-iteration summary for logging and tests.
#[derive(Clone, Debug)]
pub struct StepReport {
    pub iteration: u64,
    pub loss: f32,
    pub point_count: usize,
    pub densify: Option<DensifyReport>,
    pub mask_pruned: Option<usize>,
}

pub struct Trainer<R: Rasterizer> {
    config: TrainerConfig,
    cloud: SplatCloud,
    views: Vec<TrainView>,
    rasterizer: R,

    optimizer: SplatOptimizer,
    schedule: ExponLrSchedule,
    stats: DensifyStats,
    gate: OpacityGate,
    mask_pruner: MaskPruner,
    controller_policy: DensityControllerPolicy,
    sampler: ViewSampler,
    rng: StdRng,

    iteration: u64,
    sh_degree: u32,
    scene_extent: f32,
    opacity_was_reset: bool,
    ema_loss: f32,
}

/// The policy knobs that survive from config to controller; the controller
/// itself is rebuilt per call because the extent is fixed per run.
#[derive(Clone, Copy, Debug)]
struct DensityControllerPolicy {
    grad_threshold: f32,
    min_opacity: f32,
    percent_dense: f32,
}

impl<R: Rasterizer> Trainer<R> {
    pub fn new(
        config: TrainerConfig,
        cloud: SplatCloud,
        views: Vec<TrainView>,
        scene_extent: f32,
        rasterizer: R,
    ) -> Result<Self, TrainError> {
        config.validate()?;
        if cloud.is_empty() {
            return Err(TrainError::EmptyPointSet);
        }
        if views.is_empty() {
            return Err(TrainError::NoViews);
        }

        let extent = if scene_extent > 0.0 {
            scene_extent
        } else {
            cloud.bounding_extent().max(1e-3)
        };

        let optimizer = SplatOptimizer::new(
            config.position_lr_init * extent,
            config.scaling_lr,
            config.rotation_lr,
            config.opacity_lr,
            config.mask_lr,
            config.feature_lr,
        );
        let schedule = ExponLrSchedule::new(
            config.position_lr_init * extent,
            config.position_lr_final * extent,
            config.position_lr_delay_steps,
            config.position_lr_delay_mult,
            config.position_lr_max_steps,
        );
        let gate = OpacityGate::new(config.gate_temperature, config.gate_eps)?;
        let mask_pruner = MaskPruner::new(config.prune_iterations.clone());
        let stats = DensifyStats::new(cloud.len());
        let sampler = ViewSampler::new(views.len());
        let rng = StdRng::seed_from_u64(config.seed);

        Ok(Self {
            controller_policy: DensityControllerPolicy {
                grad_threshold: config.densify_grad_threshold,
                min_opacity: config.min_opacity,
                percent_dense: config.percent_dense,
            },
            config,
            cloud,
            views,
            rasterizer,
            optimizer,
            schedule,
            stats,
            gate,
            mask_pruner,
            sampler,
            rng,
            iteration: 0,
            sh_degree: 0,
            scene_extent: extent,
            opacity_was_reset: false,
            ema_loss: 0.0,
        })
    }

    /// Rebuild a trainer from a saved checkpoint. The optimizer's parameter
    /// groups are reconstructed at the restored point count before any
    /// iteration runs; prune iterations already in the past are discarded,
    /// the whole schedule once the gate has been disabled.
    pub fn resume(
        config: TrainerConfig,
        views: Vec<TrainView>,
        rasterizer: R,
        checkpoint: Checkpoint,
    ) -> Result<Self, TrainError> {
        let mut trainer = Self::new(
            config,
            checkpoint.cloud,
            views,
            checkpoint.scene_extent,
            rasterizer,
        )?;
        trainer.iteration = checkpoint.iteration;
        trainer.sh_degree = checkpoint.sh_degree;
        trainer.opacity_was_reset = checkpoint.iteration > trainer.config.opacity_reset_interval;
        trainer.optimizer.restore(checkpoint.optimizer);

        match checkpoint.gate_mode {
            GateMode::Stochastic => {}
            GateMode::HardSigmoid => {
                trainer.gate.switch_to_hard_sigmoid();
            }
            GateMode::Disabled => trainer.gate.disable(),
        }
        // A disabled gate means the hard cut already ran; the whole prune
        // schedule is stale, not just the entries in the past.
        let remaining: Vec<u64> = if checkpoint.gate_mode == GateMode::Disabled {
            Vec::new()
        } else {
            trainer
                .config
                .prune_iterations
                .iter()
                .copied()
                .filter(|&it| it > checkpoint.iteration)
                .collect()
        };
        trainer.mask_pruner = MaskPruner::new(remaining);
        Ok(trainer)
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn cloud(&self) -> &SplatCloud {
        &self.cloud
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn sh_degree(&self) -> u32 {
        self.sh_degree
    }

    pub fn gate_mode(&self) -> GateMode {
        self.gate.mode()
    }

    pub fn scene_extent(&self) -> f32 {
        self.scene_extent
    }

    pub fn ema_loss(&self) -> f32 {
        self.ema_loss
    }

    pub fn first_view_camera(&self) -> Option<Camera> {
        self.views.first().map(|v| v.camera.clone())
    }

    pub fn to_checkpoint(&self) -> Checkpoint {
        Checkpoint {
            iteration: self.iteration,
            sh_degree: self.sh_degree,
            gate_mode: self.gate.mode(),
            scene_extent: self.scene_extent,
            cloud: self.cloud.clone(),
            optimizer: self.optimizer.snapshot(),
        }
    }

    fn densification_window(&self, iteration: u64) -> bool {
        iteration > self.config.densify_from_iter && iteration < self.config.densify_until_iter
    }

    /// Whether the keep probability is applied and its logits receive
    /// gradients. The mask joins only once the densification window has
    /// closed, so the keep probabilities settle on a stable point set.
    fn mask_trainable(&self, iteration: u64) -> bool {
        iteration > self.config.densify_until_iter
    }

    /// Activate all opacities under the current gate mode.
    ///
    /// The gate is the opacity activation itself: a Gumbel-sigmoid draw on
    /// the opacity logit while stochastic, a plain sigmoid afterwards. With
    /// `apply_mask` the keep probability `sigmoid(mask)` multiplies in as
    /// well.
    fn effective_opacities(&mut self, apply_mask: bool) -> (Vec<f32>, Vec<GateSample>) {
        let mut effective = Vec::with_capacity(self.cloud.len());
        let mut samples = Vec::with_capacity(self.cloud.len());
        for splat in &self.cloud.splats {
            let sample = self.gate.activate(splat.opacity, &mut self.rng);
            let keep = if apply_mask {
                splat.mask_probability()
            } else {
                1.0
            };
            effective.push(sample.value * keep);
            samples.push(sample);
        }
        (effective, samples)
    }

    /// Chain the rasterizer's effective-opacity gradients back into opacity
    /// and mask logits (product rule through the activation), and pass the
    /// geometric and color gradients through.
    fn assemble_grads(
        &self,
        raster: RasterGrads,
        samples: &[GateSample],
        apply_mask: bool,
    ) -> ParamGrads {
        let n = self.cloud.len();
        let mut grads = ParamGrads::zeros(n);
        grads.d_position = raster.d_position;
        grads.d_scale = raster.d_scale;
        grads.d_rotation = raster.d_rotation;
        grads.d_sh = raster.d_sh;

        for i in 0..n {
            let d_eff = raster.d_effective_opacity[i];
            let keep = if apply_mask {
                sigmoid(self.cloud.splats[i].mask)
            } else {
                1.0
            };
            grads.d_opacity[i] = d_eff * keep * samples[i].grad;
            grads.d_mask[i] = if apply_mask {
                d_eff * samples[i].value * keep * (1.0 - keep)
            } else {
                0.0
            };
        }
        grads
    }

    /// Run one training iteration.
    pub fn step(&mut self) -> Result<StepReport, TrainError> {
        self.iteration += 1;
        let it = self.iteration;

        // Schedule + SH warm-up.
        self.optimizer.set_position_lr(self.schedule.lr(it as i64));
        if it % self.config.sh_degree_interval == 0 && self.sh_degree < SH_DEGREE_MAX {
            self.sh_degree += 1;
        }

        // View selection.
        let view_idx = self.sampler.next(&mut self.rng);

        // Forward + loss.
        let apply_mask = self.mask_trainable(it) && self.gate.mode() != GateMode::Disabled;
        let (effective, samples) = self.effective_opacities(apply_mask);
        let camera = self.views[view_idx].camera.clone();
        let frame = self
            .rasterizer
            .render(&self.cloud, &effective, &camera, self.sh_degree);
        let loss = l1_dssim_loss(
            &frame.pixels,
            &self.views[view_idx].target,
            self.config.lambda_dssim,
            frame.width,
            frame.height,
        );

        // Backward.
        let raster = self.rasterizer.backward(
            &self.cloud,
            &effective,
            &camera,
            self.sh_degree,
            &frame,
            &loss.d_pixels,
        );

        // Densification statistics accumulate only while the window is
        // still open; afterwards nothing consumes them.
        if it < self.config.densify_until_iter {
            self.stats
                .accumulate(&raster.viewspace_norm, &frame.radii, &frame.visibility);
        }

        let grads = self.assemble_grads(raster, &samples, apply_mask);

        // Structural mutations. Gradients are indexed by the pre-mutation
        // point set; when a mutation fires this iteration, the optimizer
        // step is skipped rather than applied to stale indices.
        let mut mutated = false;
        let mut densify_report = None;
        if self.densification_window(it) && it % self.config.densification_interval == 0 {
            let controller = DensityController {
                grad_threshold: self.controller_policy.grad_threshold,
                min_opacity: self.controller_policy.min_opacity,
                percent_dense: self.controller_policy.percent_dense,
                scene_extent: self.scene_extent,
            };
            let size_threshold = if self.opacity_was_reset {
                Some(self.config.size_threshold_px)
            } else {
                None
            };
            let report = controller.densify_and_prune(
                &mut self.cloud,
                &mut self.optimizer,
                &mut self.stats,
                size_threshold,
                &mut self.rng,
            )?;
            densify_report = Some(report);
            mutated = true;
        }

        // Opacity resets are scoped to the densification window.
        if it < self.config.densify_until_iter
            && (it % self.config.opacity_reset_interval == 0
                || (self.config.white_background && it == self.config.densify_from_iter))
        {
            DensityController::reset_opacity(&mut self.cloud, &mut self.optimizer);
            self.opacity_was_reset = true;
        }

        let mask_pruned = self.mask_pruner.maybe_prune(
            it,
            &mut self.cloud,
            &mut self.optimizer,
            &mut self.stats,
            &mut self.gate,
        )?;
        if mask_pruned.is_some() {
            mutated = true;
        }

        // Optimizer step.
        if !mutated {
            self.optimizer.step(&mut self.cloud, &grads);
        }

        // Gate transitions: the scheduled switch first, the densify-until
        // freeze last. Both land on the deterministic sigmoid, so the
        // freeze wins when they coincide; all transitions are one-way.
        if self.config.gate_switch_iteration == Some(it) {
            self.gate.switch_to_hard_sigmoid();
        }
        if it == self.config.densify_until_iter {
            self.gate.switch_to_hard_sigmoid();
        }

        self.ema_loss = if self.ema_loss == 0.0 {
            loss.loss
        } else {
            0.6 * self.ema_loss + 0.4 * loss.loss
        };

        Ok(StepReport {
            iteration: it,
            loss: loss.loss,
            point_count: self.cloud.len(),
            densify: densify_report,
            mask_pruned,
        })
    }

    /// Deterministic preview render for the viewer: opacities use the
    /// deterministic view of the gate, scales are multiplied by
    /// `scaling_modifier`. `apply_mask` weighs opacity by the learned keep
    /// probability (ignored once the gate is disabled); `sh_degree` caps
    /// the color evaluation, letting clients ask for DC-only previews.
    pub fn render_preview(
        &self,
        camera: &Camera,
        scaling_modifier: f32,
        sh_degree: u32,
        apply_mask: bool,
    ) -> RenderedFrame {
        let mut cloud = self.cloud.clone();
        if scaling_modifier != 1.0 && scaling_modifier > 0.0 {
            let log_mod = scaling_modifier.ln();
            for splat in &mut cloud.splats {
                splat.scale += Vector3::repeat(log_mod);
            }
        }
        let masked = apply_mask && self.gate.mode() != GateMode::Disabled;
        let effective: Vec<f32> = cloud
            .splats
            .iter()
            .map(|s| {
                if masked {
                    s.sigmoid_opacity() * s.mask_probability()
                } else {
                    s.sigmoid_opacity()
                }
            })
            .collect();
        let degree = sh_degree.min(self.sh_degree);
        self.rasterizer.render(&cloud, &effective, camera, degree)
    }

    /// Drive the loop to the configured iteration count.
    ///
    /// `out_dir` receives periodic checkpoints; `viewer` is serviced once
    /// per iteration, best-effort.
    pub fn run(
        &mut self,
        mut viewer: Option<&mut ViewerBridge>,
        out_dir: Option<&Path>,
    ) -> anyhow::Result<()> {
        while self.iteration < self.config.iterations {
            if let Some(bridge) = viewer.as_deref_mut() {
                bridge.service(self);
            }

            let report = self.step()?;

            if self.config.log_interval > 0 && report.iteration % self.config.log_interval == 0 {
                eprintln!(
                    "iter {:5}  loss={:.6} (ema {:.6})  points={}",
                    report.iteration, report.loss, self.ema_loss, report.point_count
                );
            }
            if let Some(r) = report.densify {
                eprintln!(
                    "iter {:5}  densify: +{} cloned +{} split -{} pruned => {}",
                    report.iteration, r.cloned, r.split, r.pruned, r.points_after
                );
            }
            if let Some(removed) = report.mask_pruned {
                eprintln!(
                    "iter {:5}  mask prune: -{} => {} points, gate disabled",
                    report.iteration,
                    removed,
                    self.cloud.len()
                );
            }

            if let Some(dir) = out_dir {
                let due = self.config.checkpoint_interval > 0
                    && report.iteration % self.config.checkpoint_interval == 0;
                if due || report.iteration == self.config.iterations {
                    let path = dir.join(format!("checkpoint_{:06}.csp", report.iteration));
                    self.to_checkpoint().save(&path)?;
                    eprintln!("iter {:5}  checkpoint -> {}", report.iteration, path.display());
                }
            }
        }
        Ok(())
    }
}
