//! Gate statistics and mask/gate scheduling through the training loop.

use compact_splat::core::math::{inverse_sigmoid, sigmoid};
use compact_splat::core::{Camera, Splat, SplatCloud, SH_COEFF_COUNT};
use compact_splat::optim::{
    gumbel_sigmoid, GateMode, RasterGrads, Rasterizer, RenderedFrame, TrainView, Trainer,
    TrainerConfig,
};
use nalgebra::{Matrix3, UnitQuaternion, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Rasterizer stub with zero parameter gradients; the point set and the
/// gate schedule are the only moving parts.
struct NullRasterizer;

impl Rasterizer for NullRasterizer {
    fn render(
        &self,
        cloud: &SplatCloud,
        _effective_opacity: &[f32],
        camera: &Camera,
        _sh_degree: u32,
    ) -> RenderedFrame {
        let n = (camera.width * camera.height) as usize;
        RenderedFrame {
            pixels: vec![Vector3::new(0.5, 0.5, 0.5); n],
            width: camera.width,
            height: camera.height,
            radii: vec![1.0; cloud.len()],
            visibility: vec![true; cloud.len()],
        }
    }

    fn backward(
        &self,
        cloud: &SplatCloud,
        _effective_opacity: &[f32],
        _camera: &Camera,
        _sh_degree: u32,
        _frame: &RenderedFrame,
        _d_pixels: &[Vector3<f32>],
    ) -> RasterGrads {
        let n = cloud.len();
        RasterGrads {
            d_position: vec![Vector3::zeros(); n],
            d_scale: vec![Vector3::zeros(); n],
            d_rotation: vec![Vector3::zeros(); n],
            d_effective_opacity: vec![0.0; n],
            d_sh: vec![[Vector3::zeros(); SH_COEFF_COUNT]; n],
            viewspace_norm: vec![0.0; n],
        }
    }
}

fn splat_with_mask(mask: f32) -> Splat {
    Splat {
        position: Vector3::new(0.0, 0.0, 3.0),
        scale: Vector3::repeat(-4.6),
        rotation: UnitQuaternion::identity(),
        opacity: inverse_sigmoid(0.9),
        mask,
        sh_coeffs: [[0.2; 3]; SH_COEFF_COUNT],
    }
}

fn gray_view() -> TrainView {
    TrainView {
        camera: Camera::new(
            8.0,
            8.0,
            4.0,
            4.0,
            8,
            8,
            Matrix3::identity(),
            Vector3::zeros(),
        ),
        target: vec![Vector3::new(0.5, 0.5, 0.5); 64],
    }
}

fn quiet_config() -> TrainerConfig {
    TrainerConfig {
        iterations: 100,
        densify_from_iter: 1000,
        densify_until_iter: 2000,
        opacity_reset_interval: 100_000,
        sh_degree_interval: 100_000,
        prune_iterations: vec![],
        checkpoint_interval: 0,
        log_interval: 0,
        seed: 0,
        ..TrainerConfig::default()
    }
}

#[test]
fn test_gate_firing_rate_matches_keep_probability() {
    // P(soft > 0.5) for the Gumbel-sigmoid relaxation is sigmoid(logit).
    let mut rng = StdRng::seed_from_u64(42);
    let logit = 1.0f32;
    let draws = 20_000;
    let fired = (0..draws)
        .filter(|_| gumbel_sigmoid(logit, 1.0, 1e-10, false, &mut rng).value > 0.5)
        .count();
    let rate = fired as f32 / draws as f32;
    assert!(
        (rate - sigmoid(logit)).abs() < 0.02,
        "firing rate {rate} vs expected {}",
        sigmoid(logit)
    );
}

#[test]
fn test_gate_freezes_when_densification_ends() {
    let cloud = SplatCloud::from_splats(vec![splat_with_mask(inverse_sigmoid(0.9))]);
    let mut trainer = Trainer::new(
        TrainerConfig {
            densify_until_iter: 3,
            densify_from_iter: 2, // empty window, no densify events
            ..quiet_config()
        },
        cloud,
        vec![gray_view()],
        1.0,
        NullRasterizer,
    )
    .unwrap();

    trainer.step().unwrap();
    trainer.step().unwrap();
    assert_eq!(trainer.gate_mode(), GateMode::Stochastic);
    trainer.step().unwrap();
    assert_eq!(trainer.gate_mode(), GateMode::HardSigmoid);

    // One-way: further steps never revert.
    for _ in 0..5 {
        trainer.step().unwrap();
        assert_eq!(trainer.gate_mode(), GateMode::HardSigmoid);
    }
}

#[test]
fn test_scheduled_gate_switch_fires_early() {
    let cloud = SplatCloud::from_splats(vec![splat_with_mask(inverse_sigmoid(0.9))]);
    let mut trainer = Trainer::new(
        TrainerConfig {
            gate_switch_iteration: Some(2),
            ..quiet_config()
        },
        cloud,
        vec![gray_view()],
        1.0,
        NullRasterizer,
    )
    .unwrap();

    trainer.step().unwrap();
    assert_eq!(trainer.gate_mode(), GateMode::Stochastic);
    trainer.step().unwrap();
    assert_eq!(trainer.gate_mode(), GateMode::HardSigmoid);
}

#[test]
fn test_mask_prune_removes_rejected_points_and_disables_gate() {
    let keep = inverse_sigmoid(0.9);
    let drop = inverse_sigmoid(0.1);
    let cloud = SplatCloud::from_splats(vec![
        splat_with_mask(keep),
        splat_with_mask(drop),
        splat_with_mask(keep),
        splat_with_mask(drop),
        splat_with_mask(drop),
        splat_with_mask(keep),
    ]);
    let mut trainer = Trainer::new(
        TrainerConfig {
            prune_iterations: vec![4],
            ..quiet_config()
        },
        cloud,
        vec![gray_view()],
        1.0,
        NullRasterizer,
    )
    .unwrap();

    let mut pruned = None;
    for _ in 0..4 {
        pruned = trainer.step().unwrap().mask_pruned;
    }
    assert_eq!(pruned, Some(3));
    assert_eq!(trainer.cloud().len(), 3);
    assert_eq!(trainer.gate_mode(), GateMode::Disabled);
    for splat in &trainer.cloud().splats {
        assert!(splat.mask_probability() >= 0.5);
    }

    // The gate stays disabled for the rest of the run.
    for _ in 0..5 {
        let report = trainer.step().unwrap();
        assert!(report.mask_pruned.is_none());
        assert_eq!(trainer.gate_mode(), GateMode::Disabled);
    }
}
