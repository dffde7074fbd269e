//! Save a mid-training checkpoint, reload it, and verify the resumed
//! trainer carries identical state.

use compact_splat::core::math::inverse_sigmoid;
use compact_splat::core::{Camera, Splat, SplatCloud, SH_COEFF_COUNT};
use compact_splat::io::checkpoint::Checkpoint;
use compact_splat::optim::{TrainView, Trainer, TrainerConfig};
use compact_splat::render::CpuRasterizer;
use nalgebra::{Matrix3, UnitQuaternion, Vector3};

fn scene_splats() -> Vec<Splat> {
    (0..4)
        .map(|i| Splat {
            position: Vector3::new(i as f32 * 0.2 - 0.3, 0.1 * i as f32, 3.0),
            scale: Vector3::repeat(-2.0),
            rotation: UnitQuaternion::from_euler_angles(0.0, 0.1 * i as f32, 0.0),
            opacity: inverse_sigmoid(0.7),
            mask: inverse_sigmoid(0.9),
            sh_coeffs: [[0.3; 3]; SH_COEFF_COUNT],
        })
        .collect()
}

fn views() -> Vec<TrainView> {
    let camera = Camera::new(
        16.0,
        16.0,
        8.0,
        8.0,
        16,
        16,
        Matrix3::identity(),
        Vector3::zeros(),
    );
    vec![TrainView {
        camera,
        target: vec![Vector3::new(0.3, 0.4, 0.5); 256],
    }]
}

fn config() -> TrainerConfig {
    TrainerConfig {
        iterations: 20,
        densify_from_iter: 100,
        densify_until_iter: 200,
        opacity_reset_interval: 100_000,
        sh_degree_interval: 3,
        prune_iterations: vec![],
        checkpoint_interval: 0,
        log_interval: 0,
        seed: 7,
        ..TrainerConfig::default()
    }
}

fn assert_clouds_bit_equal(a: &SplatCloud, b: &SplatCloud) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.splats.iter().zip(&b.splats) {
        assert_eq!(x.position.map(f32::to_bits), y.position.map(f32::to_bits));
        assert_eq!(x.scale.map(f32::to_bits), y.scale.map(f32::to_bits));
        assert_eq!(
            x.rotation.coords.map(f32::to_bits),
            y.rotation.coords.map(f32::to_bits)
        );
        assert_eq!(x.opacity.to_bits(), y.opacity.to_bits());
        assert_eq!(x.mask.to_bits(), y.mask.to_bits());
        for (cx, cy) in x.sh_coeffs.iter().zip(&y.sh_coeffs) {
            for (vx, vy) in cx.iter().zip(cy) {
                assert_eq!(vx.to_bits(), vy.to_bits());
            }
        }
    }
}

#[test]
fn test_resume_reproduces_trainer_state() {
    let mut trainer = Trainer::new(
        config(),
        SplatCloud::from_splats(scene_splats()),
        views(),
        1.0,
        CpuRasterizer::default(),
    )
    .unwrap();

    for _ in 0..6 {
        trainer.step().unwrap();
    }

    let path = std::env::temp_dir().join(format!(
        "compact_splat_roundtrip_{}.csp",
        std::process::id()
    ));
    trainer.to_checkpoint().save(&path).unwrap();
    let loaded = Checkpoint::load(&path).unwrap();
    std::fs::remove_file(&path).ok();

    let resumed = Trainer::resume(config(), views(), CpuRasterizer::default(), loaded).unwrap();

    assert_eq!(resumed.iteration(), trainer.iteration());
    assert_eq!(resumed.sh_degree(), trainer.sh_degree());
    assert_eq!(resumed.gate_mode(), trainer.gate_mode());
    assert_eq!(
        resumed.scene_extent().to_bits(),
        trainer.scene_extent().to_bits()
    );
    assert_clouds_bit_equal(resumed.cloud(), trainer.cloud());

    // The optimizer's moments and timestep survive the roundtrip.
    assert_eq!(resumed.to_checkpoint().optimizer, trainer.to_checkpoint().optimizer);
}

#[test]
fn test_resumed_trainer_keeps_training() {
    let mut trainer = Trainer::new(
        config(),
        SplatCloud::from_splats(scene_splats()),
        views(),
        1.0,
        CpuRasterizer::default(),
    )
    .unwrap();
    for _ in 0..3 {
        trainer.step().unwrap();
    }

    let path = std::env::temp_dir().join(format!(
        "compact_splat_resume_step_{}.csp",
        std::process::id()
    ));
    trainer.to_checkpoint().save(&path).unwrap();
    let loaded = Checkpoint::load(&path).unwrap();
    std::fs::remove_file(&path).ok();

    let mut resumed =
        Trainer::resume(config(), views(), CpuRasterizer::default(), loaded).unwrap();
    assert_eq!(resumed.iteration(), 3);
    let report = resumed.step().unwrap();
    assert_eq!(report.iteration, 4);
    assert!(report.loss.is_finite());
}

#[test]
fn test_stale_prune_iterations_are_dropped_on_resume() {
    let mut trainer = Trainer::new(
        TrainerConfig {
            prune_iterations: vec![2],
            ..config()
        },
        SplatCloud::from_splats(scene_splats()),
        views(),
        1.0,
        CpuRasterizer::default(),
    )
    .unwrap();
    for _ in 0..3 {
        trainer.step().unwrap();
    }
    // The prune at iteration 2 already fired and disabled the gate.
    assert_eq!(
        trainer.gate_mode(),
        compact_splat::optim::GateMode::Disabled
    );

    let path = std::env::temp_dir().join(format!(
        "compact_splat_stale_prune_{}.csp",
        std::process::id()
    ));
    trainer.to_checkpoint().save(&path).unwrap();
    let loaded = Checkpoint::load(&path).unwrap();
    std::fs::remove_file(&path).ok();

    let mut resumed = Trainer::resume(
        TrainerConfig {
            prune_iterations: vec![2],
            ..config()
        },
        views(),
        CpuRasterizer::default(),
        loaded,
    )
    .unwrap();
    assert_eq!(
        resumed.gate_mode(),
        compact_splat::optim::GateMode::Disabled
    );
    // The stale schedule entry must not fire again.
    let report = resumed.step().unwrap();
    assert!(report.mask_pruned.is_none());
}
