//! End-to-end density control through the training loop: clone counts,
//! accumulator consistency across mutations, the opacity reset, and the
//! empty-scene abort.

use compact_splat::core::math::inverse_sigmoid;
use compact_splat::core::{Camera, Splat, SplatCloud, SH_COEFF_COUNT};
use compact_splat::optim::{
    RasterGrads, Rasterizer, RenderedFrame, TrainError, TrainView, Trainer, TrainerConfig,
};
use nalgebra::{Matrix3, UnitQuaternion, Vector3};

/// Rasterizer stub: flat gray image, every point visible with radius 2,
/// and a controllable view-space gradient (1.0 for the first `hot` points,
/// 0.0 for the rest). All parameter gradients are zero so the point set
/// only changes through density control.
struct HotSpotRasterizer {
    hot: usize,
}

impl Rasterizer for HotSpotRasterizer {
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
            radii: vec![2.0; cloud.len()],
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
            viewspace_norm: (0..n).map(|i| if i < self.hot { 1.0 } else { 0.0 }).collect(),
        }
    }
}

fn small_splat(i: usize) -> Splat {
    Splat {
        position: Vector3::new((i % 10) as f32 * 0.1, (i / 10) as f32 * 0.01, 3.0),
        // exp(-5) ~ 0.0067, below percent_dense * extent = 0.01: clones.
        scale: Vector3::repeat(-5.0),
        rotation: UnitQuaternion::identity(),
        opacity: inverse_sigmoid(0.9),
        mask: inverse_sigmoid(0.9),
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

fn config() -> TrainerConfig {
    TrainerConfig {
        iterations: 30,
        densification_interval: 10,
        densify_from_iter: 5,
        densify_until_iter: 100,
        densify_grad_threshold: 2e-4,
        percent_dense: 0.01,
        min_opacity: 0.005,
        opacity_reset_interval: 100_000,
        prune_iterations: vec![],
        sh_degree_interval: 100_000,
        checkpoint_interval: 0,
        log_interval: 0,
        seed: 0,
        ..TrainerConfig::default()
    }
}

#[test]
fn test_fifty_hot_points_clone_exactly_once_per_interval() {
    let splats: Vec<Splat> = (0..1000).map(small_splat).collect();
    let mut trainer = Trainer::new(
        config(),
        SplatCloud::from_splats(splats),
        vec![gray_view()],
        1.0,
        HotSpotRasterizer { hot: 50 },
    )
    .unwrap();

    let mut last_report = None;
    for _ in 0..10 {
        last_report = Some(trainer.step().unwrap());
    }
    let report = last_report.unwrap();
    let densify = report.densify.expect("densify fires at iteration 10");
    assert_eq!(densify.cloned, 50);
    assert_eq!(densify.split, 0);
    assert_eq!(densify.pruned, 0);
    assert_eq!(trainer.cloud().len(), 1050);
}

#[test]
fn test_point_count_grows_by_hot_count_per_event() {
    // The clones land at the end of the point set while the hot indices
    // stay at the front, so each densification adds exactly `hot` points.
    let splats: Vec<Splat> = (0..1000).map(small_splat).collect();
    let mut trainer = Trainer::new(
        config(),
        SplatCloud::from_splats(splats),
        vec![gray_view()],
        1.0,
        HotSpotRasterizer { hot: 50 },
    )
    .unwrap();

    let mut counts = Vec::new();
    for _ in 0..30 {
        let report = trainer.step().unwrap();
        if report.densify.is_some() {
            counts.push(report.point_count);
        }
    }
    assert_eq!(counts, vec![1050, 1100, 1150]);
}

#[test]
fn test_opacity_reset_clamps_every_point() {
    let splats: Vec<Splat> = (0..20).map(small_splat).collect();
    let mut trainer = Trainer::new(
        TrainerConfig {
            opacity_reset_interval: 5,
            densify_from_iter: 100,
            densify_until_iter: 200,
            ..config()
        },
        SplatCloud::from_splats(splats),
        vec![gray_view()],
        1.0,
        HotSpotRasterizer { hot: 0 },
    )
    .unwrap();

    for _ in 0..5 {
        trainer.step().unwrap();
    }
    for splat in &trainer.cloud().splats {
        assert!(
            splat.sigmoid_opacity() <= 0.0101,
            "opacity {} survived the reset",
            splat.sigmoid_opacity()
        );
    }
    assert_eq!(trainer.cloud().len(), 20);
}

#[test]
fn test_opacity_reset_only_fires_inside_densification_window() {
    let splats: Vec<Splat> = (0..20).map(small_splat).collect();
    let mut trainer = Trainer::new(
        TrainerConfig {
            opacity_reset_interval: 10,
            densify_from_iter: 1,
            densify_until_iter: 5,
            ..config()
        },
        SplatCloud::from_splats(splats),
        vec![gray_view()],
        1.0,
        HotSpotRasterizer { hot: 0 },
    )
    .unwrap();

    for _ in 0..10 {
        trainer.step().unwrap();
    }
    // Iteration 10 is a reset multiple, but the window closed at 5; the
    // opacities keep their trained values instead of being clamped.
    for splat in &trainer.cloud().splats {
        assert!(
            splat.sigmoid_opacity() > 0.5,
            "opacity {} was clamped after the window closed",
            splat.sigmoid_opacity()
        );
    }
}

#[test]
fn test_all_points_pruned_aborts_training() {
    let splats: Vec<Splat> = (0..10)
        .map(|i| Splat {
            opacity: -10.0, // far below min_opacity
            ..small_splat(i)
        })
        .collect();
    let mut trainer = Trainer::new(
        TrainerConfig {
            densification_interval: 2,
            densify_from_iter: 1,
            ..config()
        },
        SplatCloud::from_splats(splats),
        vec![gray_view()],
        1.0,
        HotSpotRasterizer { hot: 0 },
    )
    .unwrap();

    trainer.step().unwrap();
    let err = trainer.step().unwrap_err();
    assert!(matches!(err, TrainError::EmptyPointSet));
}
