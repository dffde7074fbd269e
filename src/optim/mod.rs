//! Optimization: per-attribute Adam, learning-rate schedule, photometric
//! loss, the Gumbel-sigmoid opacity gate, adaptive density control and the
//! one-time mask prune, tied together by the training loop.

pub mod adam;
pub mod density;
pub mod gate;
pub mod loss;
pub mod mask;
pub mod schedule;
pub mod trainer;

pub use adam::{AdamState, OptimizerSnapshot, SplatOptimizer};
pub use density::{DensifyReport, DensifyStats, DensityController};
pub use gate::{gumbel_sigmoid, GateMode, GateSample, OpacityGate};
pub use loss::{l1_dssim_loss, LossGrads};
pub use mask::MaskPruner;
pub use schedule::ExponLrSchedule;
pub use trainer::{
    RasterGrads, Rasterizer, RenderedFrame, TrainView, Trainer, TrainerConfig, ViewSampler,
};

use crate::core::SH_COEFF_COUNT;
use nalgebra::Vector3;

/// Fatal training-loop errors.
#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    #[error("point set became empty; training cannot continue")]
    EmptyPointSet,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no training views available")]
    NoViews,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Per-point parameter gradients for one iteration, indexed like the cloud.
#[derive(Clone, Debug)]
pub struct ParamGrads {
    pub d_position: Vec<Vector3<f32>>,
    pub d_scale: Vec<Vector3<f32>>,
    pub d_rotation: Vec<Vector3<f32>>,
    pub d_opacity: Vec<f32>,
    pub d_mask: Vec<f32>,
    pub d_sh: Vec<[Vector3<f32>; SH_COEFF_COUNT]>,
}

impl ParamGrads {
    pub fn zeros(point_count: usize) -> Self {
        Self {
            d_position: vec![Vector3::zeros(); point_count],
            d_scale: vec![Vector3::zeros(); point_count],
            d_rotation: vec![Vector3::zeros(); point_count],
            d_opacity: vec![0.0; point_count],
            d_mask: vec![0.0; point_count],
            d_sh: vec![[Vector3::zeros(); SH_COEFF_COUNT]; point_count],
        }
    }

    pub fn len(&self) -> usize {
        self.d_position.len()
    }

    pub fn is_empty(&self) -> bool {
        self.d_position.is_empty()
    }
}
