//! # compact-splat: trainable point-based scene reconstruction
//!
//! This crate trains a set of anisotropic splats against rendered images
//! while structurally mutating the point set during training: densifying
//! where reconstruction error is high, pruning useless points, and
//! learning a differentiable keep-mask that is eventually frozen into a
//! hard prune.
//!
//! ## Architecture
//!
//! - `core`: fundamental data structures (splats, cameras, SH, activations)
//! - `optim`: the controller stack — per-attribute Adam, learning-rate
//!   schedule, Gumbel-sigmoid gate, density control, mask pruning and the
//!   training loop
//! - `render`: reference CPU rasterizer implementing the `Rasterizer`
//!   contract (a GPU backend plugs into the same trait)
//! - `io`: binary checkpoints and scene manifest loading
//! - `viewer`: optional TCP bridge for interactive previews

// Core data structures and math
pub mod core;

// Checkpoints and scene loading
pub mod io;

// Optimization and training orchestration
pub mod optim;

// Reference CPU rasterizer
pub mod render;

// Interactive viewer bridge
pub mod viewer;

// Re-export commonly used types at crate root for convenience
pub use crate::core::{Camera, Splat, SplatCloud};
pub use crate::optim::{Rasterizer, TrainError, Trainer, TrainerConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
