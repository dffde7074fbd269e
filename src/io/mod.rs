//! Persistence: binary checkpoints and scene manifest loading.

pub mod checkpoint;
pub mod scene;

pub use checkpoint::{Checkpoint, CheckpointError};
pub use scene::{load_scene, Scene, SceneError, SceneManifest};
