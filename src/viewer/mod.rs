//! Optional interactive viewer: TCP bridge and wire protocol.

pub mod bridge;
pub mod protocol;

pub use bridge::{PollResult, ViewerBridge};
pub use protocol::{CameraParams, ViewerRequest};
