//! Wire protocol for the interactive viewer.
//!
//! Requests are length-prefixed JSON (u32 LE byte count, then the
//! payload); replies are a small binary header followed by raw RGB bytes
//! and the scene source path:
//! ```text
//! Reply:
//!   - Width: u32, Height: u32
//!   - Pixel byte count: u32, then RGB8 bytes (empty if no camera)
//!   - Path byte count: u32, then UTF-8 path
//! ```

use crate::core::Camera;
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

/// Camera description sent by viewer clients.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CameraParams {
    pub position: [f32; 3],
    /// Row-major rotation matrix.
    pub rotation: [[f32; 3]; 3],
    pub width: u32,
    pub height: u32,
    pub fov_y_deg: f32,
}

impl CameraParams {
    pub fn to_camera(&self) -> Camera {
        let rotation = Matrix3::from_rows(&[
            self.rotation[0].into(),
            self.rotation[1].into(),
            self.rotation[2].into(),
        ]);
        Camera::from_pose_fov(
            Vector3::from(self.position),
            rotation,
            self.width,
            self.height,
            self.fov_y_deg.to_radians(),
        )
    }
}

fn default_true() -> bool {
    true
}

fn default_scaling() -> f32 {
    1.0
}

/// One inbound viewer message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ViewerRequest {
    /// Camera to render a preview from; `None` skips the preview.
    #[serde(default)]
    pub camera: Option<CameraParams>,
    /// False pauses training: the loop keeps exchanging messages until a
    /// request sets this back to true.
    #[serde(default = "default_true")]
    pub do_training: bool,
    /// Render with the full active SH degree (false = DC only).
    #[serde(default = "default_true")]
    pub full_sh: bool,
    /// Weigh preview opacity by the learned keep probability, showing the
    /// scene as the mask prune would leave it.
    #[serde(default = "default_true")]
    pub apply_mask: bool,
    /// False closes the connection after this exchange.
    #[serde(default = "default_true")]
    pub keep_alive: bool,
    /// Multiplier applied to splat scales for the preview.
    #[serde(default = "default_scaling")]
    pub scaling_modifier: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_request_defaults() {
        let req: ViewerRequest = serde_json::from_str("{}").unwrap();
        assert!(req.camera.is_none());
        assert!(req.do_training);
        assert!(req.full_sh);
        assert!(req.apply_mask);
        assert!(req.keep_alive);
        assert_relative_eq!(req.scaling_modifier, 1.0);
    }

    #[test]
    fn test_camera_params_to_camera() {
        let params = CameraParams {
            position: [1.0, 2.0, 3.0],
            rotation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            width: 640,
            height: 480,
            fov_y_deg: 60.0,
        };
        let camera = params.to_camera();
        assert_eq!(camera.width, 640);
        assert_relative_eq!(
            camera.camera_center(),
            Vector3::new(1.0, 2.0, 3.0),
            epsilon = 1e-5
        );
    }

    #[test]
    fn test_malformed_request_is_an_error() {
        assert!(serde_json::from_str::<ViewerRequest>("{not json").is_err());
        assert!(serde_json::from_str::<ViewerRequest>("{\"do_training\": 3}").is_err());
    }
}
