//! Pinhole camera model (intrinsics and extrinsics).
//!
//! Cameras are used to:
//! - Project splat means to 2D image coordinates
//! - Transform covariances from world space to camera space
//! - Compute viewing directions for SH evaluation

use nalgebra::{Matrix2x3, Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// A pinhole camera with intrinsic and extrinsic parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Camera {
    /// Focal length in X (pixels)
    pub fx: f32,

    /// Focal length in Y (pixels)
    pub fy: f32,

    /// Principal point X (pixels)
    pub cx: f32,

    /// Principal point Y (pixels)
    pub cy: f32,

    /// Image width (pixels)
    pub width: u32,

    /// Image height (pixels)
    pub height: u32,

    /// Rotation from world to camera coordinates
    pub rotation: Matrix3<f32>,

    /// Translation from world to camera coordinates
    pub translation: Vector3<f32>,
}

impl Camera {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fx: f32,
        fy: f32,
        cx: f32,
        cy: f32,
        width: u32,
        height: u32,
        rotation: Matrix3<f32>,
        translation: Vector3<f32>,
    ) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            width,
            height,
            rotation,
            translation,
        }
    }

    /// Build a camera from a position + row-major rotation + vertical FOV,
    /// the shape viewer clients send.
    pub fn from_pose_fov(
        position: Vector3<f32>,
        rotation: Matrix3<f32>,
        width: u32,
        height: u32,
        fov_y_rad: f32,
    ) -> Self {
        let fy = height as f32 / (2.0 * (fov_y_rad / 2.0).tan());
        let fx = fy; // square pixels
        let cx = width as f32 / 2.0;
        let cy = height as f32 / 2.0;
        // t = -R * camera_position
        let translation = -rotation * position;
        Self::new(fx, fy, cx, cy, width, height, rotation, translation)
    }

    /// Transform a point from world coordinates to camera coordinates.
    ///
    /// p_camera = R * p_world + t
    pub fn world_to_camera(&self, point_world: &Vector3<f32>) -> Vector3<f32> {
        self.rotation * point_world + self.translation
    }

    /// Project a point in camera coordinates to pixel coordinates.
    ///
    /// Returns None if the point is behind the camera (z <= 0).
    pub fn project(&self, point_camera: &Vector3<f32>) -> Option<Vector2<f32>> {
        if point_camera.z <= 0.0 {
            return None;
        }

        let x = point_camera.x / point_camera.z;
        let y = point_camera.y / point_camera.z;

        Some(Vector2::new(self.fx * x + self.cx, self.fy * y + self.cy))
    }

    /// Jacobian of the perspective projection at a camera-space point.
    ///
    /// J = d(u,v)/d(x,y,z) for u = fx·x/z + cx, v = fy·y/z + cy.
    pub fn projection_jacobian(&self, point_camera: &Vector3<f32>) -> Matrix2x3<f32> {
        let z = point_camera.z;
        let inv_z = 1.0 / z;
        let inv_z2 = inv_z * inv_z;
        Matrix2x3::new(
            self.fx * inv_z,
            0.0,
            -self.fx * point_camera.x * inv_z2,
            0.0,
            self.fy * inv_z,
            -self.fy * point_camera.y * inv_z2,
        )
    }

    /// Camera center in world coordinates: C = -R^T * t
    pub fn camera_center(&self) -> Vector3<f32> {
        -self.rotation.transpose() * self.translation
    }

    /// Viewing direction towards a world-space point, for SH evaluation.
    pub fn view_direction(&self, point_world: &Vector3<f32>) -> Vector3<f32> {
        (point_world - self.camera_center()).normalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_camera_projection() {
        let cam = Camera::new(
            100.0,
            100.0,
            50.0,
            50.0,
            100,
            100,
            Matrix3::identity(),
            Vector3::zeros(),
        );

        // Point at (1, 0, 2) projects to (100*1/2 + 50, 50) = (100, 50)
        let p = cam.world_to_camera(&Vector3::new(1.0, 0.0, 2.0));
        let pixel = cam.project(&p).unwrap();
        assert_relative_eq!(pixel.x, 100.0, epsilon = 1e-5);
        assert_relative_eq!(pixel.y, 50.0, epsilon = 1e-5);
    }

    #[test]
    fn test_point_behind_camera() {
        let cam = Camera::new(
            100.0,
            100.0,
            50.0,
            50.0,
            100,
            100,
            Matrix3::identity(),
            Vector3::zeros(),
        );
        assert!(cam.project(&Vector3::new(0.0, 0.0, -1.0)).is_none());
    }

    #[test]
    fn test_from_pose_fov_recovers_center() {
        let position = Vector3::new(1.0, -2.0, 3.0);
        let rotation = Matrix3::identity();
        let cam = Camera::from_pose_fov(position, rotation, 640, 480, 60f32.to_radians());
        assert_relative_eq!(cam.camera_center(), position, epsilon = 1e-5);
    }
}
