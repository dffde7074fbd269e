//! Scene manifest loading for the training binary.
//!
//! A scene is described by a JSON manifest next to its images:
//! ```json
//! {
//!   "views": [
//!     { "camera": { "fx": ..., "fy": ..., "cx": ..., "cy": ...,
//!                   "width": ..., "height": ...,
//!                   "rotation": [...9 floats...],
//!                   "translation": [x, y, z] },
//!       "image": "images/0001.png" }
//!   ],
//!   "points": [ { "position": [x, y, z], "color": [r, g, b] } ],
//!   "extent": 4.2
//! }
//! ```
//! Image paths are resolved relative to the manifest. Targets are decoded
//! with the `image` crate and converted from sRGB to linear RGB. When no
//! extent is given it is derived from the camera centers (their bounding
//! radius, padded by 10%), falling back to the seed-point bounds.

use crate::core::{init_from_seed_points, Camera, SeedPoint, SplatCloud};
use crate::optim::TrainView;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum SceneError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("manifest parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image decode error for {path}: {source}")]
    Image {
        path: PathBuf,
        source: image::ImageError,
    },

    #[error("image {path} is {actual_w}x{actual_h}, camera expects {expect_w}x{expect_h}")]
    DimensionMismatch {
        path: PathBuf,
        actual_w: u32,
        actual_h: u32,
        expect_w: u32,
        expect_h: u32,
    },

    #[error("manifest has no views")]
    NoViews,

    #[error("manifest has no seed points")]
    NoPoints,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManifestView {
    pub camera: Camera,
    pub image: PathBuf,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManifestPoint {
    pub position: [f32; 3],
    pub color: [u8; 3],
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SceneManifest {
    pub views: Vec<ManifestView>,
    pub points: Vec<ManifestPoint>,
    #[serde(default)]
    pub extent: Option<f32>,
}

/// A loaded scene, ready to hand to the trainer.
#[derive(Debug)]
pub struct Scene {
    pub views: Vec<TrainView>,
    pub cloud: SplatCloud,
    pub extent: f32,
    /// Where the scene came from, echoed to viewer clients.
    pub source_path: PathBuf,
}

fn srgb_u8_to_linear_f32(u: u8) -> f32 {
    let cs = (u as f32) / 255.0;
    if cs <= 0.04045 {
        cs / 12.92
    } else {
        ((cs + 0.055) / 1.055).powf(2.4)
    }
}

fn extent_from_cameras(cameras: &[Camera]) -> f32 {
    let centers: Vec<Vector3<f32>> = cameras.iter().map(|c| c.camera_center()).collect();
    let mean = centers.iter().sum::<Vector3<f32>>() / centers.len() as f32;
    let radius = centers
        .iter()
        .map(|c| (c - mean).norm())
        .fold(0.0f32, f32::max);
    radius * 1.1
}

/// Load a scene manifest and all its target images.
pub fn load_scene<P: AsRef<Path>>(manifest_path: P) -> Result<Scene, SceneError> {
    let manifest_path = manifest_path.as_ref();
    let text = std::fs::read_to_string(manifest_path).map_err(|source| SceneError::Io {
        path: manifest_path.to_path_buf(),
        source,
    })?;
    let manifest: SceneManifest = serde_json::from_str(&text)?;

    if manifest.views.is_empty() {
        return Err(SceneError::NoViews);
    }
    if manifest.points.is_empty() {
        return Err(SceneError::NoPoints);
    }

    let base_dir = manifest_path.parent().unwrap_or_else(|| Path::new("."));

    let mut views = Vec::with_capacity(manifest.views.len());
    for entry in &manifest.views {
        let image_path = base_dir.join(&entry.image);
        let img = image::open(&image_path)
            .map_err(|source| SceneError::Image {
                path: image_path.clone(),
                source,
            })?
            .to_rgb8();
        if img.width() != entry.camera.width || img.height() != entry.camera.height {
            return Err(SceneError::DimensionMismatch {
                path: image_path,
                actual_w: img.width(),
                actual_h: img.height(),
                expect_w: entry.camera.width,
                expect_h: entry.camera.height,
            });
        }
        let target: Vec<Vector3<f32>> = img
            .pixels()
            .map(|p| {
                Vector3::new(
                    srgb_u8_to_linear_f32(p[0]),
                    srgb_u8_to_linear_f32(p[1]),
                    srgb_u8_to_linear_f32(p[2]),
                )
            })
            .collect();
        views.push(TrainView {
            camera: entry.camera.clone(),
            target,
        });
    }

    let seed_points: Vec<SeedPoint> = manifest
        .points
        .iter()
        .map(|p| SeedPoint {
            position: Vector3::new(p.position[0], p.position[1], p.position[2]),
            color: p.color,
        })
        .collect();
    let cloud = init_from_seed_points(&seed_points);

    let extent = manifest.extent.unwrap_or_else(|| {
        let cameras: Vec<Camera> = views.iter().map(|v| v.camera.clone()).collect();
        let from_cameras = extent_from_cameras(&cameras);
        if from_cameras > 0.0 {
            from_cameras
        } else {
            cloud.bounding_extent().max(1e-3)
        }
    });

    Ok(Scene {
        views,
        cloud,
        extent,
        source_path: manifest_path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Matrix3;

    #[test]
    fn test_manifest_json_roundtrip() {
        let manifest = SceneManifest {
            views: vec![ManifestView {
                camera: Camera::new(
                    100.0,
                    100.0,
                    32.0,
                    32.0,
                    64,
                    64,
                    Matrix3::identity(),
                    Vector3::new(0.0, 0.0, 2.0),
                ),
                image: PathBuf::from("images/0001.png"),
            }],
            points: vec![ManifestPoint {
                position: [0.0, 1.0, 2.0],
                color: [255, 0, 128],
            }],
            extent: Some(3.0),
        };

        let json = serde_json::to_string(&manifest).unwrap();
        let back: SceneManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.views.len(), 1);
        assert_eq!(back.points[0].color, [255, 0, 128]);
        assert_eq!(back.extent, Some(3.0));
    }

    #[test]
    fn test_missing_manifest_is_io_error() {
        let err = load_scene("/nonexistent/scene.json").unwrap_err();
        assert!(matches!(err, SceneError::Io { .. }));
    }

    #[test]
    fn test_extent_from_camera_ring() {
        let cameras: Vec<Camera> = (0..4)
            .map(|i| {
                let angle = i as f32 * std::f32::consts::FRAC_PI_2;
                let position = Vector3::new(2.0 * angle.cos(), 0.0, 2.0 * angle.sin());
                Camera::from_pose_fov(position, Matrix3::identity(), 64, 64, 1.0)
            })
            .collect();
        let extent = extent_from_cameras(&cameras);
        approx::assert_relative_eq!(extent, 2.2, epsilon = 1e-4);
    }
}
