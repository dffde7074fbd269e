//! Splat representation and point-set data structure.
//!
//! A splat is parameterized by:
//! - Position (mean μ)
//! - Scale (log-space: exp(scale) gives actual scale)
//! - Rotation (quaternion)
//! - Opacity (logit-space: the active gate activation gives actual opacity)
//! - Mask (logit-space keep-probability, consumed by the mask pruner)
//! - Spherical harmonics coefficients (view-dependent color)

use crate::core::math::sigmoid;
use nalgebra::{Matrix3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// Number of SH coefficients carried per splat (degree 3).
pub const SH_COEFF_COUNT: usize = 16;

/// Maximum SH degree representable by the coefficient bank.
pub const SH_DEGREE_MAX: u32 = 3;

/// A 3D anisotropic splat primitive.
///
/// Covariance is stored factorized as scale + rotation for numerical
/// stability: Σ = R · S · S^T · R^T where S = diag(exp(scale))
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Splat {
    /// Position (mean μ)
    pub position: Vector3<f32>,

    /// Log-space scale (actual scale = exp(scale))
    pub scale: Vector3<f32>,

    /// Rotation as unit quaternion
    pub rotation: UnitQuaternion<f32>,

    /// Opacity in logit-space
    pub opacity: f32,

    /// Mask logit; sigmoid(mask) is the soft "keep probability"
    pub mask: f32,

    /// Spherical harmonics coefficients for view-dependent color,
    /// [16 coefficients × RGB] for degree-3 SH. Index 0 is the DC component.
    pub sh_coeffs: [[f32; 3]; SH_COEFF_COUNT],
}

impl Splat {
    /// Compute the 3D covariance matrix Σ = R · S · S^T · R^T
    pub fn covariance_matrix(&self) -> Matrix3<f32> {
        let rotation_matrix = self.rotation.to_rotation_matrix().into_inner();

        let sx = self.scale.x.exp();
        let sy = self.scale.y.exp();
        let sz = self.scale.z.exp();

        // S · S^T for a diagonal matrix is diag(sx², sy², sz²)
        let s_squared = Matrix3::from_diagonal(&Vector3::new(sx * sx, sy * sy, sz * sz));

        rotation_matrix * s_squared * rotation_matrix.transpose()
    }

    /// Opacity after a plain sigmoid activation.
    ///
    /// During training the opacity activation is owned by the gate
    /// (`optim::gate`); this accessor is the deterministic view used by
    /// pruning decisions and exports.
    pub fn sigmoid_opacity(&self) -> f32 {
        sigmoid(self.opacity)
    }

    /// Deterministic keep probability from the mask logit.
    pub fn mask_probability(&self) -> f32 {
        sigmoid(self.mask)
    }

    /// Actual scale values (exp of stored log values).
    pub fn actual_scale(&self) -> Vector3<f32> {
        Vector3::new(self.scale.x.exp(), self.scale.y.exp(), self.scale.z.exp())
    }

    /// Largest axis of the actual scale, used to decide clone vs. split.
    pub fn max_scale(&self) -> f32 {
        let s = self.actual_scale();
        s.x.max(s.y).max(s.z)
    }
}

/// The trainable point set: an ordered, dynamically-resizable collection.
///
/// Indices are stable between mutation events but not across a
/// densify/prune call (the set is rebuilt).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SplatCloud {
    pub splats: Vec<Splat>,
}

impl SplatCloud {
    pub fn new() -> Self {
        Self { splats: Vec::new() }
    }

    pub fn from_splats(splats: Vec<Splat>) -> Self {
        Self { splats }
    }

    pub fn len(&self) -> usize {
        self.splats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.splats.is_empty()
    }

    pub fn push(&mut self, splat: Splat) {
        self.splats.push(splat);
    }

    /// Keep only the splats whose entry in `keep` is true.
    ///
    /// Callers must resize optimizer state and accumulator arrays with the
    /// same mask, in the same call sequence.
    pub fn retain_by_mask(&mut self, keep: &[bool]) {
        assert_eq!(keep.len(), self.splats.len(), "keep mask/point count mismatch");
        let mut idx = 0;
        self.splats.retain(|_| {
            let k = keep[idx];
            idx += 1;
            k
        });
    }

    /// Half the bounding-box diagonal of all positions.
    ///
    /// A cheap stand-in for the camera-based scene extent when the dataset
    /// does not supply one; size-based densification thresholds are
    /// normalized by this value.
    pub fn bounding_extent(&self) -> f32 {
        if self.splats.is_empty() {
            return 0.0;
        }
        let mut min = Vector3::repeat(f32::INFINITY);
        let mut max = Vector3::repeat(f32::NEG_INFINITY);
        for s in &self.splats {
            min = min.inf(&s.position);
            max = max.sup(&s.position);
        }
        (max - min).norm() * 0.5
    }
}
