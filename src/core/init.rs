//! Initialization of the trainable point set from a seed point cloud.

use crate::core::math::inverse_sigmoid;
use crate::core::{Splat, SplatCloud, SH_C0, SH_COEFF_COUNT};
use nalgebra::{UnitQuaternion, Vector3};

/// A seed point from whatever reconstruction produced the input cloud.
#[derive(Clone, Debug)]
pub struct SeedPoint {
    pub position: Vector3<f32>,
    /// sRGB color, 0-255 per channel
    pub color: [u8; 3],
}

fn srgb_u8_to_linear_f32(u: u8) -> f32 {
    let cs = (u as f32) / 255.0;
    if cs <= 0.04045 {
        cs / 12.92
    } else {
        ((cs + 0.055) / 1.055).powf(2.4)
    }
}

fn splat_from_seed(point: &SeedPoint) -> Splat {
    // Small uniform scale (log-space): exp(-4.6) ≈ 0.01 unit radius
    let scale = Vector3::repeat(-4.6);

    // Seed colors are sRGB; SH coefficients represent linear radiance, and
    // the DC coefficient is color / Y_0^0.
    let mut sh_coeffs = [[0.0f32; 3]; SH_COEFF_COUNT];
    sh_coeffs[0] = [
        srgb_u8_to_linear_f32(point.color[0]) / SH_C0,
        srgb_u8_to_linear_f32(point.color[1]) / SH_C0,
        srgb_u8_to_linear_f32(point.color[2]) / SH_C0,
    ];

    Splat {
        position: point.position,
        scale,
        rotation: UnitQuaternion::identity(),
        // inverse_sigmoid(0.1): start mostly transparent so visibility is earned
        opacity: inverse_sigmoid(0.1),
        // Mask starts firmly in "keep" territory; it only becomes trainable
        // after the densification window closes.
        mask: inverse_sigmoid(0.9),
        sh_coeffs,
    }
}

/// Build a `SplatCloud` from seed points.
///
/// One splat per point: position from the point, color in the DC SH
/// coefficient, identity rotation, small uniform scale.
pub fn init_from_seed_points(points: &[SeedPoint]) -> SplatCloud {
    SplatCloud::from_splats(points.iter().map(splat_from_seed).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_from_seed_points() {
        let points = vec![
            SeedPoint {
                position: Vector3::new(1.0, 2.0, 3.0),
                color: [255, 128, 64],
            },
            SeedPoint {
                position: Vector3::new(4.0, 5.0, 6.0),
                color: [100, 200, 50],
            },
        ];

        let cloud = init_from_seed_points(&points);
        assert_eq!(cloud.len(), 2);

        let s0 = &cloud.splats[0];
        assert_eq!(s0.position, Vector3::new(1.0, 2.0, 3.0));
        assert!(s0.scale.x < 0.0); // log-space
        assert!(s0.sh_coeffs[0][0] > 0.0); // DC set
        assert!(s0.mask_probability() > 0.5);
    }
}
