//! Real spherical harmonics up to degree 3, for view-dependent color.
//!
//! Splats store color as a bank of 16 SH coefficients per channel. The
//! active degree grows during training, so evaluation takes the degree and
//! reads only the first `(degree + 1)^2` coefficients.

use crate::core::SH_COEFF_COUNT;
use nalgebra::Vector3;

/// Y_0^0 constant; also used to convert a flat color into a DC coefficient.
pub const SH_C0: f32 = 0.282_094_79;

const SH_C1: f32 = 0.488_602_51;
const SH_C2: [f32; 5] = [
    1.092_548_4,
    -1.092_548_4,
    0.315_391_57,
    -1.092_548_4,
    0.546_274_2,
];
const SH_C3: [f32; 7] = [
    -0.590_043_6,
    2.890_611_4,
    -0.457_045_8,
    0.373_176_33,
    -0.457_045_8,
    1.445_305_7,
    -0.590_043_6,
];

/// Number of coefficients active at `degree`.
pub fn sh_coeffs_for_degree(degree: u32) -> usize {
    ((degree + 1) * (degree + 1)) as usize
}

/// Basis function values for a normalized direction, all 16 of them.
pub fn sh_basis(direction: &Vector3<f32>) -> [f32; SH_COEFF_COUNT] {
    let (x, y, z) = (direction.x, direction.y, direction.z);
    let (xx, yy, zz) = (x * x, y * y, z * z);
    let (xy, yz, xz) = (x * y, y * z, x * z);

    let mut basis = [0.0f32; SH_COEFF_COUNT];
    basis[0] = SH_C0;

    basis[1] = -SH_C1 * y;
    basis[2] = SH_C1 * z;
    basis[3] = -SH_C1 * x;

    basis[4] = SH_C2[0] * xy;
    basis[5] = SH_C2[1] * yz;
    basis[6] = SH_C2[2] * (2.0 * zz - xx - yy);
    basis[7] = SH_C2[3] * xz;
    basis[8] = SH_C2[4] * (xx - yy);

    basis[9] = SH_C3[0] * y * (3.0 * xx - yy);
    basis[10] = SH_C3[1] * xy * z;
    basis[11] = SH_C3[2] * y * (4.0 * zz - xx - yy);
    basis[12] = SH_C3[3] * z * (2.0 * zz - 3.0 * xx - 3.0 * yy);
    basis[13] = SH_C3[4] * x * (4.0 * zz - xx - yy);
    basis[14] = SH_C3[5] * z * (xx - yy);
    basis[15] = SH_C3[6] * x * (xx - 3.0 * yy);

    basis
}

/// Unclamped view-dependent color at the active degree.
///
/// Gradients with respect to the coefficients are simply the basis values,
/// which is why backward passes reuse [`sh_basis`] directly.
pub fn evaluate_sh(
    sh_coeffs: &[[f32; 3]; SH_COEFF_COUNT],
    direction: &Vector3<f32>,
    degree: u32,
) -> Vector3<f32> {
    let dir = direction.normalize();
    let basis = sh_basis(&dir);
    let active = sh_coeffs_for_degree(degree.min(crate::core::SH_DEGREE_MAX));

    let mut color = Vector3::<f32>::zeros();
    for (i, b) in basis.iter().enumerate().take(active) {
        color.x += b * sh_coeffs[i][0];
        color.y += b * sh_coeffs[i][1];
        color.z += b * sh_coeffs[i][2];
    }
    color
}
