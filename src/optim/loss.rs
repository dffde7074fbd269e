//! Photometric training loss: `(1 - λ) · L1 + λ · (1 - SSIM)`.
//!
//! SSIM is computed on luminance (linear RGB → Y) with an 11×11 Gaussian
//! window, σ = 1.5, kernel weights renormalized over the valid pixels at
//! image borders. The gradient with respect to every rendered pixel is
//! returned alongside the scalar loss.

use nalgebra::Vector3;

const SSIM_RADIUS: i32 = 5; // 11x11 window
const SSIM_SIGMA: f32 = 1.5;
const SSIM_C1: f32 = 0.01 * 0.01;
const SSIM_C2: f32 = 0.03 * 0.03;

/// Scalar loss plus per-pixel gradient dL/d(rendered rgb).
#[derive(Clone, Debug)]
pub struct LossGrads {
    pub loss: f32,
    pub d_pixels: Vec<Vector3<f32>>,
}

fn luminance(rgb: Vector3<f32>) -> f32 {
    0.299 * rgb.x + 0.587 * rgb.y + 0.114 * rgb.z
}

fn d_luminance_to_rgb(dy: f32) -> Vector3<f32> {
    Vector3::new(0.299 * dy, 0.587 * dy, 0.114 * dy)
}

fn gaussian_kernel_offsets(radius: i32, sigma: f32) -> Vec<(i32, i32, f32)> {
    let mut out = Vec::new();
    let denom = 2.0 * sigma * sigma;
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            let r2 = (dx * dx + dy * dy) as f32;
            out.push((dx, dy, (-r2 / denom).exp()));
        }
    }
    out
}

/// Combined L1 + D-SSIM image loss with per-pixel gradients.
///
/// `rendered` and `target` are linear RGB in [0,1], row-major,
/// `width * height` pixels. `lambda_dssim` mixes the two terms; 0 gives
/// pure L1, 1 pure D-SSIM.
pub fn l1_dssim_loss(
    rendered: &[Vector3<f32>],
    target: &[Vector3<f32>],
    lambda_dssim: f32,
    width: u32,
    height: u32,
) -> LossGrads {
    assert_eq!(rendered.len(), target.len());
    assert_eq!(rendered.len(), (width * height) as usize);

    let n = rendered.len() as f32;

    // L1, mean over pixels and channels.
    let mut l1 = 0.0f32;
    let mut d_l1 = vec![Vector3::<f32>::zeros(); rendered.len()];
    for i in 0..rendered.len() {
        let diff = rendered[i] - target[i];
        l1 += (diff.x.abs() + diff.y.abs() + diff.z.abs()) / 3.0;
        let sign = Vector3::new(diff.x.signum(), diff.y.signum(), diff.z.signum());
        d_l1[i] = sign / (n * 3.0);
    }
    l1 /= n;

    // SSIM on luminance.
    let rendered_y: Vec<f32> = rendered.iter().copied().map(luminance).collect();
    let target_y: Vec<f32> = target.iter().copied().map(luminance).collect();
    let mut d_dssim_y = vec![0.0f32; rendered.len()];

    let kernel = gaussian_kernel_offsets(SSIM_RADIUS, SSIM_SIGMA);
    let w_i = width as i32;
    let h_i = height as i32;

    let mut dssim = 0.0f32;
    for py in 0..h_i {
        for px in 0..w_i {
            // Renormalize kernel weights over the valid window.
            let mut wsum_local = 0.0f32;
            for &(dx, dy, w) in &kernel {
                let x = px + dx;
                let y = py + dy;
                if x < 0 || x >= w_i || y < 0 || y >= h_i {
                    continue;
                }
                wsum_local += w;
            }
            if wsum_local <= 0.0 {
                continue;
            }

            let mut mu_x = 0.0f32;
            let mut mu_y = 0.0f32;
            for &(dx, dy, w) in &kernel {
                let x = px + dx;
                let y = py + dy;
                if x < 0 || x >= w_i || y < 0 || y >= h_i {
                    continue;
                }
                let wi = w / wsum_local;
                let idx = (y * w_i + x) as usize;
                mu_x += wi * rendered_y[idx];
                mu_y += wi * target_y[idx];
            }

            let mut var_x = 0.0f32;
            let mut var_y = 0.0f32;
            let mut cov = 0.0f32;
            for &(dx, dy, w) in &kernel {
                let x = px + dx;
                let y = py + dy;
                if x < 0 || x >= w_i || y < 0 || y >= h_i {
                    continue;
                }
                let wi = w / wsum_local;
                let idx = (y * w_i + x) as usize;
                let dxv = rendered_y[idx] - mu_x;
                let dyv = target_y[idx] - mu_y;
                var_x += wi * dxv * dxv;
                var_y += wi * dyv * dyv;
                cov += wi * dxv * dyv;
            }

            let a = 2.0 * mu_x * mu_y + SSIM_C1;
            let b = 2.0 * cov + SSIM_C2;
            let c = mu_x * mu_x + mu_y * mu_y + SSIM_C1;
            let d = var_x + var_y + SSIM_C2;
            let inv_cd = 1.0 / (c * d).max(1e-6);
            let ssim = (a * b) * inv_cd;

            dssim += 1.0 - ssim;

            let d_ssim_da = b * inv_cd;
            let d_ssim_db = a * inv_cd;
            let d_ssim_dc = -(ssim / c.max(1e-6));
            let d_ssim_dd = -(ssim / d.max(1e-6));

            let d_ssim_d_mu_x = d_ssim_da * (2.0 * mu_y) + d_ssim_dc * (2.0 * mu_x);
            let d_ssim_d_var_x = d_ssim_dd;
            let d_ssim_d_cov = d_ssim_db * 2.0;

            for &(dx, dy, w) in &kernel {
                let x = px + dx;
                let y = py + dy;
                if x < 0 || x >= w_i || y < 0 || y >= h_i {
                    continue;
                }
                let wi = w / wsum_local;
                let idx = (y * w_i + x) as usize;
                let dxv = rendered_y[idx] - mu_x;
                let dyv = target_y[idx] - mu_y;

                let d_ssim_dxq = d_ssim_d_mu_x * wi
                    + d_ssim_d_var_x * (2.0 * wi * dxv)
                    + d_ssim_d_cov * (wi * dyv);

                // d(1-ssim)/d(x_q), averaged over pixels below.
                d_dssim_y[idx] += -d_ssim_dxq / n;
            }
        }
    }
    dssim /= n;

    let l1_weight = 1.0 - lambda_dssim;
    let mut loss = l1_weight * l1 + lambda_dssim * dssim;
    if !loss.is_finite() {
        loss = 0.0;
    }

    let d_pixels = (0..rendered.len())
        .map(|i| d_l1[i] * l1_weight + d_luminance_to_rgb(d_dssim_y[i] * lambda_dssim))
        .collect();

    LossGrads { loss, d_pixels }
}
