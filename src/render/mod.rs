//! Reference CPU rasterizer implementing the [`Rasterizer`] contract.
//!
//! Forward: project each splat's mean and covariance to screen space (EWA
//! splatting with the perspective Jacobian at the mean), then composite
//! front-to-back per pixel. Backward: analytic gradients for SH color,
//! effective opacity and the 2D mean, with the mean gradient chained back
//! to world position through the projection. Scale and rotation gradients
//! are the province of full rasterizer backends and are reported as zero
//! here.
//!
//! A simple clarity-over-speed implementation; production training plugs a
//! GPU backend into the same trait.

use crate::core::{evaluate_sh, sh_basis, sh_coeffs_for_degree, Camera, SplatCloud, SH_COEFF_COUNT};
use crate::optim::{RasterGrads, Rasterizer, RenderedFrame};
use nalgebra::{Matrix2, Vector2, Vector3};

const NEAR_PLANE: f32 = 0.01;
const ALPHA_CLAMP: f32 = 0.99;
const ALPHA_SKIP: f32 = 1e-4;
const TRANSMITTANCE_FLOOR: f32 = 1e-4;

/// One splat projected into screen space.
struct Projected {
    idx: usize,
    mean: Vector2<f32>,
    depth: f32,
    // symmetric 2D covariance (xx, xy, yy) and its inverse
    inv_xx: f32,
    inv_xy: f32,
    inv_yy: f32,
    radius: f32,
    color: Vector3<f32>,
    effective_opacity: f32,
    point_cam: Vector3<f32>,
    min_x: i32,
    max_x: i32,
    min_y: i32,
    max_y: i32,
}

pub struct CpuRasterizer {
    pub background: Vector3<f32>,
}

impl CpuRasterizer {
    pub fn new(background: Vector3<f32>) -> Self {
        Self { background }
    }

    fn project(
        &self,
        cloud: &SplatCloud,
        effective_opacity: &[f32],
        camera: &Camera,
        sh_degree: u32,
    ) -> Vec<Projected> {
        let max_screen_dim = camera.width.max(camera.height) as f32;

        let mut projected: Vec<Projected> = cloud
            .splats
            .iter()
            .enumerate()
            .filter_map(|(idx, splat)| {
                let point_cam = camera.world_to_camera(&splat.position);
                if point_cam.z <= NEAR_PLANE {
                    return None;
                }
                let mean_px = camera.project(&point_cam)?;

                // World covariance rotated into camera space, then squashed
                // through the projection Jacobian at the mean.
                let sigma_world = splat.covariance_matrix();
                let sigma_cam = camera.rotation * sigma_world * camera.rotation.transpose();
                let j = camera.projection_jacobian(&point_cam);
                let sigma_2d: Matrix2<f32> = j * sigma_cam * j.transpose();

                let eps = 1e-6;
                let cov_xx = sigma_2d[(0, 0)] + eps;
                let cov_xy = sigma_2d[(0, 1)];
                let cov_yy = sigma_2d[(1, 1)] + eps;

                let det = cov_xx * cov_yy - cov_xy * cov_xy;
                if !det.is_finite() || det <= 1e-10 {
                    return None;
                }
                let inv_det = 1.0 / det;

                // 3-sigma bounding circle from the largest eigenvalue.
                let trace = cov_xx + cov_yy;
                let disc = ((cov_xx - cov_yy).powi(2) + 4.0 * cov_xy * cov_xy).sqrt();
                let lambda_max = 0.5 * (trace + disc).max(0.0);
                let radius = 3.0 * lambda_max.sqrt();
                if !radius.is_finite() || radius > max_screen_dim {
                    return None;
                }

                let color = evaluate_sh(
                    &splat.sh_coeffs,
                    &camera.view_direction(&splat.position),
                    sh_degree,
                );

                Some(Projected {
                    idx,
                    mean: mean_px,
                    depth: point_cam.z,
                    inv_xx: cov_yy * inv_det,
                    inv_xy: -cov_xy * inv_det,
                    inv_yy: cov_xx * inv_det,
                    radius,
                    color,
                    effective_opacity: effective_opacity[idx],
                    point_cam,
                    min_x: (mean_px.x - radius).floor() as i32,
                    max_x: (mean_px.x + radius).ceil() as i32,
                    min_y: (mean_px.y - radius).floor() as i32,
                    max_y: (mean_px.y + radius).ceil() as i32,
                })
            })
            .collect();

        // Front-to-back.
        projected.sort_by(|a, b| a.depth.total_cmp(&b.depth));
        projected
    }

    /// Gaussian falloff at a pixel, with the gradient of the weight with
    /// respect to the 2D mean.
    fn weight_at(g: &Projected, pixel: Vector2<f32>) -> (f32, Vector2<f32>) {
        let d = pixel - g.mean;
        let quad = g.inv_xx * d.x * d.x + 2.0 * g.inv_xy * d.x * d.y + g.inv_yy * d.y * d.y;
        let weight = (-0.5 * quad).exp();
        // d(weight)/d(mean) = weight * Σ⁻¹ (p - mean)
        let d_mean = Vector2::new(
            weight * (g.inv_xx * d.x + g.inv_xy * d.y),
            weight * (g.inv_xy * d.x + g.inv_yy * d.y),
        );
        (weight, d_mean)
    }
}

impl Default for CpuRasterizer {
    fn default() -> Self {
        Self::new(Vector3::zeros())
    }
}

impl Rasterizer for CpuRasterizer {
    fn render(
        &self,
        cloud: &SplatCloud,
        effective_opacity: &[f32],
        camera: &Camera,
        sh_degree: u32,
    ) -> RenderedFrame {
        assert_eq!(effective_opacity.len(), cloud.len());
        let projected = self.project(cloud, effective_opacity, camera, sh_degree);

        let mut radii = vec![0.0f32; cloud.len()];
        let mut visibility = vec![false; cloud.len()];
        for g in &projected {
            radii[g.idx] = g.radius;
            visibility[g.idx] = true;
        }

        let width = camera.width as i32;
        let height = camera.height as i32;
        let mut pixels = vec![Vector3::<f32>::zeros(); (width * height) as usize];

        for py in 0..height {
            for px in 0..width {
                let pixel = Vector2::new(px as f32 + 0.5, py as f32 + 0.5);
                let mut color = Vector3::<f32>::zeros();
                let mut transmittance = 1.0f32;

                for g in &projected {
                    if px < g.min_x || px > g.max_x || py < g.min_y || py > g.max_y {
                        continue;
                    }
                    let (weight, _) = Self::weight_at(g, pixel);
                    let alpha = (g.effective_opacity * weight).min(ALPHA_CLAMP);
                    if alpha < ALPHA_SKIP {
                        continue;
                    }
                    color += transmittance * alpha * g.color;
                    transmittance *= 1.0 - alpha;
                    if transmittance < TRANSMITTANCE_FLOOR {
                        break;
                    }
                }

                color += transmittance * self.background;
                pixels[(py * width + px) as usize] = color;
            }
        }

        RenderedFrame {
            pixels,
            width: camera.width,
            height: camera.height,
            radii,
            visibility,
        }
    }

    fn backward(
        &self,
        cloud: &SplatCloud,
        effective_opacity: &[f32],
        camera: &Camera,
        sh_degree: u32,
        frame: &RenderedFrame,
        d_pixels: &[Vector3<f32>],
    ) -> RasterGrads {
        assert_eq!(effective_opacity.len(), cloud.len());
        assert_eq!(d_pixels.len(), (frame.width * frame.height) as usize);

        let projected = self.project(cloud, effective_opacity, camera, sh_degree);
        let n = cloud.len();
        let width = camera.width as i32;
        let height = camera.height as i32;

        let mut d_color = vec![Vector3::<f32>::zeros(); n];
        let mut d_effective_opacity = vec![0.0f32; n];
        let mut d_mean_px = vec![Vector2::<f32>::zeros(); n];

        // Per-pixel contributor scratch, reused across pixels.
        let mut contrib: Vec<(usize, f32, f32, f32, Vector2<f32>, Vector3<f32>)> = Vec::new();

        for py in 0..height {
            for px in 0..width {
                let pixel = Vector2::new(px as f32 + 0.5, py as f32 + 0.5);
                contrib.clear();

                // Gather with the same predicates as the forward pass.
                let mut transmittance = 1.0f32;
                for g in &projected {
                    if px < g.min_x || px > g.max_x || py < g.min_y || py > g.max_y {
                        continue;
                    }
                    let (weight, d_weight_d_mean) = Self::weight_at(g, pixel);
                    let alpha_raw = g.effective_opacity * weight;
                    let alpha = alpha_raw.min(ALPHA_CLAMP);
                    if alpha < ALPHA_SKIP {
                        continue;
                    }
                    // Clamped alphas pass no gradient through opacity/weight.
                    let (d_alpha_d_eff, d_alpha_d_weight) = if alpha_raw < ALPHA_CLAMP {
                        (weight, g.effective_opacity)
                    } else {
                        (0.0, 0.0)
                    };
                    contrib.push((
                        g.idx,
                        alpha,
                        d_alpha_d_eff,
                        d_alpha_d_weight,
                        d_weight_d_mean,
                        g.color,
                    ));
                    transmittance *= 1.0 - alpha;
                    if transmittance < TRANSMITTANCE_FLOOR {
                        break;
                    }
                }
                if contrib.is_empty() {
                    continue;
                }

                let upstream = d_pixels[(py * width + px) as usize];

                // Forward transmittance prefix, then a reverse suffix scan:
                // suffix_k = Σ_{j>k} T_j α_j c_j + T_end * bg.
                let mut t_prefix = Vec::with_capacity(contrib.len());
                let mut t = 1.0f32;
                for &(_, alpha, ..) in &contrib {
                    t_prefix.push(t);
                    t *= 1.0 - alpha;
                }
                let mut suffix = t * self.background;

                for k in (0..contrib.len()).rev() {
                    let (idx, alpha, d_alpha_d_eff, d_alpha_d_weight, d_weight_d_mean, color) =
                        contrib[k];
                    let t_k = t_prefix[k];

                    d_color[idx] += upstream * (t_k * alpha);

                    let d_alpha =
                        upstream.dot(&(t_k * color)) - upstream.dot(&suffix) / (1.0 - alpha);
                    d_effective_opacity[idx] += d_alpha * d_alpha_d_eff;
                    d_mean_px[idx] += d_weight_d_mean * (d_alpha * d_alpha_d_weight);

                    suffix += t_k * alpha * color;
                }
            }
        }

        // Chain 2D mean gradients into world position, and spread color
        // gradients over the active SH coefficients.
        let mut grads = RasterGrads {
            d_position: vec![Vector3::zeros(); n],
            d_scale: vec![Vector3::zeros(); n],
            d_rotation: vec![Vector3::zeros(); n],
            d_effective_opacity,
            d_sh: vec![[Vector3::zeros(); SH_COEFF_COUNT]; n],
            viewspace_norm: vec![0.0; n],
        };
        let active = sh_coeffs_for_degree(sh_degree);

        for g in &projected {
            let idx = g.idx;
            let d_uv = d_mean_px[idx];
            grads.viewspace_norm[idx] = d_uv.norm();
            if d_uv != Vector2::zeros() {
                let j = camera.projection_jacobian(&g.point_cam);
                let d_point_cam = j.transpose() * d_uv;
                grads.d_position[idx] = camera.rotation.transpose() * d_point_cam;
            }

            let dc = d_color[idx];
            if dc != Vector3::zeros() {
                let dir = camera.view_direction(&cloud.splats[idx].position);
                let basis = sh_basis(&dir);
                for (l, b) in basis.iter().enumerate().take(active) {
                    grads.d_sh[idx][l] = dc * *b;
                }
            }
        }

        grads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Splat, SH_C0};
    use nalgebra::{Matrix3, UnitQuaternion};

    fn red_splat(position: Vector3<f32>, log_scale: f32) -> Splat {
        let mut sh_coeffs = [[0.0f32; 3]; SH_COEFF_COUNT];
        sh_coeffs[0] = [1.0 / SH_C0, 0.0, 0.0];
        Splat {
            position,
            scale: Vector3::repeat(log_scale),
            rotation: UnitQuaternion::identity(),
            opacity: 0.0,
            mask: 0.0,
            sh_coeffs,
        }
    }

    fn test_camera() -> Camera {
        Camera::new(
            100.0,
            100.0,
            10.0,
            10.0,
            20,
            20,
            Matrix3::identity(),
            Vector3::zeros(),
        )
    }

    fn dot_loss(pixels: &[Vector3<f32>], upstream: &[Vector3<f32>]) -> f32 {
        pixels.iter().zip(upstream).map(|(p, u)| p.dot(u)).sum()
    }

    #[test]
    fn test_center_splat_renders_red() {
        let cloud = SplatCloud::from_splats(vec![red_splat(Vector3::new(0.0, 0.0, 5.0), 0.1f32.ln())]);
        let raster = CpuRasterizer::default();
        let camera = test_camera();
        let frame = raster.render(&cloud, &[0.9], &camera, 0);

        let center = frame.pixels[10 * 20 + 10];
        assert!(center.x > 0.5);
        assert!(center.y.abs() < 1e-6);
        assert!(frame.visibility[0]);
        assert!(frame.radii[0] > 0.0);
    }

    #[test]
    fn test_behind_camera_is_culled() {
        let cloud = SplatCloud::from_splats(vec![red_splat(Vector3::new(0.0, 0.0, -5.0), -2.0)]);
        let raster = CpuRasterizer::default();
        let frame = raster.render(&cloud, &[0.9], &test_camera(), 0);
        assert!(!frame.visibility[0]);
        assert_eq!(frame.radii[0], 0.0);
        assert!(frame.pixels.iter().all(|p| *p == Vector3::zeros()));
    }

    #[test]
    fn test_opacity_gradient_matches_finite_difference() {
        let cloud = SplatCloud::from_splats(vec![red_splat(Vector3::new(0.0, 0.0, 5.0), 0.1f32.ln())]);
        let raster = CpuRasterizer::default();
        let camera = test_camera();
        let upstream = vec![Vector3::new(1.0, 1.0, 1.0); 400];

        let eff = 0.5f32;
        let frame = raster.render(&cloud, &[eff], &camera, 0);
        let grads = raster.backward(&cloud, &[eff], &camera, 0, &frame, &upstream);

        let h = 1e-3f32;
        let loss_p = dot_loss(&raster.render(&cloud, &[eff + h], &camera, 0).pixels, &upstream);
        let loss_m = dot_loss(&raster.render(&cloud, &[eff - h], &camera, 0).pixels, &upstream);
        let numerical = (loss_p - loss_m) / (2.0 * h);

        approx::assert_relative_eq!(
            grads.d_effective_opacity[0],
            numerical,
            max_relative = 0.05
        );
    }

    #[test]
    fn test_dc_color_gradient_matches_finite_difference() {
        let mut cloud =
            SplatCloud::from_splats(vec![red_splat(Vector3::new(0.0, 0.0, 5.0), 0.1f32.ln())]);
        let raster = CpuRasterizer::default();
        let camera = test_camera();
        let upstream = vec![Vector3::new(1.0, 0.5, 0.25); 400];

        let frame = raster.render(&cloud, &[0.7], &camera, 0);
        let grads = raster.backward(&cloud, &[0.7], &camera, 0, &frame, &upstream);

        let h = 1e-2f32;
        let base = cloud.splats[0].sh_coeffs[0][0];
        cloud.splats[0].sh_coeffs[0][0] = base + h;
        let loss_p = dot_loss(&raster.render(&cloud, &[0.7], &camera, 0).pixels, &upstream);
        cloud.splats[0].sh_coeffs[0][0] = base - h;
        let loss_m = dot_loss(&raster.render(&cloud, &[0.7], &camera, 0).pixels, &upstream);
        let numerical = (loss_p - loss_m) / (2.0 * h);

        approx::assert_relative_eq!(grads.d_sh[0][0].x, numerical, max_relative = 0.05);
    }

    #[test]
    fn test_position_gradient_matches_finite_difference() {
        let mut cloud =
            SplatCloud::from_splats(vec![red_splat(Vector3::new(0.2, 0.0, 5.0), 0.1f32.ln())]);
        let raster = CpuRasterizer::default();
        let camera = test_camera();
        // Asymmetric upstream so the mean gradient is nonzero.
        let upstream: Vec<Vector3<f32>> = (0..400)
            .map(|i| {
                let x = (i % 20) as f32 / 20.0;
                Vector3::new(x, 0.0, 0.0)
            })
            .collect();

        let frame = raster.render(&cloud, &[0.7], &camera, 0);
        let grads = raster.backward(&cloud, &[0.7], &camera, 0, &frame, &upstream);
        assert!(grads.viewspace_norm[0] > 0.0);

        let h = 1e-3f32;
        let base = cloud.splats[0].position.x;
        cloud.splats[0].position.x = base + h;
        let loss_p = dot_loss(&raster.render(&cloud, &[0.7], &camera, 0).pixels, &upstream);
        cloud.splats[0].position.x = base - h;
        let loss_m = dot_loss(&raster.render(&cloud, &[0.7], &camera, 0).pixels, &upstream);
        let numerical = (loss_p - loss_m) / (2.0 * h);

        // Position gradients flow only through the projected mean here, so
        // allow a looser tolerance than the color/opacity checks.
        assert!(
            (grads.d_position[0].x - numerical).abs() < 0.15 * numerical.abs().max(1e-3),
            "analytic {} vs numerical {}",
            grads.d_position[0].x,
            numerical
        );
    }

    #[test]
    fn test_front_to_back_ordering() {
        // A red splat in front of a green one at the same screen position:
        // the blended color must be dominated by red.
        let mut green = red_splat(Vector3::new(0.0, 0.0, 8.0), 0.2f32.ln());
        green.sh_coeffs[0] = [0.0, 1.0 / SH_C0, 0.0];
        let red = red_splat(Vector3::new(0.0, 0.0, 4.0), 0.1f32.ln());
        let cloud = SplatCloud::from_splats(vec![green, red]);

        let raster = CpuRasterizer::default();
        let frame = raster.render(&cloud, &[0.8, 0.8], &test_camera(), 0);
        let center = frame.pixels[10 * 20 + 10];
        assert!(center.x > center.y);
    }
}
