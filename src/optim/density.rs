//! Adaptive density control: gradient statistics, clone/split/prune and
//! the periodic opacity reset.
//!
//! Every `densification_interval` iterations the controller consumes the
//! accumulated view-space gradient statistics and mutates the point set:
//! under-reconstructed small points are cloned, under-reconstructed large
//! points are split into two children sampled from their own covariance,
//! and useless points (faint, or oversized once a size threshold is in
//! effect) are removed. The optimizer's per-point moment state and the
//! accumulator are resized in the same call, so the mutation is atomic
//! from the optimizer's perspective.

use crate::core::math::inverse_sigmoid;
use crate::core::{Splat, SplatCloud};
use crate::optim::adam::SplatOptimizer;
use crate::optim::TrainError;
use rand::Rng;
use rand_distr::StandardNormal;

/// Ceiling applied to every activated opacity by the periodic reset.
const OPACITY_RESET_CEILING: f32 = 0.01;

/// How many children a split produces.
const SPLIT_CHILDREN: usize = 2;

/// Child scales are divided by `0.8 * SPLIT_CHILDREN`.
const SPLIT_SCALE_DIVISOR: f32 = 0.8 * SPLIT_CHILDREN as f32;

/// World-space prune kicks in at this multiple of the scene extent.
const WORLD_SIZE_PRUNE_FACTOR: f32 = 0.1;

/// Per-point running statistics indexed like the point set.
///
/// `grad_sum` accumulates view-space (2D mean) gradient norms for points
/// that passed the visibility filter; `count` is how often each point was
/// visible; `max_radii` tracks the largest observed screen-space radius.
/// All three are zero-reset on every densify/prune call.
#[derive(Clone, Debug)]
pub struct DensifyStats {
    grad_sum: Vec<f32>,
    count: Vec<u32>,
    max_radii: Vec<f32>,
}

impl DensifyStats {
    pub fn new(point_count: usize) -> Self {
        Self {
            grad_sum: vec![0.0; point_count],
            count: vec![0; point_count],
            max_radii: vec![0.0; point_count],
        }
    }

    pub fn len(&self) -> usize {
        self.grad_sum.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grad_sum.is_empty()
    }

    /// Accumulate one iteration of view-space gradient norms and radii for
    /// visible points.
    pub fn accumulate(&mut self, viewspace_norm: &[f32], radii: &[f32], visibility: &[bool]) {
        assert_eq!(viewspace_norm.len(), self.len(), "stats/point count mismatch");
        assert_eq!(radii.len(), self.len(), "stats/point count mismatch");
        assert_eq!(visibility.len(), self.len(), "stats/point count mismatch");

        for i in 0..self.len() {
            if visibility[i] {
                self.grad_sum[i] += viewspace_norm[i];
                self.count[i] += 1;
                self.max_radii[i] = self.max_radii[i].max(radii[i]);
            }
        }
    }

    /// Zero-reset to a (possibly new) point count.
    pub fn reset(&mut self, point_count: usize) {
        self.grad_sum.clear();
        self.count.clear();
        self.max_radii.clear();
        self.grad_sum.resize(point_count, 0.0);
        self.count.resize(point_count, 0);
        self.max_radii.resize(point_count, 0.0);
    }

    /// Mean view-space gradient magnitude of point `i`.
    ///
    /// Never-visible points read as zero gradient (count clamps to 1).
    pub fn mean_grad(&self, i: usize) -> f32 {
        self.grad_sum[i] / (self.count[i].max(1) as f32)
    }

    pub fn max_radius(&self, i: usize) -> f32 {
        self.max_radii[i]
    }
}

/// Outcome of one densify/prune call, for logging and tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct DensifyReport {
    pub cloned: usize,
    pub split: usize,
    pub pruned: usize,
    pub points_after: usize,
}

/// Remove the points whose entry in `keep` is false, keeping cloud,
/// optimizer moments and accumulator in lockstep.
///
/// A rebuild that would leave zero points aborts: training cannot proceed
/// with an empty scene.
pub fn prune_points(
    cloud: &mut SplatCloud,
    optimizer: &mut SplatOptimizer,
    stats: &mut DensifyStats,
    keep: &[bool],
) -> Result<usize, TrainError> {
    assert_eq!(keep.len(), cloud.len(), "keep mask/point count mismatch");
    let removed = keep.iter().filter(|k| !**k).count();

    cloud.retain_by_mask(keep);
    optimizer.prune(keep);

    if cloud.is_empty() {
        return Err(TrainError::EmptyPointSet);
    }
    stats.reset(cloud.len());
    Ok(removed)
}

/// The densification/pruning state machine's policy knobs.
#[derive(Clone, Copy, Debug)]
pub struct DensityController {
    /// Mean view-space gradient magnitude above which a point is considered
    /// under-reconstructed.
    pub grad_threshold: f32,
    /// Activated-opacity floor below which a point is pruned.
    pub min_opacity: f32,
    /// Fraction of the scene extent separating "small" (clone) from
    /// "large" (split) points.
    pub percent_dense: f32,
    /// Scalar spatial scale of the scene, normalizing size thresholds.
    pub scene_extent: f32,
}

impl DensityController {
    fn dense_scale_limit(&self) -> f32 {
        self.percent_dense * self.scene_extent
    }

    fn split_children(&self, original: &Splat, rng: &mut impl Rng) -> [Splat; SPLIT_CHILDREN] {
        let scale = original.actual_scale();
        let new_scale = (scale / SPLIT_SCALE_DIVISOR).map(|s| s.ln());

        std::array::from_fn(|_| {
            // Position perturbed by a sample from the point's own spatial
            // distribution: z ~ N(0, diag(scale)) rotated into world space.
            let local = nalgebra::Vector3::new(
                rng.sample::<f32, _>(StandardNormal) * scale.x,
                rng.sample::<f32, _>(StandardNormal) * scale.y,
                rng.sample::<f32, _>(StandardNormal) * scale.z,
            );
            let mut child = original.clone();
            child.position = original.position + original.rotation * local;
            child.scale = new_scale;
            child
        })
    }

    /// One densify/prune pass.
    ///
    /// `size_threshold_px` enables the footprint prune (screen-space radius
    /// and world-space size); it is supplied only after the first opacity
    /// reset has occurred.
    pub fn densify_and_prune(
        &self,
        cloud: &mut SplatCloud,
        optimizer: &mut SplatOptimizer,
        stats: &mut DensifyStats,
        size_threshold_px: Option<f32>,
        rng: &mut impl Rng,
    ) -> Result<DensifyReport, TrainError> {
        let n0 = cloud.len();
        assert_eq!(stats.len(), n0, "stats/point count mismatch");

        let limit = self.dense_scale_limit();
        let over: Vec<bool> = (0..n0)
            .map(|i| stats.mean_grad(i) >= self.grad_threshold)
            .collect();

        // Clone: small under-reconstructed points are duplicated in place so
        // gradient descent can pull the copies apart.
        let clone_idx: Vec<usize> = (0..n0)
            .filter(|&i| over[i] && cloud.splats[i].max_scale() <= limit)
            .collect();
        for &i in &clone_idx {
            let copy = cloud.splats[i].clone();
            cloud.push(copy);
        }
        optimizer.extend(clone_idx.len());

        // Split: large under-reconstructed points are replaced by two
        // children sampled from the original's covariance; the original is
        // removed below.
        let split_idx: Vec<usize> = (0..n0)
            .filter(|&i| over[i] && cloud.splats[i].max_scale() > limit)
            .collect();
        for &i in &split_idx {
            let children = self.split_children(&cloud.splats[i], rng);
            for child in children {
                cloud.push(child);
            }
        }
        optimizer.extend(split_idx.len() * SPLIT_CHILDREN);

        // Prune: split originals, faint points and (once a size threshold is
        // in effect) oversized footprints. Appended points carry no radii
        // statistics yet and cannot be size-pruned this pass.
        let mut keep = vec![true; cloud.len()];
        for &i in &split_idx {
            keep[i] = false;
        }
        for (i, splat) in cloud.splats.iter().enumerate() {
            if splat.sigmoid_opacity() < self.min_opacity {
                keep[i] = false;
            }
            if let Some(threshold_px) = size_threshold_px {
                let radius = if i < n0 { stats.max_radius(i) } else { 0.0 };
                if radius > threshold_px
                    || splat.max_scale() > WORLD_SIZE_PRUNE_FACTOR * self.scene_extent
                {
                    keep[i] = false;
                }
            }
        }

        let pruned = prune_points(cloud, optimizer, stats, &keep)?;

        Ok(DensifyReport {
            cloned: clone_idx.len(),
            split: split_idx.len(),
            pruned,
            points_after: cloud.len(),
        })
    }

    /// Clamp every point's activated opacity to a small ceiling, forcing
    /// the optimizer to re-earn visibility. The opacity group's Adam
    /// moments are zeroed with the values; point count is unchanged.
    pub fn reset_opacity(cloud: &mut SplatCloud, optimizer: &mut SplatOptimizer) {
        for splat in &mut cloud.splats {
            let clamped = splat.sigmoid_opacity().min(OPACITY_RESET_CEILING);
            splat.opacity = inverse_sigmoid(clamped);
        }
        optimizer.reset_opacity_moments();
    }
}
