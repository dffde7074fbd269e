//! One-time hard prune driven by the learned mask logits.
//!
//! At the first configured iteration reached, the pruner removes every
//! point whose keep probability `sigmoid(mask)` has fallen below 0.5,
//! then arms itself off: the opacity gate is disabled and the mask logits
//! stop influencing training. Later schedule entries never fire.

use crate::core::SplatCloud;
use crate::optim::adam::SplatOptimizer;
use crate::optim::density::{prune_points, DensifyStats};
use crate::optim::gate::OpacityGate;
use crate::optim::TrainError;

const MASK_KEEP_THRESHOLD: f32 = 0.5;

#[derive(Clone, Debug)]
pub struct MaskPruner {
    prune_iterations: Vec<u64>,
    enabled: bool,
}

impl MaskPruner {
    pub fn new(mut prune_iterations: Vec<u64>) -> Self {
        prune_iterations.sort_unstable();
        Self {
            enabled: !prune_iterations.is_empty(),
            prune_iterations,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn is_scheduled(&self, iteration: u64) -> bool {
        self.enabled && self.prune_iterations.contains(&iteration)
    }

    /// Run the hard cut if `iteration` is scheduled. Returns the number of
    /// points removed, or `None` when nothing was scheduled.
    ///
    /// Any executed cut disables the pruner and the gate permanently.
    pub fn maybe_prune(
        &mut self,
        iteration: u64,
        cloud: &mut SplatCloud,
        optimizer: &mut SplatOptimizer,
        stats: &mut DensifyStats,
        gate: &mut OpacityGate,
    ) -> Result<Option<usize>, TrainError> {
        if !self.is_scheduled(iteration) {
            return Ok(None);
        }

        let keep: Vec<bool> = cloud
            .splats
            .iter()
            .map(|s| s.mask_probability() >= MASK_KEEP_THRESHOLD)
            .collect();
        let removed = prune_points(cloud, optimizer, stats, &keep)?;

        self.enabled = false;
        gate.disable();
        Ok(Some(removed))
    }
}
