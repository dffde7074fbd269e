//! Per-attribute Adam optimizer with per-point moment state.
//!
//! The point set is rebuilt by densify/prune events, so every optimizer
//! keeps its moment vectors indexed like the point set and exposes
//! `extend`/`prune` to remap them in lockstep: surviving points keep their
//! moments, new points start from zero, removed points' moments are
//! dropped. The global timestep is never reset — bias correction must keep
//! counting across mutations.

use crate::core::{SplatCloud, SH_COEFF_COUNT};
use crate::optim::ParamGrads;
use nalgebra::{UnitQuaternion, Vector3};

fn retain_by_mask<T: Copy>(values: &mut Vec<T>, keep: &[bool]) {
    let mut idx = 0;
    values.retain(|_| {
        let k = keep[idx];
        idx += 1;
        k
    });
}

/// Serialized moment state of one attribute group, flattened to scalars.
#[derive(Clone, Debug, PartialEq)]
pub struct AdamState {
    pub t: u32,
    pub m: Vec<f32>,
    pub v: Vec<f32>,
}

pub struct AdamF32 {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    t: u32,
    m: Vec<f32>,
    v: Vec<f32>,
}

impl AdamF32 {
    pub fn new(lr: f32) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    fn ensure_len(&mut self, len: usize) {
        if self.m.len() != len {
            self.m.resize(len, 0.0);
            self.v.resize(len, 0.0);
        }
    }

    /// Append zero-initialized moments for `additional` new points.
    pub fn extend(&mut self, additional: usize) {
        if self.m.is_empty() {
            return; // never stepped; sized lazily on the next step
        }
        let new_len = self.m.len() + additional;
        self.m.resize(new_len, 0.0);
        self.v.resize(new_len, 0.0);
    }

    /// Drop the moments of removed points.
    pub fn prune(&mut self, keep: &[bool]) {
        if self.m.is_empty() {
            return;
        }
        assert_eq!(keep.len(), self.m.len(), "optimizer/point count mismatch");
        retain_by_mask(&mut self.m, keep);
        retain_by_mask(&mut self.v, keep);
    }

    /// Zero both moment vectors in place. The timestep keeps counting.
    pub fn zero_moments(&mut self) {
        self.m.fill(0.0);
        self.v.fill(0.0);
    }

    pub fn step(&mut self, params: &mut [f32], grads: &[f32]) {
        assert_eq!(params.len(), grads.len());
        self.ensure_len(params.len());

        self.t += 1;
        let t = self.t as f32;
        let bias1 = 1.0 - self.beta1.powf(t);
        let bias2 = 1.0 - self.beta2.powf(t);

        for i in 0..params.len() {
            let g = grads[i];
            self.m[i] = self.m[i] * self.beta1 + g * (1.0 - self.beta1);
            self.v[i] = self.v[i] * self.beta2 + g * g * (1.0 - self.beta2);

            let m_hat = self.m[i] / bias1;
            let v_hat = self.v[i] / bias2;

            params[i] -= self.lr * m_hat / (v_hat.sqrt() + self.eps);
        }
    }

    pub fn state(&self) -> AdamState {
        AdamState {
            t: self.t,
            m: self.m.clone(),
            v: self.v.clone(),
        }
    }

    pub fn load_state(&mut self, state: AdamState) {
        assert_eq!(state.m.len(), state.v.len());
        self.t = state.t;
        self.m = state.m;
        self.v = state.v;
    }
}

pub struct AdamVec3 {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    t: u32,
    m: Vec<Vector3<f32>>,
    v: Vec<Vector3<f32>>,
}

impl AdamVec3 {
    pub fn new(lr: f32) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    fn ensure_len(&mut self, len: usize) {
        if self.m.len() != len {
            self.m.resize(len, Vector3::zeros());
            self.v.resize(len, Vector3::zeros());
        }
    }

    pub fn extend(&mut self, additional: usize) {
        if self.m.is_empty() {
            return;
        }
        let new_len = self.m.len() + additional;
        self.m.resize(new_len, Vector3::zeros());
        self.v.resize(new_len, Vector3::zeros());
    }

    pub fn prune(&mut self, keep: &[bool]) {
        if self.m.is_empty() {
            return;
        }
        assert_eq!(keep.len(), self.m.len(), "optimizer/point count mismatch");
        retain_by_mask(&mut self.m, keep);
        retain_by_mask(&mut self.v, keep);
    }

    pub fn step(&mut self, params: &mut [Vector3<f32>], grads: &[Vector3<f32>]) {
        assert_eq!(params.len(), grads.len());
        self.ensure_len(params.len());

        self.t += 1;
        let t = self.t as f32;
        let bias1 = 1.0 - self.beta1.powf(t);
        let bias2 = 1.0 - self.beta2.powf(t);

        for i in 0..params.len() {
            let g = grads[i];
            self.m[i] = self.m[i] * self.beta1 + g * (1.0 - self.beta1);
            self.v[i] = self.v[i] * self.beta2 + g.component_mul(&g) * (1.0 - self.beta2);

            let m_hat = self.m[i] / bias1;
            let v_hat = self.v[i] / bias2;

            params[i].x -= self.lr * m_hat.x / (v_hat.x.sqrt() + self.eps);
            params[i].y -= self.lr * m_hat.y / (v_hat.y.sqrt() + self.eps);
            params[i].z -= self.lr * m_hat.z / (v_hat.z.sqrt() + self.eps);
        }
    }

    pub fn state(&self) -> AdamState {
        let flatten = |vs: &[Vector3<f32>]| {
            let mut out = Vec::with_capacity(vs.len() * 3);
            for v in vs {
                out.extend_from_slice(&[v.x, v.y, v.z]);
            }
            out
        };
        AdamState {
            t: self.t,
            m: flatten(&self.m),
            v: flatten(&self.v),
        }
    }

    pub fn load_state(&mut self, state: AdamState) {
        let unflatten = |flat: &[f32]| {
            assert_eq!(flat.len() % 3, 0);
            flat.chunks_exact(3)
                .map(|c| Vector3::new(c[0], c[1], c[2]))
                .collect::<Vec<_>>()
        };
        self.t = state.t;
        self.m = unflatten(&state.m);
        self.v = unflatten(&state.v);
    }
}

/// Adam on the rotation manifold: moments live in the so(3) tangent space
/// and the update is applied as a scaled-axis rotation increment.
pub struct AdamQuat {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    t: u32,
    m: Vec<Vector3<f32>>,
    v: Vec<Vector3<f32>>,
}

impl AdamQuat {
    pub fn new(lr: f32) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    fn ensure_len(&mut self, len: usize) {
        if self.m.len() != len {
            self.m.resize(len, Vector3::zeros());
            self.v.resize(len, Vector3::zeros());
        }
    }

    pub fn extend(&mut self, additional: usize) {
        if self.m.is_empty() {
            return;
        }
        let new_len = self.m.len() + additional;
        self.m.resize(new_len, Vector3::zeros());
        self.v.resize(new_len, Vector3::zeros());
    }

    pub fn prune(&mut self, keep: &[bool]) {
        if self.m.is_empty() {
            return;
        }
        assert_eq!(keep.len(), self.m.len(), "optimizer/point count mismatch");
        retain_by_mask(&mut self.m, keep);
        retain_by_mask(&mut self.v, keep);
    }

    pub fn step(&mut self, rotations: &mut [UnitQuaternion<f32>], grads: &[Vector3<f32>]) {
        assert_eq!(rotations.len(), grads.len());
        self.ensure_len(rotations.len());

        self.t += 1;
        let t = self.t as f32;
        let bias1 = 1.0 - self.beta1.powf(t);
        let bias2 = 1.0 - self.beta2.powf(t);

        for i in 0..rotations.len() {
            let g = grads[i];
            self.m[i] = self.m[i] * self.beta1 + g * (1.0 - self.beta1);
            self.v[i] = self.v[i] * self.beta2 + g.component_mul(&g) * (1.0 - self.beta2);

            let m_hat = self.m[i] / bias1;
            let v_hat = self.v[i] / bias2;

            let mut step_vec = Vector3::new(
                -self.lr * m_hat.x / (v_hat.x.sqrt() + self.eps),
                -self.lr * m_hat.y / (v_hat.y.sqrt() + self.eps),
                -self.lr * m_hat.z / (v_hat.z.sqrt() + self.eps),
            );

            // Keep updates small; a single bad gradient can flip rotations.
            let max_step_rad = 0.2f32;
            let n = step_vec.norm();
            if n.is_finite() && n > max_step_rad {
                step_vec *= max_step_rad / n;
            }

            let dq = UnitQuaternion::from_scaled_axis(step_vec);
            rotations[i] = dq * rotations[i];
        }
    }

    pub fn state(&self) -> AdamState {
        let flatten = |vs: &[Vector3<f32>]| {
            let mut out = Vec::with_capacity(vs.len() * 3);
            for v in vs {
                out.extend_from_slice(&[v.x, v.y, v.z]);
            }
            out
        };
        AdamState {
            t: self.t,
            m: flatten(&self.m),
            v: flatten(&self.v),
        }
    }

    pub fn load_state(&mut self, state: AdamState) {
        let unflatten = |flat: &[f32]| {
            assert_eq!(flat.len() % 3, 0);
            flat.chunks_exact(3)
                .map(|c| Vector3::new(c[0], c[1], c[2]))
                .collect::<Vec<_>>()
        };
        self.t = state.t;
        self.m = unflatten(&state.m);
        self.v = unflatten(&state.v);
    }
}

pub struct AdamSh16 {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    t: u32,
    m: Vec<[Vector3<f32>; SH_COEFF_COUNT]>,
    v: Vec<[Vector3<f32>; SH_COEFF_COUNT]>,
}

impl AdamSh16 {
    pub fn new(lr: f32) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    fn ensure_len(&mut self, len: usize) {
        if self.m.len() != len {
            self.m.resize(len, [Vector3::zeros(); SH_COEFF_COUNT]);
            self.v.resize(len, [Vector3::zeros(); SH_COEFF_COUNT]);
        }
    }

    pub fn extend(&mut self, additional: usize) {
        if self.m.is_empty() {
            return;
        }
        let new_len = self.m.len() + additional;
        self.m.resize(new_len, [Vector3::zeros(); SH_COEFF_COUNT]);
        self.v.resize(new_len, [Vector3::zeros(); SH_COEFF_COUNT]);
    }

    pub fn prune(&mut self, keep: &[bool]) {
        if self.m.is_empty() {
            return;
        }
        assert_eq!(keep.len(), self.m.len(), "optimizer/point count mismatch");
        retain_by_mask(&mut self.m, keep);
        retain_by_mask(&mut self.v, keep);
    }

    pub fn step(
        &mut self,
        params: &mut [[Vector3<f32>; SH_COEFF_COUNT]],
        grads: &[[Vector3<f32>; SH_COEFF_COUNT]],
    ) {
        assert_eq!(params.len(), grads.len());
        self.ensure_len(params.len());

        self.t += 1;
        let t = self.t as f32;
        let bias1 = 1.0 - self.beta1.powf(t);
        let bias2 = 1.0 - self.beta2.powf(t);

        for i in 0..params.len() {
            for k in 0..SH_COEFF_COUNT {
                let g = grads[i][k];
                self.m[i][k] = self.m[i][k] * self.beta1 + g * (1.0 - self.beta1);
                self.v[i][k] =
                    self.v[i][k] * self.beta2 + g.component_mul(&g) * (1.0 - self.beta2);

                let m_hat = self.m[i][k] / bias1;
                let v_hat = self.v[i][k] / bias2;

                params[i][k].x -= self.lr * m_hat.x / (v_hat.x.sqrt() + self.eps);
                params[i][k].y -= self.lr * m_hat.y / (v_hat.y.sqrt() + self.eps);
                params[i][k].z -= self.lr * m_hat.z / (v_hat.z.sqrt() + self.eps);
            }
        }
    }

    pub fn state(&self) -> AdamState {
        let flatten = |banks: &[[Vector3<f32>; SH_COEFF_COUNT]]| {
            let mut out = Vec::with_capacity(banks.len() * SH_COEFF_COUNT * 3);
            for bank in banks {
                for v in bank {
                    out.extend_from_slice(&[v.x, v.y, v.z]);
                }
            }
            out
        };
        AdamState {
            t: self.t,
            m: flatten(&self.m),
            v: flatten(&self.v),
        }
    }

    pub fn load_state(&mut self, state: AdamState) {
        let unflatten = |flat: &[f32]| {
            assert_eq!(flat.len() % (SH_COEFF_COUNT * 3), 0);
            flat.chunks_exact(SH_COEFF_COUNT * 3)
                .map(|chunk| {
                    let mut bank = [Vector3::zeros(); SH_COEFF_COUNT];
                    for (k, c) in chunk.chunks_exact(3).enumerate() {
                        bank[k] = Vector3::new(c[0], c[1], c[2]);
                    }
                    bank
                })
                .collect::<Vec<_>>()
        };
        self.t = state.t;
        self.m = unflatten(&state.m);
        self.v = unflatten(&state.v);
    }
}

/// Serialized moment state of the whole optimizer, for checkpoints.
#[derive(Clone, Debug, PartialEq)]
pub struct OptimizerSnapshot {
    pub position: AdamState,
    pub scale: AdamState,
    pub rotation: AdamState,
    pub opacity: AdamState,
    pub mask: AdamState,
    pub sh: AdamState,
}

/// All per-attribute optimizers, stepped together once per iteration.
///
/// The position learning rate is the only scheduled one; every other group
/// keeps its configured fixed rate.
pub struct SplatOptimizer {
    pub position: AdamVec3,
    pub scale: AdamVec3,
    pub rotation: AdamQuat,
    pub opacity: AdamF32,
    pub mask: AdamF32,
    pub sh: AdamSh16,
}

impl SplatOptimizer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        position_lr: f32,
        scaling_lr: f32,
        rotation_lr: f32,
        opacity_lr: f32,
        mask_lr: f32,
        feature_lr: f32,
    ) -> Self {
        Self {
            position: AdamVec3::new(position_lr),
            scale: AdamVec3::new(scaling_lr),
            rotation: AdamQuat::new(rotation_lr),
            opacity: AdamF32::new(opacity_lr),
            mask: AdamF32::new(mask_lr),
            sh: AdamSh16::new(feature_lr),
        }
    }

    pub fn set_position_lr(&mut self, lr: f32) {
        self.position.lr = lr;
    }

    /// One optimizer step over every attribute group.
    ///
    /// `grads` must be indexed exactly like the cloud; a mismatch is a
    /// programming error and asserts rather than reshaping silently.
    pub fn step(&mut self, cloud: &mut SplatCloud, grads: &ParamGrads) {
        let n = cloud.len();
        assert_eq!(grads.d_position.len(), n, "optimizer/point count mismatch");
        assert_eq!(grads.d_scale.len(), n, "optimizer/point count mismatch");
        assert_eq!(grads.d_rotation.len(), n, "optimizer/point count mismatch");
        assert_eq!(grads.d_opacity.len(), n, "optimizer/point count mismatch");
        assert_eq!(grads.d_mask.len(), n, "optimizer/point count mismatch");
        assert_eq!(grads.d_sh.len(), n, "optimizer/point count mismatch");

        let mut positions: Vec<Vector3<f32>> = cloud.splats.iter().map(|s| s.position).collect();
        self.position.step(&mut positions, &grads.d_position);

        let mut scales: Vec<Vector3<f32>> = cloud.splats.iter().map(|s| s.scale).collect();
        self.scale.step(&mut scales, &grads.d_scale);

        let mut rotations: Vec<UnitQuaternion<f32>> =
            cloud.splats.iter().map(|s| s.rotation).collect();
        self.rotation.step(&mut rotations, &grads.d_rotation);

        let mut opacities: Vec<f32> = cloud.splats.iter().map(|s| s.opacity).collect();
        self.opacity.step(&mut opacities, &grads.d_opacity);

        let mut masks: Vec<f32> = cloud.splats.iter().map(|s| s.mask).collect();
        self.mask.step(&mut masks, &grads.d_mask);

        let mut sh: Vec<[Vector3<f32>; SH_COEFF_COUNT]> = cloud
            .splats
            .iter()
            .map(|s| {
                let mut bank = [Vector3::zeros(); SH_COEFF_COUNT];
                for (k, c) in s.sh_coeffs.iter().enumerate() {
                    bank[k] = Vector3::new(c[0], c[1], c[2]);
                }
                bank
            })
            .collect();
        self.sh.step(&mut sh, &grads.d_sh);

        for (i, s) in cloud.splats.iter_mut().enumerate() {
            s.position = positions[i];
            s.scale = scales[i];
            s.rotation = rotations[i];
            s.opacity = opacities[i];
            s.mask = masks[i];
            for (k, c) in s.sh_coeffs.iter_mut().enumerate() {
                *c = [sh[i][k].x, sh[i][k].y, sh[i][k].z];
            }
        }
    }

    /// Zero-initialized moments for `additional` appended points.
    pub fn extend(&mut self, additional: usize) {
        self.position.extend(additional);
        self.scale.extend(additional);
        self.rotation.extend(additional);
        self.opacity.extend(additional);
        self.mask.extend(additional);
        self.sh.extend(additional);
    }

    /// Forget the opacity group's momentum while keeping its timestep.
    /// Paired with the periodic opacity reset.
    pub fn reset_opacity_moments(&mut self) {
        self.opacity.zero_moments();
    }

    /// Drop moments of removed points, in the same order as the cloud rebuild.
    pub fn prune(&mut self, keep: &[bool]) {
        self.position.prune(keep);
        self.scale.prune(keep);
        self.rotation.prune(keep);
        self.opacity.prune(keep);
        self.mask.prune(keep);
        self.sh.prune(keep);
    }

    pub fn snapshot(&self) -> OptimizerSnapshot {
        OptimizerSnapshot {
            position: self.position.state(),
            scale: self.scale.state(),
            rotation: self.rotation.state(),
            opacity: self.opacity.state(),
            mask: self.mask.state(),
            sh: self.sh.state(),
        }
    }

    pub fn restore(&mut self, snapshot: OptimizerSnapshot) {
        self.position.load_state(snapshot.position);
        self.scale.load_state(snapshot.scale);
        self.rotation.load_state(snapshot.rotation);
        self.opacity.load_state(snapshot.opacity);
        self.mask.load_state(snapshot.mask);
        self.sh.load_state(snapshot.sh);
    }
}
