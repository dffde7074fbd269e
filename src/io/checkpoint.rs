//! Binary checkpoint format (`.csp`).
//!
//! Layout (all integers and floats little-endian):
//! ```text
//! Header:
//!   - Magic: "CSPLAT\0\0" (8 bytes)
//!   - Version: u32
//!   - Iteration: u64
//!   - SH degree: u32
//!   - Gate mode: u8 (0=stochastic, 1=hard sigmoid, 2=disabled)
//!   - Scene extent: f32
//!   - Point count: u64
//!
//! Per point (216 bytes):
//!   - Position: 3 x f32
//!   - Log-scale: 3 x f32
//!   - Rotation quaternion (w,x,y,z): 4 x f32
//!   - Opacity logit: f32
//!   - Mask logit: f32
//!   - SH coefficients: 16 x 3 x f32
//!
//! Optimizer moments, six attribute groups in fixed order
//! (position, scale, rotation, opacity, mask, sh), each:
//!   - Timestep: u32
//!   - Length: u64
//!   - m: length x f32
//!   - v: length x f32
//! ```
//!
//! A resumed run must see exactly the state it saved: the load path
//! validates magic, version and array lengths and fails before any
//! training iteration rather than reshaping silently.

use crate::core::{Splat, SplatCloud, SH_COEFF_COUNT};
use crate::optim::adam::{AdamState, OptimizerSnapshot};
use crate::optim::gate::GateMode;
use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const MAGIC: &[u8; 8] = b"CSPLAT\0\0";
const VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid file magic (not a checkpoint)")]
    InvalidMagic,

    #[error("unsupported checkpoint version: {0}")]
    UnsupportedVersion(u32),

    #[error("invalid checkpoint data: {0}")]
    InvalidData(String),
}

/// Full trainable state captured between iterations.
#[derive(Clone, Debug)]
pub struct Checkpoint {
    pub iteration: u64,
    pub sh_degree: u32,
    pub gate_mode: GateMode,
    pub scene_extent: f32,
    pub cloud: SplatCloud,
    pub optimizer: OptimizerSnapshot,
}

fn gate_mode_to_u8(mode: GateMode) -> u8 {
    match mode {
        GateMode::Stochastic => 0,
        GateMode::HardSigmoid => 1,
        GateMode::Disabled => 2,
    }
}

fn gate_mode_from_u8(v: u8) -> Result<GateMode, CheckpointError> {
    match v {
        0 => Ok(GateMode::Stochastic),
        1 => Ok(GateMode::HardSigmoid),
        2 => Ok(GateMode::Disabled),
        other => Err(CheckpointError::InvalidData(format!(
            "unknown gate mode {other}"
        ))),
    }
}

fn write_f32<W: Write>(w: &mut W, v: f32) -> Result<(), CheckpointError> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_vec3<W: Write>(w: &mut W, v: &Vector3<f32>) -> Result<(), CheckpointError> {
    write_f32(w, v.x)?;
    write_f32(w, v.y)?;
    write_f32(w, v.z)
}

fn read_f32<R: Read>(r: &mut R) -> Result<f32, CheckpointError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, CheckpointError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64, CheckpointError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_vec3<R: Read>(r: &mut R) -> Result<Vector3<f32>, CheckpointError> {
    Ok(Vector3::new(read_f32(r)?, read_f32(r)?, read_f32(r)?))
}

fn write_adam_state<W: Write>(w: &mut W, state: &AdamState) -> Result<(), CheckpointError> {
    w.write_all(&state.t.to_le_bytes())?;
    w.write_all(&(state.m.len() as u64).to_le_bytes())?;
    for &v in &state.m {
        write_f32(w, v)?;
    }
    for &v in &state.v {
        write_f32(w, v)?;
    }
    Ok(())
}

fn read_adam_state<R: Read>(r: &mut R) -> Result<AdamState, CheckpointError> {
    let t = read_u32(r)?;
    let len = read_u64(r)? as usize;
    let mut m = Vec::with_capacity(len);
    for _ in 0..len {
        m.push(read_f32(r)?);
    }
    let mut v = Vec::with_capacity(len);
    for _ in 0..len {
        v.push(read_f32(r)?);
    }
    Ok(AdamState { t, m, v })
}

impl Checkpoint {
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), CheckpointError> {
        let file = std::fs::File::create(path)?;
        let mut w = BufWriter::new(file);

        w.write_all(MAGIC)?;
        w.write_all(&VERSION.to_le_bytes())?;
        w.write_all(&self.iteration.to_le_bytes())?;
        w.write_all(&self.sh_degree.to_le_bytes())?;
        w.write_all(&[gate_mode_to_u8(self.gate_mode)])?;
        write_f32(&mut w, self.scene_extent)?;
        w.write_all(&(self.cloud.len() as u64).to_le_bytes())?;

        for splat in &self.cloud.splats {
            write_vec3(&mut w, &splat.position)?;
            write_vec3(&mut w, &splat.scale)?;
            let q = splat.rotation.quaternion();
            write_f32(&mut w, q.w)?;
            write_f32(&mut w, q.i)?;
            write_f32(&mut w, q.j)?;
            write_f32(&mut w, q.k)?;
            write_f32(&mut w, splat.opacity)?;
            write_f32(&mut w, splat.mask)?;
            for channel in &splat.sh_coeffs {
                for &c in channel {
                    write_f32(&mut w, c)?;
                }
            }
        }

        write_adam_state(&mut w, &self.optimizer.position)?;
        write_adam_state(&mut w, &self.optimizer.scale)?;
        write_adam_state(&mut w, &self.optimizer.rotation)?;
        write_adam_state(&mut w, &self.optimizer.opacity)?;
        write_adam_state(&mut w, &self.optimizer.mask)?;
        write_adam_state(&mut w, &self.optimizer.sh)?;

        w.flush()?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CheckpointError> {
        let file = std::fs::File::open(path)?;
        let mut r = BufReader::new(file);

        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(CheckpointError::InvalidMagic);
        }
        let version = read_u32(&mut r)?;
        if version != VERSION {
            return Err(CheckpointError::UnsupportedVersion(version));
        }

        let iteration = read_u64(&mut r)?;
        let sh_degree = read_u32(&mut r)?;
        let mut mode_byte = [0u8; 1];
        r.read_exact(&mut mode_byte)?;
        let gate_mode = gate_mode_from_u8(mode_byte[0])?;
        let scene_extent = read_f32(&mut r)?;
        let count = read_u64(&mut r)? as usize;

        let mut splats = Vec::with_capacity(count);
        for _ in 0..count {
            let position = read_vec3(&mut r)?;
            let scale = read_vec3(&mut r)?;
            let qw = read_f32(&mut r)?;
            let qi = read_f32(&mut r)?;
            let qj = read_f32(&mut r)?;
            let qk = read_f32(&mut r)?;
            let opacity = read_f32(&mut r)?;
            let mask = read_f32(&mut r)?;
            let mut sh_coeffs = [[0.0f32; 3]; SH_COEFF_COUNT];
            for channel in &mut sh_coeffs {
                for c in channel.iter_mut() {
                    *c = read_f32(&mut r)?;
                }
            }
            splats.push(Splat {
                position,
                scale,
                rotation: UnitQuaternion::from_quaternion(Quaternion::new(qw, qi, qj, qk)),
                opacity,
                mask,
                sh_coeffs,
            });
        }

        let optimizer = OptimizerSnapshot {
            position: read_adam_state(&mut r)?,
            scale: read_adam_state(&mut r)?,
            rotation: read_adam_state(&mut r)?,
            opacity: read_adam_state(&mut r)?,
            mask: read_adam_state(&mut r)?,
            sh: read_adam_state(&mut r)?,
        };

        // Moments are either empty (never stepped) or sized like the cloud.
        for (name, state, per_point) in [
            ("position", &optimizer.position, 3usize),
            ("scale", &optimizer.scale, 3),
            ("rotation", &optimizer.rotation, 3),
            ("opacity", &optimizer.opacity, 1),
            ("mask", &optimizer.mask, 1),
            ("sh", &optimizer.sh, SH_COEFF_COUNT * 3),
        ] {
            if !state.m.is_empty() && state.m.len() != count * per_point {
                return Err(CheckpointError::InvalidData(format!(
                    "{name} moment length {} does not match {count} points",
                    state.m.len()
                )));
            }
            if state.m.len() != state.v.len() {
                return Err(CheckpointError::InvalidData(format!(
                    "{name} first/second moment length mismatch"
                )));
            }
        }

        Ok(Self {
            iteration,
            sh_degree,
            gate_mode,
            scene_extent,
            cloud: SplatCloud::from_splats(splats),
            optimizer,
        })
    }
}
