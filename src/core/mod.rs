//! Fundamental data structures: splats, cameras, activations.

mod camera;
mod init;
pub mod math;
mod sh;
mod splat;

pub use camera::Camera;
pub use init::{init_from_seed_points, SeedPoint};
pub use math::{inverse_sigmoid, sigmoid};
pub use sh::{evaluate_sh, sh_basis, sh_coeffs_for_degree, SH_C0};
pub use splat::{Splat, SplatCloud, SH_COEFF_COUNT, SH_DEGREE_MAX};
