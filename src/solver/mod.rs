//! Simulation of a circuit as a system of ODEs.
//!
//! The 16x16 crossbar matrix is split into four 8x8 blocks:
//! ```text
//! [ D   C ] [ Iout ]   [ Iin ]
//! [ B   A ] [ Mout ] = [ Min ]
//! ```
//!
//! where:
//! - `Iout` are the M0 outputs (integrator states and identity values)
//! - `Mout` is the M1 bus (multiplier outputs and the constant source)
//! - `Iin` drives the integrators, `d(Iout)/dt = Iin * rate`
//! - `Min` drives the multipliers, `Mout = -(a * b)` per multiplier
//!
//! Since `Mout` depends on `Min` within the same instant, every right-hand
//! side evaluation first resolves the implicit multiplier block by
//! fixed-point iteration, then integrates the M0 states with an adaptive
//! Runge-Kutta method.

mod blocks;
mod fixed_point;
mod ode;
mod simulator;

pub use blocks::{Block8, BlockMatrix, Vector8};
pub use fixed_point::{MultiplierResolver, Resolved};
pub use ode::{integrate, IntegrationError, IntegrationStats, Method, OdeSolution, SolveOptions};
pub use simulator::{OutputVector, Simulation, SimulatorConfig, Trajectory};

use crate::elements::NUM_MULTIPLIERS;

/// Sign applied by the multipliers to their product.
pub const MUL_SIGN: f64 = -1.0;

/// Sign applied by the integrators to their input.
pub const INT_SIGN: f64 = 1.0;

/// Output saturation of the op-amps in machine units.
pub const CLIP_LIMIT: f64 = 1.4;

/// Headroom below [`CLIP_LIMIT`] where clipping sets in.
pub const CLIP_EPSILON: f64 = 0.2;

/// Fixed-point budget for a circuit without identity elements.
pub const DEFAULT_MAX_ITERATIONS: usize = 1 + NUM_MULTIPLIERS;
