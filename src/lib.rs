//! # Hybrid Core
//!
//! Circuit builder and simulator for a reconfigurable analog/hybrid
//! computer.
//!
//! This library provides:
//! - A builder that allocates integrators, identities, multipliers and the
//!   constant source and wires them through a 32-lane crossbar
//! - Lowering of a circuit to the per-block config tree sent to a device
//! - An ODE simulator of the circuit, including the implicit multiplier loop
//! - A line-delimited JSON emulator that answers device requests
//!
//! ## Architecture
//!
//! - [`elements`] - Computing elements and their crossbar lanes
//! - [`circuit`] - Circuit graph, validation and config tree
//! - [`solver`] - Block matrices, fixed-point resolution and integration
//! - [`emulator`] - Request handling of an emulated device
//!
//! ## Usage
//!
//! ```no_run
//! use hybrid_core::{solver::SolveOptions, Circuit, Simulation};
//!
//! # fn main() -> hybrid_core::Result<()> {
//! let mut circuit = Circuit::new();
//! let one = circuit.constant();
//! let x = circuit.int(0.0, false)?;
//! circuit.connect(one, x, 0.5)?;
//!
//! let simulation = Simulation::new(&circuit, false);
//! let trajectory = simulation.solve_ivp(1.0, None, true, &SolveOptions::default())?;
//! assert!((trajectory.final_state()[0] - 0.5).abs() < 1e-6);
//! # Ok(())
//! # }
//! ```
//!
//! ## Hardware conventions
//!
//! Multipliers invert the sign of their product; integrators do not invert.
//! In k0-units mode a fast integrator (k0 = 10000) has unit gain and a slow
//! one (k0 = 100) integrates a hundred times slower; realtime mode measures
//! time in seconds.

pub mod circuit;
pub mod elements;
pub mod emulator;
pub mod error;
pub mod solver;

// Re-export main types for convenience
pub use circuit::Circuit;
pub use error::{HybridError, Result};
pub use solver::Simulation;
