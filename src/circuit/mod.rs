//! Circuit representation, validation and lowering.
//!
//! A [`Circuit`] accumulates elements and crossbar routes. It is lowered
//! either into a [`ConfigTree`] for a device or into a [`DenseMatrix`] for
//! the simulator.

mod config;
mod graph;
mod types;
mod validate;

pub use config::{AdcConfig, Block, CConfig, ConfigTree, IConfig, M0Config, M0Entry, M1Config, UConfig};
pub use graph::{Circuit, DenseMatrix, M0Element, MAX_ADC_CHANNELS};
pub use types::*;
pub use validate::{validate_circuit, ValidationWarning};
