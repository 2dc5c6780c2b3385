//! Error types for the hybrid computer core.
//!
//! This module provides a unified error type [`HybridError`] that covers
//! circuit configuration, simulation, and emulator protocol failures.

use thiserror::Error;

use crate::elements::{ElementKind, Port};
use crate::solver::IntegrationError;

/// Result type alias using [`HybridError`].
pub type Result<T> = std::result::Result<T, HybridError>;

/// Unified error type for all hybrid core operations.
#[derive(Error, Debug)]
pub enum HybridError {
    // ============ Configuration Errors ============
    /// An explicitly requested element id is already allocated
    #[error("Duplicate {kind} id {id}")]
    DuplicateId { kind: ElementKind, id: usize },

    /// Element id is outside the hardware topology
    #[error("{kind} id {id} out of range (block has {capacity} slots)")]
    IdOutOfRange {
        kind: ElementKind,
        id: usize,
        capacity: usize,
    },

    /// All slots of a block are in use
    #[error("No free slot left for another {kind}")]
    SlotsExhausted { kind: ElementKind },

    /// Two routes claim the same crossbar lane
    #[error("Lane {lane} is already occupied")]
    LaneConflict { lane: usize },

    /// Lane index outside the crossbar
    #[error("Lane {lane} does not exist (crossbar has {lanes} lanes)")]
    LaneOutOfRange { lane: usize, lanes: usize },

    /// No free lane left in the requested range
    #[error("No free lane left in {first}..{last}")]
    LanesExhausted { first: usize, last: usize },

    /// Source output index is not a valid crossbar output
    #[error("Invalid crossbar output {uin}: {message}")]
    InvalidOutput { uin: usize, message: String },

    /// Destination input index is not a valid crossbar input
    #[error("Invalid crossbar input {iout}: {message}")]
    InvalidInput { iout: usize, message: String },

    /// A route references an element that was never declared
    #[error("Route on lane {lane} references undeclared element: {message}")]
    UndeclaredElement { lane: usize, message: String },

    /// Element handle does not refer to a suitable allocated element
    #[error("{element} {message}")]
    NotAllocated { element: String, message: String },

    /// A constant crosslane is routed through the wrong half of the lanes
    #[error("Constant crosslane {crosslane} cannot drive lane {lane} (allowed lanes {first}..{last})")]
    ConstantHalfSpace {
        crosslane: usize,
        lane: usize,
        first: usize,
        last: usize,
    },

    /// Coefficient magnitude exceeds what upscaling can represent
    #[error("Coefficient {coeff} outside [-{limit}, {limit}]")]
    CoefficientOutOfRange { coeff: f64, limit: f64 },

    /// Port does not exist on the element
    #[error("{kind} has no input port {port}")]
    InvalidPort { kind: ElementKind, port: Port },

    /// More ADC channels than the hardware provides
    #[error("At most {max} ADC channels can be measured")]
    TooManyAdcChannels { max: usize },

    /// Config tree cannot be turned back into a circuit
    #[error("Invalid config tree: {message}")]
    InvalidConfig { message: String },

    // ============ Simulation Errors ============
    /// Multiplier/identity feedback without an integrator breaking the loop
    #[error("Algebraic loop: multiplier inputs did not settle within {iterations} iterations")]
    AlgebraicLoop { iterations: usize },

    /// NaN appeared while resolving the implicit block
    #[error("Numerical blow-up at fixed-point iteration {iteration}: Min={min:?}, Mout={mout:?}")]
    NumericalBlowUp {
        iteration: usize,
        min: Vec<f64>,
        mout: Vec<f64>,
    },

    /// Failure inside the ODE integrator
    #[error(transparent)]
    Integration(#[from] IntegrationError),

    /// Invalid simulation parameter
    #[error("Invalid simulation parameter: {message}")]
    InvalidSimulationParam { message: String },

    // ============ Protocol / I/O Errors ============
    /// Malformed JSON on the wire or in a config file
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Request type the emulator does not implement
    #[error("Unknown request type '{kind}'")]
    UnknownRequest { kind: String },

    /// Request addressed to an entity this device does not own
    #[error("Unknown entity '{path}'")]
    UnknownEntity { path: String },

    /// Error reading a circuit file
    #[error("Failed to read circuit file '{path}': {source}")]
    FileReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Stream error while serving the emulator
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HybridError {
    /// Create an invalid output error
    pub fn invalid_output(uin: usize, message: impl Into<String>) -> Self {
        Self::InvalidOutput {
            uin,
            message: message.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(iout: usize, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            iout,
            message: message.into(),
        }
    }

    /// Create a not-allocated error
    pub fn not_allocated(element: impl ToString, message: impl Into<String>) -> Self {
        Self::NotAllocated {
            element: element.to_string(),
            message: message.into(),
        }
    }

    /// Create an invalid config error
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create an invalid simulation parameter error
    pub fn invalid_param(message: impl Into<String>) -> Self {
        Self::InvalidSimulationParam {
            message: message.into(),
        }
    }

    /// True for errors that are caller-fixable circuit configuration mistakes.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::DuplicateId { .. }
                | Self::IdOutOfRange { .. }
                | Self::SlotsExhausted { .. }
                | Self::LaneConflict { .. }
                | Self::LaneOutOfRange { .. }
                | Self::LanesExhausted { .. }
                | Self::InvalidOutput { .. }
                | Self::InvalidInput { .. }
                | Self::UndeclaredElement { .. }
                | Self::NotAllocated { .. }
                | Self::ConstantHalfSpace { .. }
                | Self::CoefficientOutOfRange { .. }
                | Self::InvalidPort { .. }
                | Self::TooManyAdcChannels { .. }
                | Self::InvalidConfig { .. }
        )
    }
}
