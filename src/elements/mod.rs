//! Computing elements of the hybrid computer.
//!
//! The hardware topology is fixed:
//! - M0 block: 8 slots hosting Integrators or Identities (one input each)
//! - M1 block: 4 Multipliers (two inputs each) plus the constant outputs
//! - Constant source: a virtual element driving crosslanes 14 and 15
//!
//! Output and input lane indices are derived from a per-kind
//! [`SlotLayout`] table so that the builder and the simulator share one
//! convention.

mod constant;
mod integrator;

pub use constant::{ConstantSource, CONSTANT_LOWER, CONSTANT_UPPER, DEFAULT_CONSTANT};
pub use integrator::{IntegratorConfig, TimeScale, K0_REFERENCE};

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{HybridError, Result};

/// Number of M0 slots (Integrators and Identities share them).
pub const NUM_M0_SLOTS: usize = 8;

/// Number of Multipliers in the M1 block.
pub const NUM_MULTIPLIERS: usize = 4;

/// Number of crossbar outputs (sources).
pub const NUM_OUTPUTS: usize = 16;

/// Number of crossbar inputs (destinations).
pub const NUM_INPUTS: usize = 16;

/// Crossbar outputs 12 and 13 are not wired to anything.
pub const RESERVED_OUTPUTS: [usize; 2] = [12, 13];

/// Kind of a computing element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Integrator,
    Identity,
    Multiplier,
    Constant,
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementKind::Integrator => "Integrator",
            ElementKind::Identity => "Identity",
            ElementKind::Multiplier => "Multiplier",
            ElementKind::Constant => "Constant",
        };
        f.write_str(name)
    }
}

/// Where a kind of element lives on the crossbar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLayout {
    /// Number of ids available for this kind
    pub capacity: usize,
    /// Crossbar output of id 0 (`None` when the output depends on the lane)
    pub output_offset: Option<usize>,
    /// Crossbar input of id 0, port A
    pub input_offset: usize,
    /// Inputs per element
    pub inputs: usize,
}

impl ElementKind {
    /// Lookup table mapping each kind to its crossbar slots.
    pub const fn layout(self) -> SlotLayout {
        match self {
            ElementKind::Integrator | ElementKind::Identity => SlotLayout {
                capacity: NUM_M0_SLOTS,
                output_offset: Some(0),
                input_offset: 0,
                inputs: 1,
            },
            ElementKind::Multiplier => SlotLayout {
                capacity: NUM_MULTIPLIERS,
                output_offset: Some(NUM_M0_SLOTS),
                input_offset: NUM_M0_SLOTS,
                inputs: 2,
            },
            ElementKind::Constant => SlotLayout {
                capacity: 1,
                output_offset: None,
                input_offset: 0,
                inputs: 0,
            },
        }
    }

    /// True for kinds that occupy an M0 slot.
    pub fn is_m0(self) -> bool {
        matches!(self, ElementKind::Integrator | ElementKind::Identity)
    }
}

/// Input port of an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Port {
    A,
    B,
}

impl Port {
    fn index(self) -> usize {
        match self {
            Port::A => 0,
            Port::B => 1,
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Port::A => write!(f, "a"),
            Port::B => write!(f, "b"),
        }
    }
}

/// Handle to an allocated element: its kind and id within the kind's block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Element {
    pub kind: ElementKind,
    pub id: usize,
}

impl Element {
    /// Create a handle, checking the id against the kind's capacity.
    pub fn new(kind: ElementKind, id: usize) -> Result<Self> {
        let capacity = kind.layout().capacity;
        if id >= capacity {
            return Err(HybridError::IdOutOfRange { kind, id, capacity });
        }
        Ok(Self { kind, id })
    }

    /// Crossbar output driven by this element.
    ///
    /// `None` for the constant source, whose crosslane is picked per lane.
    pub fn output_lane(&self) -> Option<usize> {
        self.kind.layout().output_offset.map(|offset| offset + self.id)
    }

    /// Crossbar input behind one of this element's ports.
    pub fn input_lane(&self, port: Port) -> Result<usize> {
        let layout = self.kind.layout();
        if port.index() >= layout.inputs {
            return Err(HybridError::InvalidPort {
                kind: self.kind,
                port,
            });
        }
        Ok(layout.input_offset + self.id * layout.inputs + port.index())
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ElementKind::Constant => write!(f, "Constant"),
            kind => write!(f, "{}{}", kind, self.id),
        }
    }
}

/// What sits behind a crossbar output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSlot {
    /// M0 slot (Integrator or Identity) with the given id
    M0(usize),
    /// Multiplier with the given id
    Multiplier(usize),
    /// Constant crosslane (14 or 15)
    Constant(usize),
}

/// What sits behind a crossbar input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSlot {
    M0(usize),
    Multiplier { id: usize, port: Port },
}

/// Classify a crossbar output index.
pub fn output_slot(uin: usize) -> Result<OutputSlot> {
    if uin >= NUM_OUTPUTS {
        return Err(HybridError::invalid_output(uin, "crossbar has 16 outputs"));
    }
    if RESERVED_OUTPUTS.contains(&uin) {
        return Err(HybridError::invalid_output(uin, "output is reserved"));
    }
    let mul = ElementKind::Multiplier.layout();
    Ok(match uin {
        CONSTANT_UPPER | CONSTANT_LOWER => OutputSlot::Constant(uin),
        u if u < NUM_M0_SLOTS => OutputSlot::M0(u),
        u => OutputSlot::Multiplier(u - mul.output_offset.unwrap_or(NUM_M0_SLOTS)),
    })
}

/// Classify a crossbar input index.
pub fn input_slot(iout: usize) -> Result<InputSlot> {
    if iout >= NUM_INPUTS {
        return Err(HybridError::invalid_input(iout, "crossbar has 16 inputs"));
    }
    let mul = ElementKind::Multiplier.layout();
    if iout < mul.input_offset {
        return Ok(InputSlot::M0(iout));
    }
    let rel = iout - mul.input_offset;
    let port = if rel % mul.inputs == 0 { Port::A } else { Port::B };
    Ok(InputSlot::Multiplier {
        id: rel / mul.inputs,
        port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_lanes_follow_layout() {
        let int3 = Element::new(ElementKind::Integrator, 3).unwrap();
        let mul2 = Element::new(ElementKind::Multiplier, 2).unwrap();
        let constant = Element::new(ElementKind::Constant, 0).unwrap();
        assert_eq!(int3.output_lane(), Some(3));
        assert_eq!(mul2.output_lane(), Some(10));
        assert_eq!(constant.output_lane(), None);
    }

    #[test]
    fn test_multiplier_inputs_are_paired() {
        let mul1 = Element::new(ElementKind::Multiplier, 1).unwrap();
        assert_eq!(mul1.input_lane(Port::A).unwrap(), 10);
        assert_eq!(mul1.input_lane(Port::B).unwrap(), 11);

        let int0 = Element::new(ElementKind::Integrator, 0).unwrap();
        assert!(int0.input_lane(Port::B).is_err());
    }

    #[test]
    fn test_id_range() {
        assert!(Element::new(ElementKind::Identity, 7).is_ok());
        assert!(Element::new(ElementKind::Identity, 8).is_err());
        assert!(Element::new(ElementKind::Multiplier, 4).is_err());
    }

    #[test]
    fn test_slot_classification_round_trips() {
        for id in 0..NUM_MULTIPLIERS {
            let mul = Element::new(ElementKind::Multiplier, id).unwrap();
            let out = mul.output_lane().unwrap();
            assert_eq!(output_slot(out).unwrap(), OutputSlot::Multiplier(id));
            let b = mul.input_lane(Port::B).unwrap();
            assert_eq!(input_slot(b).unwrap(), InputSlot::Multiplier { id, port: Port::B });
        }
        assert_eq!(output_slot(14).unwrap(), OutputSlot::Constant(14));
        assert!(output_slot(12).is_err());
        assert!(output_slot(16).is_err());
        assert!(input_slot(16).is_err());
    }
}
