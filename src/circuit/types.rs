//! Core types for crossbar wiring.

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::elements::{ConstantSource, Element, ElementKind, Port};
use crate::error::{HybridError, Result};

/// Number of physical crossbar lanes.
pub const NUM_LANES: usize = 32;

/// Largest coefficient magnitude representable with upscaling.
pub const MAX_COEFFICIENT: f64 = 20.0;

/// Gain applied by the hardware on upscaled lanes.
pub const UPSCALE_FACTOR: f64 = 10.0;

/// Encode a coefficient for the wire: `(stored value, upscale flag)`.
///
/// Magnitudes above 1 are pre-divided by [`UPSCALE_FACTOR`] and flagged.
pub fn encode_coefficient(coeff: f64) -> (f64, bool) {
    if coeff.abs() > 1.0 {
        (coeff / UPSCALE_FACTOR, true)
    } else {
        (coeff, false)
    }
}

/// Inverse of [`encode_coefficient`].
pub fn decode_coefficient(stored: f64, upscaled: bool) -> f64 {
    if upscaled {
        stored * UPSCALE_FACTOR
    } else {
        stored
    }
}

/// A physical route: crossbar output `uin` through `lane` with weight
/// `coeff` into crossbar input `iout`.
///
/// `lane` is `None` until the route is placed in a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub uin: usize,
    pub lane: Option<usize>,
    pub coeff: f64,
    pub iout: usize,
}

impl Route {
    /// Create a route on an explicit lane.
    pub fn new(uin: usize, lane: usize, coeff: f64, iout: usize) -> Self {
        Self {
            uin,
            lane: Some(lane),
            coeff,
            iout,
        }
    }

    /// Create a route whose lane is assigned when it is added to a circuit.
    pub fn unplaced(uin: usize, coeff: f64, iout: usize) -> Self {
        Self {
            uin,
            lane: None,
            coeff,
            iout,
        }
    }

    /// Wire encoding of the coefficient.
    pub fn encoded(&self) -> (f64, bool) {
        encode_coefficient(self.coeff)
    }

    /// Whether the hardware needs the x10 upscaling on this lane.
    pub fn is_upscaled(&self) -> bool {
        self.encoded().1
    }

    /// Coefficient as the hardware realises it: stored value times the
    /// upscaling gain.
    pub fn effective_coeff(&self) -> f64 {
        let (stored, upscaled) = self.encoded();
        decode_coefficient(stored, upscaled)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.lane {
            Some(lane) => write!(f, "{} -[{}: {}]-> {}", self.uin, lane, self.coeff, self.iout),
            None => write!(f, "{} -[?: {}]-> {}", self.uin, self.coeff, self.iout),
        }
    }
}

/// Signal source of a logical connection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Source {
    Element(Element),
    /// Raw crossbar output index
    Output(usize),
}

impl From<Element> for Source {
    fn from(element: Element) -> Self {
        Source::Element(element)
    }
}

/// Signal destination of a logical connection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Target {
    /// Primary input (port A) of the element
    Element(Element),
    Port(Element, Port),
    /// Raw crossbar input index
    Input(usize),
}

impl From<Element> for Target {
    fn from(element: Element) -> Self {
        Target::Element(element)
    }
}

impl From<(Element, Port)> for Target {
    fn from((element, port): (Element, Port)) -> Self {
        Target::Port(element, port)
    }
}

/// Logical, lane-unassigned connection between two elements.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Connection {
    pub source: Source,
    pub target: Target,
    pub weight: f64,
}

impl Connection {
    pub fn new(source: impl Into<Source>, target: impl Into<Target>, weight: f64) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            weight,
        }
    }

    /// Resolve element references and pick a lane.
    ///
    /// `next_free_lane` is asked for the first free lane within the range
    /// the source can reach: the constant source decides its crosslane from
    /// the lane it is given.
    pub fn to_route<F>(&self, mut next_free_lane: F) -> Result<Route>
    where
        F: FnMut(Range<usize>) -> Result<usize>,
    {
        let iout = match self.target {
            Target::Element(element) => element.input_lane(Port::A)?,
            Target::Port(element, port) => element.input_lane(port)?,
            Target::Input(iout) => iout,
        };

        let (uin, lane) = match self.source {
            Source::Element(element) if element.kind == ElementKind::Constant => {
                let lane = next_free_lane(0..NUM_LANES)?;
                (ConstantSource::crosslane_for(lane), lane)
            }
            Source::Element(element) => {
                let uin = element
                    .output_lane()
                    .ok_or_else(|| HybridError::invalid_output(0, format!("{element} has no output")))?;
                (uin, next_free_lane(0..NUM_LANES)?)
            }
            Source::Output(uin) => {
                let range = ConstantSource::lanes_of(uin).unwrap_or(0..NUM_LANES);
                (uin, next_free_lane(range)?)
            }
        };

        Ok(Route::new(uin, lane, self.weight, iout))
    }
}

/// Anything that can be added to a circuit's crossbar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Wiring {
    Route(Route),
    Connection(Connection),
}

impl From<Route> for Wiring {
    fn from(route: Route) -> Self {
        Wiring::Route(route)
    }
}

impl From<Connection> for Wiring {
    fn from(connection: Connection) -> Self {
        Wiring::Connection(connection)
    }
}
