//! Circuit builder: element allocation, lane assignment and matrix lowering.

use std::collections::BTreeMap;
use std::ops::Range;

use nalgebra::SMatrix;
use tracing::warn;

use super::types::{Connection, Route, Source, Target, Wiring, MAX_COEFFICIENT, NUM_LANES};
use crate::elements::{
    input_slot, output_slot, ConstantSource, Element, ElementKind, IntegratorConfig, OutputSlot,
    TimeScale, NUM_INPUTS, NUM_M0_SLOTS, NUM_MULTIPLIERS, NUM_OUTPUTS,
};
use crate::error::{HybridError, Result};

/// Dense crossbar matrix: `matrix[(iout, uin)]` is the net coefficient
/// from crossbar output `uin` into crossbar input `iout`.
pub type DenseMatrix = SMatrix<f64, NUM_INPUTS, NUM_OUTPUTS>;

/// Maximum number of ADC channels.
pub const MAX_ADC_CHANNELS: usize = 8;

/// Occupant of an M0 slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum M0Element {
    Integrator(IntegratorConfig),
    Identity,
}

/// A netlist for the hybrid computer.
///
/// Built incrementally; lowered with [`Circuit::generate`] or
/// [`Circuit::to_dense_matrix`].
#[derive(Debug, Clone)]
pub struct Circuit {
    /// M0 block occupants by id
    m0: [Option<M0Element>; NUM_M0_SLOTS],
    /// Allocated multipliers by id
    multipliers: [bool; NUM_MULTIPLIERS],
    /// Constant source, if in use
    constant: Option<ConstantSource>,
    /// Placed routes keyed by lane
    routes: BTreeMap<usize, Route>,
    /// Measured elements, in ADC channel order
    adc_channels: Vec<Element>,
    /// Emit identity usage warnings during validation
    sanity_check: bool,
}

impl Default for Circuit {
    fn default() -> Self {
        Self::new()
    }
}

impl Circuit {
    /// Create an empty circuit.
    pub fn new() -> Self {
        Self {
            m0: [None; NUM_M0_SLOTS],
            multipliers: [false; NUM_MULTIPLIERS],
            constant: None,
            routes: BTreeMap::new(),
            adc_channels: Vec::new(),
            sanity_check: true,
        }
    }

    // ============ Elements ============

    /// Allocate an element of `kind`.
    ///
    /// With `explicit_id` the id must be free; otherwise the lowest free id
    /// is used. Integrators start with a zero IC on the fast time scale.
    pub fn allocate(&mut self, kind: ElementKind, explicit_id: Option<usize>) -> Result<Element> {
        let id = match explicit_id {
            Some(id) => {
                let element = Element::new(kind, id)?;
                if self.slot_taken(element) {
                    return Err(HybridError::DuplicateId { kind, id });
                }
                id
            }
            None => (0..kind.layout().capacity)
                .find(|&id| !self.slot_taken(Element { kind, id }))
                .ok_or(HybridError::SlotsExhausted { kind })?,
        };

        match kind {
            ElementKind::Integrator => {
                self.m0[id] = Some(M0Element::Integrator(IntegratorConfig::default()))
            }
            ElementKind::Identity => self.m0[id] = Some(M0Element::Identity),
            ElementKind::Multiplier => self.multipliers[id] = true,
            ElementKind::Constant => self.constant = Some(ConstantSource::default()),
        }
        Ok(Element { kind, id })
    }

    fn slot_taken(&self, element: Element) -> bool {
        match element.kind {
            ElementKind::Integrator | ElementKind::Identity => self.m0[element.id].is_some(),
            ElementKind::Multiplier => self.multipliers[element.id],
            ElementKind::Constant => self.constant.is_some(),
        }
    }

    /// Allocate an integrator with the given initial condition.
    pub fn int(&mut self, ic: f64, slow: bool) -> Result<Element> {
        let element = self.allocate(ElementKind::Integrator, None)?;
        let time_scale = if slow { TimeScale::Slow } else { TimeScale::Fast };
        self.m0[element.id] = Some(M0Element::Integrator(IntegratorConfig::new(ic, time_scale)));
        Ok(element)
    }

    /// Allocate an identity element.
    pub fn identity(&mut self) -> Result<Element> {
        self.allocate(ElementKind::Identity, None)
    }

    /// Allocate a multiplier.
    pub fn mul(&mut self) -> Result<Element> {
        self.allocate(ElementKind::Multiplier, None)
    }

    /// Handle to the constant source, enabling it on first use.
    pub fn constant(&mut self) -> Element {
        self.constant.get_or_insert_with(ConstantSource::default);
        Element {
            kind: ElementKind::Constant,
            id: 0,
        }
    }

    /// Override the constant source value, enabling it if needed.
    pub fn set_constant_value(&mut self, value: f64) {
        self.constant = Some(ConstantSource::new(value));
    }

    /// The constant source, if in use.
    pub fn constant_source(&self) -> Option<ConstantSource> {
        self.constant
    }

    /// Whether `element` has been allocated in this circuit.
    pub fn contains(&self, element: Element) -> bool {
        element.id < element.kind.layout().capacity
            && match element.kind {
                ElementKind::Integrator => {
                    matches!(self.m0[element.id], Some(M0Element::Integrator(_)))
                }
                ElementKind::Identity => matches!(self.m0[element.id], Some(M0Element::Identity)),
                _ => self.slot_taken(element),
            }
    }

    /// Occupant of an M0 slot.
    pub fn m0(&self, id: usize) -> Option<M0Element> {
        self.m0.get(id).copied().flatten()
    }

    /// Whether multiplier `id` is allocated.
    pub fn has_multiplier(&self, id: usize) -> bool {
        self.multipliers.get(id).copied().unwrap_or(false)
    }

    /// Configuration of integrator `id`.
    pub fn integrator_config(&self, id: usize) -> Option<IntegratorConfig> {
        match self.m0(id) {
            Some(M0Element::Integrator(config)) => Some(config),
            _ => None,
        }
    }

    fn integrator_mut(&mut self, element: Element) -> Result<&mut IntegratorConfig> {
        let slot = match element.kind {
            ElementKind::Integrator => self.m0.get_mut(element.id),
            _ => None,
        };
        match slot {
            Some(Some(M0Element::Integrator(config))) => Ok(config),
            _ => Err(HybridError::not_allocated(element, "is not an allocated integrator")),
        }
    }

    /// Set the initial condition of an integrator.
    pub fn set_ic(&mut self, element: Element, ic: f64) -> Result<()> {
        self.integrator_mut(element)?.ic = ic;
        Ok(())
    }

    /// Select the time scale of an integrator.
    pub fn set_time_scale(&mut self, element: Element, time_scale: TimeScale) -> Result<()> {
        self.integrator_mut(element)?.time_scale = time_scale;
        Ok(())
    }

    /// Initial conditions of the M0 block (zero for non-integrators).
    pub fn initial_conditions(&self) -> [f64; NUM_M0_SLOTS] {
        let mut ics = [0.0; NUM_M0_SLOTS];
        for (id, ic) in ics.iter_mut().enumerate() {
            if let Some(config) = self.integrator_config(id) {
                *ic = config.ic;
            }
        }
        ics
    }

    // ============ Routes ============

    /// First lane within `range` not used by a placed route.
    pub fn next_free_lane(&self, range: Range<usize>) -> Result<usize> {
        let (first, last) = (range.start, range.end.min(NUM_LANES));
        (first..last)
            .find(|lane| !self.routes.contains_key(lane))
            .ok_or(HybridError::LanesExhausted { first, last })
    }

    /// Add a route or connection, assigning a lane when none is given.
    ///
    /// Returns the placed route.
    pub fn add(&mut self, wiring: impl Into<Wiring>) -> Result<Route> {
        let route = match wiring.into() {
            Wiring::Route(route) => match route.lane {
                Some(_) => route,
                None => Connection::new(Source::Output(route.uin), Target::Input(route.iout), route.coeff)
                    .to_route(|range| self.next_free_lane(range))?,
            },
            Wiring::Connection(connection) => connection.to_route(|range| self.next_free_lane(range))?,
        };

        let lane = route.lane.unwrap_or_default();
        if lane >= NUM_LANES {
            return Err(HybridError::LaneOutOfRange {
                lane,
                lanes: NUM_LANES,
            });
        }
        if self.routes.contains_key(&lane) {
            return Err(HybridError::LaneConflict { lane });
        }
        output_slot(route.uin)?;
        input_slot(route.iout)?;
        if !route.coeff.is_finite() || route.coeff.abs() > MAX_COEFFICIENT {
            return Err(HybridError::CoefficientOutOfRange {
                coeff: route.coeff,
                limit: MAX_COEFFICIENT,
            });
        }

        self.routes.insert(lane, route);
        Ok(route)
    }

    /// Connect two elements with a weight on the next free lane.
    pub fn connect(
        &mut self,
        source: impl Into<Source>,
        target: impl Into<Target>,
        weight: f64,
    ) -> Result<Route> {
        self.add(Connection::new(source, target, weight))
    }

    /// Add a route on an explicit lane.
    pub fn route(&mut self, uin: usize, lane: usize, coeff: f64, iout: usize) -> Result<Route> {
        self.add(Route::new(uin, lane, coeff, iout))
    }

    /// Placed routes in lane order.
    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.values()
    }

    /// Placed routes with their lanes, in lane order.
    pub fn lanes(&self) -> impl Iterator<Item = (usize, &Route)> {
        self.routes.iter().map(|(&lane, route)| (lane, route))
    }

    /// Route on a given lane.
    pub fn route_on(&self, lane: usize) -> Option<&Route> {
        self.routes.get(&lane)
    }

    /// Remove the route on `lane`, returning it.
    pub fn remove_route(&mut self, lane: usize) -> Option<Route> {
        self.routes.remove(&lane)
    }

    // ============ Measurement ============

    /// Assign the next ADC channel to `element`, returning the channel index.
    pub fn measure(&mut self, element: Element) -> Result<usize> {
        if element.output_lane().is_none() || !self.contains(element) {
            return Err(HybridError::not_allocated(element, "cannot be measured"));
        }
        if self.adc_channels.len() >= MAX_ADC_CHANNELS {
            return Err(HybridError::TooManyAdcChannels {
                max: MAX_ADC_CHANNELS,
            });
        }
        self.adc_channels.push(element);
        Ok(self.adc_channels.len() - 1)
    }

    /// Measured elements in channel order.
    pub fn adc_channels(&self) -> &[Element] {
        &self.adc_channels
    }

    // ============ Flags ============

    /// Enable or disable identity usage warnings.
    ///
    /// Lane conflicts and invalid references are reported regardless.
    pub fn set_sanity_check(&mut self, enabled: bool) {
        self.sanity_check = enabled;
    }

    pub fn sanity_check(&self) -> bool {
        self.sanity_check
    }

    // ============ Lowering ============

    /// Scatter all routes into the dense crossbar matrix.
    ///
    /// Coefficients are the hardware-effective values (upscaled lanes
    /// included) and routes sharing an output/input pair add up. Constant
    /// routes through the wrong half of the lanes cannot carry a signal in
    /// hardware and are left out.
    pub fn to_dense_matrix(&self) -> DenseMatrix {
        let mut matrix = DenseMatrix::zeros();
        for (&lane, route) in &self.routes {
            if let Ok(OutputSlot::Constant(crosslane)) = output_slot(route.uin) {
                if !ConstantSource::accepts(crosslane, lane) {
                    warn!(lane, crosslane, iout = route.iout, "Dropping constant route on wrong lane half");
                    continue;
                }
            }
            matrix[(route.iout, route.uin)] += route.effective_coeff();
        }
        matrix
    }
}
