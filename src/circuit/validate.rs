//! Circuit validation.

use std::fmt;

use tracing::warn;

use super::graph::{Circuit, M0Element};
use crate::elements::{
    input_slot, output_slot, ConstantSource, InputSlot, OutputSlot, Port, NUM_M0_SLOTS,
    NUM_MULTIPLIERS,
};
use crate::error::{HybridError, Result};

/// Non-fatal finding reported by [`validate_circuit`].
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationWarning {
    /// A multiplier input has no route and reads zero
    UnconnectedMultiplierInput { id: usize, port: Port },
    /// An identity element has no route into its input
    UndrivenIdentity { id: usize },
    /// Initial condition outside the [-1, 1] machine range
    IcOutOfRange { id: usize, ic: f64 },
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnconnectedMultiplierInput { id, port } => {
                write!(f, "Multiplier{id} input {port} is unconnected and reads zero")
            }
            Self::UndrivenIdentity { id } => write!(f, "Identity{id} has no driving route"),
            Self::IcOutOfRange { id, ic } => {
                write!(f, "Integrator{id} initial condition {ic} outside [-1, 1]")
            }
        }
    }
}

/// Validate a circuit before lowering it for a device or a simulation.
///
/// Fails on routes referencing undeclared elements and on constant
/// crosslanes routed through the wrong lane half. Lane range and lane
/// sharing are enforced when a route is added.
///
/// and returns the non-fatal findings. Identity warnings are suppressed
/// when the circuit's sanity check is disabled.
pub fn validate_circuit(circuit: &Circuit) -> Result<Vec<ValidationWarning>> {
    let mut driven = [false; 16];

    for (lane, route) in circuit.lanes() {

        match output_slot(route.uin)? {
            OutputSlot::M0(id) if circuit.m0(id).is_none() => {
                return Err(HybridError::UndeclaredElement {
                    lane,
                    message: format!("no element in M0 slot {id}"),
                });
            }
            OutputSlot::Multiplier(id) if !circuit.has_multiplier(id) => {
                return Err(HybridError::UndeclaredElement {
                    lane,
                    message: format!("Multiplier{id} is not allocated"),
                });
            }
            OutputSlot::Constant(crosslane) => {
                if circuit.constant_source().is_none() {
                    return Err(HybridError::UndeclaredElement {
                        lane,
                        message: "constant source is not in use".to_string(),
                    });
                }
                ConstantSource::check(crosslane, lane)?;
            }
            _ => {}
        }

        match input_slot(route.iout)? {
            InputSlot::M0(id) if circuit.m0(id).is_none() => {
                return Err(HybridError::UndeclaredElement {
                    lane,
                    message: format!("no element in M0 slot {id}"),
                });
            }
            InputSlot::Multiplier { id, .. } if !circuit.has_multiplier(id) => {
                return Err(HybridError::UndeclaredElement {
                    lane,
                    message: format!("Multiplier{id} is not allocated"),
                });
            }
            _ => {}
        }
        driven[route.iout] = true;
    }

    let mut warnings = Vec::new();

    for id in 0..NUM_MULTIPLIERS {
        if !circuit.has_multiplier(id) {
            continue;
        }
        for (offset, port) in [(0, Port::A), (1, Port::B)] {
            if !driven[NUM_M0_SLOTS + 2 * id + offset] {
                warnings.push(ValidationWarning::UnconnectedMultiplierInput { id, port });
            }
        }
    }

    for id in 0..NUM_M0_SLOTS {
        match circuit.m0(id) {
            Some(M0Element::Identity) if circuit.sanity_check() && !driven[id] => {
                warnings.push(ValidationWarning::UndrivenIdentity { id });
            }
            Some(M0Element::Integrator(config)) if !config.ic_in_range() => {
                warnings.push(ValidationWarning::IcOutOfRange { id, ic: config.ic });
            }
            _ => {}
        }
    }

    for warning in &warnings {
        warn!(%warning, "Circuit validation");
    }

    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::Route;
    use crate::elements::ElementKind;

    #[test]
    fn test_valid_circuit_has_no_findings() {
        let mut circuit = Circuit::new();
        let c = circuit.constant();
        let i = circuit.int(0.0, false).unwrap();
        circuit.connect(c, i, 1.0).unwrap();
        assert!(validate_circuit(&circuit).unwrap().is_empty());
    }

    #[test]
    fn test_undeclared_element_fails() {
        let mut circuit = Circuit::new();
        circuit.int(0.0, false).unwrap();
        circuit.route(0, 3, 1.0, 5).unwrap();
        assert!(matches!(
            validate_circuit(&circuit).unwrap_err(),
            HybridError::UndeclaredElement { lane: 3, .. }
        ));

        let mut circuit = Circuit::new();
        circuit.int(0.0, false).unwrap();
        circuit.route(15, 0, 1.0, 0).unwrap();
        assert!(validate_circuit(&circuit).is_err());
    }

    #[test]
    fn test_errors_report_the_assigned_lane() {
        let mut circuit = Circuit::new();
        let c = circuit.constant();
        let i = circuit.int(0.0, false).unwrap();
        circuit.connect(c, i, 1.0).unwrap();
        let placed = circuit.add(Route::unplaced(0, 1.0, 5)).unwrap();
        let lane = placed.lane.unwrap();
        assert_eq!(lane, 1);
        assert!(matches!(
            validate_circuit(&circuit).unwrap_err(),
            HybridError::UndeclaredElement { lane: 1, .. }
        ));
    }

    #[test]
    fn test_constant_half_space_fails() {
        let mut circuit = Circuit::new();
        circuit.constant();
        circuit.int(0.0, false).unwrap();
        circuit.route(14, 0, 0.1, 0).unwrap();
        assert!(matches!(
            validate_circuit(&circuit).unwrap_err(),
            HybridError::ConstantHalfSpace { crosslane: 14, lane: 0, .. }
        ));
    }

    #[test]
    fn test_unconnected_multiplier_warns() {
        let mut circuit = Circuit::new();
        let c = circuit.constant();
        let m = circuit.mul().unwrap();
        circuit.connect(c, m, 0.5).unwrap();
        let warnings = validate_circuit(&circuit).unwrap();
        assert_eq!(
            warnings,
            vec![ValidationWarning::UnconnectedMultiplierInput { id: 0, port: Port::B }]
        );
    }

    #[test]
    fn test_sanity_check_only_silences_identity_warnings() {
        let mut circuit = Circuit::new();
        circuit.allocate(ElementKind::Identity, Some(2)).unwrap();
        assert_eq!(
            validate_circuit(&circuit).unwrap(),
            vec![ValidationWarning::UndrivenIdentity { id: 2 }]
        );

        circuit.set_sanity_check(false);
        assert!(validate_circuit(&circuit).unwrap().is_empty());

        circuit.route(0, 0, 1.0, 9).unwrap();
        assert!(validate_circuit(&circuit).is_err());
    }
}
