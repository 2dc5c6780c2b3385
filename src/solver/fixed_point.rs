//! Fixed-point resolution of the implicit multiplier block.
//!
//! Multiplier inputs depend on multiplier outputs within the same instant
//! (`Min = A·Mout + B·Iout`, `Mout = f(Min)`), and so do identity elements
//! in the M0 block. The system is iterated from `Mout = f(0)` until the
//! multiplier and identity inputs repeat exactly.

use super::blocks::{BlockMatrix, Vector8};
use super::MUL_SIGN;
use crate::elements::{NUM_M0_SLOTS, NUM_MULTIPLIERS};
use crate::error::{HybridError, Result};

/// Settled values of the algebraic part of the circuit.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    /// M1 bus: multiplier outputs followed by the constant outputs
    pub mout: Vector8,
    /// Multiplier inputs
    pub min: Vector8,
    /// M0 outputs with identity slots replaced by their inputs
    pub iout: Vector8,
    /// Iterations until the inputs repeated
    pub iterations: usize,
}

/// Resolver for the multiplier/identity fixed point.
#[derive(Debug, Clone)]
pub struct MultiplierResolver {
    /// Iteration budget before declaring an algebraic loop
    pub max_iterations: usize,
    /// M0 slots holding identity elements
    identities: [bool; NUM_M0_SLOTS],
    /// Value on the constant outputs of the M1 bus
    constant: f64,
}

impl MultiplierResolver {
    pub fn new(max_iterations: usize, identities: [bool; NUM_M0_SLOTS], constant: f64) -> Self {
        Self {
            max_iterations,
            identities,
            constant,
        }
    }

    /// M1 bus for the given multiplier inputs.
    ///
    /// Each multiplier multiplies its `a`/`b` pair and the hardware inverts
    /// the sign of the product. The upper half carries the constant.
    pub fn bus(&self, min: &Vector8) -> Vector8 {
        let mut mout = Vector8::from_element(self.constant);
        for id in 0..NUM_MULTIPLIERS {
            mout[id] = MUL_SIGN * min[2 * id] * min[2 * id + 1];
        }
        mout
    }

    /// Overwrite identity slots of `state` with the matching M0 inputs.
    fn pass_identities(&self, state: &Vector8, m0_in: &Vector8) -> Vector8 {
        let mut iout = *state;
        for (slot, &identity) in self.identities.iter().enumerate() {
            if identity {
                iout[slot] = m0_in[slot];
            }
        }
        iout
    }

    fn identity_inputs(&self, m0_in: &Vector8) -> Vector8 {
        let mut inputs = Vector8::zeros();
        for (slot, &identity) in self.identities.iter().enumerate() {
            if identity {
                inputs[slot] = m0_in[slot];
            }
        }
        inputs
    }

    /// Resolve multiplier outputs for the given integrator outputs.
    ///
    /// Convergence is exact equality of consecutive iterates, not a
    /// tolerance. Fails with [`HybridError::AlgebraicLoop`] when the budget
    /// runs out and [`HybridError::NumericalBlowUp`] as soon as a NaN
    /// shows up.
    ///
    /// A feedback cycle is only reported when it keeps changing the inputs.
    /// A cycle without bias starts at its fixed point `Mout = 0` and
    /// resolves to zero instead of failing.
    pub fn resolve(&self, blocks: &BlockMatrix, state: &Vector8) -> Result<Resolved> {
        let mut mout = self.bus(&Vector8::zeros());
        let mut iout = self.pass_identities(state, &Vector8::zeros());
        let mut previous: Option<(Vector8, Vector8)> = None;

        for iteration in 0..self.max_iterations {
            let min = blocks.multiplier_inputs(&mout, &iout);
            let identity_in = self.identity_inputs(&blocks.m0_inputs(&mout, &iout));

            if min.iter().chain(mout.iter()).chain(identity_in.iter()).any(|v| v.is_nan()) {
                return Err(HybridError::NumericalBlowUp {
                    iteration,
                    min: min.as_slice().to_vec(),
                    mout: mout.as_slice().to_vec(),
                });
            }

            if previous == Some((min, identity_in)) {
                return Ok(Resolved {
                    mout,
                    min,
                    iout,
                    iterations: iteration + 1,
                });
            }

            mout = self.bus(&min);
            iout = self.pass_identities(state, &identity_in);
            previous = Some((min, identity_in));
        }

        Err(HybridError::AlgebraicLoop {
            iterations: self.max_iterations,
        })
    }
}
