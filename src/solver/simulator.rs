//! Main simulator interface.

use nalgebra::SVector;
use tracing::{debug, info};

use crate::circuit::{Circuit, DenseMatrix, M0Element};
use crate::elements::{
    Element, CONSTANT_LOWER, CONSTANT_UPPER, DEFAULT_CONSTANT, NUM_M0_SLOTS, NUM_OUTPUTS,
    RESERVED_OUTPUTS,
};
use crate::error::{HybridError, Result};

use super::blocks::{BlockMatrix, Vector8};
use super::fixed_point::{MultiplierResolver, Resolved};
use super::ode::{integrate, IntegrationStats, OdeSolution, SolveOptions};
use super::{CLIP_EPSILON, CLIP_LIMIT, DEFAULT_MAX_ITERATIONS, INT_SIGN};

/// All crossbar output lanes.
pub type OutputVector = SVector<f64, NUM_OUTPUTS>;

/// Configuration for the simulator.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Fixed-point iteration budget. `None` picks one more than the number
    /// of multipliers plus identities.
    pub max_iterations: Option<usize>,
    /// Saturation level of the op-amp outputs
    pub clip_limit: f64,
    /// Headroom below the saturation level where clipping starts
    pub clip_epsilon: f64,
    /// Constant source value, overriding the circuit's
    pub constant: Option<f64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            max_iterations: None,
            clip_limit: CLIP_LIMIT,
            clip_epsilon: CLIP_EPSILON,
            constant: None,
        }
    }
}

impl SimulatorConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fixed-point iteration budget.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    /// Set the clipping limit and headroom.
    pub fn with_clipping(mut self, limit: f64, epsilon: f64) -> Self {
        self.clip_limit = limit;
        self.clip_epsilon = epsilon;
        self
    }

    /// Override the constant source value.
    pub fn with_constant(mut self, value: f64) -> Self {
        self.constant = Some(value);
        self
    }
}

/// Integrated trajectory of the M0 states.
#[derive(Debug, Clone)]
pub struct Trajectory {
    solution: OdeSolution,
    /// Whether outputs were clipped during integration
    pub clipped: bool,
}

impl Trajectory {
    /// Accepted step times.
    pub fn t(&self) -> &[f64] {
        &self.solution.t
    }

    /// States at the accepted step times.
    pub fn y(&self) -> &[Vector8] {
        &self.solution.y
    }

    pub fn stats(&self) -> IntegrationStats {
        self.solution.stats
    }

    pub fn final_state(&self) -> Vector8 {
        self.solution.final_state()
    }

    /// Interpolated state at `t`.
    pub fn sample(&self, t: f64) -> Option<Vector8> {
        self.solution.sample(t)
    }

    /// Interpolate the states onto an arbitrary time grid.
    pub fn resample(&self, times: &[f64]) -> Result<Vec<Vector8>> {
        times
            .iter()
            .map(|&t| {
                self.sample(t).ok_or_else(|| {
                    HybridError::invalid_param(format!("time {t} outside the integrated span"))
                })
            })
            .collect()
    }
}

/// Simulation of a circuit as a system of ODEs.
///
/// The crossbar matrix is frozen at construction; later edits to the
/// circuit need a new `Simulation`.
#[derive(Debug, Clone)]
pub struct Simulation {
    blocks: BlockMatrix,
    dense: DenseMatrix,
    resolver: MultiplierResolver,
    /// Per-slot derivative factor; zero for non-integrators
    rates: Vector8,
    initial_conditions: Vector8,
    constant: f64,
    clip_bound: f64,
    adc_channels: Vec<Element>,
    realtime: bool,
}

impl Simulation {
    /// Create a simulation with default configuration.
    ///
    /// In realtime mode time is measured in seconds; otherwise in units of
    /// the fast integrator's time constant.
    pub fn new(circuit: &Circuit, realtime: bool) -> Self {
        Self::with_config(circuit, realtime, SimulatorConfig::default())
    }

    /// Create a simulation with custom configuration.
    pub fn with_config(circuit: &Circuit, realtime: bool, config: SimulatorConfig) -> Self {
        let dense = circuit.to_dense_matrix();
        let blocks = BlockMatrix::from_dense(&dense);

        let mut identities = [false; NUM_M0_SLOTS];
        let mut rates = Vector8::zeros();
        for id in 0..NUM_M0_SLOTS {
            match circuit.m0(id) {
                Some(M0Element::Integrator(int)) => rates[id] = int.rate(realtime),
                Some(M0Element::Identity) => identities[id] = true,
                None => {}
            }
        }

        let identity_count = identities.iter().filter(|&&identity| identity).count();
        let max_iterations = config
            .max_iterations
            .unwrap_or(DEFAULT_MAX_ITERATIONS + identity_count);

        let constant = config
            .constant
            .or_else(|| circuit.constant_source().map(|source| source.value))
            .unwrap_or(DEFAULT_CONSTANT);

        debug!(
            realtime,
            max_iterations,
            constant,
            identities = identity_count,
            routes = circuit.routes().count(),
            "Built simulation"
        );

        Self {
            blocks,
            dense,
            resolver: MultiplierResolver::new(max_iterations, identities, constant),
            rates,
            initial_conditions: Vector8::from(circuit.initial_conditions()),
            constant,
            clip_bound: config.clip_limit - config.clip_epsilon,
            adc_channels: circuit.adc_channels().to_vec(),
            realtime,
        }
    }

    pub fn realtime(&self) -> bool {
        self.realtime
    }

    /// The crossbar matrix split into blocks.
    pub fn blocks(&self) -> &BlockMatrix {
        &self.blocks
    }

    pub fn dense_matrix(&self) -> &DenseMatrix {
        &self.dense
    }

    /// Contribution of the constant source to every crossbar input.
    pub fn constant(&self) -> SVector<f64, NUM_OUTPUTS> {
        (self.dense.column(CONSTANT_UPPER) + self.dense.column(CONSTANT_LOWER)) * self.constant
    }

    /// Initial conditions declared by the circuit.
    pub fn initial_conditions(&self) -> Vector8 {
        self.initial_conditions
    }

    /// Clamp outputs to the op-amp saturation range.
    pub fn clip(&self, state: &Vector8) -> Vector8 {
        state.map(|v| v.clamp(-self.clip_bound, self.clip_bound))
    }

    fn resolve(&self, state: &Vector8, clip: bool) -> Result<Resolved> {
        let iout = if clip { self.clip(state) } else { *state };
        self.resolver.resolve(&self.blocks, &iout)
    }

    /// Settled M1 bus for the given M0 outputs.
    pub fn mul_out(&self, state: &Vector8) -> Result<Vector8> {
        Ok(self.resolve(state, false)?.mout)
    }

    /// Time derivative of the M0 states.
    pub fn rhs(&self, state: &Vector8, clip: bool) -> Result<Vector8> {
        let resolved = self.resolve(state, clip)?;
        let iin = self.blocks.m0_inputs(&resolved.mout, &resolved.iout);
        Ok(iin.component_mul(&self.rates) * INT_SIGN)
    }

    /// Values on all crossbar outputs for the given M0 states.
    pub fn outputs(&self, state: &Vector8, clip: bool) -> Result<OutputVector> {
        let resolved = self.resolve(state, clip)?;
        let mut outputs = OutputVector::zeros();
        outputs.fixed_rows_mut::<8>(0).copy_from(&resolved.iout);
        outputs.fixed_rows_mut::<8>(NUM_M0_SLOTS).copy_from(&resolved.mout);
        for lane in RESERVED_OUTPUTS {
            outputs[lane] = 0.0;
        }
        Ok(outputs)
    }

    /// Integrate the circuit over `[0, t_final]`.
    ///
    /// Starts from the circuit's initial conditions unless `ics` is given.
    /// Algebraic loops and NaN blow-ups abort the run; integrator failures
    /// are passed through as [`HybridError::Integration`].
    pub fn solve_ivp(
        &self,
        t_final: f64,
        ics: Option<Vector8>,
        clip: bool,
        options: &SolveOptions,
    ) -> Result<Trajectory> {
        if !(t_final.is_finite() && t_final > 0.0) {
            return Err(HybridError::invalid_param(format!(
                "t_final must be positive, got {t_final}"
            )));
        }

        let y0 = ics.unwrap_or(self.initial_conditions);
        let solution = integrate(
            |_t, y: &Vector8| self.rhs(y, clip),
            (0.0, t_final),
            y0,
            options,
        )?;

        info!(
            t_final,
            method = ?options.method,
            accepted = solution.stats.accepted,
            rejected = solution.stats.rejected,
            rhs_evaluations = solution.stats.rhs_evaluations,
            "Simulation finished"
        );

        Ok(Trajectory {
            solution,
            clipped: clip,
        })
    }

    /// Sample the measured elements at the given times.
    ///
    /// Returns one row per time with one value per ADC channel.
    pub fn sample_adc(&self, trajectory: &Trajectory, times: &[f64]) -> Result<Vec<Vec<f64>>> {
        let lanes: Vec<usize> = self
            .adc_channels
            .iter()
            .filter_map(|element| element.output_lane())
            .collect();

        trajectory
            .resample(times)?
            .iter()
            .map(|state| {
                let outputs = self.outputs(state, trajectory.clipped)?;
                Ok(lanes.iter().map(|&lane| outputs[lane]).collect())
            })
            .collect()
    }

    pub fn adc_channels(&self) -> &[Element] {
        &self.adc_channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elements::Port;
    use crate::solver::Method;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn grid(t_final: f64, n: usize) -> Vec<f64> {
        (0..=n).map(|i| t_final * i as f64 / n as f64).collect()
    }

    #[test]
    fn test_constant_respects_lane_halves() {
        let mut circuit = Circuit::new();
        circuit.constant();
        circuit.route(14, 0, 0.1, 0).unwrap();
        circuit.route(14, 16, 0.2, 1).unwrap();
        circuit.route(15, 17, 0.3, 2).unwrap();
        circuit.route(15, 2, 0.4, 3).unwrap();

        let sim = Simulation::new(&circuit, false);
        let constant = sim.constant();
        assert_eq!(&constant.as_slice()[..4], &[0.0, 0.2, 0.0, 0.4]);
        assert!(constant.as_slice()[4..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_integrator_chain_powers_of_t() {
        let mut circuit = Circuit::new();
        let constant = circuit.constant();
        let ints: Vec<Element> = (0..7).map(|_| circuit.int(0.0, false).unwrap()).collect();
        circuit.connect(constant, ints[0], 1.0).unwrap();
        for k in 1..ints.len() {
            circuit.connect(ints[k - 1], ints[k], (k + 1) as f64).unwrap();
        }

        let sim = Simulation::new(&circuit, false);
        let trajectory = sim.solve_ivp(1.0, None, true, &SolveOptions::default()).unwrap();
        let times = grid(1.0, 10);
        for (t, state) in times.iter().zip(trajectory.resample(&times).unwrap()) {
            for k in 0..ints.len() {
                assert_abs_diff_eq!(state[k], t.powi(k as i32 + 1), epsilon = 1e-3);
            }
        }
    }

    #[test]
    fn test_integrator_chain_with_negative_weights_alternates_sign() {
        let mut circuit = Circuit::new();
        let constant = circuit.constant();
        let ints: Vec<Element> = (0..7).map(|_| circuit.int(0.0, false).unwrap()).collect();
        circuit.connect(constant, ints[0], -1.0).unwrap();
        for k in 1..ints.len() {
            circuit.connect(ints[k - 1], ints[k], -((k + 1) as f64)).unwrap();
        }

        let sim = Simulation::new(&circuit, false);
        let options = SolveOptions::default().with_method(Method::Esdirk43);
        let state = sim.solve_ivp(1.0, None, true, &options).unwrap().final_state();
        for k in 0..ints.len() {
            let sign = if k % 2 == 0 { -1.0 } else { 1.0 };
            assert_abs_diff_eq!(state[k], sign, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_multiplier_sign_and_product() {
        let (a, b) = (0.3, -0.25);
        let mut circuit = Circuit::new();
        let constant = circuit.constant();
        let t = circuit.int(0.0, false).unwrap();
        let m1 = circuit.mul().unwrap();
        let m2 = circuit.mul().unwrap();
        let m3 = circuit.mul().unwrap();

        circuit.connect(constant, t, 1.0).unwrap();
        circuit.connect(constant, (m1, Port::A), a).unwrap();
        circuit.connect(constant, (m1, Port::B), -b).unwrap();
        circuit.connect(t, (m2, Port::A), 1.0).unwrap();
        circuit.connect(constant, (m2, Port::B), -a).unwrap();
        circuit.connect(t, (m3, Port::A), 1.0).unwrap();
        circuit.connect(t, (m3, Port::B), -1.0).unwrap();
        for element in [t, m1, m2, m3] {
            circuit.measure(element).unwrap();
        }

        let sim = Simulation::new(&circuit, false);
        let trajectory = sim.solve_ivp(1.0, None, true, &SolveOptions::default()).unwrap();
        let times = grid(1.0, 8);

        for (time, state) in times.iter().zip(trajectory.resample(&times).unwrap()) {
            let mout = sim.mul_out(&state).unwrap();
            assert_abs_diff_eq!(mout[0], a * b, epsilon = 1e-9);
            assert_abs_diff_eq!(mout[1], a * time, epsilon = 1e-6);
            assert_abs_diff_eq!(mout[2], time * time, epsilon = 1e-6);
        }

        let samples = sim.sample_adc(&trajectory, &times).unwrap();
        assert_eq!(samples.len(), times.len());
        let last = samples.last().unwrap();
        assert_eq!(last.len(), 4);
        assert_abs_diff_eq!(last[0], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(last[1], a * b, epsilon = 1e-9);
        assert_abs_diff_eq!(last[2], a, epsilon = 1e-6);
        assert_abs_diff_eq!(last[3], 1.0, epsilon = 1e-6);
    }

    fn ramp(slow: bool) -> Circuit {
        let mut circuit = Circuit::new();
        let constant = circuit.constant();
        let int = circuit.int(-0.5, slow).unwrap();
        circuit.connect(constant, int, 0.5).unwrap();
        circuit
    }

    #[test]
    fn test_ramp_endpoint_fast_and_slow() {
        for method in [Method::Dopri5, Method::Esdirk43] {
            let options = SolveOptions::default().with_method(method);
            for (slow, scale) in [(false, 1.0), (true, 100.0)] {
                let sim = Simulation::new(&ramp(slow), false);
                let t_final = 2.0 * scale;
                let trajectory = sim.solve_ivp(t_final, None, true, &options).unwrap();
                assert_abs_diff_eq!(trajectory.final_state()[0], 0.5, epsilon = 1e-6);
                assert_eq!(*trajectory.t().last().unwrap(), t_final);
            }
        }
    }

    #[test]
    fn test_realtime_uses_seconds() {
        let sim = Simulation::new(&ramp(false), true);
        assert!(sim.realtime());
        let trajectory = sim.solve_ivp(1e-4, None, true, &SolveOptions::default()).unwrap();
        assert_abs_diff_eq!(trajectory.final_state()[0], 0.0, epsilon = 1e-9);

        let sim = Simulation::new(&ramp(true), true);
        let trajectory = sim.solve_ivp(1e-2, None, true, &SolveOptions::default()).unwrap();
        assert_abs_diff_eq!(trajectory.final_state()[0], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_explicit_initial_conditions_override_circuit() {
        let sim = Simulation::new(&ramp(false), false);
        let mut ics = Vector8::zeros();
        ics[0] = 0.25;
        let trajectory = sim.solve_ivp(1.0, Some(ics), true, &SolveOptions::default()).unwrap();
        assert_abs_diff_eq!(trajectory.final_state()[0], 0.75, epsilon = 1e-6);
        assert_eq!(sim.initial_conditions()[0], -0.5);
    }

    #[test]
    fn test_algebraic_loop_aborts_run_and_circuit_stays_usable() {
        let mut circuit = Circuit::new();
        let constant = circuit.constant();
        let m = circuit.mul().unwrap();
        let int = circuit.int(0.0, false).unwrap();
        circuit.connect(constant, (m, Port::A), 0.5).unwrap();
        circuit.connect(constant, (m, Port::B), 0.5).unwrap();
        let feedback = circuit.connect(m, (m, Port::A), 1.0).unwrap();
        circuit.connect(m, int, 1.0).unwrap();

        let sim = Simulation::new(&circuit, false);
        let err = sim.rhs(&Vector8::zeros(), true).unwrap_err();
        assert!(matches!(err, HybridError::AlgebraicLoop { iterations: 5 }));
        let err = sim.solve_ivp(1.0, None, true, &SolveOptions::default()).unwrap_err();
        assert!(matches!(err, HybridError::AlgebraicLoop { .. }));

        circuit.remove_route(feedback.lane.unwrap()).unwrap();
        let sim = Simulation::new(&circuit, false);
        let trajectory = sim.solve_ivp(1.0, None, true, &SolveOptions::default()).unwrap();
        assert_abs_diff_eq!(trajectory.final_state()[0], -0.25, epsilon = 1e-9);
    }

    #[test]
    fn test_two_multiplier_cycle_is_an_algebraic_loop() {
        let mut circuit = Circuit::new();
        let constant = circuit.constant();
        let m0 = circuit.mul().unwrap();
        let m1 = circuit.mul().unwrap();
        circuit.connect(constant, (m0, Port::A), 0.5).unwrap();
        circuit.connect(m1, (m0, Port::A), 1.0).unwrap();
        circuit.connect(constant, (m0, Port::B), 0.5).unwrap();
        circuit.connect(m0, (m1, Port::A), 1.0).unwrap();
        circuit.connect(constant, (m1, Port::B), 0.5).unwrap();

        let sim = Simulation::new(&circuit, false);
        let err = sim.mul_out(&Vector8::zeros()).unwrap_err();
        assert!(matches!(err, HybridError::AlgebraicLoop { iterations: 5 }));
    }

    #[test]
    fn test_nan_state_is_a_blow_up() {
        let mut circuit = Circuit::new();
        let int = circuit.int(0.0, false).unwrap();
        let m = circuit.mul().unwrap();
        circuit.connect(int, (m, Port::A), 1.0).unwrap();
        circuit.connect(m, int, 1.0).unwrap();

        let sim = Simulation::new(&circuit, false);
        let mut state = Vector8::zeros();
        state[0] = f64::NAN;
        let err = sim.rhs(&state, false).unwrap_err();
        assert!(matches!(err, HybridError::NumericalBlowUp { iteration: 0, .. }));
    }

    #[test]
    fn test_identity_is_transparent() {
        let mut circuit = Circuit::new();
        let constant = circuit.constant();
        let identity = circuit.identity().unwrap();
        let int = circuit.int(0.0, false).unwrap();
        circuit.connect(constant, identity, 0.5).unwrap();
        circuit.connect(identity, int, 1.0).unwrap();

        let sim = Simulation::new(&circuit, false);
        let outputs = sim.outputs(&Vector8::zeros(), true).unwrap();
        assert_eq!(outputs[0], 0.5);

        let trajectory = sim.solve_ivp(1.0, None, true, &SolveOptions::default()).unwrap();
        let state = trajectory.final_state();
        assert_abs_diff_eq!(state[1], 0.5, epsilon = 1e-9);
        assert_eq!(state[0], 0.0);
    }

    #[test]
    fn test_clipping_limits_growth() {
        let mut circuit = Circuit::new();
        let int = circuit.int(0.5, false).unwrap();
        circuit.connect(int, int, 1.0).unwrap();
        let sim = Simulation::new(&circuit, false);
        let options = SolveOptions::default();

        let free = sim.solve_ivp(2.0, None, false, &options).unwrap().final_state()[0];
        assert_relative_eq!(free, 0.5 * 2.0_f64.exp(), max_relative = 1e-5);

        let clipped = sim.solve_ivp(2.0, None, true, &options).unwrap();
        let state = clipped.final_state();
        // Exponential growth up to the clip bound, linear afterwards
        let expected = 1.2 + 1.2 * (2.0 - 2.4_f64.ln());
        assert_relative_eq!(state[0], expected, max_relative = 1e-3);
        assert_abs_diff_eq!(sim.outputs(&state, true).unwrap()[0], 1.2, epsilon = 1e-12);
    }

    #[test]
    fn test_config_overrides() {
        let config = SimulatorConfig::new().with_constant(0.5);
        let sim = Simulation::with_config(&ramp(false), false, config);
        let trajectory = sim.solve_ivp(2.0, None, true, &SolveOptions::default()).unwrap();
        assert_abs_diff_eq!(trajectory.final_state()[0], 0.0, epsilon = 1e-6);

        let mut circuit = Circuit::new();
        let constant = circuit.constant();
        let m = circuit.mul().unwrap();
        circuit.connect(constant, (m, Port::A), 0.5).unwrap();
        let config = SimulatorConfig::new().with_max_iterations(1);
        let sim = Simulation::with_config(&circuit, false, config);
        assert!(matches!(
            sim.mul_out(&Vector8::zeros()).unwrap_err(),
            HybridError::AlgebraicLoop { iterations: 1 }
        ));
    }

    #[test]
    fn test_reserved_outputs_and_bad_parameters() {
        let sim = Simulation::new(&ramp(false), false);
        let outputs = sim.outputs(&Vector8::zeros(), true).unwrap();
        assert_eq!(outputs[12], 0.0);
        assert_eq!(outputs[13], 0.0);
        assert_eq!(outputs[14], 1.0);

        assert!(sim.solve_ivp(0.0, None, true, &SolveOptions::default()).is_err());
        let trajectory = sim.solve_ivp(1.0, None, true, &SolveOptions::default()).unwrap();
        assert!(trajectory.resample(&[0.5, 2.0]).is_err());
    }
}
