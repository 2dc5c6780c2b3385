//! Adaptive ODE integration with dense output.
//!
//! Two embedded methods are provided:
//! - [`Method::Dopri5`]: Dormand-Prince 5(4), explicit, for non-stiff circuits
//! - [`Method::Esdirk43`]: Kennedy-Carpenter ESDIRK4(3)6L, L-stable and
//!   stiffly accurate, for circuits mixing fast and slow integrators
//!
//! Implicit stages are solved with a simplified Newton iteration on a
//! finite-difference Jacobian. Between accepted steps the solution is
//! interpolated with cubic Hermite polynomials built from the states and
//! slopes at both ends of the step.

use nalgebra::SMatrix;
use thiserror::Error;

use super::blocks::Vector8;

/// Safety factor of the step size controller.
const SAFETY: f64 = 0.9;

/// Bounds of the step size change per step.
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 10.0;

/// Newton iterations per implicit stage.
const NEWTON_MAX_ITERATIONS: usize = 8;

/// Failure inside the integrator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IntegrationError {
    #[error("Invalid integration span [{t0}, {t1}]")]
    InvalidSpan { t0: f64, t1: f64 },

    #[error("Step size {h:.3e} too small at t = {t}")]
    StepSizeTooSmall { t: f64, h: f64 },

    #[error("Exceeded {max_steps} integration steps at t = {t}")]
    TooManySteps { max_steps: usize, t: f64 },

    #[error("Non-finite state at t = {t}")]
    NonFiniteState { t: f64 },
}

/// Integration method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    Dopri5,
    Esdirk43,
}

impl Method {
    /// Order of the embedded error estimate.
    fn error_order(self) -> f64 {
        match self {
            Method::Dopri5 => 4.0,
            Method::Esdirk43 => 3.0,
        }
    }
}

/// Options for a single integration run.
#[derive(Debug, Clone)]
pub struct SolveOptions {
    pub method: Method,
    /// Relative tolerance
    pub rtol: f64,
    /// Absolute tolerance
    pub atol: f64,
    /// Initial step; chosen automatically when `None`
    pub first_step: Option<f64>,
    /// Upper bound on the step size
    pub max_step: f64,
    /// Upper bound on accepted plus rejected steps
    pub max_steps: usize,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            method: Method::default(),
            rtol: 1e-6,
            atol: 1e-9,
            first_step: None,
            max_step: f64::INFINITY,
            max_steps: 100_000,
        }
    }
}

impl SolveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Set relative and absolute tolerances.
    pub fn with_tolerances(mut self, rtol: f64, atol: f64) -> Self {
        self.rtol = rtol;
        self.atol = atol;
        self
    }

    pub fn with_first_step(mut self, first_step: f64) -> Self {
        self.first_step = Some(first_step);
        self
    }

    pub fn with_max_step(mut self, max_step: f64) -> Self {
        self.max_step = max_step;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }
}

/// Counters collected during integration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntegrationStats {
    pub accepted: usize,
    pub rejected: usize,
    pub rhs_evaluations: usize,
    pub jacobian_evaluations: usize,
}

/// Accepted steps of an integration run, with dense output.
#[derive(Debug, Clone)]
pub struct OdeSolution {
    /// Step boundaries, starting at `t0` and ending at `t1`
    pub t: Vec<f64>,
    /// States at the step boundaries
    pub y: Vec<Vector8>,
    /// Slopes at the step boundaries
    dy: Vec<Vector8>,
    pub stats: IntegrationStats,
}

impl OdeSolution {
    /// State at the end of the span.
    pub fn final_state(&self) -> Vector8 {
        self.y.last().copied().unwrap_or_else(Vector8::zeros)
    }

    /// Interpolated state at `t`, or `None` outside the integrated span.
    pub fn sample(&self, t: f64) -> Option<Vector8> {
        let (&first, &last) = (self.t.first()?, self.t.last()?);
        let slack = 1e-12 * first.abs().max(last.abs()).max(1.0);
        if t < first - slack || t > last + slack {
            return None;
        }
        let t = t.clamp(first, last);

        // First boundary strictly after t
        let upper = self.t.partition_point(|&x| x <= t);
        if upper == 0 {
            return self.y.first().copied();
        }
        if upper == self.t.len() {
            return self.y.last().copied();
        }
        let lower = upper - 1;

        let (t0, t1) = (self.t[lower], self.t[upper]);
        let h = t1 - t0;
        let s = (t - t0) / h;
        let s2 = s * s;
        let s3 = s2 * s;
        let h00 = 2.0 * s3 - 3.0 * s2 + 1.0;
        let h10 = s3 - 2.0 * s2 + s;
        let h01 = -2.0 * s3 + 3.0 * s2;
        let h11 = s3 - s2;

        Some(
            self.y[lower] * h00
                + self.dy[lower] * (h10 * h)
                + self.y[upper] * h01
                + self.dy[upper] * (h11 * h),
        )
    }
}

/// RMS norm of `v` scaled element-wise by `scale`.
fn scaled_norm(v: &Vector8, scale: &Vector8) -> f64 {
    (v.component_div(scale).norm_squared() / v.len() as f64).sqrt()
}

fn error_scale(y0: &Vector8, y1: &Vector8, options: &SolveOptions) -> Vector8 {
    y0.zip_map(y1, |a, b| options.atol + options.rtol * a.abs().max(b.abs()))
}

/// Right-hand side wrapper counting evaluations.
struct Rhs<F> {
    f: F,
    stats: IntegrationStats,
}

impl<F, E> Rhs<F>
where
    F: FnMut(f64, &Vector8) -> Result<Vector8, E>,
{
    fn eval(&mut self, t: f64, y: &Vector8) -> Result<Vector8, E> {
        self.stats.rhs_evaluations += 1;
        (self.f)(t, y)
    }

    /// Forward-difference Jacobian around `(t, y)` with slope `f0`.
    fn jacobian(&mut self, t: f64, y: &Vector8, f0: &Vector8) -> Result<SMatrix<f64, 8, 8>, E> {
        self.stats.jacobian_evaluations += 1;
        let mut jac = SMatrix::<f64, 8, 8>::zeros();
        for j in 0..y.len() {
            let delta = f64::EPSILON.sqrt() * y[j].abs().max(1.0);
            let mut shifted = *y;
            shifted[j] += delta;
            let column = (self.eval(t, &shifted)? - f0) / delta;
            jac.set_column(j, &column);
        }
        Ok(jac)
    }
}

/// Result of one attempted step.
struct Attempt {
    y1: Vector8,
    error: Vector8,
    /// Slope at the end of the step when the method already evaluated it
    f1: Option<Vector8>,
}

/// Pick an initial step size from the local behaviour of the RHS.
fn initial_step<F, E>(
    rhs: &mut Rhs<F>,
    t0: f64,
    y0: &Vector8,
    f0: &Vector8,
    span: f64,
    options: &SolveOptions,
) -> Result<f64, E>
where
    F: FnMut(f64, &Vector8) -> Result<Vector8, E>,
{
    let scale = y0.map(|y| options.atol + options.rtol * y.abs());
    let d0 = scaled_norm(y0, &scale);
    let d1 = scaled_norm(f0, &scale);
    let h0 = if d0 < 1e-5 || d1 < 1e-5 {
        1e-6
    } else {
        0.01 * d0 / d1
    }
    .min(span);

    let y1 = y0 + f0 * h0;
    let f1 = rhs.eval(t0 + h0, &y1)?;
    let d2 = scaled_norm(&(f1 - f0), &scale) / h0;

    let order = options.method.error_order();
    let h1 = if d1 <= 1e-15 && d2 <= 1e-15 {
        (h0 * 1e-3).max(1e-6)
    } else {
        (0.01 / d1.max(d2)).powf(1.0 / (order + 1.0))
    };
    Ok((100.0 * h0).min(h1).min(span).min(options.max_step))
}

/// Integrate `dy/dt = f(t, y)` from `t_span.0` to `t_span.1`.
///
/// Errors from `f` are returned unchanged; integrator failures are
/// converted into `E`.
pub fn integrate<F, E>(
    f: F,
    t_span: (f64, f64),
    y0: Vector8,
    options: &SolveOptions,
) -> Result<OdeSolution, E>
where
    F: FnMut(f64, &Vector8) -> Result<Vector8, E>,
    E: From<IntegrationError>,
{
    let (t0, t1) = t_span;
    if !(t0.is_finite() && t1.is_finite() && t1 > t0) {
        return Err(IntegrationError::InvalidSpan { t0, t1 }.into());
    }
    if y0.iter().any(|v| !v.is_finite()) {
        return Err(IntegrationError::NonFiniteState { t: t0 }.into());
    }

    let mut rhs = Rhs {
        f,
        stats: IntegrationStats::default(),
    };
    let span = t1 - t0;
    let exponent = -1.0 / (options.method.error_order() + 1.0);

    let mut t = t0;
    let mut y = y0;
    let mut f0 = rhs.eval(t, &y)?;
    let mut h = match options.first_step {
        Some(h) => h.min(span),
        None => initial_step(&mut rhs, t, &y, &f0, span, options)?,
    };

    let mut solution = OdeSolution {
        t: vec![t],
        y: vec![y],
        dy: vec![f0],
        stats: IntegrationStats::default(),
    };

    while t < t1 {
        let mut rejected = false;
        loop {
            if solution.stats.accepted + solution.stats.rejected >= options.max_steps {
                return Err(IntegrationError::TooManySteps {
                    max_steps: options.max_steps,
                    t,
                }
                .into());
            }

            h = h.min(options.max_step);
            let last = h >= t1 - t;
            if last {
                h = t1 - t;
            }
            let min_step = 10.0 * f64::EPSILON * t.abs().max(span * f64::EPSILON);
            if h < min_step {
                return Err(IntegrationError::StepSizeTooSmall { t, h }.into());
            }
            let t_new = if last { t1 } else { t + h };

            let attempt = match options.method {
                Method::Dopri5 => Some(dopri5_step(&mut rhs, t, &y, &f0, h)?),
                Method::Esdirk43 => esdirk43_step(&mut rhs, t, &y, &f0, h, options)?,
            };

            let Some(attempt) = attempt else {
                // Newton did not converge: retry with a smaller step
                solution.stats.rejected += 1;
                rejected = true;
                h *= 0.5;
                continue;
            };

            let scale = error_scale(&y, &attempt.y1, options);
            let error = scaled_norm(&attempt.error, &scale);

            if error.is_finite() && error <= 1.0 {
                let factor = if error == 0.0 {
                    MAX_FACTOR
                } else {
                    (SAFETY * error.powf(exponent)).clamp(MIN_FACTOR, MAX_FACTOR)
                };
                let factor = if rejected { factor.min(1.0) } else { factor };

                if attempt.y1.iter().any(|v| !v.is_finite()) {
                    return Err(IntegrationError::NonFiniteState { t: t_new }.into());
                }

                t = t_new;
                y = attempt.y1;
                f0 = match attempt.f1 {
                    Some(f1) => f1,
                    None => rhs.eval(t, &y)?,
                };
                solution.t.push(t);
                solution.y.push(y);
                solution.dy.push(f0);
                solution.stats.accepted += 1;
                h *= factor;
                break;
            }

            let factor = if error.is_finite() {
                (SAFETY * error.powf(exponent)).max(MIN_FACTOR)
            } else {
                MIN_FACTOR
            };
            solution.stats.rejected += 1;
            rejected = true;
            h *= factor;
        }
    }

    solution.stats.rhs_evaluations = rhs.stats.rhs_evaluations;
    solution.stats.jacobian_evaluations = rhs.stats.jacobian_evaluations;
    Ok(solution)
}

// ============ Dormand-Prince 5(4) ============

const DP_C: [f64; 6] = [1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0, 1.0];

const DP_A: [[f64; 5]; 5] = [
    [1.0 / 5.0, 0.0, 0.0, 0.0, 0.0],
    [3.0 / 40.0, 9.0 / 40.0, 0.0, 0.0, 0.0],
    [44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0, 0.0, 0.0],
    [
        19372.0 / 6561.0,
        -25360.0 / 2187.0,
        64448.0 / 6561.0,
        -212.0 / 729.0,
        0.0,
    ],
    [
        9017.0 / 3168.0,
        -355.0 / 33.0,
        46732.0 / 5247.0,
        49.0 / 176.0,
        -5103.0 / 18656.0,
    ],
];

const DP_B: [f64; 6] = [
    35.0 / 384.0,
    0.0,
    500.0 / 1113.0,
    125.0 / 192.0,
    -2187.0 / 6784.0,
    11.0 / 84.0,
];

/// Difference between the 5th and 4th order weights (7 stages, FSAL).
const DP_E: [f64; 7] = [
    71.0 / 57600.0,
    0.0,
    -71.0 / 16695.0,
    71.0 / 1920.0,
    -17253.0 / 339200.0,
    22.0 / 525.0,
    -1.0 / 40.0,
];

fn dopri5_step<F, E>(
    rhs: &mut Rhs<F>,
    t: f64,
    y: &Vector8,
    f0: &Vector8,
    h: f64,
) -> Result<Attempt, E>
where
    F: FnMut(f64, &Vector8) -> Result<Vector8, E>,
{
    let mut k = [Vector8::zeros(); 7];
    k[0] = *f0;
    for stage in 1..6 {
        let mut increment = Vector8::zeros();
        for (j, &a) in DP_A[stage - 1].iter().enumerate().take(stage) {
            increment += k[j] * a;
        }
        k[stage] = rhs.eval(t + DP_C[stage - 1] * h, &(y + increment * h))?;
    }

    let mut increment = Vector8::zeros();
    for (j, &b) in DP_B.iter().enumerate() {
        increment += k[j] * b;
    }
    let y1 = y + increment * h;
    k[6] = rhs.eval(t + h, &y1)?;

    let mut error = Vector8::zeros();
    for (j, &e) in DP_E.iter().enumerate() {
        error += k[j] * e;
    }

    Ok(Attempt {
        y1,
        error: error * h,
        f1: Some(k[6]),
    })
}

// ============ ESDIRK4(3)6L[2]SA ============

const ES_GAMMA: f64 = 0.25;

/// Explicit part of each implicit stage row (diagonal excluded).
const ES_A21: f64 = -1356991263433.0 / 26208533697614.0;
const ES_A31: f64 = -1778551891173.0 / 14697912885533.0;
const ES_A32: f64 = 7325038566068.0 / 12797657924939.0;
const ES_A41: f64 = -24076725932807.0 / 39344244018142.0;
const ES_A42: f64 = 9344023789330.0 / 6876721947151.0;
const ES_A43: f64 = 11302510524611.0 / 18374767399840.0;

/// Solution weights; equal to the last stage row (stiffly accurate).
const ES_B: [f64; 6] = [
    657241292721.0 / 9909463049845.0,
    657241292721.0 / 9909463049845.0,
    1290772910128.0 / 5804808736437.0,
    1103522341516.0 / 2197678446715.0,
    -3.0 / 28.0,
    ES_GAMMA,
];

/// Embedded third order weights.
const ES_BHAT: [f64; 6] = [
    -71925161075.0 / 3900939759889.0,
    -71925161075.0 / 3900939759889.0,
    2973346383745.0 / 8160025745289.0,
    3972464885073.0 / 7694851252693.0,
    -263368882881.0 / 4213126269514.0,
    3295468053953.0 / 15064441987965.0,
];

fn esdirk_rows() -> [[f64; 5]; 5] {
    [
        [ES_GAMMA, 0.0, 0.0, 0.0, 0.0],
        [ES_A21, ES_A21, 0.0, 0.0, 0.0],
        [ES_A31, ES_A31, ES_A32, 0.0, 0.0],
        [ES_A41, ES_A41, ES_A42, ES_A43, 0.0],
        [ES_B[0], ES_B[1], ES_B[2], ES_B[3], ES_B[4]],
    ]
}

fn esdirk_nodes() -> [f64; 6] {
    [
        0.0,
        0.5,
        (2.0 - 2.0_f64.sqrt()) / 4.0,
        2012122486997.0 / 3467029789466.0,
        1.0,
        1.0,
    ]
}

/// One ESDIRK step. Returns `None` when a stage's Newton iteration fails.
fn esdirk43_step<F, E>(
    rhs: &mut Rhs<F>,
    t: f64,
    y: &Vector8,
    f0: &Vector8,
    h: f64,
    options: &SolveOptions,
) -> Result<Option<Attempt>, E>
where
    F: FnMut(f64, &Vector8) -> Result<Vector8, E>,
{
    let jac = rhs.jacobian(t, y, f0)?;
    let newton_matrix = SMatrix::<f64, 8, 8>::identity() - jac * (h * ES_GAMMA);
    let lu = newton_matrix.lu();
    if !lu.is_invertible() {
        return Ok(None);
    }

    let scale = y.map(|v| options.atol + options.rtol * v.abs());
    let newton_tol = (10.0 * f64::EPSILON / options.rtol).max(options.rtol.sqrt().min(0.03));
    let rows = esdirk_rows();
    let nodes = esdirk_nodes();

    let mut k = [Vector8::zeros(); 6];
    k[0] = *f0;
    let mut z = *y;

    for stage in 1..6 {
        let mut base = *y;
        for (j, &a) in rows[stage - 1].iter().enumerate().take(stage) {
            base += k[j] * (h * a);
        }
        let t_stage = t + nodes[stage] * h;

        // Start from the previous stage value
        let mut converged = false;
        let mut previous_norm = f64::INFINITY;
        for _ in 0..NEWTON_MAX_ITERATIONS {
            let fz = rhs.eval(t_stage, &z)?;
            let residual = z - base - fz * (h * ES_GAMMA);
            let Some(delta) = lu.solve(&(-residual)) else {
                return Ok(None);
            };
            z += delta;

            let norm = scaled_norm(&delta, &scale);
            if !norm.is_finite() || norm > previous_norm {
                break;
            }
            if norm < newton_tol {
                converged = true;
                break;
            }
            previous_norm = norm;
        }
        if !converged {
            return Ok(None);
        }
        k[stage] = (z - base) / (h * ES_GAMMA);
    }

    let mut error = Vector8::zeros();
    for j in 0..6 {
        error += k[j] * (ES_B[j] - ES_BHAT[j]);
    }

    Ok(Some(Attempt {
        y1: z,
        error: error * h,
        f1: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn decay(rate: f64) -> impl FnMut(f64, &Vector8) -> Result<Vector8, IntegrationError> {
        move |_t, y| Ok(*y * -rate)
    }

    #[test]
    fn test_dopri5_exponential_decay() {
        let y0 = Vector8::from_element(1.0);
        let solution = integrate(decay(1.0), (0.0, 2.0), y0, &SolveOptions::default()).unwrap();
        assert_relative_eq!(solution.final_state()[0], (-2.0_f64).exp(), max_relative = 1e-5);
        assert_eq!(*solution.t.last().unwrap(), 2.0);
    }

    #[test]
    fn test_esdirk43_exponential_decay() {
        let y0 = Vector8::from_element(1.0);
        let options = SolveOptions::default().with_method(Method::Esdirk43);
        let solution = integrate(decay(1.0), (0.0, 2.0), y0, &options).unwrap();
        assert_relative_eq!(solution.final_state()[3], (-2.0_f64).exp(), max_relative = 1e-4);
    }

    #[test]
    fn test_esdirk43_handles_stiff_decay_with_few_steps() {
        let y0 = Vector8::from_element(1.0);
        let stiff = SolveOptions::default().with_method(Method::Esdirk43);
        let solution = integrate(decay(1e5), (0.0, 1.0), y0, &stiff).unwrap();
        assert!(solution.final_state()[0].abs() < 1e-6);
        assert!(solution.stats.accepted < 2_000);
    }

    #[test]
    fn test_dopri5_reuses_last_stage_slope() {
        let options = SolveOptions::default().with_first_step(0.1);
        let solution = integrate(decay(1.0), (0.0, 2.0), Vector8::from_element(1.0), &options).unwrap();
        let attempts = solution.stats.accepted + solution.stats.rejected;
        assert_eq!(solution.stats.rhs_evaluations, 1 + 6 * attempts);
        assert_eq!(solution.dy.len(), solution.t.len());
    }

    #[test]
    fn test_dense_output_interpolates_between_steps() {
        let y0 = Vector8::from_element(1.0);
        let solution = integrate(decay(1.0), (0.0, 1.0), y0, &SolveOptions::default()).unwrap();
        for i in 0..=20 {
            let t = i as f64 / 20.0;
            let y = solution.sample(t).unwrap();
            assert_relative_eq!(y[0], (-t).exp(), max_relative = 1e-4);
        }
        assert!(solution.sample(1.5).is_none());
        assert!(solution.sample(-0.1).is_none());
    }

    #[test]
    fn test_invalid_span_and_step_budget() {
        let y0 = Vector8::zeros();
        let err = integrate(decay(1.0), (1.0, 1.0), y0, &SolveOptions::default()).unwrap_err();
        assert!(matches!(err, IntegrationError::InvalidSpan { .. }));

        let options = SolveOptions::default().with_max_step(1e-3).with_max_steps(10);
        let err = integrate(decay(1.0), (0.0, 1.0), Vector8::from_element(1.0), &options).unwrap_err();
        assert!(matches!(err, IntegrationError::TooManySteps { max_steps: 10, .. }));
    }

    #[test]
    fn test_rhs_errors_pass_through() {
        #[derive(Debug, PartialEq)]
        enum Failure {
            Rhs,
            Integration,
        }
        impl From<IntegrationError> for Failure {
            fn from(_: IntegrationError) -> Self {
                Failure::Integration
            }
        }

        let err = integrate(
            |t, y: &Vector8| if t > 0.5 { Err(Failure::Rhs) } else { Ok(*y) },
            (0.0, 1.0),
            Vector8::from_element(0.1),
            &SolveOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err, Failure::Rhs);
    }
}
