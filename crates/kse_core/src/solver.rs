//! Newton-type solver driving the residual to zero.
//!
//! The solver is an explicit state machine. Each outer iteration linearizes
//! the residual, computes a correction (Newton or preconditioned descent),
//! then backtracks on the step factor until the residual norm decreases.
//! Running out of iterations or step factor is reported through
//! [`ConvergeStatus`], never as an error.

use anyhow::{anyhow, bail, Context, Result};
use nalgebra::linalg::SVD;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::equation::{Constraints, Equation, LinearOperator};
use crate::error::{OrbitError, OrbitResult};
use crate::krylov::lsqr;
use crate::nonlinear::Dealiasing;
use crate::orbit::{Basis, Orbit};
use crate::spectral::{derivative, Axis};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Newton,
    Descent,
    /// Descent until the residual has decreased for `hybrid_window` steps in a
    /// row, then Newton; either phase hands over to the other when it stalls.
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InnerSolver {
    /// Matrix-free LSQR on the Jacobian action.
    Krylov,
    /// Explicit Jacobian and an SVD least-squares solve.
    Dense,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConvergeSettings {
    pub tolerance: f64,
    pub max_outer_iterations: usize,
    pub max_inner_iterations: usize,
    pub inner_tolerance: f64,
    pub method: Method,
    pub inner_solver: InnerSolver,
    pub preconditioning: bool,
    /// `(p_time, p_space)`: period and length corrections are scaled by
    /// `T^-p_time` and `L^-p_space`.
    pub preconditioner_exponents: (f64, f64),
    pub step_size: f64,
    pub min_step_size: f64,
    /// A first trial step is a blow-up when it multiplies the residual norm by more than this.
    pub divergence_factor: f64,
    /// Consecutive outer iterations with a blow-up before giving up.
    pub divergence_patience: usize,
    pub hybrid_window: usize,
    pub constraints: Constraints,
    pub dealiasing: Dealiasing,
    pub verbose: bool,
}

impl Default for ConvergeSettings {
    fn default() -> Self {
        Self {
            tolerance: 1e-10,
            max_outer_iterations: 100,
            max_inner_iterations: 500,
            inner_tolerance: 1e-12,
            method: Method::Hybrid,
            inner_solver: InnerSolver::Krylov,
            preconditioning: true,
            preconditioner_exponents: (1.0, 4.0),
            step_size: 1.0,
            min_step_size: 1e-6,
            divergence_factor: 1e4,
            divergence_patience: 3,
            hybrid_window: 5,
            constraints: Constraints::default(),
            dealiasing: Dealiasing::default(),
            verbose: false,
        }
    }
}

impl ConvergeSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.tolerance > 0.0) {
            bail!("tolerance must be positive.");
        }
        if self.max_outer_iterations == 0 {
            bail!("max_outer_iterations must be greater than zero.");
        }
        if self.max_inner_iterations == 0 {
            bail!("max_inner_iterations must be greater than zero.");
        }
        if !(self.inner_tolerance > 0.0) {
            bail!("inner_tolerance must be positive.");
        }
        if !(self.step_size > 0.0) {
            bail!("step_size must be positive.");
        }
        if !(self.min_step_size > 0.0) || self.min_step_size > self.step_size {
            bail!("min_step_size must be positive and no larger than step_size.");
        }
        if !(self.divergence_factor > 0.0) || self.divergence_patience == 0 {
            bail!("divergence_factor and divergence_patience must be positive.");
        }
        if self.hybrid_window == 0 {
            bail!("hybrid_window must be greater than zero.");
        }
        let (p_time, p_space) = self.preconditioner_exponents;
        if !p_time.is_finite() || !p_space.is_finite() {
            bail!("preconditioner exponents must be finite.");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergeStatus {
    Converged,
    Stalled,
    Diverged,
}

#[derive(Debug, Clone)]
pub struct ConvergeResult {
    pub orbit: Orbit,
    pub status: ConvergeStatus,
    /// Accepted steps.
    pub iterations: usize,
    /// Residual norm before the first step and after every accepted one.
    pub residual_history: Vec<f64>,
}

impl ConvergeResult {
    pub fn converged(&self) -> bool {
        self.status == ConvergeStatus::Converged
    }

    pub fn residual_norm(&self) -> f64 {
        self.residual_history.last().copied().unwrap_or(f64::INFINITY)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverState {
    Initializing,
    Linearizing,
    InnerSolve,
    StepAccept,
    StepReject,
    Converged,
    Stalled,
    Diverged,
}

struct Solver<'a> {
    settings: &'a ConvergeSettings,
    equation: Equation,
    orbit: Orbit,
    norm: f64,
    history: Vec<f64>,
    iterations: usize,
    phase: Method,
    operator: Option<LinearOperator>,
    direction: Option<DVector<f64>>,
    factor: f64,
    candidate: Option<(Orbit, f64)>,
    first_trial: bool,
    descent_run: usize,
    handovers: usize,
    blowups: usize,
}

impl<'a> Solver<'a> {
    fn new(orbit: Orbit, settings: &'a ConvergeSettings) -> Self {
        let phase = match settings.method {
            Method::Newton => Method::Newton,
            Method::Descent | Method::Hybrid => Method::Descent,
        };
        Self {
            settings,
            equation: Equation::new(settings.dealiasing),
            orbit,
            norm: f64::INFINITY,
            history: Vec::new(),
            iterations: 0,
            phase,
            operator: None,
            direction: None,
            factor: settings.step_size,
            candidate: None,
            first_trial: false,
            descent_run: 0,
            handovers: 0,
            blowups: 0,
        }
    }

    fn initialize(&mut self) -> Result<SolverState> {
        self.norm = self
            .equation
            .residual_norm(&self.orbit)
            .context("Failed to evaluate the initial residual.")?;
        self.history.push(self.norm);
        self.report("initial residual");
        Ok(if !self.norm.is_finite() {
            SolverState::Diverged
        } else if self.norm <= self.settings.tolerance {
            SolverState::Converged
        } else {
            SolverState::Linearizing
        })
    }

    fn linearize(&mut self) -> Result<SolverState> {
        let operator = self
            .equation
            .linearize(&self.orbit, self.settings.constraints)
            .context("Failed to linearize the residual.")?;
        self.operator = Some(operator);
        self.handovers = 0;
        Ok(SolverState::InnerSolve)
    }

    fn inner_solve(&mut self) -> Result<SolverState> {
        let operator = self
            .operator
            .as_ref()
            .ok_or_else(|| anyhow!("Inner solve requested before linearization."))?;
        let scaling = if self.settings.preconditioning {
            operator.preconditioner(&self.orbit, self.settings.preconditioner_exponents)
        } else {
            DVector::from_element(operator.layout().len(), 1.0)
        };
        let direction = match self.phase {
            Method::Newton => newton_direction(operator, &scaling, self.settings),
            _ => descent_direction(operator, &scaling),
        };
        let direction = match direction {
            Ok(Some(d)) if d.iter().all(|v| v.is_finite()) => d,
            Ok(_) | Err(OrbitError::NonFinite(_)) => return Ok(self.hand_over()),
            Err(err) => return Err(err).context("Failed to compute a correction."),
        };
        self.direction = Some(direction);
        self.factor = self.settings.step_size;
        self.first_trial = true;
        Ok(self.try_step())
    }

    fn try_step(&mut self) -> SolverState {
        let (Some(operator), Some(direction)) = (&self.operator, &self.direction) else {
            return SolverState::Stalled;
        };
        let trial = operator
            .layout()
            .step(&self.orbit, direction, self.factor)
            .ok()
            .and_then(|orbit| {
                let norm = self.equation.residual_norm(&orbit).ok()?;
                norm.is_finite().then_some((orbit, norm))
            });
        let trial_norm = trial.as_ref().map_or(f64::INFINITY, |(_, n)| *n);

        if self.first_trial {
            self.first_trial = false;
            if trial_norm > self.settings.divergence_factor * self.norm {
                self.blowups += 1;
                if self.blowups >= self.settings.divergence_patience {
                    warn!(
                        iteration = self.iterations,
                        residual = self.norm,
                        trial = trial_norm,
                        "residual ran away"
                    );
                    return SolverState::Diverged;
                }
            } else {
                self.blowups = 0;
            }
        }

        match trial {
            Some(candidate) if candidate.1 < self.norm => {
                self.candidate = Some(candidate);
                SolverState::StepAccept
            }
            _ => SolverState::StepReject,
        }
    }

    fn reject(&mut self) -> SolverState {
        self.factor *= 0.5;
        if self.factor < self.settings.min_step_size {
            return self.hand_over();
        }
        self.try_step()
    }

    /// A phase that cannot make progress passes the current linearization to
    /// the other phase once; hybrid mode only.
    fn hand_over(&mut self) -> SolverState {
        if self.settings.method != Method::Hybrid || self.handovers > 0 {
            return SolverState::Stalled;
        }
        self.handovers += 1;
        self.descent_run = 0;
        self.phase = match self.phase {
            Method::Newton => Method::Descent,
            _ => Method::Newton,
        };
        debug!(phase = ?self.phase, "switching solver phase");
        SolverState::InnerSolve
    }

    fn accept(&mut self) -> SolverState {
        let Some((orbit, norm)) = self.candidate.take() else {
            return SolverState::StepReject;
        };
        self.orbit = orbit;
        self.norm = norm;
        self.history.push(norm);
        self.iterations += 1;
        self.report("step accepted");

        if self.settings.method == Method::Hybrid && self.phase == Method::Descent {
            self.descent_run += 1;
            if self.descent_run >= self.settings.hybrid_window {
                self.phase = Method::Newton;
                self.descent_run = 0;
            }
        }

        if norm <= self.settings.tolerance {
            SolverState::Converged
        } else if self.iterations >= self.settings.max_outer_iterations {
            SolverState::Stalled
        } else {
            SolverState::Linearizing
        }
    }

    fn report(&self, message: &str) {
        if self.settings.verbose {
            info!(
                iteration = self.iterations,
                residual = self.norm,
                step = self.factor,
                phase = ?self.phase,
                "{}",
                message
            );
        } else {
            debug!(
                iteration = self.iterations,
                residual = self.norm,
                step = self.factor,
                phase = ?self.phase,
                "{}",
                message
            );
        }
    }

    fn finish(self, state: SolverState) -> ConvergeResult {
        let status = match state {
            SolverState::Converged => ConvergeStatus::Converged,
            SolverState::Diverged => ConvergeStatus::Diverged,
            _ => ConvergeStatus::Stalled,
        };
        if self.settings.verbose {
            info!(?status, iterations = self.iterations, residual = self.norm, "converge finished");
        } else {
            debug!(?status, iterations = self.iterations, residual = self.norm, "converge finished");
        }
        ConvergeResult {
            orbit: self.orbit,
            status,
            iterations: self.iterations,
            residual_history: self.history,
        }
    }
}

/// Solves `J P y = -F` and returns `P y`, or `None` when the solve breaks down.
fn newton_direction(
    operator: &LinearOperator,
    scaling: &DVector<f64>,
    settings: &ConvergeSettings,
) -> OrbitResult<Option<DVector<f64>>> {
    let rhs = -operator.residual_vector();
    let solution = match settings.inner_solver {
        InnerSolver::Dense => {
            let mut jacobian = operator.dense()?;
            for (j, s) in scaling.iter().enumerate() {
                jacobian.column_mut(j).scale_mut(*s);
            }
            let svd = SVD::new(jacobian, true, true);
            let cutoff = svd.singular_values.max() * 1e-10;
            match svd.solve(&rhs, cutoff) {
                Ok(y) => y,
                Err(reason) => {
                    warn!(reason, "dense least-squares solve failed");
                    return Ok(None);
                }
            }
        }
        InnerSolver::Krylov => {
            let outcome = lsqr(
                operator.layout().len(),
                |y| operator.apply(&y.component_mul(scaling)),
                |w| Ok(operator.apply_adjoint(w)?.component_mul(scaling)),
                &rhs,
                settings.inner_tolerance,
                settings.max_inner_iterations,
            )?;
            debug!(
                iterations = outcome.iterations,
                residual = outcome.residual_norm,
                "krylov solve"
            );
            outcome.solution
        }
    };
    Ok(Some(solution.component_mul(scaling)))
}

/// Preconditioned steepest descent on `1/2 |F|^2` with the step length that
/// minimizes the linearized residual.
fn descent_direction(
    operator: &LinearOperator,
    scaling: &DVector<f64>,
) -> OrbitResult<Option<DVector<f64>>> {
    let residual = operator.residual_vector();
    let gradient = operator.apply_adjoint(&residual)?;
    let direction = -gradient.component_mul(scaling).component_mul(scaling);
    let image = operator.apply(&direction)?;
    let curvature = image.norm_squared();
    if curvature == 0.0 {
        return Ok(None);
    }
    let length = -residual.dot(&image) / curvature;
    Ok(Some(direction * length))
}

/// Runs the solver from `orbit`, which must be in the modes basis.
pub fn converge(orbit: &Orbit, settings: &ConvergeSettings) -> Result<ConvergeResult> {
    settings.validate()?;
    orbit.require_basis(Basis::Modes, "converge")?;

    let mut solver = Solver::new(orbit.clone(), settings);
    let mut state = SolverState::Initializing;
    loop {
        state = match state {
            SolverState::Initializing => solver.initialize()?,
            SolverState::Linearizing => solver.linearize()?,
            SolverState::InnerSolve => solver.inner_solve()?,
            SolverState::StepAccept => solver.accept(),
            SolverState::StepReject => solver.reject(),
            SolverState::Converged | SolverState::Stalled | SolverState::Diverged => break,
        };
    }
    Ok(solver.finish(state))
}

/// What a converged state actually turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Integrity {
    Nontrivial,
    /// No time dependence: an equilibrium in disguise.
    Stationary,
    /// Collapsed onto `u = 0`.
    Zero,
}

pub const INTEGRITY_THRESHOLD: f64 = 1e-5;

pub fn classify(orbit: &Orbit) -> OrbitResult<Integrity> {
    let modes = orbit.to_modes()?;
    if modes.norm() < INTEGRITY_THRESHOLD {
        return Ok(Integrity::Zero);
    }
    if !modes.symmetry().is_stationary()
        && derivative(&modes, Axis::Time, 1)?.norm() < INTEGRITY_THRESHOLD
    {
        return Ok(Integrity::Stationary);
    }
    Ok(Integrity::Nontrivial)
}
