//! Tracing families of orbits by stepping a parameter or the grid.
//!
//! Every step starts the solver from the last converged orbit. Failed steps
//! are retried with half the step until `min_step_size`; running out of step
//! ends the run with the furthest orbit reached.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::discretization::{rediscretize, resize, Resolution};
use crate::error::OrbitError;
use crate::orbit::{Basis, Discretization, Orbit, Parameter};
use crate::solver::{converge, ConvergeResult, ConvergeSettings};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContinuationSettings {
    /// Initial magnitude of the parameter increment.
    pub step_size: f64,
    pub min_step_size: f64,
    pub max_steps: usize,
    /// Resample every guess to the grid its parameters call for.
    pub adapt_discretization: Option<Resolution>,
    pub converge: ConvergeSettings,
}

impl Default for ContinuationSettings {
    fn default() -> Self {
        Self {
            step_size: 0.05,
            min_step_size: 1e-4,
            max_steps: 1000,
            adapt_discretization: None,
            converge: ConvergeSettings::default(),
        }
    }
}

impl ContinuationSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.step_size > 0.0) {
            bail!("step_size must be positive.");
        }
        if !(self.min_step_size > 0.0) || self.min_step_size > self.step_size {
            bail!("min_step_size must be positive and no larger than step_size.");
        }
        if self.max_steps == 0 {
            bail!("max_steps must be greater than zero.");
        }
        self.converge.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuationStatus {
    /// The target was reached.
    Completed,
    /// A step failed even at the minimum step size.
    StepFloor,
    /// `max_steps` accepted steps did not reach the target.
    StepLimit,
    /// The starting orbit itself could not be converged.
    NotConverged,
}

#[derive(Debug, Clone)]
pub struct ContinuationResult {
    /// Furthest converged orbit, or the input when nothing converged.
    pub orbit: Orbit,
    pub status: ContinuationStatus,
    /// Converged orbits in order, starting with the converged input.
    pub family: Vec<Orbit>,
    /// Solver iterations spent on each member of `family`.
    pub iterations: Vec<usize>,
}

impl ContinuationResult {
    fn not_converged(orbit: &Orbit) -> Self {
        Self {
            orbit: orbit.clone(),
            status: ContinuationStatus::NotConverged,
            family: Vec::new(),
            iterations: Vec::new(),
        }
    }

    fn push(&mut self, result: ConvergeResult) {
        self.iterations.push(result.iterations);
        self.orbit = result.orbit.clone();
        self.family.push(result.orbit);
    }
}

fn report(verbose: bool, orbit: &Orbit, iterations: usize, step: f64) {
    let p = orbit.parameters();
    if verbose {
        info!(
            period = p.period,
            length = p.length,
            shift = p.shift,
            iterations,
            step,
            "continuation step converged"
        );
    } else {
        debug!(
            period = p.period,
            length = p.length,
            shift = p.shift,
            iterations,
            step,
            "continuation step converged"
        );
    }
}

/// Converges the starting orbit; `None` when it does not converge.
fn start(orbit: &Orbit, settings: &ConvergeSettings) -> Result<Option<ContinuationResult>> {
    orbit.require_basis(Basis::Modes, "continuation")?;
    let first = converge(orbit, settings).context("Failed to converge the starting orbit.")?;
    if !first.converged() {
        info!(status = ?first.status, "starting orbit did not converge");
        return Ok(None);
    }
    let mut result = ContinuationResult::not_converged(orbit);
    result.status = ContinuationStatus::Completed;
    result.push(first);
    Ok(Some(result))
}

/// Steps `parameter` from its current value to `target`, holding it fixed in
/// every solve.
pub fn continue_parameter(
    orbit: &Orbit,
    parameter: Parameter,
    target: f64,
    settings: &ContinuationSettings,
) -> Result<ContinuationResult> {
    settings.validate()?;
    let symmetry = orbit.symmetry();
    if !symmetry.parameters().contains(&parameter) {
        return Err(OrbitError::UnsupportedOperation {
            operation: "continuation in a parameter the class does not carry",
            symmetry,
        }
        .into());
    }
    if !target.is_finite() || (parameter != Parameter::Shift && target <= 0.0) {
        return Err(OrbitError::NonPositiveParameter {
            name: parameter.label(),
            value: target,
        }
        .into());
    }

    let mut converge_settings = settings.converge;
    converge_settings.constraints = converge_settings.constraints.with(parameter, true);

    let Some(mut result) = start(orbit, &converge_settings)? else {
        return Ok(ContinuationResult::not_converged(orbit));
    };
    let mut current = result.orbit.parameters().get(parameter);
    let direction = (target - current).signum();
    let mut step = settings.step_size;
    let mut accepted = 0;

    while (target - current) * direction > 0.0 {
        if accepted >= settings.max_steps {
            result.status = ContinuationStatus::StepLimit;
            break;
        }
        let next = if (target - current).abs() <= step {
            target
        } else {
            current + direction * step
        };
        let mut guess = result
            .orbit
            .with_parameter(parameter, next)
            .with_context(|| format!("Invalid {} = {}", parameter.label(), next))?;
        if let Some(resolution) = settings.adapt_discretization {
            guess = rediscretize(&guess, resolution)?;
        }

        let attempt = converge(&guess, &converge_settings)
            .with_context(|| format!("Failed to run the solver at {} = {}", parameter.label(), next))?;
        if attempt.converged() {
            report(settings.converge.verbose, &attempt.orbit, attempt.iterations, step);
            result.push(attempt);
            current = next;
            accepted += 1;
        } else {
            step *= 0.5;
            debug!(
                parameter = parameter.label(),
                value = next,
                status = ?attempt.status,
                step,
                "continuation step failed"
            );
            if step < settings.min_step_size {
                result.status = ContinuationStatus::StepFloor;
                break;
            }
        }
    }

    info!(
        parameter = parameter.label(),
        reached = current,
        target,
        status = ?result.status,
        "continuation finished"
    );
    Ok(result)
}

/// The grid one step closer to `target`: the smaller axis that still differs
/// moves by two points.
fn next_discretization(current: Discretization, target: Discretization, stationary: bool) -> Discretization {
    let toward = |from: usize, to: usize| {
        if from < to {
            (from + 2).min(to)
        } else {
            from.saturating_sub(2).max(to)
        }
    };
    let time_differs = !stationary && current.time_points != target.time_points;
    let space_differs = current.space_points != target.space_points;
    let mut next = current;
    if stationary {
        next.time_points = target.time_points;
    }
    if time_differs && (!space_differs || current.time_points <= current.space_points) {
        next.time_points = toward(current.time_points, target.time_points);
    } else if space_differs {
        next.space_points = toward(current.space_points, target.space_points);
    }
    next
}

/// Walks the orbit's grid to `target`, re-converging after every resize.
pub fn continue_discretization(
    orbit: &Orbit,
    target: Discretization,
    settings: &ContinuationSettings,
) -> Result<ContinuationResult> {
    settings.validate()?;
    let symmetry = orbit.symmetry();
    symmetry.validate(target)?;

    let Some(mut result) = start(orbit, &settings.converge)? else {
        return Ok(ContinuationResult::not_converged(orbit));
    };
    let mut accepted = 0;
    while result.orbit.discretization() != target {
        if accepted >= settings.max_steps {
            result.status = ContinuationStatus::StepLimit;
            break;
        }
        let next = next_discretization(
            result.orbit.discretization(),
            target,
            symmetry.is_stationary(),
        );
        let guess = resize(&result.orbit, next)?;
        let attempt = converge(&guess, &settings.converge)
            .with_context(|| format!("Failed to run the solver on a {:?} grid", next.field_shape()))?;
        if !attempt.converged() {
            debug!(grid = ?next.field_shape(), status = ?attempt.status, "resized orbit did not converge");
            result.status = ContinuationStatus::StepFloor;
            break;
        }
        report(settings.converge.verbose, &attempt.orbit, attempt.iterations, 2.0);
        result.push(attempt);
        accepted += 1;
    }
    Ok(result)
}

/// One independent continuation run.
#[derive(Debug, Clone)]
pub struct ContinuationJob {
    pub orbit: Orbit,
    pub parameter: Parameter,
    pub target: f64,
}

/// Runs independent jobs on scoped threads; results come back in job order.
pub fn continue_many(
    jobs: &[ContinuationJob],
    settings: &ContinuationSettings,
) -> Vec<Result<ContinuationResult>> {
    std::thread::scope(|scope| {
        let handles: Vec<_> = jobs
            .iter()
            .map(|job| {
                scope.spawn(move || continue_parameter(&job.orbit, job.parameter, job.target, settings))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(anyhow!("Continuation worker panicked.")))
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{reference_equilibrium, sample_orbit};
    use crate::solver::{InnerSolver, Method};
    use crate::symmetry::Symmetry;

    fn newton_settings() -> ContinuationSettings {
        ContinuationSettings {
            converge: ConvergeSettings {
                method: Method::Newton,
                inner_solver: InnerSolver::Dense,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_small_length_steps_converge_quickly() {
        let start = reference_equilibrium();
        let target = start.parameters().length + 0.1;
        let settings = ContinuationSettings {
            step_size: 0.06,
            ..newton_settings()
        };
        let result = continue_parameter(&start, Parameter::Length, target, &settings)
            .expect("continuation runs");
        println!("iterations per step: {:?}", result.iterations);
        assert_eq!(result.status, ContinuationStatus::Completed);
        assert!((result.orbit.parameters().length - target).abs() < 1e-12);
        assert_eq!(result.family.len(), 3);
        assert!(result.iterations[1..].iter().all(|&n| (1..=6).contains(&n)));
    }

    #[test]
    fn test_step_floor_returns_furthest_orbit() {
        let start = reference_equilibrium();
        let mut settings = newton_settings();
        settings.step_size = 5.0;
        settings.min_step_size = 4.0;
        settings.converge.max_outer_iterations = 2;
        let result = continue_parameter(&start, Parameter::Length, 20.0, &settings).unwrap();
        assert_eq!(result.status, ContinuationStatus::StepFloor);
        assert_eq!(result.family.len(), 1);
        assert_eq!(result.orbit.parameters(), start.parameters());
    }

    #[test]
    fn test_unconverged_start_is_reported() {
        let start = sample_orbit(Symmetry::Full, 8, 16);
        let start = start.with_state(start.state() * 20.0, Basis::Modes).unwrap();
        let mut settings = ContinuationSettings::default();
        settings.converge.max_outer_iterations = 1;
        let result = continue_parameter(&start, Parameter::Period, 25.0, &settings).unwrap();
        assert_eq!(result.status, ContinuationStatus::NotConverged);
        assert_eq!(result.orbit, start);
        assert!(result.family.is_empty());
    }

    #[test]
    fn test_rejects_parameters_the_class_lacks() {
        let start = reference_equilibrium();
        let settings = ContinuationSettings::default();
        assert!(continue_parameter(&start, Parameter::Period, 10.0, &settings).is_err());
        assert!(continue_parameter(&start, Parameter::Length, -1.0, &settings).is_err());

        let bad = ContinuationSettings {
            max_steps: 0,
            ..Default::default()
        };
        let err = continue_parameter(&start, Parameter::Length, 7.0, &bad).unwrap_err();
        assert!(err.to_string().contains("max_steps"));
    }

    #[test]
    fn test_grid_walk_moves_two_points_at_a_time() {
        let a = Discretization::new(8, 16);
        let b = Discretization::new(12, 18);
        let first = next_discretization(a, b, false);
        assert_eq!(first, Discretization::new(10, 16));
        let second = next_discretization(first, b, false);
        assert_eq!(second, Discretization::new(12, 16));
        let third = next_discretization(second, b, false);
        assert_eq!(third, b);

        let stationary = next_discretization(Discretization::new(1, 16), Discretization::new(1, 12), true);
        assert_eq!(stationary, Discretization::new(1, 14));
    }

    #[test]
    fn test_discretization_continuation_reconverges() {
        let start = reference_equilibrium();
        let target = Discretization::new(1, 20);
        let result = continue_discretization(&start, target, &newton_settings()).unwrap();
        println!("iterations per grid: {:?}", result.iterations);
        assert_eq!(result.status, ContinuationStatus::Completed);
        assert_eq!(result.orbit.discretization(), target);
        assert_eq!(result.family.len(), 3);
    }

    #[test]
    fn test_independent_runs_in_parallel() {
        let start = reference_equilibrium();
        let length = start.parameters().length;
        let jobs = vec![
            ContinuationJob {
                orbit: start.clone(),
                parameter: Parameter::Length,
                target: length + 0.05,
            },
            ContinuationJob {
                orbit: start,
                parameter: Parameter::Length,
                target: length - 0.05,
            },
        ];
        let results = continue_many(&jobs, &newton_settings());
        assert_eq!(results.len(), 2);
        for (job, result) in jobs.iter().zip(results) {
            let result = result.expect("continuation runs");
            assert_eq!(result.status, ContinuationStatus::Completed);
            assert!((result.orbit.parameters().length - job.target).abs() < 1e-12);
        }
    }
}
