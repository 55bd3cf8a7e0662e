//! The Kuramoto-Sivashinsky residual and its linearization.
//!
//! In the comoving frame of a relative orbit the equation reads
//!
//! ```text
//! F(u, T, L, S) = u_t + u_xx + u_xxxx + u u_x - (S/T) u_x
//! ```
//!
//! with the parameters entering through the wavenumbers `2 pi k / L` and the
//! frequencies `2 pi k / T`. Free parameters are appended to the unknowns, so
//! the Jacobian is rectangular whenever any of them is unconstrained.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{OrbitError, OrbitResult};
use crate::nonlinear::{Dealiasing, Linearization};
use crate::orbit::{flatten_rows, unflatten_rows, Basis, Orbit, Parameter};
use crate::spectral::{Axis, SpectralGrid};

/// Parameters held fixed while solving.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    pub period: bool,
    pub length: bool,
    pub shift: bool,
}

impl Constraints {
    pub fn fixing(parameters: &[Parameter]) -> Self {
        parameters
            .iter()
            .fold(Self::default(), |c, &p| c.with(p, true))
    }

    pub fn with(mut self, parameter: Parameter, fixed: bool) -> Self {
        match parameter {
            Parameter::Period => self.period = fixed,
            Parameter::Length => self.length = fixed,
            Parameter::Shift => self.shift = fixed,
        }
        self
    }

    pub fn is_fixed(&self, parameter: Parameter) -> bool {
        match parameter {
            Parameter::Period => self.period,
            Parameter::Length => self.length,
            Parameter::Shift => self.shift,
        }
    }
}

/// Ordering of the unknowns: row-major modes, then the free parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct StateLayout {
    pub mode_shape: (usize, usize),
    pub free: Vec<Parameter>,
}

impl StateLayout {
    pub fn new(orbit: &Orbit, constraints: Constraints) -> Self {
        let free = orbit
            .symmetry()
            .parameters()
            .iter()
            .copied()
            .filter(|&p| !constraints.is_fixed(p))
            .collect();
        Self {
            mode_shape: orbit.mode_shape(),
            free,
        }
    }

    pub fn mode_len(&self) -> usize {
        self.mode_shape.0 * self.mode_shape.1
    }

    pub fn len(&self) -> usize {
        self.mode_len() + self.free.len()
    }

    fn check(&self, vector: &DVector<f64>) -> OrbitResult<()> {
        if vector.len() != self.len() {
            return Err(OrbitError::ShapeMismatch {
                expected: (self.len(), 1),
                found: (vector.len(), 1),
            });
        }
        Ok(())
    }

    /// Splits a solver vector into its modes block and parameter increments.
    pub fn split(&self, vector: &DVector<f64>) -> OrbitResult<(DMatrix<f64>, Vec<f64>)> {
        self.check(vector)?;
        let n = self.mode_len();
        let modes = unflatten_rows(&vector.as_slice()[..n], self.mode_shape);
        Ok((modes, vector.as_slice()[n..].to_vec()))
    }

    /// `orbit + factor * delta`, as a new orbit.
    pub fn step(&self, orbit: &Orbit, delta: &DVector<f64>, factor: f64) -> OrbitResult<Orbit> {
        orbit.require_basis(Basis::Modes, "step")?;
        let (modes, increments) = self.split(delta)?;
        let mut parameters = orbit.parameters();
        for (&p, d) in self.free.iter().zip(increments) {
            parameters = parameters.set(p, parameters.get(p) + factor * d);
        }
        Orbit::new(
            orbit.state() + modes * factor,
            Basis::Modes,
            parameters,
            orbit.symmetry(),
            orbit.discretization(),
        )
    }
}

/// The governing equation together with its dealiasing policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Equation {
    pub dealiasing: Dealiasing,
}

impl Equation {
    pub fn new(dealiasing: Dealiasing) -> Self {
        Self { dealiasing }
    }

    /// Mode-shaped residual `F(u)`.
    pub fn residual(&self, orbit: &Orbit) -> OrbitResult<DMatrix<f64>> {
        orbit.require_basis(Basis::Modes, "residual")?;
        let grid = SpectralGrid::new(orbit);
        let nonlinear = Linearization::new(orbit, grid.dealias_mask(self.dealiasing))?;
        Ok(grid.linear(orbit.state())? + nonlinear.value())
    }

    pub fn residual_norm(&self, orbit: &Orbit) -> OrbitResult<f64> {
        Ok(self.residual(orbit)?.norm())
    }

    /// `1/2 |F|^2`.
    pub fn cost(&self, orbit: &Orbit) -> OrbitResult<f64> {
        Ok(0.5 * self.residual(orbit)?.norm_squared())
    }

    pub fn linearize(&self, orbit: &Orbit, constraints: Constraints) -> OrbitResult<LinearOperator> {
        orbit.require_basis(Basis::Modes, "linearize")?;
        let grid = SpectralGrid::new(orbit);
        let nonlinear = Linearization::new(orbit, grid.dealias_mask(self.dealiasing))?;
        let u = orbit.state();
        let term = nonlinear.value();
        let residual = grid.linear(u)? + &term;
        let layout = StateLayout::new(orbit, constraints);

        let params = orbit.parameters();
        let comoving = match grid.comoving_velocity() {
            Some(velocity) => grid.differentiate(u, Axis::Space, 1)? * -velocity,
            None => DMatrix::zeros(u.nrows(), u.ncols()),
        };
        let mut parameter_columns = Vec::with_capacity(layout.free.len());
        for &p in &layout.free {
            let column = match p {
                Parameter::Period => {
                    (grid.differentiate(u, Axis::Time, 1)? + &comoving) * (-1.0 / params.period)
                }
                Parameter::Length => {
                    grid.differentiate(u, Axis::Space, 2)? * (-2.0 / params.length)
                        + grid.differentiate(u, Axis::Space, 4)? * (-4.0 / params.length)
                        + (&term + &comoving) * (-1.0 / params.length)
                }
                Parameter::Shift => {
                    grid.differentiate(u, Axis::Space, 1)? * (-1.0 / params.period)
                }
            };
            parameter_columns.push(column);
        }

        Ok(LinearOperator {
            grid,
            nonlinear,
            layout,
            residual,
            parameter_columns,
        })
    }
}

/// Jacobian of the residual at one orbit, available only through its action.
#[derive(Debug, Clone)]
pub struct LinearOperator {
    grid: SpectralGrid,
    nonlinear: Linearization,
    layout: StateLayout,
    residual: DMatrix<f64>,
    parameter_columns: Vec<DMatrix<f64>>,
}

impl LinearOperator {
    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    pub fn residual_vector(&self) -> DVector<f64> {
        DVector::from_vec(flatten_rows(&self.residual))
    }

    /// `J d`, where `d` follows [`StateLayout`].
    pub fn apply(&self, direction: &DVector<f64>) -> OrbitResult<DVector<f64>> {
        let (modes, increments) = self.layout.split(direction)?;
        let mut out = self.grid.linear(&modes)? + self.nonlinear.action(&modes);
        for (column, d) in self.parameter_columns.iter().zip(increments) {
            out += column * d;
        }
        Ok(DVector::from_vec(flatten_rows(&out)))
    }

    /// `J^T w` for a mode-shaped cotangent `w`.
    pub fn apply_adjoint(&self, cotangent: &DVector<f64>) -> OrbitResult<DVector<f64>> {
        let n = self.layout.mode_len();
        if cotangent.len() != n {
            return Err(OrbitError::ShapeMismatch {
                expected: (n, 1),
                found: (cotangent.len(), 1),
            });
        }
        let w = unflatten_rows(cotangent.as_slice(), self.layout.mode_shape);
        let modes = self.grid.linear_adjoint(&w)? + self.nonlinear.adjoint(&w);
        let mut out = flatten_rows(&modes);
        out.extend(self.parameter_columns.iter().map(|column| column.dot(&w)));
        Ok(DVector::from_vec(out))
    }

    /// Dense Jacobian assembled column by column from [`LinearOperator::apply`].
    pub fn dense(&self) -> OrbitResult<DMatrix<f64>> {
        let (rows, cols) = (self.layout.mode_len(), self.layout.len());
        let mut jacobian = DMatrix::zeros(rows, cols);
        let mut basis = DVector::zeros(cols);
        for j in 0..cols {
            basis[j] = 1.0;
            jacobian.set_column(j, &self.apply(&basis)?);
            basis[j] = 0.0;
        }
        Ok(jacobian)
    }

    /// Diagonal right preconditioner: `1/(|w| + q^2 + q^4)` on modes,
    /// `T^-p_time` and `L^-p_space` on the period and length corrections.
    pub fn preconditioner(&self, orbit: &Orbit, exponents: (f64, f64)) -> DVector<f64> {
        let mut diagonal = flatten_rows(&self.grid.preconditioner());
        let params = orbit.parameters();
        diagonal.extend(self.layout.free.iter().map(|p| match p {
            Parameter::Period => params.period.powf(-exponents.0),
            Parameter::Length => params.length.powf(-exponents.1),
            Parameter::Shift => 1.0,
        }));
        DVector::from_vec(diagonal)
    }
}

/// Residual of `orbit` with the default dealiasing policy.
pub fn residual(orbit: &Orbit) -> OrbitResult<DMatrix<f64>> {
    Equation::default().residual(orbit)
}

/// `J d` at `orbit` with every parameter free and the default dealiasing policy.
pub fn jacobian_action(orbit: &Orbit, direction: &DVector<f64>) -> OrbitResult<DVector<f64>> {
    Equation::default()
        .linearize(orbit, Constraints::default())?
        .apply(direction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{sample_modes, sample_orbit};
    use crate::orbit::Discretization;
    use crate::symmetry::Symmetry;

    fn direction(layout: &StateLayout) -> DVector<f64> {
        let modes = sample_modes(layout.mode_shape).map(|x| x.cos() * 0.1);
        let mut values = flatten_rows(&modes);
        values.extend((0..layout.free.len()).map(|i| 0.3 - 0.2 * i as f64));
        DVector::from_vec(values)
    }

    fn grid_for(symmetry: Symmetry) -> usize {
        if symmetry.is_stationary() {
            1
        } else {
            8
        }
    }

    #[test]
    fn test_zero_orbit_is_exact_solution() {
        for symmetry in Symmetry::ALL {
            let orbit = Orbit::zeros(
                Basis::Modes,
                crate::orbit::Parameters::new(30.0, 22.0).with_shift(1.0),
                symmetry,
                Discretization::new(grid_for(symmetry), 16),
            )
            .unwrap();
            let norm = Equation::default().residual_norm(&orbit).unwrap();
            assert_eq!(norm, 0.0, "{:?}", symmetry);
        }
    }

    #[test]
    fn test_residual_requires_modes() {
        let orbit = sample_orbit(Symmetry::Full, 8, 16).to_field().unwrap();
        assert!(matches!(
            residual(&orbit),
            Err(OrbitError::WrongBasis { .. })
        ));
    }

    #[test]
    fn test_jacobian_matches_finite_differences() {
        let equation = Equation::default();
        for symmetry in Symmetry::ALL {
            let orbit = sample_orbit(symmetry, grid_for(symmetry), 16);
            let operator = equation.linearize(&orbit, Constraints::default()).unwrap();
            let layout = operator.layout().clone();
            let d = direction(&layout);
            let exact = operator.apply(&d).unwrap();

            let eps = 1e-6;
            let plus = layout.step(&orbit, &d, eps).unwrap();
            let minus = layout.step(&orbit, &d, -eps).unwrap();
            let fd = (equation.residual(&plus).unwrap() - equation.residual(&minus).unwrap())
                / (2.0 * eps);
            let fd = DVector::from_vec(flatten_rows(&fd));
            let err = (&fd - &exact).amax();
            println!("{:?}: finite difference error {}", symmetry, err);
            assert!(
                err < 1e-6 * exact.amax().max(1.0),
                "{:?}: Jacobian action off by {}",
                symmetry,
                err
            );
        }
    }

    #[test]
    fn test_adjoint_is_transpose() {
        for symmetry in Symmetry::ALL {
            let orbit = sample_orbit(symmetry, grid_for(symmetry), 16);
            let operator = Equation::new(Dealiasing::None)
                .linearize(&orbit, Constraints::default())
                .unwrap();
            let d = direction(operator.layout());
            let w = DVector::from_vec(flatten_rows(&sample_modes(orbit.mode_shape())));
            let lhs = operator.apply(&d).unwrap().dot(&w);
            let rhs = d.dot(&operator.apply_adjoint(&w).unwrap());
            assert!(
                (lhs - rhs).abs() <= 1e-10 * lhs.abs().max(1.0),
                "{:?}: {} vs {}",
                symmetry,
                lhs,
                rhs
            );
        }
    }

    #[test]
    fn test_travelling_wave_residual_matches_comoving_periodic_orbit() {
        let wave = sample_orbit(Symmetry::RelativeEquilibrium, 1, 16);
        let snapshot = wave.to_field().unwrap().into_state();
        let tiled = DMatrix::from_fn(8, 16, |_, j| snapshot[(0, j)]);
        let periodic = Orbit::from_field(tiled, wave.parameters(), Symmetry::Relative)
            .unwrap()
            .to_modes()
            .unwrap();

        let equation = Equation::default();
        let stationary = wave
            .with_state(equation.residual(&wave).unwrap(), Basis::Modes)
            .unwrap()
            .to_field()
            .unwrap();
        let comoving = periodic
            .with_state(equation.residual(&periodic).unwrap(), Basis::Modes)
            .unwrap()
            .to_field()
            .unwrap();
        assert!(stationary.norm() > 1e-3, "Sample wave should not solve the equation");
        for i in 0..8 {
            let diff = (comoving.state().row(i) - stationary.state().row(0)).amax();
            assert!(diff < 1e-12, "Row {} differs by {}", i, diff);
        }
    }

    #[test]
    fn test_dense_matches_action() {
        let orbit = sample_orbit(Symmetry::Antisymmetric, 4, 8);
        let operator = Equation::default()
            .linearize(&orbit, Constraints::fixing(&[Parameter::Period]))
            .unwrap();
        assert_eq!(operator.layout().free, vec![Parameter::Length]);
        let jacobian = operator.dense().unwrap();
        assert_eq!(jacobian.shape(), (9, 10));
        let d = direction(operator.layout());
        let diff = (&jacobian * &d - operator.apply(&d).unwrap()).amax();
        assert!(diff < 1e-12, "Dense Jacobian differs by {}", diff);
    }

    #[test]
    fn test_step_rejects_negative_length() {
        let orbit = sample_orbit(Symmetry::Equilibrium, 1, 16);
        let layout = StateLayout::new(&orbit, Constraints::default());
        let mut delta = DVector::zeros(layout.len());
        delta[layout.len() - 1] = -100.0;
        let res = layout.step(&orbit, &delta, 1.0);
        assert!(matches!(res, Err(OrbitError::NonPositiveParameter { .. })));
    }
}
