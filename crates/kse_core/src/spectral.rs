//! Spectral derivatives, the linear part of the equation and the diagonal preconditioner.
//!
//! Derivatives act on Fourier pairs `(re, im)` as multiplication by `(i k)^p`.
//! In the stored layout this is an elementwise product with real multipliers
//! followed, for odd orders, by swapping the real and imaginary blocks
//! along the differentiated axis.

use std::f64::consts::PI;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::{OrbitError, OrbitResult};
use crate::nonlinear::Dealiasing;
use crate::orbit::{Basis, Orbit, Parameters};
use crate::symmetry::{ModeRule, Symmetry};
use crate::transforms::temporal_index;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    Time,
    Space,
}

/// `2 pi k / L` for `k = 1..=count`.
pub fn wavenumbers(length: f64, count: usize) -> Vec<f64> {
    (1..=count).map(|k| 2.0 * PI * k as f64 / length).collect()
}

/// `2 pi k / T` for `k = 1..=count`.
pub fn frequencies(period: f64, count: usize) -> Vec<f64> {
    (1..=count).map(|k| 2.0 * PI * k as f64 / period).collect()
}

/// Signs applied to the real and imaginary blocks before the swap, so that the
/// pair `(re, im)` ends up multiplied by `i^order`.
pub(crate) fn so2_coefficients(order: u32) -> (f64, f64) {
    match order % 4 {
        0 => (1.0, 1.0),
        1 => (1.0, -1.0),
        2 => (-1.0, -1.0),
        _ => (-1.0, 1.0),
    }
}

/// First spatial derivative of complete spatial modes, one row per time point.
pub(crate) fn spatial_dx(spatial: &DMatrix<f64>, length: f64) -> DMatrix<f64> {
    let m = spatial.ncols() / 2;
    let q = wavenumbers(length, m);
    let mut out = DMatrix::zeros(spatial.nrows(), 2 * m);
    for k in 0..m {
        for i in 0..spatial.nrows() {
            out[(i, k)] = -q[k] * spatial[(i, m + k)];
            out[(i, m + k)] = q[k] * spatial[(i, k)];
        }
    }
    out
}

/// Wavenumber tables for one orbit's modes layout.
///
/// Built once per orbit evaluation and shared by every derivative taken there.
#[derive(Debug, Clone)]
pub struct SpectralGrid {
    rule: ModeRule,
    shape: (usize, usize),
    /// Temporal frequency index of each row (0 for the mean row).
    row_index: Vec<usize>,
    /// Spatial wavenumber index of each column, starting at 1.
    col_index: Vec<usize>,
    omega: Vec<f64>,
    q: Vec<f64>,
    parameters: Parameters,
    time_points: usize,
    space_points: usize,
}

impl SpectralGrid {
    pub fn new(orbit: &Orbit) -> Self {
        let symmetry = orbit.symmetry();
        let discretization = orbit.discretization();
        let rule = symmetry.rule().modes;
        let shape = symmetry.mode_shape(discretization);
        let n = if symmetry.is_stationary() { 0 } else { shape.0 / 2 };
        let m = discretization.space_points / 2 - 1;
        let row_index = (0..shape.0).map(|r| temporal_index(r, n)).collect();
        let col_index = (0..shape.1).map(|c| c % m + 1).collect();
        let parameters = orbit.parameters();
        let omega = if n > 0 {
            frequencies(parameters.period, n)
        } else {
            Vec::new()
        };
        Self {
            rule,
            shape,
            row_index,
            col_index,
            omega,
            q: wavenumbers(parameters.length, m),
            parameters,
            time_points: discretization.time_points,
            space_points: discretization.space_points,
        }
    }

    fn n(&self) -> usize {
        self.omega.len()
    }

    fn m(&self) -> usize {
        self.q.len()
    }

    fn time_multiplier(&self, row: usize, order: u32) -> f64 {
        let k = self.row_index[row];
        if k == 0 {
            return if order == 0 { 1.0 } else { 0.0 };
        }
        let (c1, c2) = so2_coefficients(order);
        let sign = if row <= self.n() { c1 } else { c2 };
        sign * self.omega[k - 1].powi(order as i32)
    }

    fn space_multiplier(&self, col: usize, order: u32) -> f64 {
        let (c1, c2) = so2_coefficients(order);
        let sign = if self.rule.is_complete_in_space() && col >= self.m() {
            c2
        } else {
            c1
        };
        sign * self.q[self.col_index[col] - 1].powi(order as i32)
    }

    /// Mode-shaped multipliers applied before the block swap.
    pub fn multipliers(&self, axis: Axis, order: u32) -> DMatrix<f64> {
        DMatrix::from_fn(self.shape.0, self.shape.1, |r, c| match axis {
            Axis::Time => self.time_multiplier(r, order),
            Axis::Space => self.space_multiplier(c, order),
        })
    }

    /// Derivative of a modes-layout state.
    ///
    /// Odd spatial orders leave the sine-type layouts, so they are rejected here.
    pub fn differentiate(
        &self,
        state: &DMatrix<f64>,
        axis: Axis,
        order: u32,
    ) -> OrbitResult<DMatrix<f64>> {
        if state.shape() != self.shape {
            return Err(OrbitError::ShapeMismatch {
                expected: self.shape,
                found: state.shape(),
            });
        }
        if order == 0 {
            return Ok(state.clone());
        }
        let odd = order % 2 == 1;
        if axis == Axis::Space && odd && !self.rule.is_complete_in_space() {
            return Err(OrbitError::UnsupportedOperation {
                operation: "odd-order spatial derivative in a sine-type layout",
                symmetry: self.symmetry_hint(),
            });
        }
        let mut out = state.component_mul(&self.multipliers(axis, order));
        if odd {
            match axis {
                Axis::Time => {
                    let n = self.n();
                    for k in 1..=n {
                        out.swap_rows(k, n + k);
                    }
                }
                Axis::Space => {
                    let m = self.m();
                    for k in 0..m {
                        out.swap_columns(k, m + k);
                    }
                }
            }
        }
        Ok(out)
    }

    fn symmetry_hint(&self) -> Symmetry {
        match self.rule {
            ModeRule::Complete => Symmetry::Full,
            ModeRule::Sine => Symmetry::Antisymmetric,
            ModeRule::ParityInterleaved => Symmetry::ShiftReflection,
            ModeRule::StationarySine => Symmetry::Equilibrium,
            ModeRule::StationaryComplete => Symmetry::RelativeEquilibrium,
        }
    }

    /// Linear part of the equation, `u_t + u_xx + u_xxxx - (S/T) u_x`.
    ///
    /// The comoving term is present only when the orbit carries a nonzero shift.
    pub fn linear(&self, state: &DMatrix<f64>) -> OrbitResult<DMatrix<f64>> {
        let mut out = self.differentiate(state, Axis::Time, 1)?;
        out += self.differentiate(state, Axis::Space, 2)?;
        out += self.differentiate(state, Axis::Space, 4)?;
        if let Some(velocity) = self.comoving_velocity() {
            out -= self.differentiate(state, Axis::Space, 1)? * velocity;
        }
        Ok(out)
    }

    /// Transpose of [`SpectralGrid::linear`]; odd derivatives are antisymmetric.
    pub fn linear_adjoint(&self, state: &DMatrix<f64>) -> OrbitResult<DMatrix<f64>> {
        let mut out = -self.differentiate(state, Axis::Time, 1)?;
        out += self.differentiate(state, Axis::Space, 2)?;
        out += self.differentiate(state, Axis::Space, 4)?;
        if let Some(velocity) = self.comoving_velocity() {
            out += self.differentiate(state, Axis::Space, 1)? * velocity;
        }
        Ok(out)
    }

    /// `S / T` for comoving layouts with a shift.
    pub fn comoving_velocity(&self) -> Option<f64> {
        let Parameters { period, shift, .. } = self.parameters;
        (self.rule.is_complete_in_space() && shift != 0.0).then(|| shift / period)
    }

    /// Diagonal preconditioner `1 / (|w| + q^2 + q^4)`.
    pub fn preconditioner(&self) -> DMatrix<f64> {
        DMatrix::from_fn(self.shape.0, self.shape.1, |r, c| {
            let k = self.row_index[r];
            let w = if k == 0 { 0.0 } else { self.omega[k - 1].abs() };
            let q = self.q[self.col_index[c] - 1];
            1.0 / (w + q.powi(2) + q.powi(4))
        })
    }

    /// Zero-one mask implementing the dealiasing policy, `None` when nothing is masked.
    ///
    /// The two-thirds rule keeps spatial wavenumbers `k <= M/3` and temporal
    /// frequencies `k <= N/3`.
    pub fn dealias_mask(&self, policy: Dealiasing) -> Option<DMatrix<f64>> {
        match policy {
            Dealiasing::None => None,
            Dealiasing::TwoThirds => {
                let stationary = self.rule.is_stationary();
                Some(DMatrix::from_fn(self.shape.0, self.shape.1, |r, c| {
                    let space_ok = 3 * self.col_index[c] <= self.space_points;
                    let time_ok = stationary || 3 * self.row_index[r] <= self.time_points;
                    if space_ok && time_ok {
                        1.0
                    } else {
                        0.0
                    }
                }))
            }
        }
    }
}

/// Spectral derivative of order `order` along `axis`.
///
/// Odd spatial derivatives of sine-type classes are not representable in their
/// own layout. Those orbits are first reinterpreted in the class with complete
/// spatial modes and the same time dependence: [`Symmetry::Full`] for periodic
/// orbits, [`Symmetry::RelativeEquilibrium`] at zero shift for equilibria.
pub fn derivative(orbit: &Orbit, axis: Axis, order: u32) -> OrbitResult<Orbit> {
    orbit.require_basis(Basis::Modes, "derivative")?;
    let symmetry = orbit.symmetry();
    let promote =
        axis == Axis::Space && order % 2 == 1 && !symmetry.rule().modes.is_complete_in_space();
    let source = if promote {
        let target = if symmetry.is_stationary() {
            Symmetry::RelativeEquilibrium
        } else {
            Symmetry::Full
        };
        orbit.with_symmetry(target)?
    } else {
        orbit.clone()
    };
    let grid = SpectralGrid::new(&source);
    let state = grid.differentiate(source.state(), axis, order)?;
    source.with_state(state, Basis::Modes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::sample_orbit;
    use crate::orbit::Discretization;
    use crate::transforms::{space_forward, space_inverse};

    fn assert_close(a: &Orbit, b: &Orbit, tol: f64, what: &str) {
        let diff = (a.state() - b.state()).amax();
        let scale = b.state().amax().max(1.0);
        assert!(diff <= tol * scale, "{}: difference {} (scale {})", what, diff, scale);
    }

    #[test]
    fn test_zero_order_is_identity() {
        for symmetry in Symmetry::ALL {
            let time_points = if symmetry.is_stationary() { 1 } else { 8 };
            let orbit = sample_orbit(symmetry, time_points, 16);
            for axis in [Axis::Time, Axis::Space] {
                let d = derivative(&orbit, axis, 0).unwrap();
                assert_eq!(d, orbit, "{:?} {:?}", symmetry, axis);
            }
        }
    }

    #[test]
    fn test_first_derivatives_compose() {
        let orbit = sample_orbit(Symmetry::Full, 8, 16);
        let dx = derivative(&orbit, Axis::Space, 1).unwrap();
        let dxdx = derivative(&dx, Axis::Space, 1).unwrap();
        let dxx = derivative(&orbit, Axis::Space, 2).unwrap();
        assert_close(&dxdx, &dxx, 1e-12, "space");

        let dt = derivative(&orbit, Axis::Time, 1).unwrap();
        let dtdt = derivative(&dt, Axis::Time, 1).unwrap();
        let dtt = derivative(&orbit, Axis::Time, 2).unwrap();
        assert_close(&dtdt, &dtt, 1e-12, "time");
    }

    #[test]
    fn test_second_derivatives_compose_in_reduced_classes() {
        for symmetry in [
            Symmetry::Antisymmetric,
            Symmetry::ShiftReflection,
            Symmetry::Equilibrium,
            Symmetry::RelativeEquilibrium,
        ] {
            let time_points = if symmetry.is_stationary() { 1 } else { 8 };
            let orbit = sample_orbit(symmetry, time_points, 16);
            let dxx = derivative(&orbit, Axis::Space, 2).unwrap();
            let twice = derivative(&dxx, Axis::Space, 2).unwrap();
            let dxxxx = derivative(&orbit, Axis::Space, 4).unwrap();
            assert_eq!(dxxxx.symmetry(), symmetry);
            assert_close(&twice, &dxxxx, 1e-12, "fourth order");
        }
    }

    #[test]
    fn test_time_derivatives_compose_for_shift_reflection() {
        let orbit = sample_orbit(Symmetry::ShiftReflection, 8, 16);
        let dt = derivative(&orbit, Axis::Time, 1).unwrap();
        let dt3 = derivative(&derivative(&dt, Axis::Time, 1).unwrap(), Axis::Time, 1).unwrap();
        let direct = derivative(&orbit, Axis::Time, 3).unwrap();
        assert_close(&dt3, &direct, 1e-12, "third order in time");
    }

    #[test]
    fn test_derivative_is_linear() {
        let x = sample_orbit(Symmetry::Full, 8, 16);
        let y = derivative(&x, Axis::Time, 2).unwrap();
        let (a, b) = (1.7, -0.3);
        let combo = x.linear_combination(a, &y, b).unwrap();
        for (axis, order) in [(Axis::Time, 1), (Axis::Space, 3), (Axis::Space, 4)] {
            let lhs = derivative(&combo, axis, order).unwrap();
            let dx = derivative(&x, axis, order).unwrap();
            let dy = derivative(&y, axis, order).unwrap();
            let rhs = dx.linear_combination(a, &dy, b).unwrap();
            assert_close(&lhs, &rhs, 1e-12, "linearity");
        }
    }

    #[test]
    fn test_matches_analytic_derivatives() {
        let (n, m) = (8, 16);
        let (period, length) = (10.0, 20.0);
        let (w, q) = (2.0 * PI / period, 2.0 * PI / length);
        let grid = |f: &dyn Fn(f64, f64) -> f64| {
            DMatrix::from_fn(n, m, |i, j| {
                f(i as f64 * period / n as f64, j as f64 * length / m as f64)
            })
        };
        let u = grid(&|t, x| (q * x).sin() * (w * t).cos());
        let u_t = grid(&|t, x| -w * (q * x).sin() * (w * t).sin());
        let u_x = grid(&|t, x| q * (q * x).cos() * (w * t).cos());

        let params = Parameters::new(period, length);
        let orbit = Orbit::from_field(u, params, Symmetry::Full)
            .unwrap()
            .to_modes()
            .unwrap();
        let dt = derivative(&orbit, Axis::Time, 1).unwrap().to_field().unwrap();
        let dx = derivative(&orbit, Axis::Space, 1).unwrap().to_field().unwrap();
        assert!((dt.state() - u_t).amax() < 1e-12, "time derivative mismatch");
        assert!((dx.state() - u_x).amax() < 1e-12, "space derivative mismatch");
    }

    #[test]
    fn test_odd_space_derivative_promotes_antisymmetric() {
        let orbit = sample_orbit(Symmetry::Antisymmetric, 8, 16);
        let dx = derivative(&orbit, Axis::Space, 1).unwrap();
        assert_eq!(dx.symmetry(), Symmetry::Full);
        let full = orbit.with_symmetry(Symmetry::Full).unwrap();
        let expected = derivative(&full, Axis::Space, 1).unwrap();
        assert_close(&dx, &expected, 1e-12, "promoted derivative");
    }

    #[test]
    fn test_odd_space_derivative_of_equilibrium() {
        let orbit = sample_orbit(Symmetry::Equilibrium, 1, 16);
        let length = orbit.parameters().length;
        let dx = derivative(&orbit, Axis::Space, 1).unwrap();
        assert_eq!(dx.symmetry(), Symmetry::RelativeEquilibrium);
        assert_eq!(dx.discretization(), orbit.discretization());
        assert_eq!(dx.parameters().shift, 0.0);

        let field = orbit.to_field().unwrap().into_state();
        let expected = space_inverse(&spatial_dx(&space_forward(&field), length), 16);
        let diff = (dx.to_field().unwrap().state() - &expected).amax();
        assert!(diff < 1e-12, "u_x mismatch {}", diff);

        let dxdx = derivative(&dx, Axis::Space, 1).unwrap();
        let dxx = derivative(&orbit, Axis::Space, 2)
            .unwrap()
            .with_symmetry(Symmetry::RelativeEquilibrium)
            .unwrap();
        assert_close(&dxdx, &dxx, 1e-12, "stationary second order");
    }

    #[test]
    fn test_derivative_requires_modes() {
        let orbit = sample_orbit(Symmetry::Full, 8, 16).to_field().unwrap();
        let res = derivative(&orbit, Axis::Space, 2);
        assert!(matches!(res, Err(OrbitError::WrongBasis { .. })));
    }

    #[test]
    fn test_equilibrium_has_no_time_derivative() {
        let orbit = sample_orbit(Symmetry::Equilibrium, 1, 16);
        let dt = derivative(&orbit, Axis::Time, 1).unwrap();
        assert_eq!(dt.norm(), 0.0);
    }

    #[test]
    fn test_dealias_mask_keeps_low_modes() {
        let orbit = sample_orbit(Symmetry::Full, 8, 16);
        let grid = SpectralGrid::new(&orbit);
        let mask = grid.dealias_mask(Dealiasing::TwoThirds).unwrap();
        assert_eq!(mask[(0, 0)], 1.0);
        // spatial wavenumber 6 > 16 / 3
        assert_eq!(mask[(0, 5)], 0.0);
        // temporal frequency 3 > 8 / 3
        assert_eq!(mask[(3, 0)], 0.0);
        assert!(grid.dealias_mask(Dealiasing::None).is_none());
        let shape = Symmetry::Full.mode_shape(Discretization::new(8, 16));
        assert_eq!(mask.shape(), shape);
    }

    #[test]
    fn test_preconditioner_is_positive_and_decays() {
        let orbit = sample_orbit(Symmetry::Relative, 8, 16);
        let p = SpectralGrid::new(&orbit).preconditioner();
        assert!(p.iter().all(|&v| v > 0.0));
        assert!(p[(0, 6)] < p[(0, 0)]);
    }
}
