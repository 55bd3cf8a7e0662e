//! Deterministic orbits shared by the unit tests.

use nalgebra::DMatrix;

use crate::orbit::{Discretization, Orbit, Parameters};
use crate::symmetry::Symmetry;

/// Smooth pseudo-random coefficients with decaying amplitude.
pub(crate) fn sample_modes(shape: (usize, usize)) -> DMatrix<f64> {
    DMatrix::from_fn(shape.0, shape.1, |i, j| {
        let phase = 0.37 * (7 * i + 3 * j + 1) as f64;
        phase.sin() / (1.0 + (i + j) as f64)
    })
}

pub(crate) fn sample_orbit(symmetry: Symmetry, time_points: usize, space_points: usize) -> Orbit {
    let discretization = Discretization::new(time_points, space_points);
    let parameters = Parameters::new(20.0, 22.0).with_shift(2.5);
    let state = sample_modes(symmetry.mode_shape(discretization));
    Orbit::from_modes(state, parameters, symmetry, discretization).expect("valid sample orbit")
}

/// Antisymmetric equilibrium guess `a sin(qx) + b sin(2qx)` near the first
/// nontrivial branch, `q = 2 pi / length`.
pub(crate) fn equilibrium_guess(length: f64, space_points: usize) -> Orbit {
    let q = 2.0 * std::f64::consts::PI / length;
    let lambda = |k: f64| (k * q).powi(4) - (k * q).powi(2);
    let b = 2.0 * lambda(1.0) / q;
    let a = (-2.0 * lambda(2.0) * b / q).sqrt();
    let field = DMatrix::from_fn(1, space_points, |_, j| {
        let x = j as f64 * length / space_points as f64;
        a * (q * x).sin() + b * (2.0 * q * x).sin()
    });
    Orbit::from_field(field, Parameters::new(0.0, length), Symmetry::Equilibrium)
        .and_then(|orbit| orbit.to_modes())
        .expect("valid equilibrium guess")
}

pub(crate) const REFERENCE_LENGTH: f64 = 6.6;

/// Amplitudes `a_k` of `u = sum a_k sin(2 pi k x / L)`, `k = 1..=5`, for an
/// antisymmetric equilibrium on the first nontrivial branch at `L = 6.6`.
///
/// Obtained independently of this crate: Galerkin projection of
/// `u_xx + u_xxxx + u u_x = 0` onto the five sines, with the advection term
/// integrated exactly by a 64-point rule, solved by Newton iteration to a
/// coefficient residual of 4e-16. Sixteen points with two-thirds dealiasing
/// retain exactly these wavenumbers, so the truncated problems coincide.
const REFERENCE_AMPLITUDES: [f64; 5] = [
    1.892799522831261,
    -0.17763296638760676,
    0.008210718810174523,
    -0.00030440328714082074,
    9.868464325405e-06,
];

pub(crate) fn reference_equilibrium() -> Orbit {
    let space_points = 16;
    let q = 2.0 * std::f64::consts::PI / REFERENCE_LENGTH;
    let field = DMatrix::from_fn(1, space_points, |_, j| {
        let x = j as f64 * REFERENCE_LENGTH / space_points as f64;
        REFERENCE_AMPLITUDES
            .iter()
            .enumerate()
            .map(|(k, a)| a * ((k + 1) as f64 * q * x).sin())
            .sum()
    });
    Orbit::from_field(field, Parameters::new(0.0, REFERENCE_LENGTH), Symmetry::Equilibrium)
        .and_then(|orbit| orbit.to_modes())
        .expect("valid reference equilibrium")
}
