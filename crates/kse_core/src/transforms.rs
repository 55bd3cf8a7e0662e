//! Conversion between the field and modes bases.
//!
//! Both axes use orthonormal real transforms, so the modes basis is an isometric
//! image of the band-limited fields: the spatial mean, the spatial Nyquist
//! mode and the temporal Nyquist mode are not represented.
//!
//! Spatial layout per time row: `sqrt(2) * [Re k=1..m | Im k=1..m]`, `m = M/2 - 1`.
//! Temporal layout per column: `[Re 0, sqrt(2) Re k=1..n, sqrt(2) Im k=1..n]`,
//! `n = N/2 - 1`. Symmetry classes then keep a subset of these coefficients.

use std::cell::RefCell;
use std::f64::consts::SQRT_2;

use nalgebra::DMatrix;
use num_complex::Complex;
use rustfft::FftPlanner;

use crate::error::OrbitResult;
use crate::orbit::{Basis, Discretization, Orbit, Parameter};
use crate::symmetry::{carries_cosine, ModeRule, Symmetry};

thread_local! {
    static PLANNER: RefCell<FftPlanner<f64>> = RefCell::new(FftPlanner::new());
}

fn forward(values: impl Iterator<Item = f64>) -> Vec<Complex<f64>> {
    let mut buffer: Vec<Complex<f64>> = values.map(|v| Complex::new(v, 0.0)).collect();
    let fft = PLANNER.with(|planner| planner.borrow_mut().plan_fft_forward(buffer.len()));
    fft.process(&mut buffer);
    let scale = 1.0 / (buffer.len() as f64).sqrt();
    for c in buffer.iter_mut() {
        *c *= scale;
    }
    buffer
}

fn inverse_real(mut spectrum: Vec<Complex<f64>>) -> Vec<f64> {
    let fft = PLANNER.with(|planner| planner.borrow_mut().plan_fft_inverse(spectrum.len()));
    fft.process(&mut spectrum);
    let scale = 1.0 / (spectrum.len() as f64).sqrt();
    spectrum.into_iter().map(|c| c.re * scale).collect()
}

/// Field rows to spatial modes, `N x M -> N x (M - 2)`.
pub(crate) fn space_forward(field: &DMatrix<f64>) -> DMatrix<f64> {
    let (rows, cols) = field.shape();
    let m = cols / 2 - 1;
    let mut out = DMatrix::zeros(rows, 2 * m);
    for i in 0..rows {
        let spectrum = forward(field.row(i).iter().copied());
        for k in 1..=m {
            out[(i, k - 1)] = SQRT_2 * spectrum[k].re;
            out[(i, m + k - 1)] = SQRT_2 * spectrum[k].im;
        }
    }
    out
}

/// Spatial modes back to field rows on `space_points` collocation points.
pub(crate) fn space_inverse(spatial: &DMatrix<f64>, space_points: usize) -> DMatrix<f64> {
    let rows = spatial.nrows();
    let m = spatial.ncols() / 2;
    let mut out = DMatrix::zeros(rows, space_points);
    for i in 0..rows {
        let mut spectrum = vec![Complex::new(0.0, 0.0); space_points];
        for k in 1..=m {
            let c = Complex::new(spatial[(i, k - 1)], spatial[(i, m + k - 1)]) / SQRT_2;
            spectrum[k] = c;
            spectrum[space_points - k] = c.conj();
        }
        for (j, value) in inverse_real(spectrum).into_iter().enumerate() {
            out[(i, j)] = value;
        }
    }
    out
}

/// Columns over time to temporal modes, `N x C -> (N - 1) x C`.
fn time_forward(values: &DMatrix<f64>) -> DMatrix<f64> {
    let (time_points, cols) = values.shape();
    let n = time_points / 2 - 1;
    let mut out = DMatrix::zeros(time_points - 1, cols);
    for c in 0..cols {
        let spectrum = forward(values.column(c).iter().copied());
        out[(0, c)] = spectrum[0].re;
        for k in 1..=n {
            out[(k, c)] = SQRT_2 * spectrum[k].re;
            out[(n + k, c)] = SQRT_2 * spectrum[k].im;
        }
    }
    out
}

fn time_inverse(modes: &DMatrix<f64>, time_points: usize) -> DMatrix<f64> {
    let cols = modes.ncols();
    let n = modes.nrows() / 2;
    let mut out = DMatrix::zeros(time_points, cols);
    for c in 0..cols {
        let mut spectrum = vec![Complex::new(0.0, 0.0); time_points];
        spectrum[0] = Complex::new(modes[(0, c)], 0.0);
        for k in 1..=n {
            let z = Complex::new(modes[(k, c)], modes[(n + k, c)]) / SQRT_2;
            spectrum[k] = z;
            spectrum[time_points - k] = z.conj();
        }
        for (i, value) in inverse_real(spectrum).into_iter().enumerate() {
            out[(i, c)] = value;
        }
    }
    out
}

/// Temporal frequency index of a modes row, given `n` positive frequencies.
pub(crate) fn temporal_index(row: usize, n: usize) -> usize {
    if row <= n {
        row
    } else {
        row - n
    }
}

/// Expands class modes into complete spatial modes, one row per time point.
pub(crate) fn spatial_modes(
    modes: &DMatrix<f64>,
    symmetry: Symmetry,
    discretization: Discretization,
) -> DMatrix<f64> {
    let time_points = discretization.time_points;
    let m = discretization.space_points / 2 - 1;
    match symmetry.rule().modes {
        ModeRule::Complete => time_inverse(modes, time_points),
        ModeRule::Sine => {
            let mut spatial = DMatrix::zeros(time_points, 2 * m);
            spatial
                .columns_mut(m, m)
                .copy_from(&time_inverse(modes, time_points));
            spatial
        }
        ModeRule::ParityInterleaved => {
            let rows = modes.nrows();
            let mut cosine = DMatrix::zeros(rows, m);
            let mut sine = DMatrix::zeros(rows, m);
            for r in 0..rows {
                let target = if carries_cosine(r, rows) {
                    &mut cosine
                } else {
                    &mut sine
                };
                target.row_mut(r).copy_from(&modes.row(r));
            }
            let mut spatial = DMatrix::zeros(time_points, 2 * m);
            spatial
                .columns_mut(0, m)
                .copy_from(&time_inverse(&cosine, time_points));
            spatial
                .columns_mut(m, m)
                .copy_from(&time_inverse(&sine, time_points));
            spatial
        }
        ModeRule::StationarySine => {
            let mut spatial = DMatrix::zeros(time_points, 2 * m);
            for i in 0..time_points {
                spatial.view_mut((i, m), (1, m)).copy_from(&modes.row(0));
            }
            spatial
        }
        ModeRule::StationaryComplete => {
            DMatrix::from_fn(time_points, 2 * m, |_, c| modes[(0, c)])
        }
    }
}

/// Projects complete spatial modes onto the coefficients a class stores.
///
/// This is the transpose of [`spatial_modes`] for the periodic classes and its
/// time average for the stationary ones, so `project(expand(x)) == x` in every class.
pub(crate) fn project_spatial_modes(
    spatial: &DMatrix<f64>,
    symmetry: Symmetry,
    discretization: Discretization,
) -> DMatrix<f64> {
    let m = discretization.space_points / 2 - 1;
    match symmetry.rule().modes {
        ModeRule::Complete => time_forward(spatial),
        ModeRule::Sine => time_forward(&spatial.columns(m, m).clone_owned()),
        ModeRule::ParityInterleaved => {
            let cosine = time_forward(&spatial.columns(0, m).clone_owned());
            let sine = time_forward(&spatial.columns(m, m).clone_owned());
            let rows = cosine.nrows();
            DMatrix::from_fn(rows, m, |r, c| {
                if carries_cosine(r, rows) {
                    cosine[(r, c)]
                } else {
                    sine[(r, c)]
                }
            })
        }
        ModeRule::StationarySine => {
            let sine = spatial.columns(m, m);
            let mean = sine.row_sum() / sine.nrows() as f64;
            DMatrix::from_row_slice(1, m, mean.as_slice())
        }
        ModeRule::StationaryComplete => {
            let mean = spatial.row_sum() / spatial.nrows() as f64;
            DMatrix::from_row_slice(1, 2 * m, mean.as_slice())
        }
    }
}

/// Converts an orbit to `target`. Converting into the current basis is a no-op.
pub fn convert(orbit: &Orbit, target: Basis) -> OrbitResult<Orbit> {
    let discretization = orbit.discretization();
    let symmetry = orbit.symmetry();
    match (orbit.basis(), target) {
        (Basis::Field, Basis::Field) | (Basis::Modes, Basis::Modes) => Ok(orbit.clone()),
        (Basis::Field, Basis::Modes) => {
            let spatial = space_forward(orbit.state());
            let modes = project_spatial_modes(&spatial, symmetry, discretization);
            orbit.with_state(modes, Basis::Modes)
        }
        (Basis::Modes, Basis::Field) => {
            let spatial = spatial_modes(orbit.state(), symmetry, discretization);
            let field = space_inverse(&spatial, discretization.space_points);
            orbit.with_state(field, Basis::Field)
        }
    }
}

impl Orbit {
    pub fn convert(&self, target: Basis) -> OrbitResult<Orbit> {
        convert(self, target)
    }

    pub fn to_modes(&self) -> OrbitResult<Orbit> {
        convert(self, Basis::Modes)
    }

    pub fn to_field(&self) -> OrbitResult<Orbit> {
        convert(self, Basis::Field)
    }

    /// Reinterprets the orbit's field under another symmetry class.
    ///
    /// Content outside the target class's mode rule is projected away; use
    /// [`symmetry_defect`] first when that loss must be detected. The result is
    /// returned in the orbit's current basis.
    pub fn with_symmetry(&self, target: Symmetry) -> OrbitResult<Orbit> {
        if target == self.symmetry() {
            return Ok(self.clone());
        }
        let field = self.to_field()?.into_state();
        let mut parameters = self.parameters();
        if parameters.period == 0.0 && target.parameters().contains(&Parameter::Period) {
            // stationary orbits are periodic with any period
            parameters.period = 1.0;
        }
        Orbit::from_field(field, parameters, target)?.convert(self.basis())
    }
}

/// Relative size of the part of `field` that the `target` class cannot store.
///
/// Measured against the complete band-limited content of the field, so the
/// classes with the complete mode rule always report zero.
pub fn symmetry_defect(field: &DMatrix<f64>, target: Symmetry) -> OrbitResult<f64> {
    let (time_points, space_points) = field.shape();
    let discretization = Discretization::new(time_points, space_points);
    target.validate(discretization)?;
    let spatial = space_forward(field);
    let baseline = if time_points % 2 == 0 {
        let full = project_spatial_modes(&spatial, Symmetry::Full, discretization);
        spatial_modes(&full, Symmetry::Full, discretization)
    } else {
        spatial
    };
    let stored = project_spatial_modes(&baseline, target, discretization);
    let restored = spatial_modes(&stored, target, discretization);
    let scale = baseline.norm();
    if scale == 0.0 {
        return Ok(0.0);
    }
    Ok((baseline - restored).norm() / scale)
}
