//! Symmetry classes, their mode-reduction rules and the group operations they admit.
//!
//! Each class is a tag on the single [`Orbit`] type. Everything class-specific is
//! read from [`Symmetry::rule`], so adding a class means adding a table row rather
//! than a new type.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::{OrbitError, OrbitResult};
use crate::orbit::{Basis, Discretization, Orbit, Parameter, Parameters};
use crate::spectral::{frequencies, wavenumbers};
use crate::transforms::{space_forward, space_inverse, temporal_index};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Symmetry {
    /// Doubly periodic, no further constraint.
    Full,
    /// Periodic up to a spatial shift `S`; stored in the comoving frame.
    Relative,
    /// `u(-x, t) = -u(x, t)`.
    Antisymmetric,
    /// `u(x, t + T/2) = -u(-x, t)`.
    ShiftReflection,
    /// Time independent and antisymmetric.
    Equilibrium,
    /// Travelling wave: time independent in the frame moving with speed `S/T`.
    RelativeEquilibrium,
}

/// Which Fourier coefficients a class stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeRule {
    /// Every spatial cosine and sine coefficient at every temporal frequency.
    Complete,
    /// Sine coefficients only.
    Sine,
    /// Cosine coefficients at odd temporal frequencies, sine coefficients at even ones.
    ParityInterleaved,
    /// Sine coefficients of a single time-independent snapshot.
    StationarySine,
    /// Cosine and sine coefficients of a single time-independent snapshot.
    StationaryComplete,
}

impl ModeRule {
    /// Both spatial parities are stored, so odd spatial derivatives stay in the layout.
    pub fn is_complete_in_space(self) -> bool {
        matches!(self, ModeRule::Complete | ModeRule::StationaryComplete)
    }

    pub fn is_stationary(self) -> bool {
        matches!(self, ModeRule::StationarySine | ModeRule::StationaryComplete)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupOperation {
    Reflection,
    ShiftReflection,
    /// Translation in space by an arbitrary distance.
    SpatialRotation,
    /// Translation in space by half the domain.
    HalfCellShift,
    TimeRotation,
    FrameChange,
}

#[derive(Debug, Clone, Copy)]
pub struct SymmetryRule {
    pub modes: ModeRule,
    pub parameters: &'static [Parameter],
    pub operations: &'static [GroupOperation],
}

const PERIODIC_PARAMETERS: &[Parameter] = &[Parameter::Period, Parameter::Length];
const RELATIVE_PARAMETERS: &[Parameter] = &[Parameter::Period, Parameter::Length, Parameter::Shift];
const EQUILIBRIUM_PARAMETERS: &[Parameter] = &[Parameter::Length];

impl Symmetry {
    pub const ALL: [Symmetry; 6] = [
        Symmetry::Full,
        Symmetry::Relative,
        Symmetry::Antisymmetric,
        Symmetry::ShiftReflection,
        Symmetry::Equilibrium,
        Symmetry::RelativeEquilibrium,
    ];

    pub fn rule(self) -> SymmetryRule {
        use GroupOperation::*;
        match self {
            Symmetry::Full => SymmetryRule {
                modes: ModeRule::Complete,
                parameters: PERIODIC_PARAMETERS,
                operations: &[
                    Reflection,
                    ShiftReflection,
                    SpatialRotation,
                    HalfCellShift,
                    TimeRotation,
                ],
            },
            Symmetry::Relative => SymmetryRule {
                modes: ModeRule::Complete,
                parameters: RELATIVE_PARAMETERS,
                operations: &[
                    Reflection,
                    SpatialRotation,
                    HalfCellShift,
                    TimeRotation,
                    FrameChange,
                ],
            },
            Symmetry::Antisymmetric => SymmetryRule {
                modes: ModeRule::Sine,
                parameters: PERIODIC_PARAMETERS,
                operations: &[Reflection, ShiftReflection, HalfCellShift, TimeRotation],
            },
            Symmetry::ShiftReflection => SymmetryRule {
                modes: ModeRule::ParityInterleaved,
                parameters: PERIODIC_PARAMETERS,
                operations: &[Reflection, ShiftReflection, HalfCellShift, TimeRotation],
            },
            Symmetry::Equilibrium => SymmetryRule {
                modes: ModeRule::StationarySine,
                parameters: EQUILIBRIUM_PARAMETERS,
                operations: &[Reflection, ShiftReflection, HalfCellShift, TimeRotation],
            },
            Symmetry::RelativeEquilibrium => SymmetryRule {
                modes: ModeRule::StationaryComplete,
                parameters: RELATIVE_PARAMETERS,
                operations: &[
                    Reflection,
                    SpatialRotation,
                    HalfCellShift,
                    TimeRotation,
                    FrameChange,
                ],
            },
        }
    }

    pub fn permits(self, operation: GroupOperation) -> bool {
        self.rule().operations.contains(&operation)
    }

    pub fn parameters(self) -> &'static [Parameter] {
        self.rule().parameters
    }

    pub fn is_stationary(self) -> bool {
        self.rule().modes.is_stationary()
    }

    pub fn is_comoving(self) -> bool {
        self.parameters().contains(&Parameter::Shift)
    }

    /// Shape of the modes-basis state for a grid.
    pub fn mode_shape(self, discretization: Discretization) -> (usize, usize) {
        let n = discretization.time_points;
        let m = discretization.space_points / 2 - 1;
        match self.rule().modes {
            ModeRule::Complete => (n - 1, 2 * m),
            ModeRule::Sine | ModeRule::ParityInterleaved => (n - 1, m),
            ModeRule::StationarySine => (1, m),
            ModeRule::StationaryComplete => (1, 2 * m),
        }
    }

    pub fn validate(self, discretization: Discretization) -> OrbitResult<()> {
        let Discretization {
            time_points,
            space_points,
        } = discretization;
        let invalid = |reason| OrbitError::InvalidDiscretization {
            time_points,
            space_points,
            reason,
        };
        if space_points < 4 || space_points % 2 != 0 {
            return Err(invalid("space points must be even and at least 4"));
        }
        if self.is_stationary() {
            if time_points == 0 {
                return Err(invalid("at least one time point is required"));
            }
        } else if time_points < 2 || time_points % 2 != 0 {
            return Err(invalid("time points must be even and at least 2"));
        }
        Ok(())
    }

    /// Checks positivity of the parameters the class carries and zeroes the rest.
    pub fn normalize_parameters(self, parameters: Parameters) -> OrbitResult<Parameters> {
        let carried = self.parameters();
        for parameter in [Parameter::Period, Parameter::Length] {
            let value = parameters.get(parameter);
            if carried.contains(&parameter) && !(value > 0.0 && value.is_finite()) {
                return Err(OrbitError::NonPositiveParameter {
                    name: parameter.label(),
                    value,
                });
            }
        }
        if !parameters.shift.is_finite() {
            return Err(OrbitError::NonFinite("shift parameter"));
        }
        let mut normalized = parameters;
        for parameter in [Parameter::Period, Parameter::Shift] {
            if !carried.contains(&parameter) {
                normalized = normalized.set(parameter, 0.0);
            }
        }
        Ok(normalized)
    }

    fn require(self, operation: GroupOperation, name: &'static str) -> OrbitResult<()> {
        if self.permits(operation) {
            Ok(())
        } else {
            Err(OrbitError::UnsupportedOperation {
                operation: name,
                symmetry: self,
            })
        }
    }
}

/// Applies `op` to the field of `orbit` and returns the result in the orbit's basis.
fn map_field(
    orbit: &Orbit,
    parameters: Parameters,
    op: impl FnOnce(&DMatrix<f64>) -> DMatrix<f64>,
) -> OrbitResult<Orbit> {
    let field = orbit.to_field()?;
    let mapped = op(field.state());
    Orbit::new(
        mapped,
        Basis::Field,
        parameters,
        orbit.symmetry(),
        orbit.discretization(),
    )?
    .convert(orbit.basis())
}

fn reflect_field(field: &DMatrix<f64>) -> DMatrix<f64> {
    let cols = field.ncols();
    DMatrix::from_fn(field.nrows(), cols, |i, j| -field[(i, (cols - j) % cols)])
}

fn roll_field(field: &DMatrix<f64>, rows: isize, cols: isize) -> DMatrix<f64> {
    let (n, m) = field.shape();
    let rows = rows.rem_euclid(n as isize) as usize;
    let cols = cols.rem_euclid(m as isize) as usize;
    DMatrix::from_fn(n, m, |i, j| field[((i + n - rows) % n, (j + m - cols) % m)])
}

/// `u(x, t) -> -u(-x, t)`. Relative orbits have their shift negated.
pub fn reflection(orbit: &Orbit) -> OrbitResult<Orbit> {
    orbit.symmetry().require(GroupOperation::Reflection, "reflection")?;
    let mut parameters = orbit.parameters();
    parameters.shift = -parameters.shift;
    map_field(orbit, parameters, reflect_field)
}

/// Reflection followed by a half-period translation in time.
pub fn shift_reflection(orbit: &Orbit) -> OrbitResult<Orbit> {
    orbit
        .symmetry()
        .require(GroupOperation::ShiftReflection, "shift-reflection")?;
    let half = (orbit.discretization().time_points / 2) as isize;
    let stationary = orbit.symmetry().is_stationary();
    map_field(orbit, orbit.parameters(), |field| {
        let reflected = reflect_field(field);
        if stationary {
            reflected
        } else {
            roll_field(&reflected, half, 0)
        }
    })
}

/// Translates the orbit by whole grid cells along each axis.
///
/// Spatial rolls other than zero or half the domain need `SpatialRotation`.
pub fn roll(orbit: &Orbit, time_cells: isize, space_cells: isize) -> OrbitResult<Orbit> {
    let Discretization {
        time_points,
        space_points,
    } = orbit.discretization();
    let space_cells = space_cells.rem_euclid(space_points as isize);
    if space_cells != 0 {
        let operation = if space_cells as usize * 2 == space_points {
            GroupOperation::HalfCellShift
        } else {
            GroupOperation::SpatialRotation
        };
        orbit.symmetry().require(operation, "spatial roll")?;
    }
    if time_cells.rem_euclid(time_points as isize) != 0 {
        orbit
            .symmetry()
            .require(GroupOperation::TimeRotation, "time roll")?;
    }
    map_field(orbit, orbit.parameters(), |field| {
        roll_field(field, time_cells, space_cells)
    })
}

/// Continuous translation `u(x, t) -> u(x - distance, t)` through a phase rotation
/// of the spatial Fourier pairs.
pub fn rotate_space(orbit: &Orbit, distance: f64) -> OrbitResult<Orbit> {
    orbit
        .symmetry()
        .require(GroupOperation::SpatialRotation, "continuous spatial rotation")?;
    let length = orbit.parameters().length;
    map_field(orbit, orbit.parameters(), |field| {
        translate_rows(field, length, |_| distance)
    })
}

/// Continuous translation `u(x, t) -> u(x, t - delay)` through a phase rotation
/// of the temporal Fourier pairs.
pub fn rotate_time(orbit: &Orbit, delay: f64) -> OrbitResult<Orbit> {
    orbit
        .symmetry()
        .require(GroupOperation::TimeRotation, "continuous time rotation")?;
    if orbit.symmetry().is_stationary() {
        return Ok(orbit.clone());
    }
    let modes = orbit.to_modes()?;
    let (rows, cols) = modes.mode_shape();
    let n = rows / 2;
    let omega = frequencies(modes.parameters().period, n);
    let mut state = modes.state().clone();
    for k in 1..=n {
        let (sin, cos) = (omega[k - 1] * delay).sin_cos();
        for c in 0..cols {
            let (re, im) = (state[(k, c)], state[(n + k, c)]);
            state[(k, c)] = re * cos + im * sin;
            state[(n + k, c)] = im * cos - re * sin;
        }
    }
    modes.with_state(state, Basis::Modes)?.convert(orbit.basis())
}

/// Shifts every time row of a field by `distance(row)` in space.
fn translate_rows(
    field: &DMatrix<f64>,
    length: f64,
    distance: impl Fn(usize) -> f64,
) -> DMatrix<f64> {
    let mut spatial = space_forward(field);
    let m = spatial.ncols() / 2;
    let q = wavenumbers(length, m);
    for i in 0..spatial.nrows() {
        let d = distance(i);
        for k in 0..m {
            let (sin, cos) = (q[k] * d).sin_cos();
            let (a, b) = (spatial[(i, k)], spatial[(i, m + k)]);
            spatial[(i, k)] = a * cos + b * sin;
            spatial[(i, m + k)] = b * cos - a * sin;
        }
    }
    space_inverse(&spatial, field.ncols())
}

/// Field of a relative orbit seen in the laboratory frame.
///
/// Row `i` sits at `t_i = i T / N` and is translated by `S t_i / T`. Other classes
/// are already in the laboratory frame.
pub fn physical_field(orbit: &Orbit) -> OrbitResult<DMatrix<f64>> {
    let field = orbit.to_field()?.into_state();
    if !orbit.symmetry().is_comoving() {
        return Ok(field);
    }
    let Parameters { length, shift, .. } = orbit.parameters();
    let n = field.nrows() as f64;
    Ok(translate_rows(&field, length, |i| shift * i as f64 / n))
}

/// Inverse of [`physical_field`]: moves a laboratory-frame field into the frame
/// comoving with `parameters.shift`.
pub fn comoving_field(field: &DMatrix<f64>, parameters: Parameters) -> DMatrix<f64> {
    let n = field.nrows() as f64;
    translate_rows(field, parameters.length, |i| {
        -parameters.shift * i as f64 / n
    })
}

/// Estimates the spatial shift accumulated over one period of a laboratory-frame field.
///
/// Uses the phase drift of the dominant spatial wavenumber between the first and
/// last time rows, extrapolated to a full period.
pub fn estimate_shift(field: &DMatrix<f64>, length: f64) -> f64 {
    let rows = field.nrows();
    if rows < 2 {
        return 0.0;
    }
    let spatial = space_forward(field);
    let m = spatial.ncols() / 2;
    let q = wavenumbers(length, m);
    let last = rows - 1;
    let dominant = (0..m)
        .max_by(|&a, &b| {
            let amp = |k: usize| spatial[(0, k)].hypot(spatial[(0, m + k)]);
            amp(a).total_cmp(&amp(b))
        })
        .unwrap_or(0);
    let first = num_complex::Complex::new(spatial[(0, dominant)], spatial[(0, m + dominant)]);
    let end = num_complex::Complex::new(spatial[(last, dominant)], spatial[(last, m + dominant)]);
    if first.norm() == 0.0 || end.norm() == 0.0 {
        return 0.0;
    }
    let drift = -(end / first).arg() / q[dominant];
    drift * rows as f64 / last as f64
}

/// Field restricted to the region that generates the orbit under its symmetry.
///
/// Sine-type classes keep `x in [0, L/2]`, shift-reflection orbits keep the first
/// half period, other classes return the whole field.
pub fn fundamental_domain(orbit: &Orbit) -> OrbitResult<DMatrix<f64>> {
    let field = orbit.to_field()?.into_state();
    let (n, m) = field.shape();
    Ok(match orbit.symmetry().rule().modes {
        ModeRule::Complete | ModeRule::StationaryComplete => field,
        ModeRule::Sine | ModeRule::StationarySine => field.columns(0, m / 2 + 1).into_owned(),
        ModeRule::ParityInterleaved => field.rows(0, n / 2).into_owned(),
    })
}

/// Row selector for the parity-interleaved layout: `true` where the stored
/// coefficient is a spatial cosine.
pub(crate) fn carries_cosine(row: usize, rows: usize) -> bool {
    temporal_index(row, rows / 2) % 2 == 1
}
