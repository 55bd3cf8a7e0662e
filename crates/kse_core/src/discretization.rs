//! Changing the collocation grid of an orbit.
//!
//! Resizing works directly on the stored coefficients: low frequencies are
//! copied, new high frequencies start at zero and truncated ones are dropped.
//! The orthonormal transforms make coefficients grow like `sqrt(points)`, so
//! every copied coefficient is rescaled per axis to keep the field unchanged.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::OrbitResult;
use crate::orbit::{Basis, Discretization, Orbit, Parameters};
use crate::symmetry::{ModeRule, Symmetry};
use crate::transforms::temporal_index;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Coarse,
    #[default]
    Normal,
    Fine,
}

/// Old modes row feeding new row `row`, for temporal layouts with `old_n` and
/// `new_n` positive frequencies.
fn source_row(row: usize, old_n: usize, new_n: usize) -> Option<usize> {
    if row == 0 {
        return Some(0);
    }
    let k = temporal_index(row, new_n);
    if k > old_n {
        None
    } else if row <= new_n {
        Some(k)
    } else {
        Some(old_n + k)
    }
}

/// Old modes column feeding new column `col`.
fn source_col(col: usize, old_cols: usize, new_cols: usize, rule: ModeRule) -> Option<usize> {
    match rule {
        ModeRule::Complete | ModeRule::StationaryComplete => {
            let (old_m, new_m) = (old_cols / 2, new_cols / 2);
            let (block, k) = if col < new_m {
                (0, col)
            } else {
                (1, col - new_m)
            };
            (k < old_m).then_some(block * old_m + k)
        }
        ModeRule::Sine | ModeRule::ParityInterleaved | ModeRule::StationarySine => {
            (col < old_cols).then_some(col)
        }
    }
}

/// Interpolates or truncates `orbit` onto `target`, keeping its basis.
pub fn resize(orbit: &Orbit, target: Discretization) -> OrbitResult<Orbit> {
    let symmetry = orbit.symmetry();
    symmetry.validate(target)?;
    let source = orbit.discretization();
    if source == target {
        return Ok(orbit.clone());
    }

    let modes = orbit.to_modes()?;
    let old = modes.state();
    let rule = symmetry.rule().modes;
    let (rows, cols) = symmetry.mode_shape(target);

    let space_scale = (target.space_points as f64 / source.space_points as f64).sqrt();
    let time_scale = if symmetry.is_stationary() {
        1.0
    } else {
        (target.time_points as f64 / source.time_points as f64).sqrt()
    };
    let scale = space_scale * time_scale;
    let (old_n, new_n) = (old.nrows() / 2, rows / 2);

    let state = DMatrix::from_fn(rows, cols, |r, c| {
        let row = if symmetry.is_stationary() {
            Some(0)
        } else {
            source_row(r, old_n, new_n)
        };
        match (row, source_col(c, old.ncols(), cols, rule)) {
            (Some(i), Some(j)) => scale * old[(i, j)],
            _ => 0.0,
        }
    });
    debug!(
        from = ?source.field_shape(),
        to = ?target.field_shape(),
        ?symmetry,
        "resized orbit"
    );
    Orbit::new(state, Basis::Modes, modes.parameters(), symmetry, target)?
        .convert(orbit.basis())
}

fn power_of_two(exponent: f64, floor: usize) -> usize {
    let size = 2f64.powi(exponent.trunc() as i32);
    (size as usize).max(floor)
}

/// Grid size that resolves an orbit with the given parameters.
///
/// Both axes scale with the domain: roughly one time point per two units of
/// period and one space point per unit of length at normal resolution,
/// rounded to powers of two. Equilibria get a single time point.
pub fn parameter_based_discretization(
    parameters: Parameters,
    symmetry: Symmetry,
    resolution: Resolution,
) -> Discretization {
    let log_t = parameters.period.max(f64::MIN_POSITIVE).log2();
    let log_l = parameters.length.max(f64::MIN_POSITIVE).log2();
    let (time_points, space_points) = match resolution {
        Resolution::Coarse => (power_of_two(log_t - 2.0, 16), power_of_two(log_l - 1.0, 16)),
        Resolution::Normal => (power_of_two(log_t - 1.0, 32), power_of_two(log_l + 0.5, 32)),
        Resolution::Fine => (power_of_two(log_t + 1.0, 32), power_of_two(log_l + 2.0, 32)),
    };
    if symmetry.is_stationary() {
        Discretization::new(1, space_points)
    } else {
        Discretization::new(time_points, space_points)
    }
}

/// Resizes `orbit` to the grid its own parameters call for.
pub fn rediscretize(orbit: &Orbit, resolution: Resolution) -> OrbitResult<Orbit> {
    let target = parameter_based_discretization(orbit.parameters(), orbit.symmetry(), resolution);
    resize(orbit, target)
}
