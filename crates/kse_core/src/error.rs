//! Contract violations raised by orbit operations.
//!
//! Non-convergence is not represented here: the solver and the continuation
//! stepper report it through status values in their result types.

use thiserror::Error;

use crate::orbit::Basis;
use crate::symmetry::Symmetry;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum OrbitError {
    #[error("operation `{operation}` requires the {expected:?} basis, orbit is in the {found:?} basis")]
    WrongBasis {
        operation: &'static str,
        expected: Basis,
        found: Basis,
    },

    #[error("state shape {found:?} does not match the expected shape {expected:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("invalid discretization {time_points}x{space_points}: {reason}")]
    InvalidDiscretization {
        time_points: usize,
        space_points: usize,
        reason: &'static str,
    },

    #[error("parameter {name} must be positive, got {value}")]
    NonPositiveParameter { name: &'static str, value: f64 },

    #[error("glued state violates the {symmetry:?} mode-reduction rule (relative defect {defect:.3e})")]
    SymmetryViolation { symmetry: Symmetry, defect: f64 },

    #[error("{operation} is not valid for {symmetry:?} orbits")]
    UnsupportedOperation {
        operation: &'static str,
        symmetry: Symmetry,
    },

    #[error("incompatible tiles: {0}")]
    IncompatibleTiles(String),

    #[error("non-finite values encountered in {0}")]
    NonFinite(&'static str),
}

pub type OrbitResult<T> = std::result::Result<T, OrbitError>;
