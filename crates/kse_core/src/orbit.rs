//! The orbit value type and its persisted record.
//!
//! An [`Orbit`] bundles a two-axis state (time rows by space columns) with the
//! basis it is expressed in, its parameters, its symmetry class and the grid it
//! was sampled on. Orbits are values: every operation in this crate returns a
//! new orbit and leaves its input untouched.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::{OrbitError, OrbitResult};
use crate::symmetry::Symmetry;

/// Representation of an orbit's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Basis {
    /// Physical samples `u(t_i, x_j)` on the collocation grid.
    Field,
    /// Joint space-time Fourier coefficients.
    Modes,
}

/// Named orbit parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parameter {
    Period,
    Length,
    Shift,
}

impl Parameter {
    pub fn label(self) -> &'static str {
        match self {
            Parameter::Period => "T",
            Parameter::Length => "L",
            Parameter::Shift => "S",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    pub period: f64,
    pub length: f64,
    #[serde(default)]
    pub shift: f64,
}

impl Parameters {
    pub fn new(period: f64, length: f64) -> Self {
        Self {
            period,
            length,
            shift: 0.0,
        }
    }

    pub fn with_shift(mut self, shift: f64) -> Self {
        self.shift = shift;
        self
    }

    pub fn get(&self, parameter: Parameter) -> f64 {
        match parameter {
            Parameter::Period => self.period,
            Parameter::Length => self.length,
            Parameter::Shift => self.shift,
        }
    }

    pub fn set(mut self, parameter: Parameter, value: f64) -> Self {
        match parameter {
            Parameter::Period => self.period = value,
            Parameter::Length => self.length = value,
            Parameter::Shift => self.shift = value,
        }
        self
    }
}

/// Collocation grid: `time_points` rows by `space_points` columns in the field basis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Discretization {
    pub time_points: usize,
    pub space_points: usize,
}

impl Discretization {
    pub fn new(time_points: usize, space_points: usize) -> Self {
        Self {
            time_points,
            space_points,
        }
    }

    pub fn field_shape(&self) -> (usize, usize) {
        (self.time_points, self.space_points)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Orbit {
    state: DMatrix<f64>,
    basis: Basis,
    parameters: Parameters,
    symmetry: Symmetry,
    discretization: Discretization,
}

impl Orbit {
    /// Builds an orbit after checking the grid, the parameters and the state shape.
    ///
    /// Parameters that do not exist for the symmetry class are normalized to zero
    /// (equilibria carry no period, only relative orbits carry a shift).
    pub fn new(
        state: DMatrix<f64>,
        basis: Basis,
        parameters: Parameters,
        symmetry: Symmetry,
        discretization: Discretization,
    ) -> OrbitResult<Self> {
        symmetry.validate(discretization)?;
        let parameters = symmetry.normalize_parameters(parameters)?;
        let expected = match basis {
            Basis::Field => discretization.field_shape(),
            Basis::Modes => symmetry.mode_shape(discretization),
        };
        let found = state.shape();
        if found != expected {
            return Err(OrbitError::ShapeMismatch { expected, found });
        }
        if state.iter().any(|value| !value.is_finite()) {
            return Err(OrbitError::NonFinite("orbit state"));
        }
        Ok(Self {
            state,
            basis,
            parameters,
            symmetry,
            discretization,
        })
    }

    /// Field-basis orbit whose grid is read off the state shape.
    pub fn from_field(
        state: DMatrix<f64>,
        parameters: Parameters,
        symmetry: Symmetry,
    ) -> OrbitResult<Self> {
        let (rows, cols) = state.shape();
        Self::new(
            state,
            Basis::Field,
            parameters,
            symmetry,
            Discretization::new(rows, cols),
        )
    }

    pub fn from_modes(
        state: DMatrix<f64>,
        parameters: Parameters,
        symmetry: Symmetry,
        discretization: Discretization,
    ) -> OrbitResult<Self> {
        Self::new(state, Basis::Modes, parameters, symmetry, discretization)
    }

    pub fn zeros(
        basis: Basis,
        parameters: Parameters,
        symmetry: Symmetry,
        discretization: Discretization,
    ) -> OrbitResult<Self> {
        symmetry.validate(discretization)?;
        let (rows, cols) = match basis {
            Basis::Field => discretization.field_shape(),
            Basis::Modes => symmetry.mode_shape(discretization),
        };
        Self::new(
            DMatrix::zeros(rows, cols),
            basis,
            parameters,
            symmetry,
            discretization,
        )
    }

    pub fn state(&self) -> &DMatrix<f64> {
        &self.state
    }

    pub fn into_state(self) -> DMatrix<f64> {
        self.state
    }

    pub fn basis(&self) -> Basis {
        self.basis
    }

    pub fn parameters(&self) -> Parameters {
        self.parameters
    }

    pub fn symmetry(&self) -> Symmetry {
        self.symmetry
    }

    pub fn discretization(&self) -> Discretization {
        self.discretization
    }

    pub fn mode_shape(&self) -> (usize, usize) {
        self.symmetry.mode_shape(self.discretization)
    }

    /// Same orbit metadata with a replacement state.
    pub fn with_state(&self, state: DMatrix<f64>, basis: Basis) -> OrbitResult<Self> {
        Self::new(
            state,
            basis,
            self.parameters,
            self.symmetry,
            self.discretization,
        )
    }

    pub fn with_parameters(&self, parameters: Parameters) -> OrbitResult<Self> {
        Self::new(
            self.state.clone(),
            self.basis,
            parameters,
            self.symmetry,
            self.discretization,
        )
    }

    pub fn with_parameter(&self, parameter: Parameter, value: f64) -> OrbitResult<Self> {
        self.with_parameters(self.parameters.set(parameter, value))
    }

    pub fn require_basis(&self, expected: Basis, operation: &'static str) -> OrbitResult<()> {
        if self.basis != expected {
            return Err(OrbitError::WrongBasis {
                operation,
                expected,
                found: self.basis,
            });
        }
        Ok(())
    }

    /// Frobenius norm of the state.
    pub fn norm(&self) -> f64 {
        self.state.norm()
    }

    /// `a * self + b * other`, for orbits sharing basis, class and grid.
    pub fn linear_combination(&self, a: f64, other: &Orbit, b: f64) -> OrbitResult<Self> {
        if other.basis != self.basis {
            return Err(OrbitError::WrongBasis {
                operation: "linear_combination",
                expected: self.basis,
                found: other.basis,
            });
        }
        if other.symmetry != self.symmetry {
            return Err(OrbitError::UnsupportedOperation {
                operation: "combining orbits of different symmetry classes",
                symmetry: self.symmetry,
            });
        }
        if other.state.shape() != self.state.shape() {
            return Err(OrbitError::ShapeMismatch {
                expected: self.state.shape(),
                found: other.state.shape(),
            });
        }
        self.with_state(&self.state * a + &other.state * b, self.basis)
    }

    pub fn to_record(&self, name: impl Into<String>) -> OrbitRecord {
        OrbitRecord {
            name: name.into(),
            state: self
                .state
                .row_iter()
                .map(|row| row.iter().copied().collect())
                .collect(),
            basis: self.basis,
            parameters: self.parameters,
            symmetry: self.symmetry,
            discretization: self.discretization,
        }
    }

    pub fn from_record(record: &OrbitRecord) -> OrbitResult<Self> {
        let rows = record.state.len();
        let cols = record.state.first().map_or(0, Vec::len);
        if let Some(row) = record.state.iter().find(|row| row.len() != cols) {
            return Err(OrbitError::ShapeMismatch {
                expected: (rows, cols),
                found: (rows, row.len()),
            });
        }
        let flat: Vec<f64> = record.state.iter().flatten().copied().collect();
        Self::new(
            DMatrix::from_row_slice(rows, cols, &flat),
            record.basis,
            record.parameters,
            record.symmetry,
            record.discretization,
        )
    }
}

/// Serializable form of an orbit, keyed by a human-readable name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrbitRecord {
    pub name: String,
    /// Row-major state, one inner vector per time row.
    pub state: Vec<Vec<f64>>,
    pub basis: Basis,
    pub parameters: Parameters,
    pub symmetry: Symmetry,
    pub discretization: Discretization,
}

/// Row-major flattening used by solver vectors.
pub(crate) fn flatten_rows(matrix: &DMatrix<f64>) -> Vec<f64> {
    matrix.transpose().as_slice().to_vec()
}

pub(crate) fn unflatten_rows(values: &[f64], shape: (usize, usize)) -> DMatrix<f64> {
    DMatrix::from_row_slice(shape.0, shape.1, values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_positive_length() {
        let res = Orbit::zeros(
            Basis::Field,
            Parameters::new(10.0, -1.0),
            Symmetry::Full,
            Discretization::new(8, 8),
        );
        assert!(
            matches!(res, Err(OrbitError::NonPositiveParameter { name: "L", .. })),
            "Unexpected result: {:?}",
            res
        );
    }

    #[test]
    fn test_rejects_mismatched_shape() {
        let res = Orbit::new(
            DMatrix::zeros(8, 6),
            Basis::Modes,
            Parameters::new(10.0, 10.0),
            Symmetry::Full,
            Discretization::new(8, 8),
        );
        assert_eq!(
            res.err(),
            Some(OrbitError::ShapeMismatch {
                expected: (7, 6),
                found: (8, 6)
            })
        );
    }

    #[test]
    fn test_equilibrium_drops_period() {
        let orbit = Orbit::zeros(
            Basis::Modes,
            Parameters::new(12.0, 22.0).with_shift(3.0),
            Symmetry::Equilibrium,
            Discretization::new(1, 16),
        )
        .expect("valid equilibrium");
        assert_eq!(orbit.parameters().period, 0.0);
        assert_eq!(orbit.parameters().shift, 0.0);
        assert_eq!(orbit.state().shape(), (1, 7));
    }

    #[test]
    fn test_record_round_trip_through_json() {
        let state = DMatrix::from_fn(7, 6, |i, j| (i as f64) - 0.5 * (j as f64));
        let orbit = Orbit::from_modes(
            state,
            Parameters::new(20.0, 30.0).with_shift(1.5),
            Symmetry::Relative,
            Discretization::new(8, 8),
        )
        .expect("valid orbit");

        let json = serde_json::to_string(&orbit.to_record("rpo_test")).expect("serialize");
        let record: OrbitRecord = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(record.name, "rpo_test");
        let restored = Orbit::from_record(&record).expect("restore");
        assert_eq!(restored, orbit);
    }

    #[test]
    fn test_flatten_is_row_major() {
        let m = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let flat = flatten_rows(&m);
        assert_eq!(flat, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(unflatten_rows(&flat, (2, 3)), m);
    }
}
