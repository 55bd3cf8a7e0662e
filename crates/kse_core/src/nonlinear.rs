//! Pseudospectral evaluation of the advection term `u u_x`.
//!
//! Products are formed on the collocation grid and transformed back into the
//! orbit's own mode layout. With [`Dealiasing::TwoThirds`] the factors are
//! truncated to the lower two thirds of the spectrum before the product and the
//! result is truncated again afterwards, so the retained coefficients are free
//! of aliasing for every grid size.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::OrbitResult;
use crate::orbit::{Basis, Discretization, Orbit};
use crate::spectral::{spatial_dx, SpectralGrid};
use crate::symmetry::Symmetry;
use crate::transforms::{project_spatial_modes, space_forward, space_inverse, spatial_modes};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dealiasing {
    /// Products are projected back without truncation.
    None,
    /// Orszag's rule: keep `|k| <= K/3` on both axes.
    #[default]
    TwoThirds,
}

/// The advection term of `orbit` under the default dealiasing policy.
pub fn nonlinear(orbit: &Orbit) -> OrbitResult<Orbit> {
    nonlinear_with(orbit, Dealiasing::default())
}

pub fn nonlinear_with(orbit: &Orbit, dealiasing: Dealiasing) -> OrbitResult<Orbit> {
    orbit.require_basis(Basis::Modes, "nonlinear")?;
    let grid = SpectralGrid::new(orbit);
    let term = Linearization::new(orbit, grid.dealias_mask(dealiasing))?;
    orbit.with_state(term.value(), Basis::Modes)
}

/// Fields of `u` and `u_x` at one orbit, reused for the term itself, its
/// directional derivative and the transpose of that derivative.
#[derive(Debug, Clone)]
pub(crate) struct Linearization {
    symmetry: Symmetry,
    discretization: Discretization,
    length: f64,
    mask: Option<DMatrix<f64>>,
    u: DMatrix<f64>,
    u_x: DMatrix<f64>,
}

impl Linearization {
    pub(crate) fn new(orbit: &Orbit, mask: Option<DMatrix<f64>>) -> OrbitResult<Self> {
        orbit.require_basis(Basis::Modes, "nonlinear")?;
        let mut lin = Self {
            symmetry: orbit.symmetry(),
            discretization: orbit.discretization(),
            length: orbit.parameters().length,
            mask,
            u: DMatrix::zeros(0, 0),
            u_x: DMatrix::zeros(0, 0),
        };
        let masked = lin.masked(orbit.state());
        lin.u = lin.field(&masked);
        lin.u_x = lin.field_dx(&masked);
        Ok(lin)
    }

    fn masked(&self, modes: &DMatrix<f64>) -> DMatrix<f64> {
        match &self.mask {
            Some(mask) => modes.component_mul(mask),
            None => modes.clone(),
        }
    }

    fn field(&self, modes: &DMatrix<f64>) -> DMatrix<f64> {
        let spatial = spatial_modes(modes, self.symmetry, self.discretization);
        space_inverse(&spatial, self.discretization.space_points)
    }

    fn field_dx(&self, modes: &DMatrix<f64>) -> DMatrix<f64> {
        let spatial = spatial_modes(modes, self.symmetry, self.discretization);
        space_inverse(&spatial_dx(&spatial, self.length), self.discretization.space_points)
    }

    fn project(&self, field: &DMatrix<f64>) -> DMatrix<f64> {
        let spatial = space_forward(field);
        self.masked(&project_spatial_modes(&spatial, self.symmetry, self.discretization))
    }

    fn project_dx(&self, field: &DMatrix<f64>) -> DMatrix<f64> {
        let spatial = spatial_dx(&space_forward(field), self.length);
        self.masked(&project_spatial_modes(&spatial, self.symmetry, self.discretization))
    }

    /// `P(u u_x)`.
    pub(crate) fn value(&self) -> DMatrix<f64> {
        self.project(&self.u.component_mul(&self.u_x))
    }

    /// Directional derivative `P(v u_x + u v_x)`.
    pub(crate) fn action(&self, direction: &DMatrix<f64>) -> DMatrix<f64> {
        let masked = self.masked(direction);
        let v = self.field(&masked);
        let v_x = self.field_dx(&masked);
        self.project(&(v.component_mul(&self.u_x) + self.u.component_mul(&v_x)))
    }

    /// Transpose of [`Linearization::action`]: `P(u_x w) - P((u w)_x)`.
    pub(crate) fn adjoint(&self, cotangent: &DMatrix<f64>) -> DMatrix<f64> {
        let w = self.field(&self.masked(cotangent));
        self.project(&self.u_x.component_mul(&w)) - self.project_dx(&self.u.component_mul(&w))
    }
}
