//! The `kse_core` crate finds space-time periodic solutions of the
//! Kuramoto-Sivashinsky equation `u_t + u_xx + u_xxxx + u u_x = 0`.
//!
//! Time is treated as a second periodic dimension, so an orbit is a single
//! root of a residual in a joint space-time Fourier basis.
//!
//! Key components:
//! - **Orbit**: state, basis, parameters `(T, L, S)`, symmetry class and grid.
//! - **Transforms / Spectral**: field and modes bases, spectral derivatives.
//! - **Equation**: residual, Jacobian action and its adjoint.
//! - **Solver**: preconditioned Newton, descent and hybrid iterations.
//! - **Continuation**: parameter and grid stepping with step halving.
//! - **Gluing**: symmetry-aware composition of orbit tiles.
pub mod continuation;
pub mod discretization;
pub mod equation;
pub mod error;
pub mod gluing;
pub mod krylov;
pub mod nonlinear;
pub mod orbit;
pub mod solver;
pub mod spectral;
pub mod symmetry;
pub mod transforms;

#[cfg(test)]
mod fixtures;

pub use continuation::{
    continue_discretization, continue_many, continue_parameter, ContinuationJob,
    ContinuationResult, ContinuationSettings, ContinuationStatus,
};
pub use discretization::{parameter_based_discretization, rediscretize, resize, Resolution};
pub use equation::{jacobian_action, residual, Constraints, Equation};
pub use error::{OrbitError, OrbitResult};
pub use gluing::{glue, tile, GluingSettings};
pub use nonlinear::{nonlinear, Dealiasing};
pub use orbit::{Basis, Discretization, Orbit, OrbitRecord, Parameter, Parameters};
pub use solver::{
    classify, converge, ConvergeResult, ConvergeSettings, ConvergeStatus, InnerSolver, Integrity,
    Method,
};
pub use spectral::{derivative, Axis};
pub use symmetry::Symmetry;
pub use transforms::{convert, symmetry_defect};
