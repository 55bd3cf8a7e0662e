//! Matrix-free least-squares solver for the Newton correction.
//!
//! LSQR (Paige and Saunders) needs only products with `A` and `A^T`, handles
//! the rectangular systems produced by free parameters and returns the
//! minimum-norm solution for rank-deficient ones.

use nalgebra::DVector;

use crate::error::{OrbitError, OrbitResult};

#[derive(Debug, Clone)]
pub struct LsqrOutcome {
    pub solution: DVector<f64>,
    pub iterations: usize,
    /// Estimate of `|b - A x|`.
    pub residual_norm: f64,
}

/// Solves `min |A x - b|` given closures for `A x` and `A^T y`.
///
/// Stops once the residual estimate drops below `tolerance * |b|`, once the
/// normal-equation residual is below `tolerance` relative to `|A| |r|`, or
/// after `max_iterations` steps.
pub fn lsqr<A, At>(
    columns: usize,
    mut apply: A,
    mut apply_adjoint: At,
    rhs: &DVector<f64>,
    tolerance: f64,
    max_iterations: usize,
) -> OrbitResult<LsqrOutcome>
where
    A: FnMut(&DVector<f64>) -> OrbitResult<DVector<f64>>,
    At: FnMut(&DVector<f64>) -> OrbitResult<DVector<f64>>,
{
    let mut x = DVector::zeros(columns);
    let b_norm = rhs.norm();
    if !b_norm.is_finite() {
        return Err(OrbitError::NonFinite("least-squares right-hand side"));
    }
    if b_norm == 0.0 {
        return Ok(LsqrOutcome {
            solution: x,
            iterations: 0,
            residual_norm: 0.0,
        });
    }

    let mut u = rhs / b_norm;
    let mut v = apply_adjoint(&u)?;
    let mut alpha = v.norm();
    if alpha == 0.0 {
        return Ok(LsqrOutcome {
            solution: x,
            iterations: 0,
            residual_norm: b_norm,
        });
    }
    v /= alpha;

    let mut w = v.clone();
    let mut phi_bar = b_norm;
    let mut rho_bar = alpha;
    let mut a_norm_sq = alpha * alpha;
    let mut iterations = 0;

    while iterations < max_iterations {
        iterations += 1;

        u = apply(&v)? - &u * alpha;
        let beta = u.norm();
        if beta > 0.0 {
            u /= beta;
        }
        v = apply_adjoint(&u)? - &v * beta;
        alpha = v.norm();
        if alpha > 0.0 {
            v /= alpha;
        }
        a_norm_sq += alpha * alpha + beta * beta;

        let rho = rho_bar.hypot(beta);
        if rho == 0.0 {
            break;
        }
        let c = rho_bar / rho;
        let s = beta / rho;
        let theta = s * alpha;
        rho_bar = -c * alpha;
        let phi = c * phi_bar;
        phi_bar *= s;

        x.axpy(phi / rho, &w, 1.0);
        w = &v - &w * (theta / rho);

        if !phi_bar.is_finite() || !x.iter().all(|value| value.is_finite()) {
            return Err(OrbitError::NonFinite("least-squares iteration"));
        }
        let normal_residual = alpha * c.abs() / a_norm_sq.sqrt();
        if phi_bar <= tolerance * b_norm || normal_residual <= tolerance || alpha == 0.0 {
            break;
        }
    }

    Ok(LsqrOutcome {
        solution: x,
        iterations,
        residual_norm: phi_bar,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DMatrix;

    fn solve(a: &DMatrix<f64>, b: &DVector<f64>) -> LsqrOutcome {
        lsqr(
            a.ncols(),
            |x| Ok(a * x),
            |y| Ok(a.transpose() * y),
            b,
            1e-14,
            100,
        )
        .unwrap()
    }

    #[test]
    fn test_square_system() {
        let a = DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.0, 1.0, 3.0, -1.0, 0.0, -1.0, 2.0]);
        let expected = DVector::from_vec(vec![1.0, -2.0, 0.5]);
        let b = &a * &expected;
        let outcome = solve(&a, &b);
        let err = (&outcome.solution - &expected).amax();
        assert!(err < 1e-10, "Solution error {}", err);
        assert!(outcome.iterations <= 10, "Took {} iterations", outcome.iterations);
    }

    #[test]
    fn test_overdetermined_matches_normal_equations() {
        let a = DMatrix::from_row_slice(4, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0, 1.0, 3.0]);
        let b = DVector::from_vec(vec![1.0, 2.0, 2.0, 5.0]);
        let outcome = solve(&a, &b);
        let normal = (a.transpose() * &a)
            .lu()
            .solve(&(a.transpose() * &b))
            .expect("normal equations are regular");
        let err = (&outcome.solution - &normal).amax();
        assert!(err < 1e-10, "Least-squares error {}", err);
        assert!(outcome.residual_norm > 0.0);
    }

    #[test]
    fn test_underdetermined_returns_minimum_norm() {
        let a = DMatrix::from_row_slice(1, 2, &[1.0, 1.0]);
        let b = DVector::from_vec(vec![2.0]);
        let outcome = solve(&a, &b);
        let err = (&outcome.solution - DVector::from_vec(vec![1.0, 1.0])).amax();
        assert!(err < 1e-12, "Minimum-norm error {}", err);
    }

    #[test]
    fn test_zero_rhs() {
        let a = DMatrix::<f64>::identity(3, 3);
        let outcome = solve(&a, &DVector::zeros(3));
        assert_eq!(outcome.iterations, 0);
        assert_eq!(outcome.solution, DVector::zeros(3));
    }
}
