//! Linear algebra helpers for covariance square roots and gain solves.
//!
//! Public API:
//!     pub fn matrix_square_root(matrix: &DMatrix<f64>) -> Result<DMatrix<f64>>
//!     pub fn kalman_gain(cross_covariance: &DMatrix<f64>, innovation: &DMatrix<f64>) -> Result<DMatrix<f64>>
//!
//! Internal pipeline (each step isolated for testing):
//!     - symmetrize()
//!     - chol_sqrt()
//!     - evd_symmetric_sqrt()
//!     - chol_solve_spd()
//!
//! Square root strategy:
//! 1) Symmetrize P ← 0.5 (P + Pᵀ)
//! 2) Cholesky (positive definite fast path)
//! 3) Symmetric EVD, accepting eigenvalues down to -tol·max|λ| and clamping them
//!    to zero → S = U * sqrt(Λ⁺) * Uᵀ. Anything more negative is not PSD.

use nalgebra::DMatrix;
use nalgebra::linalg::{Cholesky, SymmetricEigen};

use crate::error::{FilterError, Result};

/// Relative eigenvalue tolerance below zero still treated as round-off.
pub const PSD_TOLERANCE: f64 = 1e-10;
/// Reciprocal condition number under which an innovation covariance is singular.
pub const SINGULARITY_TOLERANCE: f64 = 1e-12;

/// Compute a square root `S` such that `matrix ≈ S * Sᵀ`.
///
/// Attempts Cholesky decomposition first (yielding lower triangular L such that
/// matrix = L * Lᵀ). If Cholesky fails because the matrix is only semi-definite, the
/// symmetric square root from the eigenvalue decomposition is returned instead.
///
/// # Arguments
/// * `matrix` - square, (nearly) symmetric matrix to factor
///
/// # Returns
/// * `Ok(S)` with `matrix ≈ S * Sᵀ`
/// * `Err(FilterError::Numerical)` if the matrix is not square, contains non-finite
///   entries, or has an eigenvalue significantly below zero.
pub fn matrix_square_root(matrix: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    if !matrix.is_square() {
        return Err(FilterError::numerical(format!(
            "matrix square root requires a square matrix, got {}x{}",
            matrix.nrows(),
            matrix.ncols()
        )));
    }
    if matrix.iter().any(|v| !v.is_finite()) {
        return Err(FilterError::numerical(
            "matrix square root of a matrix with non-finite entries",
        ));
    }
    // 1) Symmetrize to kill round-off asymmetry
    let p = symmetrize(matrix);
    // 2) Cholesky (fast path)
    if let Some(s) = chol_sqrt(&p) {
        return Ok(s);
    }
    // 3) EVD fallback for semi-definite input
    evd_symmetric_sqrt(&p, PSD_TOLERANCE)
}

/// Symmetrize a matrix: P ← 0.5 (P + Pᵀ)
///
/// Reduces the round-off asymmetry accumulated by floating point covariance updates.
#[inline]
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (m + m.transpose())
}

/// Largest absolute difference between a matrix and its transpose.
pub fn asymmetry(m: &DMatrix<f64>) -> f64 {
    (m - m.transpose()).amax()
}

/// Plain Cholesky square root, `None` if the matrix is not positive definite.
fn chol_sqrt(p: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    Cholesky::new(p.clone()).map(|ch| ch.l().into_owned())
}

/// Symmetric EVD square root: S = U * sqrt(max(λ, 0)) * Uᵀ
///
/// Eigenvalues in `[-tol·max|λ|, 0)` are round-off and clamped to zero.
fn evd_symmetric_sqrt(p: &DMatrix<f64>, tol: f64) -> Result<DMatrix<f64>> {
    let se = SymmetricEigen::new(p.clone());
    let scale = se.eigenvalues.amax().max(f64::MIN_POSITIVE);
    let min = se.eigenvalues.min();
    if min < -tol * scale {
        return Err(FilterError::numerical(format!(
            "matrix is not positive semi-definite (smallest eigenvalue {min:e})"
        )));
    }
    let sqrt_vals = se.eigenvalues.map(|l| l.max(0.0).sqrt());
    let u = se.eigenvectors;
    Ok(&u * DMatrix::<f64>::from_diagonal(&sqrt_vals) * u.transpose())
}

/// Diagonal loading schedule for [`chol_solve_spd`]
#[derive(Debug, Clone, Copy)]
pub struct SolveOptions {
    /// First value added to the diagonal after a failed factorization
    pub initial_jitter: f64,
    /// Largest diagonal loading tried; the jitter grows tenfold per attempt
    pub max_jitter: f64,
    pub max_tries: usize,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            initial_jitter: 1e-12,
            max_jitter: 1e-6,
            max_tries: 6,
        }
    }
}

/// Solve A X = B for SPD-ish A via Cholesky, with jitter retries.
/// Returns None if the shapes disagree or all attempts fail.
pub fn chol_solve_spd(
    a: &DMatrix<f64>,
    b: &DMatrix<f64>,
    opt: SolveOptions,
) -> Option<DMatrix<f64>> {
    if !a.is_square() || a.nrows() != b.nrows() {
        return None;
    }
    let a_sym = symmetrize(a);
    if let Some(ch) = Cholesky::new(a_sym.clone()) {
        return Some(ch.solve(b));
    }
    let n = a_sym.nrows();
    let mut jitter = opt.initial_jitter;
    for _ in 0..opt.max_tries {
        let mut a_j = a_sym.clone();
        for i in 0..n {
            a_j[(i, i)] += jitter;
        }
        if let Some(ch) = Cholesky::new(a_j) {
            return Some(ch.solve(b));
        }
        jitter *= 10.0;
        if jitter > opt.max_jitter {
            break;
        }
    }
    None
}

/// Reciprocal condition estimate of a symmetric matrix from its eigenvalues.
pub fn reciprocal_condition(m: &DMatrix<f64>) -> f64 {
    let se = SymmetricEigen::new(symmetrize(m));
    let largest = se.eigenvalues.amax();
    if largest == 0.0 || !largest.is_finite() {
        return 0.0;
    }
    se.eigenvalues.amin() / largest
}

/// Kalman gain K = C · S⁻¹ for cross-covariance `C` (n×m) and innovation `S` (m×m).
///
/// `S` is checked for singularity before solving; the solve itself goes through
/// Cholesky (`Sᵀ Kᵀ = Cᵀ`) with an LU fallback for indefinite but invertible `S`.
pub fn kalman_gain(
    cross_covariance: &DMatrix<f64>,
    innovation: &DMatrix<f64>,
) -> Result<DMatrix<f64>> {
    if !innovation.is_square() || cross_covariance.ncols() != innovation.nrows() {
        return Err(FilterError::numerical(format!(
            "gain shapes disagree: cross-covariance {}x{}, innovation {}x{}",
            cross_covariance.nrows(),
            cross_covariance.ncols(),
            innovation.nrows(),
            innovation.ncols()
        )));
    }
    if innovation.iter().any(|v| !v.is_finite()) {
        return Err(FilterError::numerical(
            "innovation covariance has non-finite entries",
        ));
    }
    let rcond = reciprocal_condition(innovation);
    if rcond <= SINGULARITY_TOLERANCE {
        return Err(FilterError::numerical(format!(
            "innovation covariance is singular (reciprocal condition {rcond:e})"
        )));
    }
    let s = symmetrize(innovation);
    let ct = cross_covariance.transpose();
    let kt = match chol_solve_spd(&s, &ct, SolveOptions::default()) {
        Some(kt) => kt,
        None => s.lu().solve(&ct).ok_or_else(|| {
            FilterError::numerical("innovation covariance could not be inverted")
        })?,
    };
    Ok(kt.transpose())
}

/* =============================== Tests ==================================== */
