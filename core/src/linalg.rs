//! Linear algebra and log-space helpers shared by the motion models and the filter.
//!
//! Public API:
//!     pub fn matrix_square_root(matrix: &DMatrix<f64>) -> DMatrix<f64>
//!     pub fn robust_spd_solve(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Option<DMatrix<f64>>
//!     pub fn gaussian_log_pdf(x: &DVector<f64>, mean: &DVector<f64>, cov: &DMatrix<f64>) -> f64
//!     pub fn log_add / log_sum_exp / log_normalize
//!
//! Covariances coming out of repeated Kalman updates drift away from symmetry and, for the
//! one-dimensional road states, can become nearly singular when an edge clamps the mean.
//! Every decomposition here therefore symmetrizes first and falls back through a jittered
//! Cholesky before giving up.
//!
//! Likelihoods are carried in natural-log space throughout the crate. Sums of probabilities
//! are always formed with [`log_add`], never by exponentiating and adding.

use nalgebra::linalg::{Cholesky, SymmetricEigen};
use nalgebra::{DMatrix, DVector};

const INITIAL_JITTER: f64 = 1e-12;
const MAX_JITTER: f64 = 1e-6;
const MAX_TRIES: usize = 6;
const EIGEN_FLOOR: f64 = 1e-12;

/// Compute a robust square root `S` such that approximately `matrix ≈ S * Sᵀ`.
///
/// Tries a plain Cholesky factorization, then a jittered one, and finally a symmetric
/// eigen-decomposition with the eigenvalues floored at a small positive value. The motion
/// models draw their acceleration noise through it.
pub fn matrix_square_root(matrix: &DMatrix<f64>) -> DMatrix<f64> {
    assert!(
        matrix.is_square(),
        "matrix_square_root: matrix must be square"
    );
    let p = symmetrize(matrix);
    if let Some(s) = chol_sqrt(&p) {
        return s;
    }
    if let Some(s) = chol_sqrt_with_jitter(&p) {
        return s;
    }
    evd_symmetric_sqrt_with_floor(&p, EIGEN_FLOOR)
}

/// Symmetrize a matrix: P ← 0.5 (P + Pᵀ)
#[inline]
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (m + m.transpose())
}

fn chol_sqrt(p: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    Cholesky::new(p.clone()).map(|ch| ch.l().into_owned())
}

fn jittered_cholesky(p: &DMatrix<f64>) -> Option<Cholesky<f64, nalgebra::Dyn>> {
    let n = p.nrows();
    let mut jitter = INITIAL_JITTER;
    for _ in 0..MAX_TRIES {
        let mut pj = p.clone();
        for i in 0..n {
            pj[(i, i)] += jitter;
        }
        if let Some(ch) = Cholesky::new(pj) {
            return Some(ch);
        }
        jitter *= 10.0;
        if jitter > MAX_JITTER {
            break;
        }
    }
    None
}

fn chol_sqrt_with_jitter(p: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    jittered_cholesky(p).map(|ch| ch.l().into_owned())
}

/// S = U * sqrt(max(λ, floor)) * Uᵀ
fn evd_symmetric_sqrt_with_floor(p: &DMatrix<f64>, floor: f64) -> DMatrix<f64> {
    let se = SymmetricEigen::new(p.clone());
    let sqrt_vals = se.eigenvalues.map(|l| l.max(floor).sqrt());
    let u = se.eigenvectors;
    &u * DMatrix::<f64>::from_diagonal(&sqrt_vals) * u.transpose()
}

/// Solve A X = B for symmetric positive (semi-)definite A.
///
/// Cholesky with a jitter ramp first, then an explicit inverse. Returns `None` only when
/// A is singular even after jitter.
pub fn robust_spd_solve(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    assert!(a.is_square(), "robust_spd_solve: A must be square");
    assert_eq!(a.nrows(), b.nrows(), "robust_spd_solve: A and B incompatible");
    let a_sym = symmetrize(a);
    if let Some(ch) = Cholesky::new(a_sym.clone()) {
        return Some(ch.solve(b));
    }
    if let Some(ch) = jittered_cholesky(&a_sym) {
        return Some(ch.solve(b));
    }
    a_sym.try_inverse().map(|inv| &inv * b)
}

/// Log-density of a multivariate normal.
///
/// Returns `-inf` for non-finite inputs or a covariance that cannot be factored.
pub fn gaussian_log_pdf(x: &DVector<f64>, mean: &DVector<f64>, cov: &DMatrix<f64>) -> f64 {
    assert_eq!(x.len(), mean.len(), "gaussian_log_pdf: dimension mismatch");
    let residual = x - mean;
    if residual.iter().any(|v| !v.is_finite()) {
        return f64::NEG_INFINITY;
    }
    let cov = symmetrize(cov);
    let chol = match Cholesky::new(cov.clone()).or_else(|| jittered_cholesky(&cov)) {
        Some(ch) => ch,
        None => return f64::NEG_INFINITY,
    };
    let log_det: f64 = 2.0 * chol.l().diagonal().iter().map(|d| d.ln()).sum::<f64>();
    let solved = chol.solve(&residual);
    let mahalanobis = residual.dot(&solved);
    let k = x.len() as f64;
    -0.5 * (k * (2.0 * std::f64::consts::PI).ln() + log_det + mahalanobis)
}

/// `ln(exp(a) + exp(b))` without leaving log space.
#[inline]
pub fn log_add(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
    hi + (lo - hi).exp().ln_1p()
}

/// Sequential pairwise reduction with [`log_add`]. `-inf` for an empty slice.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    values.iter().fold(f64::NEG_INFINITY, |acc, &v| log_add(acc, v))
}

/// Normalize log-weights into linear probabilities summing to one.
///
/// Returns `None` when the support is empty or every weight is `-inf`.
pub fn log_normalize(log_weights: &[f64]) -> Option<Vec<f64>> {
    let total = log_sum_exp(log_weights);
    if !total.is_finite() {
        return None;
    }
    Some(log_weights.iter().map(|w| (w - total).exp()).collect())
}
