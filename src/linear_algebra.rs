//! Linear algebra helpers for the per-sample Gaussian computations
//!
//! Every projected covariance `T = R·V·Rᵗ + S` is inverted once per sample
//! and component per EM iteration, so these routines work on small dense
//! `nalgebra` matrices and report singular input instead of panicking.

use crate::errors::{DeconvResult, DeconvolutionError};
use nalgebra::{DMatrix, DVector};
use rand::Rng;

/// Validates that a matrix contains no NaN or Inf values
pub fn ensure_finite_matrix(a: &DMatrix<f64>, operation: &str) -> DeconvResult<()> {
    for j in 0..a.ncols() {
        for i in 0..a.nrows() {
            let val = a[(i, j)];
            if !val.is_finite() {
                return Err(DeconvolutionError::NumericalError {
                    reason: format!("Non-finite value ({}) at position [{},{}]", val, i, j),
                    operation: Some(operation.to_string()),
                });
            }
        }
    }
    Ok(())
}

/// Validates that a vector contains no NaN or Inf values
pub fn ensure_finite_vector(v: &DVector<f64>, operation: &str) -> DeconvResult<()> {
    if let Some((i, val)) = v.iter().enumerate().find(|(_, x)| !x.is_finite()) {
        return Err(DeconvolutionError::NumericalError {
            reason: format!("Non-finite value ({}) at position [{}]", val, i),
            operation: Some(operation.to_string()),
        });
    }
    Ok(())
}

/// Determinant of a square matrix via LU decomposition.
///
/// # Example
/// ```rust
/// use extreme_deconvolution::linear_algebra::determinant;
/// use nalgebra::DMatrix;
///
/// let a = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
/// assert!((determinant(&a) - 11.0).abs() < 1e-12);
/// ```
pub fn determinant(a: &DMatrix<f64>) -> f64 {
    if a.nrows() == 0 {
        return 1.0;
    }
    a.clone().lu().determinant()
}

/// LU-invert a covariance matrix, returning the inverse and ln|A|.
///
/// Returns `None` when the matrix is not square, cannot be inverted, or its
/// determinant is not a positive finite number.
pub fn invert_with_log_det(a: &DMatrix<f64>) -> Option<(DMatrix<f64>, f64)> {
    if !a.is_square() {
        return None;
    }
    let lu = a.clone().lu();
    let det = lu.determinant();
    if !(det.is_finite() && det > 0.0) {
        return None;
    }
    let inverse = lu.try_inverse()?;
    if inverse.iter().any(|x| !x.is_finite()) {
        return None;
    }
    Some((inverse, det.ln()))
}

/// Random perturbation used when splitting a component.
///
/// Each coordinate is drawn independently and uniformly from
/// `[-length/√d, length/√d]`, so the offset lies in a hypercube whose
/// half-diagonal is `length`.
pub fn random_offset<R: Rng + ?Sized>(rng: &mut R, d: usize, length: f64) -> DVector<f64> {
    if d == 0 {
        return DVector::zeros(0);
    }
    let scale = length / (d as f64).sqrt();
    DVector::from_fn(d, |_, _| (2.0 * rng.gen::<f64>() - 1.0) * scale)
}

/// Mirror the upper triangle into the lower triangle.
pub fn symmetrize_from_upper(a: &mut DMatrix<f64>) {
    let n = a.nrows().min(a.ncols());
    for i in 1..n {
        for j in 0..i {
            a[(i, j)] = a[(j, i)];
        }
    }
}
