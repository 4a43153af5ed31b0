//! Log-domain arithmetic over rows and columns of log-probabilities.
//!
//! Responsibilities are kept as logs so that samples far out in the tail of
//! every component do not underflow to zero. Summation uses a single shift
//! chosen from the finite extremes of the vector: large enough that the
//! smallest finite term does not vanish, small enough that the largest term
//! (times the vector length) still fits in an `f64`.

use crate::math_utils::constants::{LN_F64_MAX, LN_F64_MIN_POSITIVE};
use crate::workspace::LogResponsibilities;

/// Which direction of a matrix to reduce over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    /// A single sample's log-responsibilities over all components.
    Row,
    /// A single component's log-responsibilities over all samples.
    Column,
}

/// Finite minimum and maximum of `values`, skipping ±∞ and NaN.
///
/// Returns `None` when no finite entry exists.
pub fn minmax<I>(values: I) -> Option<(f64, f64)>
where
    I: IntoIterator<Item = f64>,
{
    let mut extremes: Option<(f64, f64)> = None;
    for v in values {
        if !v.is_finite() {
            continue;
        }
        extremes = Some(match extremes {
            None => (v, v),
            Some((lo, hi)) => (lo.min(v), hi.max(v)),
        });
    }
    extremes
}

/// Shift added to every entry before exponentiating.
fn stable_shift(min: f64, max: f64, len: usize) -> f64 {
    let low = LN_F64_MIN_POSITIVE - min;
    let high = LN_F64_MAX - (len.max(1) as f64).ln() - max;
    low.min(high)
}

/// log(Σ exp(vᵢ)) computed without overflow or needless underflow.
///
/// Entries equal to −∞ contribute nothing; a vector with no finite entry
/// sums to −∞.
pub fn logsum(values: &[f64]) -> f64 {
    logsum_iter(values.iter().copied(), values.len())
}

fn logsum_iter<I>(values: I, len: usize) -> f64
where
    I: Iterator<Item = f64> + Clone,
{
    let (min, max) = match minmax(values.clone()) {
        Some(extremes) => extremes,
        None => return f64::NEG_INFINITY,
    };
    let shift = stable_shift(min, max, len);
    let total: f64 = values.map(|v| (v + shift).exp()).sum();
    total.ln() - shift
}

/// Log-normalize `values` in place.
///
/// Afterwards the exponentials sum to 1, or to `exp(weight)` when a weight is
/// given. Returns the normalization constant computed before the weight was
/// applied. A vector with no finite entry is left untouched and −∞ is
/// returned.
pub fn normalize_row(values: &mut [f64], weight: Option<f64>) -> f64 {
    let norm = logsum(values);
    if norm == f64::NEG_INFINITY {
        return norm;
    }
    let offset = weight.unwrap_or(0.0) - norm;
    for v in values.iter_mut() {
        *v += offset;
    }
    norm
}

/// [`logsum`] over one row or column of a responsibility matrix.
pub fn logsum_axis(q: &LogResponsibilities, index: usize, axis: Axis) -> f64 {
    match axis {
        Axis::Row => logsum(q.row(index)),
        Axis::Column => logsum_iter(q.column_iter(index), q.rows()),
    }
}

/// [`normalize_row`] over one row or column of a responsibility matrix.
pub fn normalize_axis(
    q: &mut LogResponsibilities,
    index: usize,
    axis: Axis,
    weight: Option<f64>,
) -> f64 {
    match axis {
        Axis::Row => normalize_row(q.row_mut(index), weight),
        Axis::Column => {
            let norm = logsum_axis(q, index, Axis::Column);
            if norm == f64::NEG_INFINITY {
                return norm;
            }
            let offset = weight.unwrap_or(0.0) - norm;
            for i in 0..q.rows() {
                let v = q.get(i, index);
                q.set(i, index, v + offset);
            }
            norm
        }
    }
}
