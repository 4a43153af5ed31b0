//! Error types and validation functions for extreme deconvolution.
//!
//! Numeric failure is the dominant error class: a projected covariance that
//! cannot be decomposed surfaces as [`DeconvolutionError::SingularCovariance`]
//! naming the offending sample and component. Shape problems are caught by
//! validation before the first EM iteration.

use std::sync::Arc;
use thiserror::Error;

/// Error types for mixture fitting operations.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum DeconvolutionError {
    /// A covariance matrix could not be decomposed or inverted.
    #[error("Singular covariance for component {component}{}", sample_suffix(.sample))]
    SingularCovariance {
        /// Sample whose projected covariance failed (None for a bare component covariance)
        sample: Option<usize>,
        /// Mixture component index
        component: usize,
    },

    /// Inconsistent dimensions between samples, projections and components.
    #[error("Dimension mismatch in {context}: expected {expected}, found {found}")]
    DimensionMismatch {
        /// What was being checked
        context: String,
        /// Expected dimension
        expected: usize,
        /// Actual dimension
        found: usize,
    },

    /// Invalid parameter value for fit configuration.
    #[error("Invalid parameter: {parameter} = {value}, expected {constraint}")]
    InvalidParameter {
        /// Parameter name
        parameter: String,
        /// Invalid value provided
        value: f64,
        /// Valid range or constraint description
        constraint: String,
    },

    /// Not enough samples or components for the requested operation.
    #[error("Insufficient data: need at least {required}, got {actual}")]
    InsufficientData {
        /// Minimum required count
        required: usize,
        /// Actual count provided
        actual: usize,
    },

    /// Numerical computation error not covered by a more specific variant.
    #[error("Numerical computation failed: {reason}")]
    NumericalError {
        /// Detailed reason for numerical failure
        reason: String,
        /// Operation that failed
        operation: Option<String>,
    },

    /// Workspace allocation exceeds the allocation guard.
    #[error("Allocation of {requested} bytes in '{operation}' exceeds the safety limit")]
    AllocationLimit {
        /// Requested size in bytes
        requested: usize,
        /// Operation requesting the allocation
        operation: String,
    },

    /// Writing to the text log sink failed.
    #[error("Log sink write failed: {operation}")]
    LogSink {
        /// Write operation that failed
        operation: String,
        /// Underlying error
        #[source]
        source: Arc<std::io::Error>,
    },

    /// The worker pool could not be created.
    #[error("Worker pool construction failed: {reason}")]
    ThreadPool {
        /// Reason reported by the pool builder
        reason: String,
    },
}

fn sample_suffix(sample: &Option<usize>) -> String {
    match sample {
        Some(i) => format!(" at sample {}", i),
        None => String::new(),
    }
}

/// Result type for mixture fitting operations.
pub type DeconvResult<T> = Result<T, DeconvolutionError>;

/// Validates that a value is finite and not NaN.
///
/// # Example
/// ```rust
/// use extreme_deconvolution::errors::validate_finite;
///
/// assert!(validate_finite(1.0, "tolerance").is_ok());
/// assert!(validate_finite(f64::NAN, "tolerance").is_err());
/// ```
pub fn validate_finite(value: f64, name: &str) -> DeconvResult<()> {
    if !value.is_finite() {
        Err(DeconvolutionError::NumericalError {
            reason: format!("{} is not finite: {}", name, value),
            operation: None,
        })
    } else {
        Ok(())
    }
}

/// Validates that all values in a slice are finite.
///
/// Returns on the first non-finite entry, naming its index.
pub fn validate_all_finite(data: &[f64], name: &str) -> DeconvResult<()> {
    if let Some((i, &value)) = data.iter().enumerate().find(|(_, &v)| !v.is_finite()) {
        return Err(DeconvolutionError::NumericalError {
            reason: format!("{} contains non-finite value at index {}: {}", name, i, value),
            operation: None,
        });
    }
    Ok(())
}

/// Validates that a parameter is within inclusive bounds.
pub fn validate_parameter(value: f64, min: f64, max: f64, name: &str) -> DeconvResult<()> {
    if value.is_nan() {
        return Err(DeconvolutionError::InvalidParameter {
            parameter: name.to_string(),
            value,
            constraint: "must not be NaN".to_string(),
        });
    }

    if value < min || value > max {
        Err(DeconvolutionError::InvalidParameter {
            parameter: name.to_string(),
            value,
            constraint: format!("[{}, {}]", min, max),
        })
    } else {
        Ok(())
    }
}

/// Guards workspace allocations.
///
/// The responsibility matrix is N×K and every worker holds K (d + d²)
/// accumulators, so a mistyped K or d can ask for absurd amounts of memory.
/// Requests above 4 GiB are refused.
///
/// # Example
/// ```rust
/// use extreme_deconvolution::errors::validate_allocation_size;
///
/// assert!(validate_allocation_size(1000, "test").is_ok());
/// assert!(validate_allocation_size(usize::MAX, "test").is_err());
/// ```
pub fn validate_allocation_size(size: usize, operation: &str) -> DeconvResult<()> {
    const MAX_SAFE_ALLOCATION: usize = 1 << 32;

    if size > MAX_SAFE_ALLOCATION {
        return Err(DeconvolutionError::AllocationLimit {
            requested: size,
            operation: operation.to_string(),
        });
    }

    if size >= (1 << 30) {
        log::warn!(
            "Large workspace allocation: {} bytes ({:.2} GB) in '{}'",
            size,
            size as f64 / (1024.0 * 1024.0 * 1024.0),
            operation
        );
    }

    Ok(())
}
