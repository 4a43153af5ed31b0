//! # Fit Configuration
//!
//! This module contains the configuration for a deconvolution run: EM
//! stopping rules, covariance regularization, the split-and-merge search
//! depth, the sample-interpretation modes and the worker count.

use crate::errors::{validate_finite, validate_parameter, DeconvResult, DeconvolutionError};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// What to do when a projected covariance cannot be inverted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SingularPolicy {
    /// Abort the fit with `SingularCovariance` (default)
    #[default]
    Fail,
    /// Give the sample/component pair zero responsibility for this iteration
    Skip,
}

/// Configuration for a deconvolution fit
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FitConfig {
    /// Convergence threshold on the change of the average log-likelihood
    pub tolerance: f64,
    /// Iteration cap for each EM run
    pub max_iterations: usize,
    /// Covariance regularization strength w (0 disables)
    pub regularization: f64,
    /// Number of split-and-merge trials per pass (0 disables)
    pub split_merge_depth: usize,
    /// Compute the likelihood of the current model only
    pub likelihood_only: bool,
    /// All projections are the identity
    pub no_projection: bool,
    /// All noise covariances are diagonal
    pub diagonal_errors: bool,
    /// Ignore per-sample log-weights
    pub unweighted: bool,
    /// Worker threads (None: one per core)
    pub parallelism: Option<usize>,
    /// Seed for the split perturbation RNG (None: OS entropy)
    pub seed: Option<u64>,
    /// Handling of singular projected covariances
    pub singular_policy: SingularPolicy,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self::standard()
    }
}

impl FitConfig {
    /// Standard configuration: full EM plus split-and-merge
    pub fn standard() -> Self {
        Self {
            tolerance: 1e-6,
            max_iterations: 1_000_000_000,
            regularization: 0.0,
            split_merge_depth: 5,
            likelihood_only: false,
            no_projection: false,
            diagonal_errors: false,
            unweighted: true,
            parallelism: None,
            seed: None,
            singular_policy: SingularPolicy::Fail,
        }
    }

    /// Evaluate the likelihood of the given model without fitting
    pub fn likelihood_only() -> Self {
        Self {
            likelihood_only: true,
            split_merge_depth: 0,
            ..Self::standard()
        }
    }

    /// Set the convergence tolerance
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Set the EM iteration cap
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the covariance regularization strength
    pub fn with_regularization(mut self, w: f64) -> Self {
        self.regularization = w;
        self
    }

    /// Set the split-and-merge depth
    pub fn with_split_merge_depth(mut self, depth: usize) -> Self {
        self.split_merge_depth = depth;
        self
    }

    /// Treat every projection as the identity
    pub fn with_no_projection(mut self, no_projection: bool) -> Self {
        self.no_projection = no_projection;
        self
    }

    /// Require diagonal noise covariances
    pub fn with_diagonal_errors(mut self, diagonal_errors: bool) -> Self {
        self.diagonal_errors = diagonal_errors;
        self
    }

    /// Use or ignore per-sample log-weights
    pub fn with_weights(mut self, weighted: bool) -> Self {
        self.unweighted = !weighted;
        self
    }

    /// Set the worker count
    pub fn with_parallelism(mut self, workers: usize) -> Self {
        self.parallelism = Some(workers);
        self
    }

    /// Seed the split perturbation RNG
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set the singular-covariance policy
    pub fn with_singular_policy(mut self, policy: SingularPolicy) -> Self {
        self.singular_policy = policy;
        self
    }

    /// Whether per-sample log-weights take part in the fit
    pub fn is_weighted(&self) -> bool {
        !self.unweighted
    }

    /// Whether split-and-merge runs after the first EM
    pub fn is_split_merge_enabled(&self) -> bool {
        !self.likelihood_only && self.split_merge_depth > 0
    }

    /// Check parameter ranges
    pub fn validate(&self) -> DeconvResult<()> {
        validate_finite(self.tolerance, "tolerance")?;
        validate_parameter(self.tolerance, 0.0, f64::MAX, "tolerance")?;
        validate_finite(self.regularization, "regularization")?;
        validate_parameter(self.regularization, 0.0, f64::MAX, "regularization")?;
        if self.max_iterations == 0 {
            return Err(DeconvolutionError::InvalidParameter {
                parameter: "max_iterations".to_string(),
                value: 0.0,
                constraint: "at least 1".to_string(),
            });
        }
        if self.parallelism == Some(0) {
            return Err(DeconvolutionError::InvalidParameter {
                parameter: "parallelism".to_string(),
                value: 0.0,
                constraint: "at least 1 worker".to_string(),
            });
        }
        Ok(())
    }
}
