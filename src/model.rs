//! Mixture components and observed samples.

use crate::linear_algebra::symmetrize_from_upper;
use nalgebra::{DMatrix, DVector};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// One Gaussian component of the mixture in the latent space.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Gaussian {
    /// Mixing weight; the weights of all components sum to 1
    pub amplitude: f64,
    /// Mean vector (length d)
    pub mean: DVector<f64>,
    /// Covariance (d×d, symmetric positive semi-definite); the upper triangle
    /// is authoritative
    pub covariance: DMatrix<f64>,
}

impl Gaussian {
    /// Create a component from its amplitude, mean and covariance.
    pub fn new(amplitude: f64, mean: DVector<f64>, covariance: DMatrix<f64>) -> Self {
        Self {
            amplitude,
            mean,
            covariance,
        }
    }

    /// Latent dimension of the component.
    pub fn dim(&self) -> usize {
        self.mean.len()
    }
}

/// Which parameters of a component are held fixed during fitting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ComponentFlags {
    /// Keep the amplitude
    pub amplitude: bool,
    /// Keep the mean
    pub mean: bool,
    /// Keep the covariance
    pub covariance: bool,
}

impl ComponentFlags {
    /// Every parameter free.
    pub const fn free() -> Self {
        Self {
            amplitude: false,
            mean: false,
            covariance: false,
        }
    }

    /// Every parameter fixed.
    pub const fn fixed() -> Self {
        Self {
            amplitude: true,
            mean: true,
            covariance: true,
        }
    }

    /// True when amplitude, mean and covariance are all fixed.
    pub fn is_fully_fixed(&self) -> bool {
        self.amplitude && self.mean && self.covariance
    }
}

/// Per-sample noise covariance.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum NoiseCovariance {
    /// Full dᵢ×dᵢ covariance matrix
    Full(DMatrix<f64>),
    /// Independent per-coordinate variances (length dᵢ)
    Diagonal(DVector<f64>),
}

impl NoiseCovariance {
    /// Dimension of the observation this noise belongs to.
    pub fn dim(&self) -> usize {
        match self {
            NoiseCovariance::Full(m) => m.nrows(),
            NoiseCovariance::Diagonal(v) => v.len(),
        }
    }

    /// Whether the noise is stored as a variance vector.
    pub fn is_diagonal(&self) -> bool {
        matches!(self, NoiseCovariance::Diagonal(_))
    }

    /// Add the noise covariance onto `target` in place.
    ///
    /// Only the upper triangle of a full matrix is read.
    pub fn add_to(&self, target: &mut DMatrix<f64>) {
        match self {
            NoiseCovariance::Full(m) => {
                for c in 0..m.ncols() {
                    for r in 0..m.nrows() {
                        target[(r, c)] += m[(r.min(c), r.max(c))];
                    }
                }
            }
            NoiseCovariance::Diagonal(v) => {
                for (i, var) in v.iter().enumerate() {
                    target[(i, i)] += var;
                }
            }
        }
    }

    /// Dense symmetric matrix form of the noise covariance.
    pub fn to_matrix(&self) -> DMatrix<f64> {
        match self {
            NoiseCovariance::Full(m) => {
                let mut full = m.clone();
                symmetrize_from_upper(&mut full);
                full
            }
            NoiseCovariance::Diagonal(v) => DMatrix::from_diagonal(v),
        }
    }
}

/// A single noisy, projected observation.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Datapoint {
    /// Observed values (length dᵢ ≤ d)
    pub observation: DVector<f64>,
    /// Measurement noise covariance
    pub noise: NoiseCovariance,
    /// Projection from latent to observed space (dᵢ×d)
    pub projection: DMatrix<f64>,
    /// Log of the sample weight, used only in weighted fits
    pub log_weight: f64,
}

impl Datapoint {
    /// Create a sample with log-weight 0.
    pub fn new(observation: DVector<f64>, noise: NoiseCovariance, projection: DMatrix<f64>) -> Self {
        Self {
            observation,
            noise,
            projection,
            log_weight: 0.0,
        }
    }

    /// Create a sample observed directly in the latent space.
    pub fn unprojected(observation: DVector<f64>, noise: NoiseCovariance) -> Self {
        let d = observation.len();
        Self::new(observation, noise, DMatrix::identity(d, d))
    }

    /// Set the log-weight.
    pub fn with_log_weight(mut self, log_weight: f64) -> Self {
        self.log_weight = log_weight;
        self
    }

    /// Observed dimension dᵢ.
    pub fn dim(&self) -> usize {
        self.observation.len()
    }
}
