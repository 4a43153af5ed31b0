//! # Extreme Deconvolution
//!
//! Gaussian mixture density estimation from noisy, incomplete and projected
//! samples.
//!
//! Each sample `wᵢ` is modelled as `wᵢ = Rᵢ·vᵢ + noise`, with `vᵢ` drawn from a
//! K-component Gaussian mixture in a d-dimensional latent space, `Rᵢ` a known
//! dᵢ×d projection and the noise Gaussian with known per-sample covariance
//! `Sᵢ`. The crate estimates the mixture (amplitudes, means, covariances) of
//! the latent space, i.e. the density the data would have with no noise and
//! no projection.
//!
//! ## Key Features
//!
//! - **Heterogeneous noise**: full or diagonal noise covariance per sample
//! - **Projections and missing data**: every sample may observe a different
//!   linear combination of the latent coordinates
//! - **Split-and-merge**: escapes poor local optima by merging overlapping
//!   components and splitting poorly-fitting ones, keeping only improvements
//! - **Fixed parameters**: amplitude, mean and covariance can be held fixed
//!   per component
//! - **Regularization**: optional `w·I` prior on the covariances
//! - **Weighted samples** and model-selection diagnostics (partition
//!   coefficient, AIC, MDL)
//! - **Parallel**: the Expectation and Maximization phases run on a rayon pool
//!   (`parallel` feature, on by default)
//!
//! ## Quick Start
//!
//! ```rust
//! use extreme_deconvolution::{
//!     ComponentFlags, Datapoint, Deconvolver, FitConfig, Gaussian, NoiseCovariance,
//! };
//! use nalgebra::{DMatrix, DVector};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Noisy 1-D measurements with individual error bars
//!     let data: Vec<Datapoint> = [(-2.1, 0.3), (-1.9, 0.1), (-2.4, 0.5), (1.8, 0.2), (2.2, 0.4), (2.0, 0.1)]
//!         .iter()
//!         .map(|&(x, var)| {
//!             Datapoint::unprojected(
//!                 DVector::from_vec(vec![x]),
//!                 NoiseCovariance::Diagonal(DVector::from_vec(vec![var])),
//!             )
//!         })
//!         .collect();
//!
//!     let mut gaussians = vec![
//!         Gaussian::new(0.5, DVector::from_vec(vec![-1.0]), DMatrix::identity(1, 1)),
//!         Gaussian::new(0.5, DVector::from_vec(vec![1.0]), DMatrix::identity(1, 1)),
//!     ];
//!     let flags = vec![ComponentFlags::free(); 2];
//!
//!     let config = FitConfig::standard().with_regularization(0.01).with_seed(1);
//!     let summary = Deconvolver::new(config).fit(&data, &mut gaussians, &flags, None)?;
//!
//!     println!("avg log-likelihood: {:.4}", summary.avg_loglike);
//!     for g in &gaussians {
//!         println!("α = {:.3}, m = {:.3}, V = {:.3}", g.amplitude, g.mean[0], g.covariance[(0, 0)]);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! [`Deconvolver::fit`] validates the inputs, allocates a [`Workspace`], runs
//! EM ([`em::run_em`]) and then the split-and-merge search
//! ([`split_merge::run_split_merge`]). Each EM iteration is one
//! [`expectation::expectation_step`] followed by one
//! [`maximization::maximization_step`]. Numerically delicate sums over
//! log-probabilities go through [`log_domain`].
//!
//! Progress is reported through the `log` facade. A [`FitLog`] additionally
//! records the per-iteration likelihoods and the split-and-merge decisions as
//! plain text.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;
pub mod linear_algebra;
pub mod log_domain;
pub mod math_utils;
pub mod model;
pub mod rng;
pub mod workspace;

// Fitting
pub mod deconvolution;
pub mod em;
pub mod expectation;
pub mod fit_log;
pub mod maximization;
pub mod split_merge;

// Re-exports for convenience - main public API
pub use config::{FitConfig, SingularPolicy};
pub use deconvolution::{Deconvolver, FitSummary, ModelSelectionCriteria};
pub use em::{EmOutcome, EmStatus};
pub use errors::{DeconvResult, DeconvolutionError};
pub use fit_log::FitLog;
pub use log_domain::Axis;
pub use model::{ComponentFlags, Datapoint, Gaussian, NoiseCovariance};
pub use split_merge::{SplitMergeReport, Trial};
pub use workspace::{LogResponsibilities, Workspace};
