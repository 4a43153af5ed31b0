//! Top-level fitting entry point and model-selection diagnostics.

use crate::config::FitConfig;
use crate::em::{run_em, EmOutcome};
use crate::errors::{validate_all_finite, DeconvResult, DeconvolutionError};
use crate::fit_log::FitLog;
use crate::linear_algebra::{ensure_finite_matrix, ensure_finite_vector};
use crate::math_utils::float_ops::approx_eq_eps;
use crate::model::{ComponentFlags, Datapoint, Gaussian, NoiseCovariance};
use crate::rng::SplitRng;
use crate::split_merge::{run_split_merge, SplitMergeReport};
use crate::workspace::{LogResponsibilities, Workspace};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Diagnostics for choosing the number of components.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ModelSelectionCriteria {
    /// Mean over samples of Σₖ qᵢₖ²; 1 for a hard partition, 1/K for none
    pub partition_coefficient: f64,
    /// Akaike information criterion (small-sample variant)
    pub aic: f64,
    /// Minimum description length
    pub mdl: f64,
}

impl ModelSelectionCriteria {
    /// Compute the diagnostics from the final responsibilities.
    ///
    /// `avg_loglike` is the average log-likelihood of the final model and `d`
    /// the latent dimension. Each component carries `1 + d + d(d−1)/2` free
    /// parameters.
    pub fn compute(responsibilities: &LogResponsibilities, d: usize, avg_loglike: f64) -> Self {
        let n = responsibilities.rows() as f64;
        let k = responsibilities.cols();

        let partition_coefficient = responsibilities
            .as_slice()
            .iter()
            .map(|q| q.exp().powi(2))
            .sum::<f64>()
            / n;

        let per_component = (1 + d + d * d.saturating_sub(1) / 2) as f64;
        let params = k as f64 * per_component;
        let aic = -2.0 * (n - 1.0 - per_component - 100.0) * avg_loglike + 3.0 * params;
        let mdl = -avg_loglike * n + 0.5 * params * n.ln();

        Self {
            partition_coefficient,
            aic,
            mdl,
        }
    }
}

/// Result of a complete fit.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FitSummary {
    /// Average log-likelihood of the returned model
    pub avg_loglike: f64,
    /// The initial EM run
    pub em: EmOutcome,
    /// The split-and-merge search
    pub split_merge: SplitMergeReport,
    /// Model-selection diagnostics of the returned model
    pub criteria: ModelSelectionCriteria,
}

/// Extreme-deconvolution fitter.
///
/// # Example
/// ```rust
/// use extreme_deconvolution::{ComponentFlags, Datapoint, Deconvolver, FitConfig, Gaussian, NoiseCovariance};
/// use nalgebra::{DMatrix, DVector};
///
/// let data: Vec<Datapoint> = [-1.0, -0.4, 0.1, 0.3, 1.2]
///     .iter()
///     .map(|&x| Datapoint::unprojected(
///         DVector::from_vec(vec![x]),
///         NoiseCovariance::Diagonal(DVector::from_vec(vec![0.01])),
///     ))
///     .collect();
/// let mut gaussians = vec![Gaussian::new(1.0, DVector::zeros(1), DMatrix::identity(1, 1))];
/// let flags = vec![ComponentFlags::free()];
///
/// let summary = Deconvolver::new(FitConfig::standard().with_parallelism(1))
///     .fit(&data, &mut gaussians, &flags, None)
///     .unwrap();
/// assert!(summary.avg_loglike.is_finite());
/// assert!((gaussians[0].amplitude - 1.0).abs() < 1e-12);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Deconvolver {
    config: FitConfig,
}

impl Deconvolver {
    /// Create a fitter with the given configuration.
    pub fn new(config: FitConfig) -> Self {
        Self { config }
    }

    /// The configuration in use.
    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    /// Fit `gaussians` to `data` in place.
    ///
    /// Runs EM from the given components, then split-and-merge unless it is
    /// disabled or there are fewer than three components. `flags` holds one
    /// entry per component. Inputs are validated before any iteration.
    pub fn fit(
        &self,
        data: &[Datapoint],
        gaussians: &mut [Gaussian],
        flags: &[ComponentFlags],
        log: Option<&mut FitLog>,
    ) -> DeconvResult<FitSummary> {
        self.config.validate()?;
        let d = validate_inputs(data, gaussians, flags, &self.config)?;

        let mut discard = FitLog::disabled();
        let log = match log {
            Some(log) => log,
            None => &mut discard,
        };

        let mut workspace = Workspace::new(data.len(), d, flags, self.config.parallelism)?;
        log::info!(
            "Fitting {} components to {} samples in {} dimensions ({} workers)",
            gaussians.len(),
            data.len(),
            d,
            workspace.workers()
        );

        log.initial_em()?;
        let em = run_em(data, gaussians, &mut workspace, &self.config, log)?;
        log.em_finished()?;
        workspace.set_working_flags(flags);

        let mut rng = SplitRng::from_seed_option(self.config.seed);
        let split_merge = run_split_merge(
            data,
            gaussians,
            &mut workspace,
            flags,
            &self.config,
            &mut rng,
            log,
            em.avg_loglike,
        )?;

        let avg_loglike = split_merge.avg_loglike;
        let criteria = ModelSelectionCriteria::compute(workspace.responsibilities(), d, avg_loglike);
        log.criteria(&criteria)?;

        log::info!(
            "Fit finished: avg loglike {}, {} of {} restructurings accepted",
            avg_loglike,
            split_merge.accepted,
            split_merge.trials
        );

        Ok(FitSummary {
            avg_loglike,
            em,
            split_merge,
            criteria,
        })
    }

    /// Average log-likelihood of `data` under `gaussians`, without fitting.
    pub fn log_likelihood(&self, data: &[Datapoint], gaussians: &[Gaussian]) -> DeconvResult<f64> {
        let config = FitConfig {
            likelihood_only: true,
            ..self.config.clone()
        };
        let mut model = gaussians.to_vec();
        let flags = vec![ComponentFlags::fixed(); gaussians.len()];
        let summary = Deconvolver::new(config).fit(data, &mut model, &flags, None)?;
        Ok(summary.avg_loglike)
    }
}

fn mismatch(context: String, expected: usize, found: usize) -> DeconvolutionError {
    DeconvolutionError::DimensionMismatch {
        context,
        expected,
        found,
    }
}

/// Check shapes and values of the fit inputs. Returns the latent dimension.
fn validate_inputs(
    data: &[Datapoint],
    gaussians: &[Gaussian],
    flags: &[ComponentFlags],
    config: &FitConfig,
) -> DeconvResult<usize> {
    if gaussians.is_empty() {
        return Err(DeconvolutionError::InsufficientData {
            required: 1,
            actual: 0,
        });
    }
    if data.is_empty() {
        return Err(DeconvolutionError::InsufficientData {
            required: 1,
            actual: 0,
        });
    }
    if flags.len() != gaussians.len() {
        return Err(mismatch("component flags".to_string(), gaussians.len(), flags.len()));
    }

    let d = gaussians[0].dim();
    if d == 0 {
        return Err(mismatch("latent dimension".to_string(), 1, 0));
    }

    let mut amplitude_sum = 0.0;
    for (k, g) in gaussians.iter().enumerate() {
        if g.dim() != d {
            return Err(mismatch(format!("mean of component {}", k), d, g.dim()));
        }
        if g.covariance.nrows() != d || g.covariance.ncols() != d {
            return Err(mismatch(
                format!("covariance of component {}", k),
                d,
                if g.covariance.nrows() != d { g.covariance.nrows() } else { g.covariance.ncols() },
            ));
        }
        if !(g.amplitude.is_finite() && g.amplitude >= 0.0) {
            return Err(DeconvolutionError::InvalidParameter {
                parameter: format!("amplitude of component {}", k),
                value: g.amplitude,
                constraint: "finite and non-negative".to_string(),
            });
        }
        ensure_finite_vector(&g.mean, "component mean")?;
        ensure_finite_matrix(&g.covariance, "component covariance")?;
        amplitude_sum += g.amplitude;
    }
    if !approx_eq_eps(amplitude_sum, 1.0, 1e-6) {
        log::warn!("Initial amplitudes sum to {}, not 1", amplitude_sum);
    }

    for (i, point) in data.iter().enumerate() {
        let di = point.dim();
        if di == 0 || di > d {
            return Err(mismatch(format!("observation of sample {}", i), d, di));
        }
        if point.noise.dim() != di {
            return Err(mismatch(format!("noise of sample {}", i), di, point.noise.dim()));
        }
        if let NoiseCovariance::Full(s) = &point.noise {
            if s.ncols() != di {
                return Err(mismatch(format!("noise columns of sample {}", i), di, s.ncols()));
            }
            ensure_finite_matrix(s, "noise covariance")?;
        }
        if let NoiseCovariance::Diagonal(v) = &point.noise {
            ensure_finite_vector(v, "noise variances")?;
        }
        if config.diagonal_errors && !point.noise.is_diagonal() {
            return Err(DeconvolutionError::InvalidParameter {
                parameter: "diagonal_errors".to_string(),
                value: 1.0,
                constraint: format!("sample {} carries a full noise covariance", i),
            });
        }
        if config.no_projection {
            if di != d {
                return Err(mismatch(format!("unprojected sample {}", i), d, di));
            }
        } else {
            if point.projection.nrows() != di {
                return Err(mismatch(format!("projection rows of sample {}", i), di, point.projection.nrows()));
            }
            if point.projection.ncols() != d {
                return Err(mismatch(format!("projection columns of sample {}", i), d, point.projection.ncols()));
            }
            ensure_finite_matrix(&point.projection, "projection")?;
        }
        validate_all_finite(point.observation.as_slice(), "observation")?;
        if config.is_weighted() && !point.log_weight.is_finite() {
            return Err(DeconvolutionError::InvalidParameter {
                parameter: format!("log_weight of sample {}", i),
                value: point.log_weight,
                constraint: "finite".to_string(),
            });
        }
    }

    Ok(d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::{DMatrix, DVector};

    fn point(x: f64) -> Datapoint {
        Datapoint::unprojected(
            DVector::from_vec(vec![x]),
            NoiseCovariance::Diagonal(DVector::from_vec(vec![0.1])),
        )
    }

    fn unit() -> Gaussian {
        Gaussian::new(1.0, DVector::zeros(1), DMatrix::identity(1, 1))
    }

    #[test]
    fn test_criteria_formulas() {
        let mut q = LogResponsibilities::new(4, 2);
        for i in 0..4 {
            q.row_mut(i).copy_from_slice(&[0.5f64.ln(), 0.5f64.ln()]);
        }
        let c = ModelSelectionCriteria::compute(&q, 2, -1.5);
        assert_approx_eq!(c.partition_coefficient, 0.5, 1e-12);
        // npc = 1 + 2 + 1 = 4, np = 8
        assert_approx_eq!(c.aic, -2.0 * (4.0 - 1.0 - 4.0 - 100.0) * -1.5 + 24.0, 1e-9);
        assert_approx_eq!(c.mdl, 1.5 * 4.0 + 4.0 * 4.0f64.ln(), 1e-9);
    }

    #[test]
    fn test_hard_partition_coefficient() {
        let mut q = LogResponsibilities::new(2, 3);
        q.row_mut(0).copy_from_slice(&[0.0, f64::NEG_INFINITY, f64::NEG_INFINITY]);
        q.row_mut(1).copy_from_slice(&[f64::NEG_INFINITY, f64::NEG_INFINITY, 0.0]);
        let c = ModelSelectionCriteria::compute(&q, 1, 0.0);
        assert_approx_eq!(c.partition_coefficient, 1.0, 1e-15);
    }

    #[test]
    fn test_validation_errors() {
        let data = vec![point(0.0), point(1.0)];
        let fitter = Deconvolver::new(FitConfig::standard().with_parallelism(1));

        let mut empty: Vec<Gaussian> = Vec::new();
        assert!(matches!(
            fitter.fit(&data, &mut empty, &[], None),
            Err(DeconvolutionError::InsufficientData { .. })
        ));

        let mut gaussians = vec![unit()];
        assert!(matches!(
            fitter.fit(&[], &mut gaussians, &[ComponentFlags::free()], None),
            Err(DeconvolutionError::InsufficientData { .. })
        ));

        match fitter.fit(&data, &mut gaussians, &[], None) {
            Err(DeconvolutionError::DimensionMismatch { context, expected, found }) => {
                assert_eq!(context, "component flags");
                assert_eq!((expected, found), (1, 0));
            }
            other => panic!("Expected DimensionMismatch, got {:?}", other),
        }

        let mut bad = vec![Gaussian::new(1.0, DVector::zeros(1), DMatrix::identity(2, 2))];
        assert!(matches!(
            fitter.fit(&data, &mut bad, &[ComponentFlags::free()], None),
            Err(DeconvolutionError::DimensionMismatch { .. })
        ));

        let mut negative = vec![Gaussian::new(-0.1, DVector::zeros(1), DMatrix::identity(1, 1))];
        assert!(matches!(
            fitter.fit(&data, &mut negative, &[ComponentFlags::free()], None),
            Err(DeconvolutionError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_validation_of_samples() {
        let fitter = Deconvolver::new(FitConfig::standard().with_parallelism(1));
        let mut gaussians = vec![Gaussian::new(1.0, DVector::zeros(2), DMatrix::identity(2, 2))];
        let flags = [ComponentFlags::free()];

        // Projection with the wrong number of columns
        let wrong_projection = vec![Datapoint::new(
            DVector::from_vec(vec![1.0]),
            NoiseCovariance::Diagonal(DVector::from_vec(vec![0.1])),
            DMatrix::from_row_slice(1, 3, &[1.0, 0.0, 0.0]),
        )];
        assert!(matches!(
            fitter.fit(&wrong_projection, &mut gaussians, &flags, None),
            Err(DeconvolutionError::DimensionMismatch { expected: 2, found: 3, .. })
        ));

        // Noise of the wrong size
        let wrong_noise = vec![Datapoint::unprojected(
            DVector::from_vec(vec![1.0, 2.0]),
            NoiseCovariance::Diagonal(DVector::from_vec(vec![0.1])),
        )];
        assert!(matches!(
            fitter.fit(&wrong_noise, &mut gaussians, &flags, None),
            Err(DeconvolutionError::DimensionMismatch { .. })
        ));

        // Full noise when diagonal errors are required
        let full = vec![Datapoint::unprojected(
            DVector::from_vec(vec![1.0, 2.0]),
            NoiseCovariance::Full(DMatrix::identity(2, 2)),
        )];
        let diagonal = Deconvolver::new(FitConfig::standard().with_diagonal_errors(true));
        assert!(matches!(
            diagonal.fit(&full, &mut gaussians, &flags, None),
            Err(DeconvolutionError::InvalidParameter { .. })
        ));

        // Non-finite observation
        let nan = vec![Datapoint::unprojected(
            DVector::from_vec(vec![f64::NAN, 2.0]),
            NoiseCovariance::Diagonal(DVector::from_vec(vec![0.1, 0.1])),
        )];
        assert!(matches!(
            fitter.fit(&nan, &mut gaussians, &flags, None),
            Err(DeconvolutionError::NumericalError { .. })
        ));
    }

    #[test]
    fn test_log_likelihood_does_not_modify() {
        let data = vec![point(-1.0), point(0.5), point(2.0)];
        let gaussians = vec![unit()];
        let fitter = Deconvolver::new(FitConfig::standard().with_parallelism(1));
        let ll = fitter.log_likelihood(&data, &gaussians).unwrap();

        // One Gaussian with variance 1 + 0.1
        let var: f64 = 1.1;
        let expected = [-1.0f64, 0.5, 2.0]
            .iter()
            .map(|x| -0.5 * (2.0 * std::f64::consts::PI * var).ln() - 0.5 * x * x / var)
            .sum::<f64>()
            / 3.0;
        assert_approx_eq!(ll, expected, 1e-12);
        assert_eq!(gaussians[0], unit());
    }
}
