//! EM driver: alternate Expectation and Maximization until convergence.

use crate::config::FitConfig;
use crate::errors::DeconvResult;
use crate::expectation::expectation_step;
use crate::fit_log::FitLog;
use crate::linear_algebra::symmetrize_from_upper;
use crate::maximization::maximization_step;
use crate::model::{Datapoint, Gaussian};
use crate::workspace::Workspace;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// State of an EM run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum EmStatus {
    /// Still iterating
    Running,
    /// Likelihood change fell within the tolerance
    Converged,
    /// Iteration cap reached first
    MaxIterReached,
    /// Only the likelihood was evaluated
    LikelihoodOnly,
}

impl EmStatus {
    /// Whether the run has stopped.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EmStatus::Running)
    }
}

/// Result of one EM run
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EmOutcome {
    /// Terminal state
    pub status: EmStatus,
    /// Expectation phases performed
    pub iterations: usize,
    /// Average log-likelihood from the last Expectation phase
    pub avg_loglike: f64,
    /// Average log-likelihood of every iteration
    pub history: Vec<f64>,
}

/// Run EM on `gaussians` using the workspace's working flags.
///
/// Each iteration evaluates the likelihood of the current components and then
/// updates them. The run converges once the change between consecutive
/// iterations is at most `config.tolerance`. A decrease in likelihood is
/// reported but does not stop the run. Covariances are read from their upper
/// triangle, and on return they are exactly symmetric.
pub fn run_em(
    data: &[Datapoint],
    gaussians: &mut [Gaussian],
    workspace: &mut Workspace,
    config: &FitConfig,
    log: &mut FitLog,
) -> DeconvResult<EmOutcome> {
    let mut status = EmStatus::Running;
    let mut history = Vec::new();
    let mut previous: Option<f64> = None;
    for g in gaussians.iter_mut() {
        symmetrize_from_upper(&mut g.covariance);
    }

    while !status.is_terminal() {
        let avg = expectation_step(data, gaussians, workspace, config)?;
        history.push(avg);
        log.iteration(avg)?;

        if let Some(prev) = previous {
            if avg < prev {
                log::warn!(
                    "Average log-likelihood decreased by {:e} (from {} to {})",
                    avg - prev,
                    prev,
                    avg
                );
                log.likelihood_decrease(prev, avg)?;
            }
        }

        if config.likelihood_only {
            status = EmStatus::LikelihoodOnly;
            break;
        }

        let totals = workspace.accumulators.reduce(&workspace.pool);
        let pruned = maximization_step(
            gaussians,
            &totals,
            workspace,
            config.regularization,
            config.is_weighted(),
        );
        if pruned > 0 {
            log::info!("Iteration {}: pruned {} empty component(s)", history.len(), pruned);
        }

        if let Some(prev) = previous {
            if (avg - prev).abs() <= config.tolerance {
                status = EmStatus::Converged;
            }
        }
        if !status.is_terminal() && history.len() >= config.max_iterations {
            status = EmStatus::MaxIterReached;
        }
        previous = Some(avg);
    }

    for g in gaussians.iter_mut() {
        symmetrize_from_upper(&mut g.covariance);
    }

    let avg_loglike = history.last().copied().unwrap_or(f64::NEG_INFINITY);
    log::debug!(
        "EM finished: {:?} after {} iterations, avg loglike {}",
        status,
        history.len(),
        avg_loglike
    );

    Ok(EmOutcome {
        status,
        iterations: history.len(),
        avg_loglike,
        history,
    })
}
