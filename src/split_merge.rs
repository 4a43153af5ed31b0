//! Split-and-merge search over component restructurings.
//!
//! After EM converges, pairs of components that claim the same samples are
//! candidates for merging and components that fit their samples poorly are
//! candidates for splitting. Each trial merges one pair, splits a third
//! component into the freed slot, lets the three settle with everything else
//! fixed, then runs a full EM. A trial is kept only if it strictly improves
//! the average log-likelihood; otherwise the model and responsibilities are
//! restored exactly.

use crate::config::FitConfig;
use crate::em::run_em;
use crate::errors::{DeconvResult, DeconvolutionError};
use crate::fit_log::FitLog;
use crate::linear_algebra::{determinant, invert_with_log_det, random_offset};
use crate::log_domain::{logsum_axis, normalize_row, Axis};
use crate::math_utils::constants::HALF_LN_TWO_PI;
use crate::math_utils::float_ops::safe_div;
use crate::math_utils::float_total_cmp;
use crate::model::{ComponentFlags, Datapoint, Gaussian};
use crate::rng::SplitRng;
use crate::workspace::{LogResponsibilities, WorkerPool, Workspace};
use nalgebra::{DMatrix, DVector};
use rand::Rng;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Merge and split criteria for the current model.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateScores {
    /// `merge[(j, k)]` for j < k; −∞ elsewhere
    pub merge: DMatrix<f64>,
    /// Local Kullback-Leibler divergence of each component from its samples
    pub split: Vec<f64>,
}

/// One restructuring: merge `merge.1` into `merge.0`, split `split` into
/// itself and the slot freed by `merge.1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Trial {
    /// Components to merge
    pub merge: (usize, usize),
    /// Component to split
    pub split: usize,
}

/// Summary of a split-and-merge search.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SplitMergeReport {
    /// Trials attempted
    pub trials: usize,
    /// Trials accepted
    pub accepted: usize,
    /// Passes over a freshly scored hierarchy
    pub passes: usize,
    /// Average log-likelihood of the final model
    pub avg_loglike: f64,
}

/// Observation used to score splits: the sample itself when it lives in the
/// latent space, otherwise its back-projection `Rᵗ·w`.
///
/// The back-projection leaves the null space of `R` at zero instead of
/// filling it with its conditional expectation.
fn filled_observation(point: &Datapoint, d: usize) -> DVector<f64> {
    if point.dim() == d {
        point.observation.clone()
    } else {
        point.projection.tr_mul(&point.observation)
    }
}

/// Split score of one component; −∞ when its covariance cannot be inverted,
/// which puts it last in the split order.
fn split_score(
    component: usize,
    gaussian: &Gaussian,
    filled: &[DVector<f64>],
    responsibilities: &LogResponsibilities,
) -> f64 {
    let d = gaussian.dim();
    let mut column: Vec<f64> = responsibilities.column_iter(component).collect();
    normalize_row(&mut column, None);

    let Some((v_inv, log_det)) = invert_with_log_det(&gaussian.covariance) else {
        log::debug!("Component {} has a singular covariance; not a split candidate", component);
        return f64::NEG_INFINITY;
    };

    let mut score = d as f64 * HALF_LN_TWO_PI + 0.5 * log_det;
    for (log_q, x) in column.iter().zip(filled) {
        let q = log_q.exp();
        if q == 0.0 {
            continue;
        }
        let diff = x - &gaussian.mean;
        score += log_q * q + 0.5 * q * diff.dot(&(&v_inv * &diff));
    }
    if score.is_nan() {
        f64::NEG_INFINITY
    } else {
        score
    }
}

/// Compute the merge and split criteria.
///
/// `merge[(j, k)] = Σᵢ qᵢⱼ·qᵢₖ` measures how much two components overlap on
/// the data. `split[l]` is the divergence between component l and the data
/// it is responsible for, weighted by the column-normalized responsibilities.
/// Components with a singular covariance score −∞.
pub fn score_candidates(
    data: &[Datapoint],
    gaussians: &[Gaussian],
    responsibilities: &LogResponsibilities,
    pool: &WorkerPool,
) -> CandidateScores {
    let k = gaussians.len();
    let d = gaussians.first().map_or(0, Gaussian::dim);

    let mut merge = DMatrix::from_element(k, k, f64::NEG_INFINITY);
    for j in 0..k {
        for m in (j + 1)..k {
            let overlap: f64 = (0..responsibilities.rows())
                .map(|i| responsibilities.get(i, j).exp() * responsibilities.get(i, m).exp())
                .sum();
            merge[(j, m)] = overlap;
        }
    }

    let filled: Vec<DVector<f64>> = data.iter().map(|p| filled_observation(p, d)).collect();
    let score = |c: usize| split_score(c, &gaussians[c], &filled, responsibilities);

    #[cfg(feature = "parallel")]
    let split = {
        use rayon::prelude::*;
        pool.install(|| (0..k).into_par_iter().map(score).collect::<Vec<f64>>())
    };
    #[cfg(not(feature = "parallel"))]
    let split = {
        let _ = pool;
        (0..k).map(score).collect::<Vec<f64>>()
    };

    CandidateScores { merge, split }
}

/// Order all trials, most promising first.
///
/// Merge pairs are taken in descending merge score (earliest pair in
/// row-major order on ties); each is paired with every other component in
/// descending split score. Produces K(K−1)(K−2)/2 trials.
pub fn build_hierarchy(scores: &CandidateScores) -> Vec<Trial> {
    let k = scores.split.len();
    if k < 3 {
        return Vec::new();
    }

    let mut pairs: Vec<(usize, usize)> = Vec::with_capacity(k * (k - 1) / 2);
    for j in 0..k {
        for m in (j + 1)..k {
            pairs.push((j, m));
        }
    }
    // Stable sorts keep index order among equal scores
    pairs.sort_by(|a, b| float_total_cmp(&scores.merge[*b], &scores.merge[*a]));

    let mut split_order: Vec<usize> = (0..k).collect();
    split_order.sort_by(|a, b| float_total_cmp(&scores.split[*b], &scores.split[*a]));

    let mut hierarchy = Vec::with_capacity(k * (k - 1) * (k - 2) / 2);
    for &(j, m) in &pairs {
        for &l in split_order.iter().filter(|&&l| l != j && l != m) {
            hierarchy.push(Trial {
                merge: (j, m),
                split: l,
            });
        }
    }
    hierarchy
}

/// Merge two components and split a third in place.
///
/// The merged component takes the summed amplitude and the
/// responsibility-mass-weighted mean and covariance. The split component's
/// amplitude is halved between itself and the freed slot; both halves get
/// the isotropic covariance `det(V)^(1/d)·I` and independently perturbed
/// copies of the original mean.
pub fn apply_trial<R: Rng + ?Sized>(
    gaussians: &mut [Gaussian],
    responsibilities: &LogResponsibilities,
    trial: Trial,
    rng: &mut R,
) -> DeconvResult<()> {
    let (j, k) = trial.merge;
    let l = trial.split;
    let d = gaussians[l].dim();

    let qj = logsum_axis(responsibilities, j, Axis::Column).exp();
    let qk = logsum_axis(responsibilities, k, Axis::Column).exp();
    let (wj, wk) = match safe_div(qj, qj + qk) {
        Some(wj) => (wj, 1.0 - wj),
        None => (0.5, 0.5),
    };

    let merged = Gaussian::new(
        gaussians[j].amplitude + gaussians[k].amplitude,
        &gaussians[j].mean * wj + &gaussians[k].mean * wk,
        &gaussians[j].covariance * wj + &gaussians[k].covariance * wk,
    );

    let parent = &gaussians[l];
    let scale = determinant(&parent.covariance).powf(1.0 / d as f64);
    if !(scale.is_finite() && scale > 0.0) {
        return Err(DeconvolutionError::NumericalError {
            reason: format!("component {} has a non-positive covariance determinant", l),
            operation: Some("split".to_string()),
        });
    }
    let amplitude = parent.amplitude / 2.0;
    let covariance = DMatrix::<f64>::identity(d, d) * scale;
    let length = scale.sqrt();
    let first = Gaussian::new(
        amplitude,
        &parent.mean + random_offset(rng, d, length),
        covariance.clone(),
    );
    let second = Gaussian::new(
        amplitude,
        &parent.mean + random_offset(rng, d, length),
        covariance,
    );

    gaussians[j] = merged;
    gaussians[k] = first;
    gaussians[l] = second;
    Ok(())
}

fn settling_flags(k: usize, trial: Trial) -> Vec<ComponentFlags> {
    (0..k)
        .map(|c| {
            if c == trial.merge.0 || c == trial.merge.1 || c == trial.split {
                ComponentFlags::free()
            } else {
                ComponentFlags::fixed()
            }
        })
        .collect()
}

/// Settle the three touched components, then run a full EM with the
/// caller's flags. Returns the final average log-likelihood.
#[allow(clippy::too_many_arguments)]
fn run_trial(
    data: &[Datapoint],
    gaussians: &mut [Gaussian],
    workspace: &mut Workspace,
    caller_flags: &[ComponentFlags],
    config: &FitConfig,
    snapshot: &LogResponsibilities,
    trial: Trial,
    rng: &mut SplitRng,
    log: &mut FitLog,
) -> DeconvResult<f64> {
    log.trial_started(trial.merge.0, trial.merge.1, trial.split)?;
    apply_trial(gaussians, snapshot, trial, rng)?;

    workspace.set_working_flags(&settling_flags(gaussians.len(), trial));
    run_em(data, gaussians, workspace, config, log)?;
    workspace.set_working_flags(caller_flags);

    log.full_em()?;
    let outcome = run_em(data, gaussians, workspace, config, log)?;
    log.em_finished()?;
    workspace.set_working_flags(caller_flags);
    Ok(outcome.avg_loglike)
}

/// Run split-and-merge passes until a pass accepts nothing.
///
/// `avg_loglike` is the likelihood of the converged model on entry. Each pass
/// scores the current model and walks at most `config.split_merge_depth`
/// trials of its hierarchy, restarting after the first accepted trial.
/// A trial that fails numerically is rolled back and counts as rejected.
/// Nothing happens in likelihood-only mode, at depth 0 or with fewer than
/// three components.
#[allow(clippy::too_many_arguments)]
pub fn run_split_merge(
    data: &[Datapoint],
    gaussians: &mut [Gaussian],
    workspace: &mut Workspace,
    caller_flags: &[ComponentFlags],
    config: &FitConfig,
    rng: &mut SplitRng,
    log: &mut FitLog,
    avg_loglike: f64,
) -> DeconvResult<SplitMergeReport> {
    let k = gaussians.len();
    let mut report = SplitMergeReport {
        trials: 0,
        accepted: 0,
        passes: 0,
        avg_loglike,
    };
    if !config.is_split_merge_enabled() || k < 3 {
        return Ok(report);
    }

    let mut snapshot = workspace.responsibilities.clone();
    loop {
        report.passes += 1;
        let baseline = report.avg_loglike;
        let saved = gaussians.to_vec();
        snapshot.copy_from(&workspace.responsibilities);

        let scores = score_candidates(data, gaussians, &snapshot, &workspace.pool);
        let hierarchy = build_hierarchy(&scores);

        let mut improved = false;
        for &trial in hierarchy.iter().take(config.split_merge_depth) {
            report.trials += 1;
            let result = run_trial(
                data,
                gaussians,
                workspace,
                caller_flags,
                config,
                &snapshot,
                trial,
                rng,
                log,
            );
            let trial_loglike = match result {
                Ok(value) => value,
                Err(e @ DeconvolutionError::LogSink { .. }) => {
                    gaussians.clone_from_slice(&saved);
                    workspace.responsibilities.copy_from(&snapshot);
                    workspace.set_working_flags(caller_flags);
                    return Err(e);
                }
                Err(e) => {
                    log::warn!(
                        "Merge of {} and {} with split of {} failed: {}",
                        trial.merge.0,
                        trial.merge.1,
                        trial.split,
                        e
                    );
                    f64::NAN
                }
            };

            if trial_loglike > baseline {
                log::info!(
                    "Accepted merge of {} and {} with split of {}: {} -> {}",
                    trial.merge.0,
                    trial.merge.1,
                    trial.split,
                    baseline,
                    trial_loglike
                );
                log.trial_accepted()?;
                report.accepted += 1;
                report.avg_loglike = trial_loglike;
                improved = true;
                break;
            }

            log::debug!(
                "Rejected merge of {} and {} with split of {}: {} <= {}",
                trial.merge.0,
                trial.merge.1,
                trial.split,
                trial_loglike,
                baseline
            );
            gaussians.clone_from_slice(&saved);
            workspace.responsibilities.copy_from(&snapshot);
            workspace.set_working_flags(caller_flags);
            log.trial_rejected()?;
        }

        if !improved {
            break;
        }
    }

    Ok(report)
}
