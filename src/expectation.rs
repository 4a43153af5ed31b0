//! Expectation phase: responsibilities and posterior moments per sample.
//!
//! For sample i and component k with projected covariance
//! `T = R·V·Rᵗ + S` the log-responsibility before normalization is
//!
//! ```text
//! ln αₖ − (dᵢ/2)·ln 2π − ½·ln|T| − ½·(w − R·m)ᵗ T⁻¹ (w − R·m)
//! ```
//!
//! and the posterior moments of the latent value are
//! `b = m + V·Rᵗ·T⁻¹·(w − R·m)` and `B = V − V·Rᵗ·T⁻¹·R·V`.

use crate::config::{FitConfig, SingularPolicy};
use crate::errors::{DeconvResult, DeconvolutionError};
use crate::linear_algebra::invert_with_log_det;
use crate::log_domain::normalize_row;
use crate::math_utils::constants::HALF_LN_TWO_PI;
use crate::model::{Datapoint, Gaussian};
use crate::workspace::{ComponentAccumulator, Workspace};
use nalgebra::{DMatrix, DVector};

/// Posterior moments of the latent value of one sample under one component.
#[derive(Debug, Clone)]
pub struct Posterior {
    /// Log-responsibility before row normalization
    pub log_q: f64,
    /// Posterior mean b
    pub mean: DVector<f64>,
    /// Posterior covariance B
    pub covariance: DMatrix<f64>,
}

/// Evaluate one sample under one component.
///
/// Returns `None` when the projected covariance is singular.
pub fn posterior(point: &Datapoint, gaussian: &Gaussian, no_projection: bool) -> Option<Posterior> {
    let di = point.dim();
    let v = &gaussian.covariance;

    let (mut t, residual, v_rt) = if no_projection {
        (v.clone(), &point.observation - &gaussian.mean, v.clone())
    } else {
        let r = &point.projection;
        let v_rt = v * r.transpose();
        (r * &v_rt, &point.observation - r * &gaussian.mean, v_rt)
    };
    point.noise.add_to(&mut t);

    let (t_inv, log_det) = invert_with_log_det(&t)?;
    let t_inv_residual = &t_inv * &residual;
    let exponent = residual.dot(&t_inv_residual);

    let log_q = gaussian.amplitude.ln()
        - di as f64 * HALF_LN_TWO_PI
        - 0.5 * log_det
        - 0.5 * exponent;

    let gain = &v_rt * &t_inv;
    let mean = &gaussian.mean + &v_rt * &t_inv_residual;
    let covariance = v - gain * v_rt.transpose();

    Some(Posterior {
        log_q,
        mean,
        covariance,
    })
}

/// Process a contiguous chunk of samples owned by one worker.
///
/// Writes the normalized rows into `rows` and adds each sample's weighted
/// moments into `accumulators`. Returns the chunk's log-likelihood sum.
fn process_chunk(
    first_sample: usize,
    samples: &[Datapoint],
    gaussians: &[Gaussian],
    rows: &mut [f64],
    accumulators: &mut [ComponentAccumulator],
    config: &FitConfig,
) -> DeconvResult<f64> {
    let k = gaussians.len();
    let weighted = config.is_weighted();
    let mut partial = 0.0;
    let mut moments: Vec<Option<(DVector<f64>, DMatrix<f64>)>> = Vec::with_capacity(k);

    for (offset, point) in samples.iter().enumerate() {
        let sample = first_sample + offset;
        let row = &mut rows[offset * k..(offset + 1) * k];
        moments.clear();

        for (component, gaussian) in gaussians.iter().enumerate() {
            match posterior(point, gaussian, config.no_projection) {
                Some(p) => {
                    row[component] = p.log_q;
                    moments.push(Some((p.mean, p.covariance)));
                }
                None => match config.singular_policy {
                    SingularPolicy::Fail => {
                        return Err(DeconvolutionError::SingularCovariance {
                            sample: Some(sample),
                            component,
                        })
                    }
                    SingularPolicy::Skip => {
                        log::debug!(
                            "Skipping singular projected covariance (sample {}, component {})",
                            sample,
                            component
                        );
                        row[component] = f64::NEG_INFINITY;
                        moments.push(None);
                    }
                },
            }
        }

        let weight = if weighted { Some(point.log_weight) } else { None };
        let norm = normalize_row(row, weight);
        if norm == f64::NEG_INFINITY || norm.is_nan() {
            return Err(DeconvolutionError::NumericalError {
                reason: format!("sample {} has zero likelihood under every component", sample),
                operation: Some("expectation".to_string()),
            });
        }
        partial += match weight {
            Some(w) => norm * w.exp(),
            None => norm,
        };

        for (component, m) in moments.iter().enumerate() {
            if let Some((b, big_b)) = m {
                let r = row[component].exp();
                if r > 0.0 {
                    accumulators[component].add_weighted(r, b, big_b);
                }
            }
        }
    }

    Ok(partial)
}

/// Run the Expectation phase over every sample.
///
/// Overwrites the workspace responsibilities, clears and refills the
/// per-worker accumulators and returns the average log-likelihood of the
/// data under the current components.
pub fn expectation_step(
    data: &[Datapoint],
    gaussians: &[Gaussian],
    workspace: &mut Workspace,
    config: &FitConfig,
) -> DeconvResult<f64> {
    let n = data.len();
    let k = gaussians.len();
    let chunk_rows = workspace.chunk_rows();
    let Workspace {
        responsibilities,
        accumulators,
        pool,
        ..
    } = workspace;
    accumulators.clear();

    let rows = responsibilities.as_mut_slice();
    let tables = accumulators.rows_mut();

    #[cfg(feature = "parallel")]
    let partials: Vec<f64> = {
        use rayon::prelude::*;
        pool.install(|| {
            rows.par_chunks_mut(chunk_rows * k)
                .zip(data.par_chunks(chunk_rows))
                .zip(tables.par_iter_mut())
                .enumerate()
                .map(|(worker, ((rows, samples), table))| {
                    process_chunk(worker * chunk_rows, samples, gaussians, rows, table, config)
                })
                .collect::<DeconvResult<Vec<f64>>>()
        })?
    };

    #[cfg(not(feature = "parallel"))]
    let partials: Vec<f64> = {
        let _ = pool;
        rows.chunks_mut(chunk_rows * k)
            .zip(data.chunks(chunk_rows))
            .zip(tables.iter_mut())
            .enumerate()
            .map(|(worker, ((rows, samples), table))| {
                process_chunk(worker * chunk_rows, samples, gaussians, rows, table, config)
            })
            .collect::<DeconvResult<Vec<f64>>>()?
    };

    // Summed in worker order so the result does not depend on scheduling
    let total: f64 = partials.iter().sum();
    Ok(total / n as f64)
}
