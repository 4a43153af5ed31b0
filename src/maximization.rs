//! Maximization phase: component updates from the reduced accumulators.

use crate::log_domain::{logsum_axis, Axis};
use crate::math_utils::constants::MASS_FLOOR;
use crate::model::{ComponentFlags, Gaussian};
use crate::workspace::{ComponentAccumulator, LogResponsibilities, Workspace};
use nalgebra::DMatrix;

/// Column mass `q_k = Σᵢ exp(log qᵢₖ)`, flushed to zero below the smallest
/// normal `f64`.
pub fn component_mass(responsibilities: &LogResponsibilities, component: usize) -> f64 {
    let q = logsum_axis(responsibilities, component, Axis::Column).exp();
    if q < MASS_FLOOR {
        0.0
    } else {
        q
    }
}

/// Update one component in place. Returns `true` when the component was
/// pruned for having no responsibility mass.
fn update_component(
    gaussian: &mut Gaussian,
    flags: &mut ComponentFlags,
    totals: &ComponentAccumulator,
    q: f64,
    regularization: &DMatrix<f64>,
    w: f64,
) -> bool {
    if q == 0.0 {
        if !flags.amplitude {
            gaussian.amplitude = 0.0;
        }
        *flags = ComponentFlags::fixed();
        return true;
    }

    let n = &totals.mean / q;
    if !flags.mean {
        gaussian.mean.copy_from(&n);
    }

    if !flags.covariance {
        let m = &gaussian.mean;
        let mut c = totals.second_moment.clone();
        c.ger(q, m, m, 1.0);
        c.ger(-q, m, &n, 1.0);
        c.ger(-q, &n, m, 1.0);
        if w > 0.0 {
            c += regularization;
            c /= q + 1.0;
        } else {
            c /= q;
        }
        gaussian.covariance = c;
    }

    if !flags.amplitude {
        gaussian.amplitude = q;
    }
    false
}

/// Run the Maximization phase.
///
/// `totals` are the accumulators reduced across workers. Components whose
/// working flags are all set are left untouched; a component with zero
/// responsibility mass is pruned by fixing all of its working flags and
/// zeroing its amplitude. Amplitudes are renormalized afterwards so that
/// free and fixed amplitudes sum to one. Returns the number of components
/// pruned in this step.
pub fn maximization_step(
    gaussians: &mut [Gaussian],
    totals: &[ComponentAccumulator],
    workspace: &mut Workspace,
    regularization: f64,
    weighted: bool,
) -> usize {
    let n = workspace.samples();
    let d = workspace.dim();
    let reg = DMatrix::<f64>::identity(d, d) * regularization;
    let Workspace {
        responsibilities,
        working_flags,
        pool,
        ..
    } = workspace;

    let sum_fixed: f64 = gaussians
        .iter()
        .zip(working_flags.iter())
        .filter(|(_, f)| f.amplitude)
        .map(|(g, _)| g.amplitude)
        .sum();

    let responsibilities = &*responsibilities;
    let update = |(component, ((gaussian, flags), totals)): (
        usize,
        ((&mut Gaussian, &mut ComponentFlags), &ComponentAccumulator),
    )| {
        if flags.is_fully_fixed() {
            return false;
        }
        let q = component_mass(responsibilities, component);
        let pruned = update_component(gaussian, flags, totals, q, &reg, regularization);
        if pruned {
            log::debug!("Component {} has no responsibility mass; fixing it", component);
        }
        pruned
    };

    #[cfg(feature = "parallel")]
    let pruned = {
        use rayon::prelude::*;
        pool.install(|| {
            gaussians
                .par_iter_mut()
                .zip(working_flags.par_iter_mut())
                .zip(totals.par_iter())
                .enumerate()
                .map(update)
                .filter(|p| *p)
                .count()
        })
    };

    #[cfg(not(feature = "parallel"))]
    let pruned = {
        let _ = pool;
        gaussians
            .iter_mut()
            .zip(working_flags.iter_mut())
            .zip(totals.iter())
            .enumerate()
            .map(update)
            .filter(|p| *p)
            .count()
    };

    if !weighted && sum_fixed == 0.0 {
        for g in gaussians.iter_mut() {
            g.amplitude /= n as f64;
        }
    } else {
        let free_sum: f64 = gaussians
            .iter()
            .zip(working_flags.iter())
            .filter(|(_, f)| !f.amplitude)
            .map(|(g, _)| g.amplitude)
            .sum();
        if free_sum > 0.0 {
            let scale = (1.0 - sum_fixed) / free_sum;
            for (g, _) in gaussians
                .iter_mut()
                .zip(working_flags.iter())
                .filter(|(_, f)| !f.amplitude)
            {
                g.amplitude *= scale;
            }
        }
    }

    pruned
}
