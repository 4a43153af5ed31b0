//! Split-and-merge and execution-mode behaviour
//!
//! Drives the EM and split-and-merge stages directly through a [`Workspace`]
//! and compares fits across worker counts, projection modes and seeds.

use assert_approx_eq::assert_approx_eq;
use extreme_deconvolution::em::run_em;
use extreme_deconvolution::rng::SplitRng;
use extreme_deconvolution::split_merge::{apply_trial, run_split_merge};
use extreme_deconvolution::{
    ComponentFlags, Datapoint, Deconvolver, EmStatus, FitConfig, FitLog, Gaussian,
    NoiseCovariance, Trial, Workspace,
};
use nalgebra::{DMatrix, DVector};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Normal};

/// Three well separated 1-D clusters at -10, 0 and 10
fn three_clusters(n: usize, seed: u64) -> Vec<Datapoint> {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let unit = Normal::new(0.0, 1.0).unwrap();
    (0..n)
        .map(|i| {
            let centre = [-10.0, 0.0, 10.0][i % 3];
            Datapoint::unprojected(
                DVector::from_vec(vec![centre + unit.sample(&mut rng)]),
                NoiseCovariance::Diagonal(DVector::from_vec(vec![0.01])),
            )
        })
        .collect()
}

fn correlated_2d(n: usize, seed: u64) -> Vec<Datapoint> {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let unit = Normal::new(0.0, 1.0).unwrap();
    (0..n)
        .map(|i| {
            let shift = if i % 2 == 0 { -3.0 } else { 3.0 };
            let x = shift + unit.sample(&mut rng);
            let y = 0.5 * x + 0.8 * unit.sample(&mut rng);
            let s = 0.05 + 0.02 * (i % 5) as f64;
            Datapoint::unprojected(
                DVector::from_vec(vec![x, y]),
                NoiseCovariance::Full(DMatrix::from_row_slice(2, 2, &[s, 0.3 * s, 0.3 * s, s])),
            )
        })
        .collect()
}

fn gaussian_1d(amplitude: f64, mean: f64, var: f64) -> Gaussian {
    Gaussian::new(amplitude, DVector::from_vec(vec![mean]), DMatrix::from_element(1, 1, var))
}

fn two_2d() -> Vec<Gaussian> {
    vec![
        Gaussian::new(0.5, DVector::from_vec(vec![-1.0, 0.0]), DMatrix::identity(2, 2)),
        Gaussian::new(0.5, DVector::from_vec(vec![1.0, 0.0]), DMatrix::identity(2, 2)),
    ]
}

/// A rejected trial leaves the model and responsibilities bit-identical
#[test]
fn test_rejected_trial_restores_state() {
    let data = three_clusters(300, 8);
    let mut gaussians = vec![
        gaussian_1d(0.3, -9.0, 2.0),
        gaussian_1d(0.4, 1.0, 2.0),
        gaussian_1d(0.3, 9.0, 2.0),
    ];
    let flags = vec![ComponentFlags::free(); 3];
    let mut ws = Workspace::new(data.len(), 1, &flags, Some(2)).unwrap();
    let fit_config = FitConfig::standard().with_tolerance(1e-9);
    let outcome = run_em(&data, &mut gaussians, &mut ws, &fit_config, &mut FitLog::disabled()).unwrap();
    assert_eq!(outcome.status, EmStatus::Converged);

    let before = gaussians.clone();
    let responsibilities = ws.responsibilities().clone();

    // One short trial: any merge joins two distant clusters
    let trial_config = FitConfig::standard()
        .with_max_iterations(1)
        .with_split_merge_depth(1);
    let report = run_split_merge(
        &data,
        &mut gaussians,
        &mut ws,
        &flags,
        &trial_config,
        &mut SplitRng::with_seed(5),
        &mut FitLog::disabled(),
        outcome.avg_loglike,
    )
    .unwrap();

    assert_eq!(report.trials, 1);
    assert_eq!(report.accepted, 0);
    assert_eq!(report.passes, 1);
    assert_eq!(report.avg_loglike, outcome.avg_loglike);
    assert_eq!(gaussians, before);
    assert_eq!(ws.responsibilities(), &responsibilities);
    assert_eq!(ws.working_flags(), flags.as_slice());
}

/// Applying a restructuring conserves total amplitude
#[test]
fn test_apply_trial_conserves_amplitude() {
    let data = three_clusters(90, 2);
    let mut gaussians = vec![
        gaussian_1d(0.2, -10.0, 1.0),
        gaussian_1d(0.5, 0.0, 1.0),
        gaussian_1d(0.3, 10.0, 1.0),
    ];
    let flags = vec![ComponentFlags::free(); 3];
    let mut ws = Workspace::new(data.len(), 1, &flags, Some(1)).unwrap();
    let config = FitConfig::likelihood_only();
    run_em(&data, &mut gaussians, &mut ws, &config, &mut FitLog::disabled()).unwrap();

    let trial = Trial { merge: (0, 1), split: 2 };
    let mut rng = SplitRng::with_seed(9);
    apply_trial(&mut gaussians, ws.responsibilities(), trial, &mut rng).unwrap();

    let total: f64 = gaussians.iter().map(|g| g.amplitude).sum();
    assert_approx_eq!(total, 1.0, 1e-12);
    assert_approx_eq!(gaussians[0].amplitude, 0.7, 1e-12);
    assert_approx_eq!(gaussians[1].amplitude, 0.15, 1e-12);
    assert_approx_eq!(gaussians[2].amplitude, 0.15, 1e-12);
    assert!(gaussians[0].mean[0] > -10.0 && gaussians[0].mean[0] < 0.0);
    assert!(rng.draws() > 0);
}

/// Worker count changes summation order only
#[test]
fn test_worker_counts_agree() {
    let data = correlated_2d(400, 21);
    let flags = vec![ComponentFlags::free(); 2];
    let base = FitConfig::standard().with_tolerance(1e-10).with_max_iterations(500);

    let mut serial = two_2d();
    let a = Deconvolver::new(base.clone().with_parallelism(1))
        .fit(&data, &mut serial, &flags, None)
        .unwrap();
    let mut parallel = two_2d();
    let b = Deconvolver::new(base.with_parallelism(4))
        .fit(&data, &mut parallel, &flags, None)
        .unwrap();

    assert_approx_eq!(a.avg_loglike, b.avg_loglike, 1e-8);
    for (s, p) in serial.iter().zip(&parallel) {
        assert_approx_eq!(s.amplitude, p.amplitude, 1e-6);
        for i in 0..2 {
            assert_approx_eq!(s.mean[i], p.mean[i], 1e-6);
            for j in 0..2 {
                assert_approx_eq!(s.covariance[(i, j)], p.covariance[(i, j)], 1e-6);
            }
        }
    }
}

/// Identity projections give the same fit with and without the fast path
#[test]
fn test_no_projection_matches_identity_projection() {
    let data = correlated_2d(300, 4);
    let flags = vec![ComponentFlags::free(); 2];
    let base = FitConfig::standard()
        .with_tolerance(0.0)
        .with_max_iterations(30)
        .with_parallelism(1);

    let mut general = two_2d();
    Deconvolver::new(base.clone()).fit(&data, &mut general, &flags, None).unwrap();
    let mut fast = two_2d();
    Deconvolver::new(base.with_no_projection(true))
        .fit(&data, &mut fast, &flags, None)
        .unwrap();

    for (g, f) in general.iter().zip(&fast) {
        assert_approx_eq!(g.amplitude, f.amplitude, 1e-9);
        assert_approx_eq!((&g.mean - &f.mean).norm(), 0.0, 1e-9);
        assert_approx_eq!((&g.covariance - &f.covariance).norm(), 0.0, 1e-9);
    }
}

/// A fixed seed reproduces the split-and-merge search exactly
#[test]
fn test_seeded_fits_are_reproducible() {
    let data = three_clusters(240, 13);
    let init = vec![
        gaussian_1d(0.4, -10.5, 1.0),
        gaussian_1d(0.3, -9.5, 1.0),
        gaussian_1d(0.3, 5.0, 30.0),
    ];
    let flags = vec![ComponentFlags::free(); 3];
    let config = FitConfig::standard()
        .with_tolerance(1e-6)
        .with_max_iterations(500)
        .with_seed(77)
        .with_parallelism(1);

    let mut first = init.clone();
    let a = Deconvolver::new(config.clone()).fit(&data, &mut first, &flags, None).unwrap();
    let mut second = init;
    let b = Deconvolver::new(config).fit(&data, &mut second, &flags, None).unwrap();

    assert_eq!(first, second);
    assert_eq!(a.split_merge, b.split_merge);
    assert!(a.avg_loglike >= a.em.avg_loglike);
}

/// Evaluating the likelihood changes nothing and matches a likelihood-only fit
#[test]
fn test_log_likelihood_evaluation() {
    let data = three_clusters(60, 1);
    let gaussians = vec![
        gaussian_1d(0.3, -10.0, 1.0),
        gaussian_1d(0.4, 0.0, 1.0),
        gaussian_1d(0.3, 10.0, 1.0),
    ];
    let deconvolver = Deconvolver::new(FitConfig::standard());
    let value = deconvolver.log_likelihood(&data, &gaussians).unwrap();

    let mut copy = gaussians.clone();
    let summary = Deconvolver::new(FitConfig::likelihood_only())
        .fit(&data, &mut copy, &[ComponentFlags::free(); 3], None)
        .unwrap();

    assert_eq!(copy, gaussians);
    assert_eq!(summary.em.status, EmStatus::LikelihoodOnly);
    assert_eq!(summary.split_merge.trials, 0);
    assert_approx_eq!(value, summary.avg_loglike, 1e-12);
    // Well-specified model: roughly the entropy of the mixture, per sample
    assert!(value < 0.0 && value > -5.0);
}

/// A caller-fixed point-mass component does not stop the restructuring search
#[test]
fn test_point_mass_component_survives_split_merge() {
    let mut rng = ChaCha20Rng::seed_from_u64(60);
    let spread = Normal::new(0.0, 2.0).unwrap();
    let data: Vec<Datapoint> = (0..60)
        .map(|_| {
            Datapoint::unprojected(
                DVector::from_vec(vec![spread.sample(&mut rng)]),
                NoiseCovariance::Diagonal(DVector::from_vec(vec![0.5])),
            )
        })
        .collect();
    let init = vec![
        Gaussian::new(0.2, DVector::from_vec(vec![0.0]), DMatrix::zeros(1, 1)),
        gaussian_1d(0.4, -1.5, 1.0),
        gaussian_1d(0.4, 1.5, 1.0),
    ];
    let mut flags = vec![ComponentFlags::free(); 3];
    flags[0] = ComponentFlags::fixed();
    let base = FitConfig::standard().with_seed(4).with_parallelism(1);

    let mut without = init.clone();
    let plain = Deconvolver::new(base.clone().with_split_merge_depth(0))
        .fit(&data, &mut without, &flags, None)
        .unwrap();

    let mut with = init;
    let summary = Deconvolver::new(base).fit(&data, &mut with, &flags, None).unwrap();

    assert_eq!(summary.em.avg_loglike, plain.em.avg_loglike);
    assert!(summary.split_merge.trials >= 1);
    assert!(summary.avg_loglike >= plain.avg_loglike);
    let total: f64 = with.iter().map(|g| g.amplitude).sum();
    assert_approx_eq!(total, 1.0, 1e-9);
}
