//! Per-run scratch state shared by the EM phases.
//!
//! A [`Workspace`] owns everything that is overwritten every iteration: the
//! N×K log-responsibility matrix, one accumulator table row per worker, the
//! working copy of the fixed flags and the worker pool. Samples are split
//! into contiguous chunks, one per worker, so each worker writes a disjoint
//! slice of the responsibility matrix and its own accumulator row.

use crate::errors::{validate_allocation_size, DeconvResult, DeconvolutionError};
use crate::model::ComponentFlags;
use nalgebra::{DMatrix, DVector};

/// N×K matrix of log-responsibilities, stored row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct LogResponsibilities {
    data: Vec<f64>,
    rows: usize,
    cols: usize,
}

impl LogResponsibilities {
    /// Create a zero-filled matrix.
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            data: vec![0.0; rows * cols],
            rows,
            cols,
        }
    }

    /// Number of samples.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of components.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Get element at (row, col)
    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        debug_assert!(row < self.rows && col < self.cols);
        self.data[row * self.cols + col]
    }

    /// Set element at (row, col)
    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        debug_assert!(row < self.rows && col < self.cols);
        self.data[row * self.cols + col] = value;
    }

    /// One sample's log-responsibilities.
    pub fn row(&self, row: usize) -> &[f64] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    /// Mutable access to one sample's log-responsibilities.
    pub fn row_mut(&mut self, row: usize) -> &mut [f64] {
        &mut self.data[row * self.cols..(row + 1) * self.cols]
    }

    /// One component's log-responsibilities over all samples.
    pub fn column_iter(&self, col: usize) -> impl Iterator<Item = f64> + Clone + '_ {
        self.data.iter().skip(col).step_by(self.cols.max(1)).copied()
    }

    /// Row-major backing storage.
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Mutable row-major backing storage.
    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Overwrite with another matrix of the same shape.
    pub fn copy_from(&mut self, other: &Self) {
        debug_assert_eq!((self.rows, self.cols), (other.rows, other.cols));
        self.data.copy_from_slice(&other.data);
    }
}

/// Responsibility-weighted sums for one component.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentAccumulator {
    /// Σ r·b
    pub mean: DVector<f64>,
    /// Σ r·(b·bᵗ + B)
    pub second_moment: DMatrix<f64>,
}

impl ComponentAccumulator {
    /// Zeroed accumulator for dimension `d`.
    pub fn new(d: usize) -> Self {
        Self {
            mean: DVector::zeros(d),
            second_moment: DMatrix::zeros(d, d),
        }
    }

    /// Reset to zero.
    pub fn clear(&mut self) {
        self.mean.fill(0.0);
        self.second_moment.fill(0.0);
    }

    /// Add `weight·b` and `weight·(b·bᵗ + big_b)`.
    pub fn add_weighted(&mut self, weight: f64, b: &DVector<f64>, big_b: &DMatrix<f64>) {
        self.mean.axpy(weight, b, 1.0);
        self.second_moment.ger(weight, b, b, 1.0);
        self.second_moment
            .zip_apply(big_b, |acc, v| *acc += weight * v);
    }

    /// Add another accumulator.
    pub fn merge(&mut self, other: &Self) {
        self.mean += &other.mean;
        self.second_moment += &other.second_moment;
    }
}

/// Accumulators indexed by worker, then component.
#[derive(Debug, Clone)]
pub struct AccumulatorTable {
    workers: Vec<Vec<ComponentAccumulator>>,
}

impl AccumulatorTable {
    /// Zeroed table for `workers` workers, `k` components of dimension `d`.
    pub fn new(workers: usize, k: usize, d: usize) -> Self {
        Self {
            workers: (0..workers)
                .map(|_| (0..k).map(|_| ComponentAccumulator::new(d)).collect())
                .collect(),
        }
    }

    /// Number of worker rows.
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Reset every accumulator.
    pub fn clear(&mut self) {
        for row in &mut self.workers {
            row.iter_mut().for_each(ComponentAccumulator::clear);
        }
    }

    /// One worker's accumulators.
    pub fn worker(&self, worker: usize) -> &[ComponentAccumulator] {
        &self.workers[worker]
    }

    /// Mutable per-worker rows, for handing one row to each worker.
    pub fn rows_mut(&mut self) -> &mut [Vec<ComponentAccumulator>] {
        &mut self.workers
    }

    /// Sum the worker rows component by component.
    pub fn reduce(&self, pool: &WorkerPool) -> Vec<ComponentAccumulator> {
        let k = self.workers.first().map_or(0, Vec::len);
        let sum_component = |c: usize| {
            let mut total = self.workers[0][c].clone();
            for row in &self.workers[1..] {
                total.merge(&row[c]);
            }
            total
        };

        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            pool.install(|| (0..k).into_par_iter().map(sum_component).collect())
        }
        #[cfg(not(feature = "parallel"))]
        {
            let _ = pool;
            (0..k).map(sum_component).collect()
        }
    }
}

/// Fixed-size group of workers used by the Expectation and Maximization phases.
pub struct WorkerPool {
    workers: usize,
    #[cfg(feature = "parallel")]
    pool: rayon::ThreadPool,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers)
            .finish()
    }
}

impl WorkerPool {
    /// Build a pool with `workers` threads (at least one).
    pub fn new(workers: usize) -> DeconvResult<Self> {
        let workers = workers.max(1);
        #[cfg(feature = "parallel")]
        {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .thread_name(|i| format!("xd-worker-{}", i))
                .build()
                .map_err(|e| DeconvolutionError::ThreadPool {
                    reason: e.to_string(),
                })?;
            Ok(Self { workers, pool })
        }
        #[cfg(not(feature = "parallel"))]
        {
            Ok(Self { workers })
        }
    }

    /// One worker per available core.
    pub fn default_workers() -> usize {
        #[cfg(feature = "parallel")]
        {
            rayon::current_num_threads()
        }
        #[cfg(not(feature = "parallel"))]
        {
            1
        }
    }

    /// Number of workers.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `op` inside the pool.
    pub fn install<OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        #[cfg(feature = "parallel")]
        {
            self.pool.install(op)
        }
        #[cfg(not(feature = "parallel"))]
        {
            op()
        }
    }
}

/// Scratch state for one fit.
#[derive(Debug)]
pub struct Workspace {
    pub(crate) responsibilities: LogResponsibilities,
    pub(crate) accumulators: AccumulatorTable,
    pub(crate) working_flags: Vec<ComponentFlags>,
    pub(crate) pool: WorkerPool,
    chunk_rows: usize,
    dim: usize,
}

impl Workspace {
    /// Allocate for `n` samples, the given components' flags and latent
    /// dimension `d`.
    ///
    /// `parallelism` defaults to one worker per core and is capped at `n`.
    pub fn new(
        n: usize,
        d: usize,
        flags: &[ComponentFlags],
        parallelism: Option<usize>,
    ) -> DeconvResult<Self> {
        let k = flags.len();
        if n == 0 || k == 0 {
            return Err(DeconvolutionError::InsufficientData {
                required: 1,
                actual: n.min(k),
            });
        }

        let requested = parallelism.unwrap_or_else(WorkerPool::default_workers).max(1);
        let chunk_rows = n.div_ceil(requested.min(n));
        let workers = n.div_ceil(chunk_rows);

        let per_worker = k
            .checked_mul(d.saturating_mul(d).saturating_add(d))
            .and_then(|x| x.checked_mul(workers));
        let elements = n
            .checked_mul(k)
            .zip(per_worker)
            .and_then(|(a, b)| a.checked_add(b))
            .and_then(|x| x.checked_mul(std::mem::size_of::<f64>()))
            .unwrap_or(usize::MAX);
        validate_allocation_size(elements, "workspace")?;

        log::debug!(
            "Workspace: N={}, K={}, d={}, {} workers x {} rows",
            n,
            k,
            d,
            workers,
            chunk_rows
        );

        Ok(Self {
            responsibilities: LogResponsibilities::new(n, k),
            accumulators: AccumulatorTable::new(workers, k, d),
            working_flags: flags.to_vec(),
            pool: WorkerPool::new(workers)?,
            chunk_rows,
            dim: d,
        })
    }

    /// Current log-responsibilities.
    pub fn responsibilities(&self) -> &LogResponsibilities {
        &self.responsibilities
    }

    /// Flags in effect for the next EM run.
    pub fn working_flags(&self) -> &[ComponentFlags] {
        &self.working_flags
    }

    /// Replace the working flags.
    pub fn set_working_flags(&mut self, flags: &[ComponentFlags]) {
        self.working_flags.clear();
        self.working_flags.extend_from_slice(flags);
    }

    /// Samples handled by each worker (the last chunk may be shorter).
    pub fn chunk_rows(&self) -> usize {
        self.chunk_rows
    }

    /// Number of workers.
    pub fn workers(&self) -> usize {
        self.pool.workers()
    }

    /// Latent dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of components.
    pub fn components(&self) -> usize {
        self.responsibilities.cols()
    }

    /// Number of samples.
    pub fn samples(&self) -> usize {
        self.responsibilities.rows()
    }
}
