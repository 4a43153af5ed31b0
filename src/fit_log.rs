//! Append-only text log of a fit.
//!
//! The main sink receives every EM likelihood, warnings and the
//! split-and-merge narrative. The optional convergence sink receives only the
//! likelihood traces that ended up in the final model: traces of a
//! split-and-merge trial are held back until the trial is accepted and
//! dropped otherwise.

use crate::deconvolution::ModelSelectionCriteria;
use crate::errors::{DeconvResult, DeconvolutionError};
use std::io::Write;
use std::sync::Arc;

fn sink_error(operation: &str, err: std::io::Error) -> DeconvolutionError {
    DeconvolutionError::LogSink {
        operation: operation.to_string(),
        source: Arc::new(err),
    }
}

/// Text log for a deconvolution run.
pub struct FitLog {
    main: Option<Box<dyn Write + Send>>,
    convergence: Option<Box<dyn Write + Send>>,
    pending: Vec<u8>,
    holding: bool,
}

impl std::fmt::Debug for FitLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FitLog")
            .field("main", &self.main.is_some())
            .field("convergence", &self.convergence.is_some())
            .field("pending_bytes", &self.pending.len())
            .finish()
    }
}

impl FitLog {
    /// Log into `main`.
    pub fn new<W: Write + Send + 'static>(main: W) -> Self {
        Self {
            main: Some(Box::new(main)),
            convergence: None,
            pending: Vec::new(),
            holding: false,
        }
    }

    /// Also write accepted likelihood traces into `convergence`.
    pub fn with_convergence<W: Write + Send + 'static>(mut self, convergence: W) -> Self {
        self.convergence = Some(Box::new(convergence));
        self
    }

    /// A log that discards everything.
    pub fn disabled() -> Self {
        Self {
            main: None,
            convergence: None,
            pending: Vec::new(),
            holding: false,
        }
    }

    /// Whether anything is recorded.
    pub fn is_enabled(&self) -> bool {
        self.main.is_some() || self.convergence.is_some()
    }

    fn write_main(&mut self, text: &str) -> DeconvResult<()> {
        if let Some(main) = self.main.as_mut() {
            main.write_all(text.as_bytes())
                .and_then(|_| main.flush())
                .map_err(|e| sink_error("main log", e))?;
        }
        Ok(())
    }

    fn write_trace(&mut self, text: &str) -> DeconvResult<()> {
        if self.convergence.is_none() {
            return Ok(());
        }
        if self.holding {
            self.pending.extend_from_slice(text.as_bytes());
            return Ok(());
        }
        if let Some(conv) = self.convergence.as_mut() {
            conv.write_all(text.as_bytes())
                .and_then(|_| conv.flush())
                .map_err(|e| sink_error("convergence log", e))?;
        }
        Ok(())
    }

    /// Record the average log-likelihood of one EM iteration.
    pub fn iteration(&mut self, avg_loglike: f64) -> DeconvResult<()> {
        let line = format!("{:.6}\n", avg_loglike);
        self.write_main(&line)?;
        self.write_trace(&line)
    }

    /// Record a decrease of the average log-likelihood.
    pub fn likelihood_decrease(&mut self, previous: f64, current: f64) -> DeconvResult<()> {
        self.write_main(&format!(
            "Warning: log likelihood decreased by {:e}\noldavgloglike was {:e}\navgloglike is {:e}\n",
            current - previous,
            previous,
            current
        ))
    }

    /// Header written before the initial EM.
    pub fn initial_em(&mut self) -> DeconvResult<()> {
        self.write_main("#Initial EM\n")
    }

    /// Separator written after an EM run.
    pub fn em_finished(&mut self) -> DeconvResult<()> {
        self.write_main("\n")?;
        self.write_trace("\n")
    }

    /// Start a split-and-merge trial; its traces are held until it is resolved.
    pub fn trial_started(&mut self, j: usize, k: usize, l: usize) -> DeconvResult<()> {
        self.holding = true;
        self.pending.clear();
        self.write_main(&format!("#Merging {} and {}, splitting {}\n", j, k, l))
    }

    /// Header between the settling EM and the full EM of a trial.
    pub fn full_em(&mut self) -> DeconvResult<()> {
        self.write_main("#full EM:\n")?;
        self.write_trace("\n")
    }

    /// The trial improved the likelihood: keep its traces.
    pub fn trial_accepted(&mut self) -> DeconvResult<()> {
        self.holding = false;
        self.write_main("#accepted\n")?;
        let pending = std::mem::take(&mut self.pending);
        if let Some(conv) = self.convergence.as_mut() {
            conv.write_all(&pending)
                .and_then(|_| conv.flush())
                .map_err(|e| sink_error("convergence log", e))?;
        }
        Ok(())
    }

    /// The trial did not improve the likelihood: drop its traces.
    pub fn trial_rejected(&mut self) -> DeconvResult<()> {
        self.holding = false;
        self.pending.clear();
        self.write_main("#didn't improve likelihood\n")
    }

    /// Record the model-selection diagnostics.
    pub fn criteria(&mut self, criteria: &ModelSelectionCriteria) -> DeconvResult<()> {
        self.write_trace("\n")?;
        self.write_main(&format!(
            "Partition coefficient \t=\t{:.6}\nAIC \t\t\t=\t{:.6}\nMDL \t\t\t=\t{:.6}\n",
            criteria.partition_coefficient, criteria.aic, criteria.mdl
        ))
    }
}
