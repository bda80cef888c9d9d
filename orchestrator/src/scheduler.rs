//! Cooperative round-robin over many runs.
//!
//! Each run is single-writer and step-driven, so interleaving is just a
//! matter of calling `step` on each in turn. A run that errors is retired
//! with its error; the others keep going.

use keel_kernel::schema::{RunId, RunStatus};
use keel_kernel::store::EventBackend;

use crate::error::KernelError;
use crate::kernel::{OrchestrationKernel, StepOutcome};

/// Anything the scheduler can advance one step at a time.
pub trait Pump {
    /// Advance by one step.
    ///
    /// # Errors
    ///
    /// Whatever the run reports; the scheduler retires it.
    fn pump(&mut self) -> Result<StepOutcome, KernelError>;

    fn is_finished(&self) -> bool;

    fn run_id(&self) -> &RunId;
}

impl<B: EventBackend> Pump for OrchestrationKernel<B> {
    fn pump(&mut self) -> Result<StepOutcome, KernelError> {
        self.step()
    }

    fn is_finished(&self) -> bool {
        OrchestrationKernel::is_finished(self)
    }

    fn run_id(&self) -> &RunId {
        OrchestrationKernel::run_id(self)
    }
}

/// How one run left the scheduler.
#[derive(Debug)]
pub enum Retired {
    Halted { run_id: RunId, status: RunStatus },
    Errored { run_id: RunId, error: KernelError },
}

impl Retired {
    #[must_use]
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::Halted { run_id, .. } | Self::Errored { run_id, .. } => run_id,
        }
    }
}

#[derive(Default)]
pub struct Scheduler {
    runs: Vec<Box<dyn Pump>>,
    retired: Vec<Retired>,
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, run: impl Pump + 'static) {
        self.runs.push(Box::new(run));
    }

    /// Runs still being pumped.
    #[must_use]
    pub fn active(&self) -> usize {
        self.runs.len()
    }

    #[must_use]
    pub fn retired(&self) -> &[Retired] {
        &self.retired
    }

    /// Give every active run one step. Returns how many made progress.
    pub fn round(&mut self) -> usize {
        let mut progressed = 0;
        let mut keep = Vec::with_capacity(self.runs.len());
        for mut run in self.runs.drain(..) {
            match run.pump() {
                Ok(StepOutcome::Advanced { .. }) => {
                    progressed += 1;
                    keep.push(run);
                }
                Ok(StepOutcome::Suspended { .. }) => keep.push(run),
                Ok(StepOutcome::Halted { status }) => {
                    tracing::info!(run = %run.run_id(), status = status.label(), "run retired");
                    self.retired.push(Retired::Halted {
                        run_id: run.run_id().clone(),
                        status,
                    });
                }
                Err(error) => {
                    tracing::error!(run = %run.run_id(), %error, "run retired with error");
                    self.retired.push(Retired::Errored {
                        run_id: run.run_id().clone(),
                        error,
                    });
                }
            }
        }
        self.runs = keep;
        progressed
    }

    /// Pump rounds until every run has retired, no run can make progress,
    /// or `max_rounds` rounds have passed. Returns the rounds run.
    pub fn run(&mut self, max_rounds: usize) -> usize {
        for round in 0..max_rounds {
            if self.runs.is_empty() {
                return round;
            }
            if self.round() == 0 && !self.runs.is_empty() {
                tracing::debug!(waiting = self.runs.len(), "every run is suspended");
                return round + 1;
            }
        }
        max_rounds
    }
}
