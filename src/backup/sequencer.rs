use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use super::command::{self, ValidationError};
use super::executor::JobExecutor;
use super::runner::RunnerError;
use super::{ActiveGuard, BatchSummary, Event, Job};

#[derive(Debug, Error)]
pub enum SequencerError {
    #[error("a backup is already in progress")]
    Busy,
    #[error("invalid profile: {0}")]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

/// Feeds jobs through a single executor, strictly one after another.
pub struct JobSequencer {
    executor: Arc<dyn JobExecutor>,
    event_tx: broadcast::Sender<Event>,
    // Also held while claiming a batch and while raising or lowering `stop_tx`
    queue: Mutex<VecDeque<Job>>,
    active: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl JobSequencer {
    pub fn new(executor: Arc<dyn JobExecutor>, event_tx: broadcast::Sender<Event>) -> Self {
        Self {
            executor,
            event_tx,
            queue: Mutex::new(VecDeque::new()),
            active: AtomicBool::new(false),
            stop_tx: watch::channel(false).0,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Jobs still waiting in the current batch.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Run every job in order. Invalid jobs are skipped, and exactly one
    /// `BatchComplete` is emitted at the end, also after `stop_all`.
    pub async fn run_all(&self, jobs: &[Job]) -> Result<BatchSummary, SequencerError> {
        let _guard = self.claim(jobs)?;

        info!("Running {} profiles sequentially", jobs.len());
        let mut summary = BatchSummary {
            total: jobs.len(),
            ..BatchSummary::default()
        };

        while let Some(job) = self.next_job() {
            if self.stop_requested() {
                break;
            }
            let args = match command::build_args(&job) {
                Ok(args) => args,
                Err(reason) => {
                    warn!("Skipping {}: {}", job.name, reason);
                    summary.skipped += 1;
                    self.emit(Event::JobSkipped {
                        name: job.name.clone(),
                        reason: reason.to_string(),
                    });
                    continue;
                }
            };

            match self.execute(&job, &args).await {
                Ok(0) => summary.succeeded += 1,
                Ok(_) => summary.failed += 1,
                Err(e) => {
                    warn!("Skipping {}: {}", job.name, e);
                    summary.skipped += 1;
                    self.emit(Event::JobSkipped {
                        name: job.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        summary.stopped = self.stop_requested();
        info!(
            "Batch complete: {} succeeded, {} failed, {} skipped{}",
            summary.succeeded,
            summary.failed,
            summary.skipped,
            if summary.stopped { " (stopped)" } else { "" }
        );
        self.emit(Event::BatchComplete(summary));
        Ok(summary)
    }

    /// Run a single job, bypassing the queue.
    pub async fn run_one(&self, job: &Job) -> Result<i32, SequencerError> {
        let _guard = self.claim(&[])?;

        let args = match command::build_args(job) {
            Ok(args) => args,
            Err(reason) => {
                warn!("Not running {}: {}", job.name, reason);
                self.emit(Event::JobSkipped {
                    name: job.name.clone(),
                    reason: reason.to_string(),
                });
                return Err(reason.into());
            }
        };

        Ok(self.execute(job, &args).await?)
    }

    /// Drop the rest of the queue and kill the running job, if any. The stop
    /// holds until the current batch ends, so a job that is just starting
    /// is killed as well.
    pub fn stop_all(&self) {
        let mut queue = self.queue.lock();
        if !self.is_busy() {
            return;
        }
        let dropped = queue.len();
        queue.clear();
        self.stop_tx.send_replace(true);
        info!("Stopping; {} queued profiles dropped", dropped);
    }

    fn claim(&self, jobs: &[Job]) -> Result<ActiveGuard<'_>, SequencerError> {
        let mut queue = self.queue.lock();
        let guard = ActiveGuard::acquire(&self.active).ok_or(SequencerError::Busy)?;
        self.stop_tx.send_replace(false);
        queue.clear();
        queue.extend(jobs.iter().cloned());
        Ok(guard)
    }

    fn stop_requested(&self) -> bool {
        *self.stop_tx.borrow()
    }

    async fn execute(&self, job: &Job, args: &[String]) -> Result<i32, RunnerError> {
        info!("Running profile {}", job.name);
        self.emit(Event::JobStarted {
            name: job.name.clone(),
        });
        let exit_code = self.executor.run(args, self.stop_tx.subscribe()).await?;
        info!("Profile {} finished with exit code {}", job.name, exit_code);
        self.emit(Event::JobFinished {
            name: job.name.clone(),
            exit_code,
        });
        Ok(exit_code)
    }

    fn next_job(&self) -> Option<Job> {
        self.queue.lock().pop_front()
    }

    fn emit(&self, event: Event) {
        let _ = self.event_tx.send(event);
    }
}
