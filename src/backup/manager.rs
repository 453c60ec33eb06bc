use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::command::{self, ValidationError};
use super::runner::ProcessRunner;
use super::sequencer::JobSequencer;
use super::{BatchSummary, Event, RunState};
use crate::storage::{ProfileStore, StorageError};
use crate::utils::config::Config;
use crate::utils::{LogBuffer, LogEntry, LogLevel};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("invalid profile: {0}")]
    Invalid(#[from] ValidationError),
    #[error("a backup is already in progress")]
    Busy,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStatus {
    pub state: RunState,
    pub busy: bool,
    pub current_job: Option<String>,
    pub progress: u8,
    pub pending: usize,
    pub last_exit_code: Option<i32>,
    pub last_batch: Option<BatchSummary>,
}

/// Cloneable handle tying the profile store to the execution engine.
#[derive(Clone)]
pub struct BackupManager {
    config: Arc<Config>,
    store: ProfileStore,
    runner: Arc<ProcessRunner>,
    sequencer: Arc<JobSequencer>,
    event_tx: broadcast::Sender<Event>,
    log_buffer: LogBuffer,
    status: Arc<Mutex<RunStatus>>,
}

impl BackupManager {
    /// Must be called inside a tokio runtime; spawns the event recorder.
    pub fn new(config: Config, store: ProfileStore) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity);

        let runner = Arc::new(ProcessRunner::new(
            config.rsync_binary.clone(),
            event_tx.clone(),
        ));
        let sequencer = Arc::new(JobSequencer::new(runner.clone(), event_tx.clone()));
        let log_buffer = LogBuffer::new(config.log_buffer_size);
        let status = Arc::new(Mutex::new(RunStatus::default()));

        tokio::spawn(record_events(
            event_tx.subscribe(),
            log_buffer.clone(),
            status.clone(),
        ));

        Self {
            config: Arc::new(config),
            store,
            runner,
            sequencer,
            event_tx,
            log_buffer,
            status,
        }
    }

    pub fn profiles(&self) -> &ProfileStore {
        &self.store
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    pub fn get_status(&self) -> RunStatus {
        let mut status = self.status.lock().clone();
        status.state = self.runner.state();
        status.busy = self.sequencer.is_busy();
        status.pending = self.sequencer.pending();
        status
    }

    pub fn get_logs(&self, limit: Option<usize>) -> Vec<LogEntry> {
        self.log_buffer.get_logs(limit)
    }

    pub fn clear_logs(&self) {
        self.log_buffer.clear();
    }

    /// Shell-quoted command line for a stored profile.
    pub fn preview(&self, index: usize) -> Result<String, ManagerError> {
        let job = self.store.get(index)?;
        Ok(command::preview(&self.config.rsync_binary, &job)?)
    }

    /// Validate and start one profile in the background.
    pub fn run_profile(&self, index: usize) -> Result<(), ManagerError> {
        let job = self.store.get(index)?;
        command::build_args(&job)?;
        if self.sequencer.is_busy() {
            return Err(ManagerError::Busy);
        }

        info!("Starting profile {} ({})", index, job.name);
        let sequencer = self.sequencer.clone();
        tokio::spawn(async move {
            if let Err(e) = sequencer.run_one(&job).await {
                warn!("Profile {} did not run: {}", job.name, e);
            }
        });
        Ok(())
    }

    /// Start every stored profile, in order, in the background.
    pub fn run_all(&self) -> Result<usize, ManagerError> {
        if self.sequencer.is_busy() {
            return Err(ManagerError::Busy);
        }

        let jobs = self.store.list();
        let count = jobs.len();
        info!("Starting all {} profiles", count);
        let sequencer = self.sequencer.clone();
        tokio::spawn(async move {
            if let Err(e) = sequencer.run_all(&jobs).await {
                warn!("Batch did not run: {}", e);
            }
        });
        Ok(count)
    }

    pub fn stop(&self) {
        self.sequencer.stop_all();
        self.runner.stop();
    }

    pub fn reload_profiles(&self) -> Result<usize, ManagerError> {
        Ok(self.store.reload()?)
    }
}

async fn record_events(
    mut rx: broadcast::Receiver<Event>,
    log_buffer: LogBuffer,
    status: Arc<Mutex<RunStatus>>,
) {
    loop {
        match rx.recv().await {
            Ok(event) => record(&event, &log_buffer, &status),
            Err(RecvError::Lagged(missed)) => {
                warn!("Event recorder fell behind; {} events dropped", missed);
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("Event recorder stopped");
}

fn record(event: &Event, logs: &LogBuffer, status: &Mutex<RunStatus>) {
    let mut status = status.lock();
    let profile = status.current_job.clone();

    match event {
        Event::OutputLine(line) if !line.trim().is_empty() => {
            logs.add_log(LogLevel::Output, line.clone(), profile);
        }
        Event::ErrorLine(line) if !line.trim().is_empty() => {
            logs.add_log(LogLevel::Error, line.clone(), profile);
        }
        Event::Progress(percent) => status.progress = *percent,
        Event::Finished(code) => status.last_exit_code = Some(*code),
        Event::JobStarted { name } => {
            status.current_job = Some(name.clone());
            status.progress = 0;
            logs.add_log(LogLevel::Info, format!("Running {}", name), Some(name.clone()));
        }
        Event::JobFinished { name, exit_code } => {
            let level = if *exit_code == 0 {
                LogLevel::Success
            } else {
                LogLevel::Error
            };
            logs.add_log(
                level,
                format!("Finished {} (exit {})", name, exit_code),
                Some(name.clone()),
            );
            status.current_job = None;
        }
        Event::JobSkipped { name, reason } => {
            logs.add_log(
                LogLevel::Error,
                format!("Skipped {}: {}", name, reason),
                Some(name.clone()),
            );
        }
        Event::BatchComplete(summary) => {
            status.last_batch = Some(*summary);
            let message = if summary.stopped {
                "Stopped; remaining profiles were not run".to_string()
            } else {
                format!("All {} profiles finished", summary.total)
            };
            logs.add_log(LogLevel::Info, message, None);
        }
        _ => {}
    }
}
