pub mod command;
pub mod executor;
pub mod job;
pub mod line_buffer;
pub mod manager;
pub mod progress;
pub mod runner;
pub mod sequencer;

pub use job::{Job, JobOptions};
pub use manager::BackupManager;
pub use runner::ProcessRunner;
pub use sequencer::JobSequencer;

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

/// Lifecycle of the single external process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "state", content = "exit_code", rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Idle,
    Starting,
    Running,
    Finished(i32),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub stopped: bool,
}

/// Everything the engine reports to its subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    Started,
    OutputLine(String),
    ErrorLine(String),
    Progress(u8),
    StateChanged(RunState),
    Finished(i32),
    JobStarted { name: String },
    JobFinished { name: String, exit_code: i32 },
    JobSkipped { name: String, reason: String },
    BatchComplete(BatchSummary),
}

/// Claim on a busy flag, released on drop.
pub(crate) struct ActiveGuard<'a>(&'a AtomicBool);

impl<'a> ActiveGuard<'a> {
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_is_exclusive_until_dropped() {
        let flag = AtomicBool::new(false);
        let guard = ActiveGuard::acquire(&flag).unwrap();
        assert!(ActiveGuard::acquire(&flag).is_none());
        drop(guard);
        assert!(ActiveGuard::acquire(&flag).is_some());
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let value = serde_json::to_value(Event::Progress(42)).unwrap();
        assert_eq!(value, serde_json::json!({"type": "progress", "data": 42}));

        let value = serde_json::to_value(Event::StateChanged(RunState::Finished(137))).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"type": "state_changed", "data": {"state": "finished", "exit_code": 137}})
        );

        let value = serde_json::to_value(Event::Started).unwrap();
        assert_eq!(value, serde_json::json!({"type": "started"}));
    }
}
