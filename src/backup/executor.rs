use async_trait::async_trait;
use tokio::sync::watch;

use super::runner::RunnerError;

/// Runs one tool invocation to completion.
///
/// The sequencer only talks to this trait, which keeps it independent of
/// how processes are actually started.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Run with the given arguments and return the exit code.
    ///
    /// The invocation is aborted as soon as `stop` holds `true`, including
    /// when it already does on entry.
    async fn run(&self, args: &[String], stop: watch::Receiver<bool>) -> Result<i32, RunnerError>;
}
