use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::executor::JobExecutor;
use super::line_buffer::{last_redraw, LineBuffer, Segment};
use super::progress::ProgressTracker;
use super::{ActiveGuard, Event, RunState};

/// Reported when the tool is not on the search path. Nothing is spawned.
pub const TOOL_NOT_FOUND: i32 = 127;
/// Reported when the tool was found but could not be started.
pub const SPAWN_FAILED: i32 = 126;
/// Reported when the exit status could not be collected.
pub const STATUS_UNAVAILABLE: i32 = -1;

// Upper bound on reading leftovers after exit; orphaned grandchildren may
// keep the pipes open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_millis(250);
const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("a backup process is already running")]
    Busy,
}

#[derive(Debug, Clone, Copy)]
enum Channel {
    Stdout,
    Stderr,
}

/// Owns the one external process the system may run at a time.
pub struct ProcessRunner {
    program: String,
    event_tx: broadcast::Sender<Event>,
    active: AtomicBool,
    state: Mutex<RunState>,
    kill_switch: Mutex<Option<oneshot::Sender<()>>>,
}

impl ProcessRunner {
    pub fn new(program: impl Into<String>, event_tx: broadcast::Sender<Event>) -> Self {
        Self {
            program: program.into(),
            event_tx,
            active: AtomicBool::new(false),
            state: Mutex::new(RunState::Idle),
            kill_switch: Mutex::new(None),
        }
    }

    pub fn state(&self) -> RunState {
        *self.state.lock()
    }

    /// Run the tool once and return its exit code.
    ///
    /// Every call that gets past the busy check ends with exactly one
    /// `Finished` event, whatever happens to the process.
    pub async fn run(&self, args: &[String]) -> Result<i32, RunnerError> {
        self.run_inner(args, None).await
    }

    /// Like [`run`](Self::run), but also killed once `stop` holds `true`.
    /// A stop raised before the process starts still kills it.
    pub async fn run_until_stopped(
        &self,
        args: &[String],
        stop: watch::Receiver<bool>,
    ) -> Result<i32, RunnerError> {
        self.run_inner(args, Some(stop)).await
    }

    async fn run_inner(
        &self,
        args: &[String],
        stop: Option<watch::Receiver<bool>>,
    ) -> Result<i32, RunnerError> {
        let (_guard, kill_rx) = {
            let mut switch = self.kill_switch.lock();
            let guard = ActiveGuard::acquire(&self.active).ok_or(RunnerError::Busy)?;
            let (kill_tx, kill_rx) = oneshot::channel();
            *switch = Some(kill_tx);
            (guard, kill_rx)
        };

        let span = info_span!("run", id = %uuid::Uuid::new_v4(), program = %self.program);
        let code = self.drive(args, kill_rx, stop).instrument(span).await;

        self.kill_switch.lock().take();
        Ok(code)
    }

    /// Kill the running process. Safe to call at any time.
    pub fn stop(&self) {
        if let Some(kill) = self.kill_switch.lock().take() {
            info!("Stop requested for {}", self.program);
            let _ = kill.send(());
        }
    }

    async fn drive(
        &self,
        args: &[String],
        mut kill_rx: oneshot::Receiver<()>,
        mut stop: Option<watch::Receiver<bool>>,
    ) -> i32 {
        let mut tracker = ProgressTracker::new();
        self.emit(Event::Progress(0));

        let program = match which::which(&self.program) {
            Ok(path) => path,
            Err(e) => {
                warn!("{} not found in PATH: {}", self.program, e);
                self.emit(Event::ErrorLine(format!(
                    "Error: {} not found in PATH.",
                    self.program
                )));
                self.set_state(RunState::Finished(TOOL_NOT_FOUND));
                self.emit(Event::Finished(TOOL_NOT_FOUND));
                return TOOL_NOT_FOUND;
            }
        };

        self.set_state(RunState::Starting);
        debug!("Running {} {:?}", program.display(), args);
        let started_at = Instant::now();

        let spawned = Command::new(&program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to start {}: {}", program.display(), e);
                self.emit(Event::ErrorLine(format!(
                    "Error: failed to start {}: {}",
                    self.program, e
                )));
                self.finalize(&tracker, SPAWN_FAILED);
                return SPAWN_FAILED;
            }
        };

        self.set_state(RunState::Running);
        self.emit(Event::Started);
        info!("Started {} (pid {:?})", self.program, child.id());

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let mut out_lines = LineBuffer::new();
        let mut err_lines = LineBuffer::new();
        let mut out_chunk = vec![0u8; READ_CHUNK];
        let mut err_chunk = vec![0u8; READ_CHUNK];
        let mut kill_armed = true;
        let mut stop_armed = stop.is_some();

        let status = loop {
            tokio::select! {
                biased;

                _ = &mut kill_rx, if kill_armed => {
                    kill_armed = false;
                    self.kill(&mut child);
                }
                raised = stop_raised(&mut stop), if stop_armed => {
                    stop_armed = false;
                    if raised {
                        info!("Stop signal received for {}", self.program);
                        self.kill(&mut child);
                    }
                }
                read = read_some(&mut stdout, &mut out_chunk), if stdout.is_some() => match read {
                    Some(n) => {
                        for segment in out_lines.push(&out_chunk[..n]) {
                            self.handle_segment(Channel::Stdout, segment, &mut tracker);
                        }
                    }
                    None => stdout = None,
                },
                read = read_some(&mut stderr, &mut err_chunk), if stderr.is_some() => match read {
                    Some(n) => {
                        for segment in err_lines.push(&err_chunk[..n]) {
                            self.handle_segment(Channel::Stderr, segment, &mut tracker);
                        }
                    }
                    None => stderr = None,
                },
                status = child.wait() => break status,
            }
        };

        let code = match status {
            Ok(status) => exit_code(status),
            Err(e) => {
                error!("Failed to collect exit status of {}: {}", self.program, e);
                STATUS_UNAVAILABLE
            }
        };

        let drained = tokio::time::timeout(DRAIN_GRACE, async {
            while let Some(n) = read_some(&mut stdout, &mut out_chunk).await {
                for segment in out_lines.push(&out_chunk[..n]) {
                    self.handle_segment(Channel::Stdout, segment, &mut tracker);
                }
            }
            while let Some(n) = read_some(&mut stderr, &mut err_chunk).await {
                for segment in err_lines.push(&err_chunk[..n]) {
                    self.handle_segment(Channel::Stderr, segment, &mut tracker);
                }
            }
        })
        .await;
        if drained.is_err() {
            debug!("Output pipes still open after exit; dropping them");
        }

        if let Some(line) = out_lines.flush() {
            self.handle_line(Channel::Stdout, line, &mut tracker);
        }
        if let Some(line) = err_lines.flush() {
            self.handle_line(Channel::Stderr, line, &mut tracker);
        }

        info!(
            "{} exited with {} after {}",
            self.program,
            code,
            humantime::format_duration(whole_millis(started_at.elapsed()))
        );

        self.finalize(&tracker, code);
        code
    }

    fn kill(&self, child: &mut tokio::process::Child) {
        if let Err(e) = child.start_kill() {
            warn!("Failed to kill {}: {}", self.program, e);
        }
    }

    fn handle_segment(&self, channel: Channel, segment: Segment, tracker: &mut ProgressTracker) {
        match segment {
            Segment::Line(line) => self.handle_line(channel, line, tracker),
            Segment::Redraw(text) => {
                if let Some(percent) = tracker.observe(&text) {
                    self.emit(Event::Progress(percent));
                }
            }
        }
    }

    fn handle_line(&self, channel: Channel, line: String, tracker: &mut ProgressTracker) {
        // Earlier redraws of this line were already observed
        let percent = tracker.observe(last_redraw(&line));
        match channel {
            Channel::Stdout => self.emit(Event::OutputLine(line)),
            Channel::Stderr => {
                debug!("{} stderr: {}", self.program, line);
                self.emit(Event::ErrorLine(line));
            }
        }
        if let Some(percent) = percent {
            self.emit(Event::Progress(percent));
        }
    }

    fn finalize(&self, tracker: &ProgressTracker, code: i32) {
        self.emit(Event::Progress(tracker.final_value(code)));
        self.set_state(RunState::Finished(code));
        self.emit(Event::Finished(code));
    }

    fn set_state(&self, state: RunState) {
        *self.state.lock() = state;
        self.emit(Event::StateChanged(state));
    }

    fn emit(&self, event: Event) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }
}

#[async_trait]
impl JobExecutor for ProcessRunner {
    async fn run(&self, args: &[String], stop: watch::Receiver<bool>) -> Result<i32, RunnerError> {
        self.run_until_stopped(args, stop).await
    }
}

/// Resolves to `true` once a stop is raised, or `false` if the sender is
/// gone. Never resolves without a receiver.
async fn stop_raised(stop: &mut Option<watch::Receiver<bool>>) -> bool {
    match stop {
        Some(rx) => rx.wait_for(|raised| *raised).await.is_ok(),
        None => std::future::pending().await,
    }
}

async fn read_some<R>(reader: &mut Option<R>, chunk: &mut [u8]) -> Option<usize>
where
    R: AsyncRead + Unpin,
{
    let reader = reader.as_mut()?;
    match reader.read(chunk).await {
        Ok(0) => None,
        Ok(n) => Some(n),
        Err(e) => {
            warn!("Error reading process output: {}", e);
            None
        }
    }
}

// Sub-millisecond digits only clutter the log
fn whole_millis(elapsed: Duration) -> Duration {
    Duration::from_millis(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}

/// Exit code as reported to subscribers; signals map to `128 + signal`.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    STATUS_UNAVAILABLE
}

/// Version string of the installed tool, e.g. "3.2.7".
pub async fn probe_tool(program: &str) -> anyhow::Result<String> {
    let path = which::which(program).with_context(|| format!("{} not found in PATH", program))?;

    let output = Command::new(&path)
        .arg("--version")
        .output()
        .await
        .with_context(|| format!("Failed to execute {}", path.display()))?;

    if !output.status.success() {
        anyhow::bail!("{} --version exited with {}", program, output.status);
    }

    let version = String::from_utf8_lossy(&output.stdout);
    Ok(version
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(2))
        .unwrap_or("unknown")
        .to_string())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn runner(program: &str) -> (Arc<ProcessRunner>, broadcast::Receiver<Event>) {
        let (tx, rx) = broadcast::channel(1024);
        (Arc::new(ProcessRunner::new(program, tx)), rx)
    }

    fn shell(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    fn collect(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn wait_for(rx: &mut broadcast::Receiver<Event>, wanted: Event) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if rx.recv().await.expect("event channel open") == wanted {
                    return;
                }
            }
        })
        .await
        .expect("event arrives in time");
    }

    fn count_finished(events: &[Event]) -> usize {
        events.iter().filter(|e| matches!(e, Event::Finished(_))).count()
    }

    #[tokio::test]
    async fn silent_success_reports_full_progress() {
        let (runner, mut rx) = runner("sh");
        let code = runner.run(&shell("exit 0")).await.unwrap();
        assert_eq!(code, 0);

        let events = collect(&mut rx);
        assert_eq!(events.first(), Some(&Event::Progress(0)));
        assert!(events.contains(&Event::StateChanged(RunState::Starting)));
        assert!(events.contains(&Event::StateChanged(RunState::Running)));
        assert!(events.contains(&Event::Started));
        assert_eq!(
            &events[events.len() - 3..],
            &[
                Event::Progress(100),
                Event::StateChanged(RunState::Finished(0)),
                Event::Finished(0),
            ]
        );
        assert_eq!(runner.state(), RunState::Finished(0));
    }

    #[tokio::test]
    async fn silent_failure_keeps_baseline_progress() {
        let (runner, mut rx) = runner("sh");
        let code = runner.run(&shell("exit 3")).await.unwrap();
        assert_eq!(code, 3);

        let events = collect(&mut rx);
        assert_eq!(
            &events[events.len() - 3..],
            &[
                Event::Progress(0),
                Event::StateChanged(RunState::Finished(3)),
                Event::Finished(3),
            ]
        );
        assert_eq!(count_finished(&events), 1);
    }

    #[tokio::test]
    async fn lines_and_progress_including_unterminated_tail() {
        let (runner, mut rx) = runner("sh");
        let script = r"printf 'sending incremental file list\n  1,024  10%%\n  2,048  10%%\nhalf to-chk=40/100'";
        runner.run(&shell(script)).await.unwrap();

        let seen: Vec<Event> = collect(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, Event::OutputLine(_) | Event::Progress(_)))
            .collect();
        assert_eq!(
            seen,
            vec![
                Event::Progress(0),
                Event::OutputLine("sending incremental file list".into()),
                Event::OutputLine("  1,024  10%".into()),
                Event::Progress(10),
                Event::OutputLine("  2,048  10%".into()),
                Event::OutputLine("half to-chk=40/100".into()),
                Event::Progress(60),
                Event::Progress(100),
            ]
        );
    }

    #[tokio::test]
    async fn carriage_return_redraws_update_progress_within_one_line() {
        let (runner, mut rx) = runner("sh");
        runner
            .run(&shell(r"printf '  10%%\r  55%%\r 100%%\ndone\n'"))
            .await
            .unwrap();

        let seen: Vec<Event> = collect(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, Event::OutputLine(_) | Event::Progress(_)))
            .collect();
        assert_eq!(
            seen,
            vec![
                Event::Progress(0),
                Event::Progress(10),
                Event::Progress(55),
                Event::OutputLine("  10%\r  55%\r 100%".into()),
                Event::Progress(100),
                Event::OutputLine("done".into()),
                Event::Progress(100),
            ]
        );
    }

    #[tokio::test]
    async fn stderr_lines_are_error_events() {
        let (runner, mut rx) = runner("sh");
        let code = runner.run(&shell("echo 'rsync: change_dir failed' >&2; exit 23")).await.unwrap();
        assert_eq!(code, 23);

        let events = collect(&mut rx);
        assert!(events.contains(&Event::ErrorLine("rsync: change_dir failed".into())));
        assert_eq!(events.last(), Some(&Event::Finished(23)));
    }

    #[tokio::test]
    async fn missing_tool_finishes_with_127_without_spawning() {
        let (runner, mut rx) = runner("definitely-not-an-installed-tool-4821");
        let code = runner.run(&["-a".to_string()]).await.unwrap();
        assert_eq!(code, TOOL_NOT_FOUND);

        let events = collect(&mut rx);
        assert_eq!(events.len(), 4);
        assert_eq!(events[0], Event::Progress(0));
        assert!(matches!(&events[1], Event::ErrorLine(msg) if msg.contains("not found in PATH")));
        assert_eq!(events[2], Event::StateChanged(RunState::Finished(TOOL_NOT_FOUND)));
        assert_eq!(events[3], Event::Finished(TOOL_NOT_FOUND));
        assert!(!events.contains(&Event::Started));
    }

    #[tokio::test]
    async fn stop_kills_and_finishes_once() {
        let (runner, mut rx) = runner("sh");
        let task = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run(&shell("echo begin; sleep 30")).await })
        };

        wait_for(&mut rx, Event::Started).await;
        assert!(matches!(
            runner.run(&shell("exit 0")).await,
            Err(RunnerError::Busy)
        ));

        runner.stop();
        runner.stop();

        let code = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("run ends after stop")
            .unwrap()
            .unwrap();
        assert_eq!(code, 128 + 9);

        let events = collect(&mut rx);
        assert_eq!(count_finished(&events), 1);
        assert_eq!(events.last(), Some(&Event::Finished(137)));
    }

    #[tokio::test]
    async fn stop_signal_raised_before_start_still_kills() {
        let (runner, mut rx) = runner("sh");
        let (_stop_tx, stop_rx) = watch::channel(true);

        let code = tokio::time::timeout(
            Duration::from_secs(5),
            runner.run_until_stopped(&shell("sleep 30"), stop_rx),
        )
        .await
        .expect("killed without waiting for the sleep")
        .unwrap();
        assert_eq!(code, 137);
        assert_eq!(count_finished(&collect(&mut rx)), 1);
    }

    #[tokio::test]
    async fn stop_signal_raised_mid_run_kills() {
        let (runner, mut rx) = runner("sh");
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = {
            let runner = runner.clone();
            tokio::spawn(async move {
                runner.run_until_stopped(&shell("echo begin; sleep 30"), stop_rx).await
            })
        };

        wait_for(&mut rx, Event::Started).await;
        stop_tx.send_replace(true);

        let code = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("run ends after stop")
            .unwrap()
            .unwrap();
        assert_eq!(code, 137);
    }

    #[tokio::test]
    async fn lowered_stop_signal_lets_the_run_finish() {
        let (runner, _rx) = runner("sh");
        let (stop_tx, stop_rx) = watch::channel(false);
        assert_eq!(runner.run_until_stopped(&shell("exit 0"), stop_rx).await.unwrap(), 0);

        drop(stop_tx);
        let (_, closed_rx) = watch::channel(false);
        assert_eq!(runner.run_until_stopped(&shell("exit 4"), closed_rx).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn stale_stop_does_not_affect_next_run() {
        let (runner, _rx) = runner("sh");
        runner.stop();
        assert_eq!(runner.run(&shell("exit 0")).await.unwrap(), 0);

        // Progress tracking restarts at unknown for every run
        let (runner, mut rx) = self::runner("sh");
        runner.run(&shell("echo 40%; exit 1")).await.unwrap();
        collect(&mut rx);
        runner.run(&shell("exit 1")).await.unwrap();
        let events = collect(&mut rx);
        assert_eq!(events[events.len() - 3], Event::Progress(0));
    }

    #[test]
    fn elapsed_time_is_truncated_to_milliseconds_without_overflow() {
        assert_eq!(whole_millis(Duration::from_micros(1_500_700)), Duration::from_millis(1_500));
        assert_eq!(whole_millis(Duration::MAX), Duration::from_millis(u64::MAX));
    }

    #[tokio::test]
    async fn version_lookup_reports_missing_tool() {
        assert!(probe_tool("definitely-not-an-installed-tool-4821").await.is_err());
    }
}
