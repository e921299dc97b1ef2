//! Timeboxed subprocess supervision shared by agents, pipelines and judges.
//!
//! Output is drained concurrently with the wait so a child that times out or
//! is cancelled still yields whatever it printed. Timeout and cancellation are
//! reported as flags on [`ProcessOutcome`], never as errors.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::shutdown::Shutdown;

/// Grace period for pipe readers after the child has been killed.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Terminal state of a supervised child process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessOutcome {
    /// Exit code, or -1 when the process was killed or never started.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
    pub cancelled: bool,
    pub spawn_error: Option<String>,
}

impl ProcessOutcome {
    fn spawn_failed(error: String, duration: Duration) -> Self {
        Self {
            exit_code: -1,
            duration,
            spawn_error: Some(error),
            ..Default::default()
        }
    }

    /// True when the process ran to completion with exit code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.cancelled && self.spawn_error.is_none()
    }

    /// Stdout followed by stderr, separated when both are present.
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

fn spawn_reader<R>(reader: Option<R>) -> (mpsc::UnboundedReceiver<Vec<u8>>, tokio::task::JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        let Some(mut reader) = reader else {
            return;
        };
        let mut buf = vec![0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    (rx, handle)
}

fn collect(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> String {
    let mut bytes = Vec::new();
    while let Ok(chunk) = rx.try_recv() {
        bytes.extend_from_slice(&chunk);
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

enum Ending {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Runs `command` to completion, timeout or cancellation.
///
/// Stdin is closed, stdout and stderr are captured, and the child is killed
/// if this future is dropped.
pub async fn run_supervised(mut command: Command, timeout: Duration, cancel: &Shutdown) -> ProcessOutcome {
    let start = Instant::now();

    if cancel.is_triggered() {
        return ProcessOutcome {
            exit_code: -1,
            cancelled: true,
            ..Default::default()
        };
    }

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(error = %e, "Failed to spawn process");
            return ProcessOutcome::spawn_failed(e.to_string(), start.elapsed());
        }
    };

    let (mut stdout_rx, stdout_task) = spawn_reader(child.stdout.take());
    let (mut stderr_rx, stderr_task) = spawn_reader(child.stderr.take());

    let ending = tokio::select! {
        status = child.wait() => Ending::Exited(status),
        _ = tokio::time::sleep(timeout) => Ending::TimedOut,
        _ = cancel.cancelled() => Ending::Cancelled,
    };

    let mut outcome = ProcessOutcome {
        exit_code: -1,
        ..Default::default()
    };
    match ending {
        Ending::Exited(Ok(status)) => outcome.exit_code = status.code().unwrap_or(-1),
        Ending::Exited(Err(e)) => warn!(error = %e, "Failed waiting on process"),
        Ending::TimedOut => outcome.timed_out = true,
        Ending::Cancelled => outcome.cancelled = true,
    }

    if outcome.timed_out || outcome.cancelled {
        if let Err(e) = child.start_kill() {
            debug!(error = %e, "Process already gone");
        }
        let _ = child.wait().await;
    }

    // Grandchildren may still hold the pipes open; keep what has arrived.
    for task in [stdout_task, stderr_task] {
        let abort = task.abort_handle();
        if tokio::time::timeout(DRAIN_GRACE, task).await.is_err() {
            abort.abort();
        }
    }

    outcome.stdout = collect(&mut stdout_rx);
    outcome.stderr = collect(&mut stderr_rx);
    outcome.duration = start.elapsed();

    debug!(
        exit_code = outcome.exit_code,
        timed_out = outcome.timed_out,
        cancelled = outcome.cancelled,
        duration_ms = outcome.duration.as_millis() as u64,
        "Process finished"
    );

    outcome
}

/// Builds a `sh -c <script>` command rooted at `dir`.
pub fn shell_command(script: &str, dir: &std::path::Path) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script).current_dir(dir);
    cmd
}
