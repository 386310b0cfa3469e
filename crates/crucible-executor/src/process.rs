//! Child process execution.
//!
//! Spawns a shell command, pumps stdout/stderr line-by-line to a callback,
//! and enforces the three termination paths: normal exit, per-step timeout
//! (soft-terminate, grace, then kill), and cooperative cancellation
//! (force-kill).

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crucible_core::{Error, Result};

/// Long lines are chunked at this byte cap so a runaway step cannot buffer
/// unbounded output.
pub const MAX_LINE_BYTES: usize = 16 * 1024;

/// Grace between the soft-terminate signal and the force kill.
const TERM_GRACE: Duration = Duration::from_secs(2);

/// Which stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// Callback receiving each (already chunked) output line.
pub type LineSink = Arc<dyn Fn(StreamKind, &str) + Send + Sync>;

/// A command to run.
#[derive(Clone)]
pub struct ProcessRequest {
    /// Shell command, run through `sh -c`.
    pub command: String,
    pub env: HashMap<String, String>,
    pub cwd: PathBuf,
    pub timeout: Option<Duration>,
}

/// What happened to the child.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub interrupted: bool,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.interrupted
    }
}

/// Spawns and supervises child processes.
#[derive(Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }

    /// Run the command to completion, streaming output to `sink` and
    /// honoring the cancellation flag.
    pub async fn run(
        &self,
        request: ProcessRequest,
        sink: LineSink,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<ProcessOutcome> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&request.command)
            .envs(&request.env)
            .current_dir(&request.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Internal(format!("spawn failed: {e}")))?;

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        let out_pump = tokio::spawn(pump(stdout, StreamKind::Stdout, sink.clone()));
        let err_pump = tokio::spawn(pump(stderr, StreamKind::Stderr, sink));

        let deadline = request.timeout.map(|t| Instant::now() + t);
        let mut timed_out = false;
        let mut interrupted = false;
        let mut cancel_closed = false;

        // The flag may have been set before we started.
        if *cancel.borrow() {
            interrupted = true;
            let _ = child.start_kill();
        }

        let status = loop {
            tokio::select! {
                status = child.wait() => {
                    break status.map_err(|e| Error::Internal(format!("wait failed: {e}")))?;
                }
                _ = sleep_until_opt(deadline), if deadline.is_some() && !timed_out && !interrupted => {
                    debug!(command = %request.command, "step timeout, terminating");
                    timed_out = true;
                    soft_terminate(&child);
                    // If the child ignores SIGTERM past the grace period,
                    // force-kill it; the next wait() picks up the status.
                    if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_err() {
                        let _ = child.start_kill();
                    }
                }
                changed = cancel.changed(), if !interrupted && !cancel_closed => {
                    match changed {
                        Ok(()) if *cancel.borrow() => {
                            debug!(command = %request.command, "cancellation observed, killing");
                            interrupted = true;
                            let _ = child.start_kill();
                        }
                        Ok(()) => {}
                        // A dropped sender means cancellation can never
                        // arrive; stop watching.
                        Err(_) => cancel_closed = true,
                    }
                }
            }
        };

        let stdout = out_pump
            .await
            .map_err(|e| Error::Internal(format!("stdout pump: {e}")))?;
        let stderr = err_pump
            .await
            .map_err(|e| Error::Internal(format!("stderr pump: {e}")))?;

        Ok(ProcessOutcome {
            exit_code: exit_code_of(&status),
            stdout,
            stderr,
            timed_out,
            interrupted,
        })
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Read a stream, emitting lines (chunked at [`MAX_LINE_BYTES`]) and
/// accumulating the full text.
async fn pump(
    mut reader: impl tokio::io::AsyncRead + Unpin,
    stream: StreamKind,
    sink: LineSink,
) -> String {
    let mut accumulated = String::new();
    let mut line: Vec<u8> = Vec::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &byte in &buf[..n] {
            if byte == b'\n' {
                emit(&mut line, stream, &sink, &mut accumulated);
            } else {
                line.push(byte);
                if line.len() >= MAX_LINE_BYTES {
                    emit(&mut line, stream, &sink, &mut accumulated);
                }
            }
        }
    }
    if !line.is_empty() {
        emit(&mut line, stream, &sink, &mut accumulated);
    }
    accumulated
}

fn emit(line: &mut Vec<u8>, stream: StreamKind, sink: &LineSink, accumulated: &mut String) {
    let text = String::from_utf8_lossy(line);
    sink(stream, &text);
    accumulated.push_str(&text);
    accumulated.push('\n');
    line.clear();
}

#[cfg(unix)]
fn soft_terminate(child: &Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn soft_terminate(_child: &Child) {}

#[cfg(unix)]
fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

#[cfg(not(unix))]
fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collecting_sink() -> (LineSink, Arc<Mutex<Vec<(StreamKind, String)>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let captured = lines.clone();
        let sink: LineSink = Arc::new(move |stream, line: &str| {
            captured.lock().unwrap().push((stream, line.to_string()));
        });
        (sink, lines)
    }

    fn request(command: &str) -> ProcessRequest {
        ProcessRequest {
            command: command.to_string(),
            env: HashMap::new(),
            cwd: std::env::temp_dir(),
            timeout: None,
        }
    }

    #[tokio::test]
    async fn captures_exit_code_and_output() {
        let (sink, lines) = collecting_sink();
        let (_tx, cancel) = watch::channel(false);
        let outcome = ProcessRunner::new()
            .run(request("echo out; echo err >&2; exit 3"), sink, cancel)
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 3);
        assert!(outcome.stdout.contains("out"));
        assert!(outcome.stderr.contains("err"));
        let lines = lines.lock().unwrap();
        assert!(lines.iter().any(|(s, l)| *s == StreamKind::Stdout && l == "out"));
        assert!(lines.iter().any(|(s, l)| *s == StreamKind::Stderr && l == "err"));
    }

    #[tokio::test]
    async fn timeout_kills_sleeping_child() {
        let (sink, _) = collecting_sink();
        let (_tx, cancel) = watch::channel(false);
        let mut req = request("sleep 30");
        req.timeout = Some(Duration::from_millis(1));
        let started = std::time::Instant::now();
        let outcome = ProcessRunner::new().run(req, sink, cancel).await.unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancellation_interrupts_child() {
        let (sink, _) = collecting_sink();
        let (tx, cancel) = watch::channel(false);
        let handle = tokio::spawn(async move {
            ProcessRunner::new().run(request("sleep 30"), sink, cancel).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        let outcome = handle.await.unwrap().unwrap();
        assert!(outcome.interrupted);
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn long_lines_are_chunked() {
        let (sink, lines) = collecting_sink();
        let (_tx, cancel) = watch::channel(false);
        let big = MAX_LINE_BYTES * 2 + 100;
        let outcome = ProcessRunner::new()
            .run(request(&format!("printf 'a%.0s' $(seq {big}); echo")), sink, cancel)
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        let lines = lines.lock().unwrap();
        assert!(lines.len() >= 3);
        assert!(lines.iter().all(|(_, l)| l.len() <= MAX_LINE_BYTES));
    }
}
