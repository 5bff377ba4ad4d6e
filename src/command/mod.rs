//! External process execution with timeout enforcement and bounded retry.
//!
//! Everything the integrator runs out-of-process (ssh, git, the summarizer,
//! sendmail) goes through this module. A timeout bounds every execution; on
//! expiry the child is killed and the sentinel status [`TIMEOUT_STATUS`] is
//! reported instead of blocking forever.
//!
//! [`run_robust`] layers bounded exponential-backoff retry on top, retrying
//! only when the exit code is in a caller-supplied allow-list (SSH's
//! network-failure code 255 being the canonical member). Any other non-zero
//! exit is fatal immediately, with captured stdout/stderr in the failure
//! detail for diagnosability.

mod retry;

pub use retry::RetryPlan;

use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Exit status reported when a command is killed on timeout.
pub const TIMEOUT_STATUS: i32 = -1;

/// Default execution timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// SSH's exit code for network-level failures; always retryable.
pub const SSH_NETWORK_ERROR: i32 = 255;

/// Errors that can occur while running external commands.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The command could not be spawned or its pipes could not be driven.
    #[error("cannot run {command}: {source}")]
    Io {
        command: String,
        source: std::io::Error,
    },

    /// The command exited non-zero (or timed out) and was not retryable,
    /// or retries were exhausted.
    #[error("{command} failed with status {status}\nstdout:\n{stdout}\nstderr:\n{stderr}")]
    Failed {
        command: String,
        status: i32,
        stdout: String,
        stderr: String,
    },
}

impl CommandError {
    /// The exit status of a failed command, if it ran at all.
    pub fn status(&self) -> Option<i32> {
        match self {
            CommandError::Io { .. } => None,
            CommandError::Failed { status, .. } => Some(*status),
        }
    }
}

/// Result type for command operations.
pub type Result<T> = std::result::Result<T, CommandError>;

/// The outcome of one command execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit status; [`TIMEOUT_STATUS`] if the command timed out, otherwise
    /// the exit code (or 128+signal for signal deaths).
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// A command to execute: program, arguments, and optional stdin payload.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = String>) -> Self {
        CommandSpec {
            program: program.into(),
            args: args.into_iter().collect(),
            stdin: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Display form for logs and failure detail.
    pub fn display(&self) -> String {
        let mut s = self.program.clone();
        for arg in &self.args {
            s.push(' ');
            if arg.contains(' ') {
                s.push('\'');
                s.push_str(arg);
                s.push('\'');
            } else {
                s.push_str(arg);
            }
        }
        s
    }
}

/// Runs a command once, capturing stdout/stderr, bounded by its timeout.
///
/// A non-zero exit is not an error at this layer; callers inspect
/// [`CommandOutput::status`]. Only spawn/pipe failures surface as `Err`.
pub async fn run(spec: &CommandSpec) -> Result<CommandOutput> {
    let io_err = |source| CommandError::Io {
        command: spec.display(),
        source,
    };

    debug!(command = %spec.display(), "Running command");

    let mut child = Command::new(&spec.program)
        .args(&spec.args)
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(io_err)?;

    let stdin_pipe = child.stdin.take();
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();

    // The stdin write runs inside the timeout, concurrently with the reads:
    // a child that never drains its stdin while the payload exceeds the pipe
    // buffer must not block past the bound, and a child that fills stdout
    // before reading stdin must not deadlock against the writer.
    let waited = tokio::time::timeout(spec.timeout, async {
        let feed = async {
            if let Some(mut pipe) = stdin_pipe {
                if let Some(input) = &spec.stdin {
                    match pipe.write_all(input).await {
                        Ok(()) => {}
                        // The child exited without reading; its exit status
                        // tells the story.
                        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                        Err(e) => return Err(e),
                    }
                }
                // Drop closes the pipe so the child sees EOF.
            }
            std::io::Result::Ok(())
        };
        let out = async {
            if let Some(pipe) = stdout_pipe.as_mut() {
                pipe.read_to_end(&mut stdout_buf).await?;
            }
            std::io::Result::Ok(())
        };
        let err = async {
            if let Some(pipe) = stderr_pipe.as_mut() {
                pipe.read_to_end(&mut stderr_buf).await?;
            }
            std::io::Result::Ok(())
        };
        let (_, _, _, status) = tokio::try_join!(feed, out, err, child.wait())?;
        std::io::Result::Ok(status)
    })
    .await;

    let status = match waited {
        Ok(result) => {
            let status = result.map_err(io_err)?;
            status
                .code()
                .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
        }
        Err(_) => {
            warn!(
                command = %spec.display(),
                timeout_secs = spec.timeout.as_secs(),
                "Command timed out, killing"
            );
            child.start_kill().ok();
            let _ = child.wait().await;
            TIMEOUT_STATUS
        }
    };

    Ok(CommandOutput {
        status,
        stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
        stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
    })
}

/// Runs a command with bounded exponential-backoff retry.
///
/// Attempts are bounded by `plan.max_attempts`. After a failed attempt, the
/// command is retried only if its exit status is in `retry_on`; any other
/// non-zero status fails immediately. Success requires status 0.
pub async fn run_robust(
    spec: &CommandSpec,
    plan: RetryPlan,
    retry_on: &[i32],
) -> Result<CommandOutput> {
    let mut attempt = 0;
    loop {
        let output = run(spec).await?;
        if output.success() {
            return Ok(output);
        }

        attempt += 1;
        let retryable = retry_on.contains(&output.status);
        if !retryable || attempt >= plan.max_attempts {
            if retryable {
                warn!(
                    command = %spec.display(),
                    attempts = attempt,
                    "Retries exhausted"
                );
            }
            return Err(CommandError::Failed {
                command: spec.display(),
                status: output.status,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }

        let delay = plan.delay_for_attempt(attempt - 1);
        debug!(
            command = %spec.display(),
            status = output.status,
            attempt,
            delay_ms = delay.as_millis(),
            "Retryable failure, backing off"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh", ["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr() {
        let out = run(&sh("echo hello; echo oops >&2")).await.unwrap();
        assert_eq!(out.status, 0);
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.stderr, "oops\n");
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_not_err() {
        let out = run(&sh("exit 3")).await.unwrap();
        assert_eq!(out.status, 3);
    }

    #[tokio::test]
    async fn stdin_is_delivered() {
        let spec = sh("cat").with_stdin(b"payload".to_vec());
        let out = run(&spec).await.unwrap();
        assert_eq!(out.stdout, "payload");
    }

    #[tokio::test]
    async fn timeout_reports_sentinel_status() {
        let spec = sh("sleep 30").with_timeout(Duration::from_millis(50));
        let out = run(&spec).await.unwrap();
        assert_eq!(out.status, TIMEOUT_STATUS);
    }

    #[tokio::test]
    async fn timeout_bounds_stdin_delivery_to_slow_readers() {
        // The payload exceeds the pipe buffer and the child does not read
        // stdin for a while; the write must be cut off by the timeout, not
        // block until the child gets around to draining the pipe.
        let payload = vec![b'x'; 1 << 20];
        let spec = sh("sleep 30; cat > /dev/null")
            .with_stdin(payload)
            .with_timeout(Duration::from_millis(100));
        let started = std::time::Instant::now();
        let out = run(&spec).await.unwrap();
        assert_eq!(out.status, TIMEOUT_STATUS);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn child_exiting_without_reading_stdin_reports_its_status() {
        let spec = sh("exit 7").with_stdin(vec![b'x'; 1 << 20]);
        let out = run(&spec).await.unwrap();
        assert_eq!(out.status, 7);
    }

    #[tokio::test]
    async fn spawn_failure_is_io_error() {
        let spec = CommandSpec::new("/no/such/program", Vec::new());
        assert!(matches!(run(&spec).await, Err(CommandError::Io { .. })));
    }

    #[tokio::test]
    async fn robust_does_not_retry_unlisted_exit_codes() {
        let spec = sh("exit 3");
        let plan = RetryPlan::fast_for_tests();
        let err = run_robust(&spec, plan, &[SSH_NETWORK_ERROR])
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(3));
    }

    #[tokio::test]
    async fn robust_retries_listed_exit_codes_until_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("count");
        // Appends one byte per attempt, always exits 255.
        let script = format!("printf x >> {}; exit 255", counter.display());
        let plan = RetryPlan::fast_for_tests();
        let err = run_robust(&sh(&script), plan, &[SSH_NETWORK_ERROR])
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(SSH_NETWORK_ERROR));
        let attempts = std::fs::read(&counter).unwrap().len();
        assert_eq!(attempts as u32, plan.max_attempts);
    }

    #[tokio::test]
    async fn robust_succeeds_after_transient_failures() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("count");
        // Fails with 255 twice, then succeeds.
        let script = format!(
            "printf x >> {c}; [ $(wc -c < {c}) -ge 3 ] || exit 255",
            c = counter.display()
        );
        let plan = RetryPlan::fast_for_tests();
        let out = run_robust(&sh(&script), plan, &[SSH_NETWORK_ERROR])
            .await
            .unwrap();
        assert_eq!(out.status, 0);
    }

    #[tokio::test]
    async fn failure_detail_includes_output() {
        let err = run_robust(
            &sh("echo partial; echo broken >&2; exit 9"),
            RetryPlan::fast_for_tests(),
            &[],
        )
        .await
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("partial"));
        assert!(message.contains("broken"));
        assert!(message.contains("status 9"));
    }
}
