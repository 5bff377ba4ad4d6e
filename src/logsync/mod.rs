//! Build-log archival.
//!
//! Completed-run console logs (and, when present, zipped test-artifact
//! bundles) are streamed from Jenkins straight into an `ssh` child's stdin
//! on the archive host, gzip-compressed in flight unless the source is
//! already compressed. Nothing is buffered whole in memory.
//!
//! Transfers retry up to seven times with exponential backoff on any HTTP
//! error, an SSH network failure (exit 255), or a local timeout. Any other
//! failure is fatal for that single log only; failures are aggregated so
//! one bad upload never blocks the others.
//!
//! When a build is finished, [`LogSynchronizer::finish_build`] writes a
//! gzipped snapshot of the build state next to the logs and atomically
//! updates the `latest` (and, on success, `latest-success`) pointer files.

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures_util::{Stream, StreamExt};
use std::collections::BTreeSet;
use std::io::Write;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::command::{RetryPlan, SSH_NETWORK_ERROR};
use crate::config::{JenkinsConfig, LogArchiveConfig};
use crate::jenkins::BuildTree;

/// Bound on one whole transfer, fetch and upload included.
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Errors from log archival.
#[derive(Debug, Error)]
pub enum LogSyncError {
    /// The log fetch answered with a non-success HTTP status.
    #[error("HTTP {status} fetching {url}")]
    Http { status: u16, url: String },

    /// The log fetch failed at the transport level.
    #[error("cannot fetch {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The upload side (ssh) exited non-zero.
    #[error("archive upload failed with status {status}: {stderr}")]
    Ssh { status: i32, stderr: String },

    /// Local IO while driving the pipe.
    #[error("log sync IO error ({context}): {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The transfer exceeded [`UPLOAD_TIMEOUT`].
    #[error("transfer of {url} timed out")]
    Timeout { url: String },
}

impl LogSyncError {
    /// Any HTTP error, an SSH network failure, or a timeout is worth another
    /// attempt. Other SSH exits and local IO failures are not.
    pub fn is_transient(&self) -> bool {
        match self {
            LogSyncError::Http { .. }
            | LogSyncError::Transport { .. }
            | LogSyncError::Timeout { .. } => true,
            LogSyncError::Ssh { status, .. } => *status == SSH_NETWORK_ERROR,
            LogSyncError::Io { .. } => false,
        }
    }
}

/// Result type for log-sync operations.
pub type Result<T> = std::result::Result<T, LogSyncError>;

/// One failed upload inside an otherwise-continuing sync pass.
#[derive(Debug)]
pub struct SyncFailure {
    /// The run URL whose log could not be archived.
    pub run_url: String,
    pub error: LogSyncError,
}

/// Streams build logs from Jenkins into the archive host.
#[derive(Debug, Clone)]
pub struct LogSynchronizer {
    http: reqwest::Client,
    user: String,
    token: String,
    ssh_program: String,
    retry: RetryPlan,
}

impl LogSynchronizer {
    pub fn new(config: &JenkinsConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|source| LogSyncError::Transport {
                url: config.url.clone(),
                source,
            })?;
        Ok(LogSynchronizer {
            http,
            user: config.user.clone(),
            token: config.token.clone(),
            ssh_program: "ssh".to_string(),
            retry: RetryPlan::UPLOAD,
        })
    }

    /// Archives the logs of every completed run not yet in `synced`,
    /// recording each success in `synced`. Returns the per-run failures;
    /// an empty vector means everything (newly) completed is archived.
    pub async fn sync_completed_runs(
        &self,
        archive: &LogArchiveConfig,
        job: &str,
        build: &BuildTree,
        synced: &mut BTreeSet<String>,
    ) -> Vec<SyncFailure> {
        let mut failures = Vec::new();
        let pending: Vec<_> = build
            .completed_runs()
            .into_iter()
            .filter(|r| !synced.contains(&r.url))
            .cloned()
            .collect();

        for run in pending {
            let dir = format!("{}/{}", build_dir(archive, job, build.number), run.display_name());
            match self.sync_run(archive, &dir, &run.url).await {
                Ok(()) => {
                    info!(run = %run.url, "Archived run logs");
                    synced.insert(run.url.clone());
                }
                Err(error) => {
                    warn!(run = %run.url, error = %error, "Run log archival failed");
                    failures.push(SyncFailure {
                        run_url: run.url.clone(),
                        error,
                    });
                }
            }
        }
        failures
    }

    /// Console log plus, when Jenkins has archived artifacts, the zipped
    /// artifact bundle. A 404 on the bundle just means there are none.
    async fn sync_run(&self, archive: &LogArchiveConfig, dir: &str, run_url: &str) -> Result<()> {
        let console_url = format!("{run_url}consoleText");
        self.upload_url(archive, dir, "console.log.gz", &console_url, true)
            .await?;

        let bundle_url = format!("{run_url}artifact/*zip*/archive.zip");
        match self
            .upload_url(archive, dir, "artifacts.zip", &bundle_url, false)
            .await
        {
            Ok(()) | Err(LogSyncError::Http { status: 404, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Writes the gzipped build-state snapshot and moves the `latest` (and
    /// on success `latest-success`) pointers, all atomically on the remote
    /// side via write-to-temp-then-rename.
    pub async fn finish_build(
        &self,
        archive: &LogArchiveConfig,
        job: &str,
        build: &BuildTree,
    ) -> Result<()> {
        let dir = build_dir(archive, job, build.number);
        let rendered =
            serde_json::to_vec_pretty(build).map_err(|source| LogSyncError::Io {
                context: "serializing build state".to_string(),
                source: source.into(),
            })?;
        self.upload_with_retry(archive, &dir, "state.json.gz", || {
            futures_util::stream::iter([reqwest::Result::Ok(Bytes::from(rendered.clone()))])
        })
        .await?;

        let job_dir = job_dir(archive, job);
        let pointer = format!("{}\n", build.number);
        self.upload_pointer(archive, &job_dir, "latest", &pointer)
            .await?;
        if build.succeeded() {
            self.upload_pointer(archive, &job_dir, "latest-success", &pointer)
                .await?;
        }
        info!(job, build = build.number, "Finished build archive");
        Ok(())
    }

    async fn upload_pointer(
        &self,
        archive: &LogArchiveConfig,
        dir: &str,
        name: &str,
        content: &str,
    ) -> Result<()> {
        let content = Bytes::from(content.as_bytes().to_vec());
        let mut attempt = 0;
        loop {
            let stream = futures_util::stream::iter([reqwest::Result::Ok(content.clone())]);
            match self.upload_stream(archive, dir, name, stream, false).await {
                Ok(()) => return Ok(()),
                Err(e) => attempt = self.backoff_or_fail(attempt, e).await?,
            }
        }
    }

    /// Fetches `url` and pipes it into the archive; retried per the plan.
    async fn upload_url(
        &self,
        archive: &LogArchiveConfig,
        dir: &str,
        name: &str,
        url: &str,
        compress: bool,
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            let result = tokio::time::timeout(UPLOAD_TIMEOUT, async {
                let response = self
                    .http
                    .get(url)
                    .basic_auth(&self.user, Some(&self.token))
                    .send()
                    .await
                    .map_err(|source| LogSyncError::Transport {
                        url: url.to_string(),
                        source,
                    })?;
                let status = response.status();
                if !status.is_success() {
                    return Err(LogSyncError::Http {
                        status: status.as_u16(),
                        url: url.to_string(),
                    });
                }
                self.upload_stream(archive, dir, name, response.bytes_stream(), compress)
                    .await
            })
            .await
            .unwrap_or(Err(LogSyncError::Timeout {
                url: url.to_string(),
            }));

            match result {
                Ok(()) => return Ok(()),
                // 404 is a hard fact about the source, not a flake.
                Err(e @ LogSyncError::Http { status: 404, .. }) => return Err(e),
                Err(e) => attempt = self.backoff_or_fail(attempt, e).await?,
            }
        }
    }

    async fn upload_with_retry<S, F>(
        &self,
        archive: &LogArchiveConfig,
        dir: &str,
        name: &str,
        mut make_stream: F,
    ) -> Result<()>
    where
        S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
        F: FnMut() -> S,
    {
        let mut attempt = 0;
        loop {
            match self
                .upload_stream(archive, dir, name, make_stream(), true)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => attempt = self.backoff_or_fail(attempt, e).await?,
            }
        }
    }

    /// Sleeps out the backoff for a transient failure, or surfaces the
    /// error when it is fatal or attempts are exhausted.
    async fn backoff_or_fail(&self, attempt: u32, error: LogSyncError) -> Result<u32> {
        let next = attempt + 1;
        if !error.is_transient() || next >= self.retry.max_attempts {
            return Err(error);
        }
        let delay = self.retry.delay_for_attempt(attempt);
        debug!(error = %error, attempt = next, delay_ms = delay.as_millis(), "Retrying upload");
        tokio::time::sleep(delay).await;
        Ok(next)
    }

    /// One streaming transfer into the remote file, via write-to-temp plus
    /// rename on the archive host.
    async fn upload_stream<S>(
        &self,
        archive: &LogArchiveConfig,
        dir: &str,
        name: &str,
        mut stream: S,
        compress: bool,
    ) -> Result<()>
    where
        S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
    {
        let io_err = |context: &str| {
            let context = context.to_string();
            move |source| LogSyncError::Io { context, source }
        };

        let mut child = Command::new(&self.ssh_program)
            .arg("-oBatchMode=yes")
            .arg(&archive.ssh_host)
            .arg(remote_command(dir, name))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(io_err("spawning ssh"))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| LogSyncError::Io {
                context: "taking ssh stdin".to_string(),
                source: std::io::Error::other("stdin not piped"),
            })?;

        let write_result: Result<()> = async {
            if compress {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|source| LogSyncError::Transport {
                        url: format!("{dir}/{name}"),
                        source,
                    })?;
                    encoder
                        .write_all(&chunk)
                        .map_err(io_err("compressing chunk"))?;
                    let buffered = encoder.get_mut();
                    if !buffered.is_empty() {
                        stdin
                            .write_all(buffered)
                            .await
                            .map_err(io_err("writing to ssh"))?;
                        buffered.clear();
                    }
                }
                let tail = encoder.finish().map_err(io_err("finishing gzip"))?;
                stdin
                    .write_all(&tail)
                    .await
                    .map_err(io_err("writing to ssh"))?;
            } else {
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|source| LogSyncError::Transport {
                        url: format!("{dir}/{name}"),
                        source,
                    })?;
                    stdin
                        .write_all(&chunk)
                        .await
                        .map_err(io_err("writing to ssh"))?;
                }
            }
            Ok(())
        }
        .await;

        drop(stdin); // EOF for the remote cat

        let output = child
            .wait_with_output()
            .await
            .map_err(io_err("waiting for ssh"))?;
        write_result?;

        if output.status.success() {
            Ok(())
        } else {
            Err(LogSyncError::Ssh {
                status: output.status.code().unwrap_or(SSH_NETWORK_ERROR),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }
}

fn job_dir(archive: &LogArchiveConfig, job: &str) -> String {
    format!("{}/{}", archive.base_path.trim_end_matches('/'), job)
}

fn build_dir(archive: &LogArchiveConfig, job: &str, number: u64) -> String {
    format!("{}/build_{:05}", job_dir(archive, job), number)
}

/// The remote side: mkdir, stream into a temp file, rename into place.
fn remote_command(dir: &str, name: &str) -> String {
    format!(
        "mkdir -p '{dir}' && cat > '{dir}/.{name}.tmp' && mv '{dir}/.{name}.tmp' '{dir}/{name}'"
    )
}
