//! Build summarization and the retry-on-infra-flake policy.
//!
//! The summarizer itself is an external collaborator invoked as a
//! subprocess: it receives the serialized build tree on stdin and emits a
//! JSON summary (human-readable text plus per-run verdicts with retry hints)
//! on stdout. A retry hint marks a run's failure as infrastructural (e.g.
//! executor loss) rather than a genuine test failure.
//!
//! The policy here is deliberate: a build is retried only when *every*
//! failed run carries a retry hint. A single genuine test failure among
//! otherwise-retryable runs disqualifies retry, since re-running would
//! reproduce the same genuine failure.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::command::{run, CommandError, CommandSpec};
use crate::jenkins::BuildTree;

/// Errors from summarization.
#[derive(Debug, Error)]
pub enum SummaryError {
    /// The summarizer subprocess could not be run.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// The summarizer exited non-zero.
    #[error("summarizer exited with status {status}: {stderr}")]
    Summarizer { status: i32, stderr: String },

    /// The summarizer's output was not valid summary JSON.
    #[error("cannot parse summarizer output: {0}")]
    Parse(#[from] serde_json::Error),

    /// The build tree could not be serialized for the summarizer.
    #[error("cannot serialize build tree: {0}")]
    Serialize(serde_json::Error),
}

/// Result type for summary operations.
pub type Result<T> = std::result::Result<T, SummaryError>;

/// The summarizer's verdict on one failed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunVerdict {
    /// The run's URL, matching [`crate::jenkins::BuildRun::url`].
    pub url: String,

    /// True when the failure looks infrastructural and the run would likely
    /// pass on a clean re-run.
    #[serde(default)]
    pub should_retry: bool,
}

/// A parsed build summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildSummary {
    /// Human-readable pass/fail summary.
    pub text: String,

    /// Per-run verdicts; absent runs carry no retry hint.
    #[serde(default)]
    pub run_verdicts: Vec<RunVerdict>,
}

/// How a build should be summarized.
#[derive(Debug, Clone, Copy, Default)]
pub struct SummaryOptions {
    /// The build was cancelled by the integrator itself.
    pub aborted_by_integrator: bool,

    /// Analyze per-run failures even for an integrator-aborted build.
    pub ignore_aborted: bool,
}

/// Invokes the configured summarizer program (or a built-in fallback).
#[derive(Debug, Clone)]
pub struct Summarizer {
    program: Option<PathBuf>,
    timeout: Duration,
}

impl Summarizer {
    pub fn new(program: Option<PathBuf>) -> Self {
        Summarizer {
            program,
            timeout: Duration::from_secs(10 * 60),
        }
    }

    /// Summarizes a finished build.
    ///
    /// An ABORTED build cancelled by the integrator suppresses per-run
    /// analysis entirely (unless `ignore_aborted` is set): the sub-run logs
    /// describe an interrupted build, not genuine failures, and re-deriving
    /// failure details from them would be misleading.
    pub async fn summarize(
        &self,
        build: &BuildTree,
        options: SummaryOptions,
    ) -> Result<BuildSummary> {
        if options.aborted_by_integrator && !options.ignore_aborted {
            return Ok(BuildSummary {
                text: format!(
                    "Build {} was aborted by the integrator after a failed configuration.",
                    build.number
                ),
                run_verdicts: Vec::new(),
            });
        }

        match &self.program {
            Some(program) => self.run_summarizer(program, build).await,
            None => Ok(fallback_summary(build)),
        }
    }

    async fn run_summarizer(&self, program: &PathBuf, build: &BuildTree) -> Result<BuildSummary> {
        let input = serde_json::to_vec(build).map_err(SummaryError::Serialize)?;
        let spec = CommandSpec::new(program.display().to_string(), Vec::new())
            .with_stdin(input)
            .with_timeout(self.timeout);
        let output = run(&spec).await?;
        if !output.success() {
            return Err(SummaryError::Summarizer {
                status: output.status,
                stderr: output.stderr,
            });
        }
        let summary: BuildSummary = serde_json::from_str(&output.stdout)?;
        debug!(
            build = build.number,
            verdicts = summary.run_verdicts.len(),
            "Summarized build"
        );
        Ok(summary)
    }
}

/// A minimal summary derived from the build tree alone, used when no
/// summarizer program is configured.
fn fallback_summary(build: &BuildTree) -> BuildSummary {
    let verdict = match build.result {
        Some(result) => result.to_string(),
        None => "UNKNOWN".to_string(),
    };
    let mut text = format!("Build {}: {}", build.number, verdict);
    let failed = build.failed_runs();
    if !failed.is_empty() {
        text.push_str("\nFailed configurations:");
        for run in failed {
            text.push_str(&format!("\n  {}", run.display_name()));
        }
    }
    BuildSummary {
        text,
        run_verdicts: Vec::new(),
    }
}

/// Whether the whole build should be re-triggered.
///
/// True only when the build failed, the attempt ceiling is not exhausted,
/// and *every* failed run carries a retry hint.
pub fn should_retry(
    build: &BuildTree,
    summary: &BuildSummary,
    attempt: u32,
    max_attempts: u32,
) -> bool {
    if attempt >= max_attempts || build.succeeded() {
        return false;
    }
    let failed = build.failed_runs();
    if failed.is_empty() {
        // Top-level failure with no attributable run: nothing says this is
        // an infra flake.
        return false;
    }
    failed.iter().all(|run| {
        summary
            .run_verdicts
            .iter()
            .any(|v| v.url == run.url && v.should_retry)
    })
}

/// Backoff before re-triggering a retried build: `2^attempt + 30` seconds.
pub fn retry_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt) + 30)
}
