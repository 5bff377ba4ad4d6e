//! The Gerrit staging-command client.
//!
//! [`GerritOps`] is the seam the state machine drives; the real
//! implementation shells out over ssh, and tests substitute an in-memory
//! fake.

use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, info};

use crate::command::{run_robust, CommandSpec, RetryPlan, SSH_NETWORK_ERROR};
use crate::types::{parse_staging_ls, BuildRef, StagedChange};

use super::{GerritError, GerritUrl, Result};

/// Pass/fail verdict reported back to Gerrit for a build ref.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingResult {
    Pass,
    Fail,
}

impl StagingResult {
    pub fn as_arg(&self) -> &'static str {
        match self {
            StagingResult::Pass => "pass",
            StagingResult::Fail => "fail",
        }
    }
}

/// Gerrit operations the state machine depends on.
#[async_trait]
pub trait GerritOps: Send + Sync + 'static {
    /// Lightweight existence probe for the staging branch, used before the
    /// branch has ever been created.
    async fn staging_branch_exists(&self, url: &GerritUrl, branch: &str) -> Result<bool>;

    /// Lists staged changes. With `from_ref`, the query is scoped to a build
    /// ref instead of the live staging branch.
    async fn staging_ls(
        &self,
        url: &GerritUrl,
        branch: &str,
        from_ref: Option<&BuildRef>,
    ) -> Result<Vec<StagedChange>>;

    /// Creates a build ref from current staging-branch content and verifies
    /// it exists afterwards.
    async fn staging_new_build(&self, url: &GerritUrl, branch: &str) -> Result<BuildRef>;

    /// Reports pass/fail for a build ref, with a multi-line message.
    async fn staging_approve(
        &self,
        url: &GerritUrl,
        branch: &str,
        build_ref: &BuildRef,
        result: StagingResult,
        message: &str,
    ) -> Result<()>;
}

/// The production client: ssh subprocesses with retry on exit 255.
#[derive(Debug, Clone)]
pub struct GerritClient {
    ssh_program: String,
    git_program: String,
    timeout: Duration,
    retry: RetryPlan,
}

impl Default for GerritClient {
    fn default() -> Self {
        GerritClient {
            ssh_program: "ssh".to_string(),
            git_program: "git".to_string(),
            timeout: Duration::from_secs(120),
            retry: RetryPlan::ROBUST,
        }
    }
}

impl GerritClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the command timeout (mainly for tests).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn gerrit_command(&self, url: &GerritUrl, remote: &[&str]) -> CommandSpec {
        CommandSpec::new(self.ssh_program.clone(), url.ssh_args(remote)).with_timeout(self.timeout)
    }

    /// Queries the remote for a single ref; returns true if it exists.
    async fn ref_exists(&self, url: &GerritUrl, ref_name: &str) -> Result<bool> {
        let spec = CommandSpec::new(
            self.git_program.clone(),
            ["ls-remote".to_string(), url.git_url(), ref_name.to_string()],
        )
        .with_timeout(self.timeout);
        let output = run_robust(&spec, self.retry, &[SSH_NETWORK_ERROR]).await?;
        Ok(output
            .stdout
            .lines()
            .any(|l| l.split_whitespace().nth(1) == Some(ref_name)))
    }

    fn staging_ref(branch: &str) -> String {
        format!("refs/staging/{branch}")
    }
}

#[async_trait]
impl GerritOps for GerritClient {
    async fn staging_branch_exists(&self, url: &GerritUrl, branch: &str) -> Result<bool> {
        self.ref_exists(url, &Self::staging_ref(branch)).await
    }

    async fn staging_ls(
        &self,
        url: &GerritUrl,
        branch: &str,
        from_ref: Option<&BuildRef>,
    ) -> Result<Vec<StagedChange>> {
        let staging = Self::staging_ref(branch);
        let branch_ref = from_ref.map(|r| r.as_str()).unwrap_or(&staging);
        let destination = format!("refs/heads/{branch}");
        let spec = self.gerrit_command(
            url,
            &[
                "gerrit",
                "staging-ls",
                "--branch",
                branch_ref,
                "--destination",
                &destination,
                "--project",
                &url.project,
            ],
        );
        let output = run_robust(&spec, self.retry, &[SSH_NETWORK_ERROR]).await?;
        let staged = parse_staging_ls(&output.stdout);
        debug!(
            project = %url.project,
            branch = branch_ref,
            count = staged.len(),
            "staging-ls"
        );
        Ok(staged)
    }

    async fn staging_new_build(&self, url: &GerritUrl, branch: &str) -> Result<BuildRef> {
        let build_ref = BuildRef::for_branch(branch, Utc::now().timestamp());
        let staging = Self::staging_ref(branch);
        let spec = self.gerrit_command(
            url,
            &[
                "gerrit",
                "staging-new-build",
                "--build-id",
                build_ref.as_str(),
                "--staging-branch",
                &staging,
                "--project",
                &url.project,
            ],
        );
        run_robust(&spec, self.retry, &[SSH_NETWORK_ERROR]).await?;

        // The exit code alone is not trusted; the ref must be visible.
        if !self.ref_exists(url, build_ref.as_str()).await? {
            return Err(GerritError::BuildRefMissing { build_ref });
        }

        info!(project = %url.project, build_ref = %build_ref, "Created build ref");
        Ok(build_ref)
    }

    async fn staging_approve(
        &self,
        url: &GerritUrl,
        branch: &str,
        build_ref: &BuildRef,
        result: StagingResult,
        message: &str,
    ) -> Result<()> {
        let spec = self
            .gerrit_command(
                url,
                &[
                    "gerrit",
                    "staging-approve",
                    "--branch",
                    branch,
                    "--build-id",
                    build_ref.as_str(),
                    "--project",
                    &url.project,
                    "--result",
                    result.as_arg(),
                    "--message",
                    "-",
                ],
            )
            .with_stdin(message.as_bytes().to_vec());
        run_robust(&spec, self.retry, &[SSH_NETWORK_ERROR]).await?;
        info!(
            project = %url.project,
            build_ref = %build_ref,
            result = result.as_arg(),
            "Reported staging result"
        );
        Ok(())
    }
}
