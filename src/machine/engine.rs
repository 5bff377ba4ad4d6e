//! The state-machine driver.
//!
//! [`ProjectRunner::run`] is one long-lived task per project. Each loop
//! iteration reads the current (state, stash) from the store, executes that
//! state's handler, and persists the transition with a synchronous flush.
//! Reading from the store at the top of every iteration is what lets admin
//! commands (reset-state) take effect between transitions without touching
//! a running handler.
//!
//! The error wrapper is uniform: any handler error transitions to the
//! `error` state carrying the failing state, the rendered message and an
//! incremented counter; any non-error state succeeding clears the counter.
//! The `error` state sleeps `2^count` seconds and resumes the failed state
//! with the stash preserved; past [`SUSPEND_THRESHOLD`] consecutive
//! failures the project suspends until an operator resume.

use chrono::Utc;
use rand::Rng;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ProjectConfig;
use crate::events::SignalHub;
use crate::gerrit::{GerritError, GerritOps, GerritUrl, StagingResult};
use crate::jenkins::{BuildResult, JenkinsError, JenkinsOps};
use crate::logsync::LogSynchronizer;
use crate::mail::{MailError, Mailer};
use crate::store::{StateStore, StoreError};
use crate::summary::{self, Summarizer, SummaryError, SummaryOptions};
use crate::types::{format_change_list, format_change_list_html, ProjectId, RequestId};

use super::stash::{ErrorContext, Stash, StashError};
use super::state::State;

/// Consecutive failures after which a project suspends.
pub const SUSPEND_THRESHOLD: u32 = 8;

/// Errors a state handler can raise. All of them route to the `error`
/// state; none are handled above the wrapper.
#[derive(Debug, Error)]
pub enum MachineError {
    #[error(transparent)]
    Gerrit(#[from] GerritError),

    #[error(transparent)]
    Jenkins(#[from] JenkinsError),

    #[error(transparent)]
    Stash(#[from] StashError),

    #[error(transparent)]
    Summary(#[from] SummaryError),

    #[error(transparent)]
    Mail(#[from] MailError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Some run-log uploads failed after their own retries. Successes are
    /// recorded in the stash, so the resumed state only re-tries the rest.
    #[error("{failed} run-log upload(s) failed, first: {first}")]
    LogSync { failed: usize, first: String },
}

/// The store, shared by all runner tasks and the servers.
pub type SharedStore = Arc<Mutex<StateStore>>;

fn lock(store: &SharedStore) -> MutexGuard<'_, StateStore> {
    match store.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Process-wide collaborators shared by every project runner.
#[derive(Clone)]
pub struct ProjectContext {
    pub store: SharedStore,
    pub hub: SignalHub,
    pub shutdown: CancellationToken,
    pub mailer: Mailer,
    pub logsync: LogSynchronizer,
}

/// What a state handler produced.
enum Step {
    Next(State),
    Shutdown,
}

/// One project's state machine.
pub struct ProjectRunner<G, J> {
    id: ProjectId,
    config: ProjectConfig,
    gerrit_url: GerritUrl,
    recipients: Vec<String>,
    gerrit: Arc<G>,
    jenkins: Arc<J>,
    summarizer: Summarizer,
    ctx: ProjectContext,
    initial_delay: Duration,
}

impl<G: GerritOps, J: JenkinsOps> ProjectRunner<G, J> {
    pub fn new(
        id: ProjectId,
        config: ProjectConfig,
        recipients: Vec<String>,
        gerrit: Arc<G>,
        jenkins: Arc<J>,
        ctx: ProjectContext,
        initial_delay: Duration,
    ) -> Result<Self, GerritError> {
        let gerrit_url = GerritUrl::parse(&config.gerrit_url)?;
        let summarizer = Summarizer::new(config.summarizer.clone());
        Ok(ProjectRunner {
            id,
            config,
            gerrit_url,
            recipients,
            gerrit,
            jenkins,
            summarizer,
            ctx,
            initial_delay,
        })
    }

    /// Drives the project until shutdown. Never returns early on handler
    /// errors; those route through the `error` state.
    pub async fn run(self) {
        if !self.initial_delay.is_zero() {
            debug!(
                project = %self.id,
                delay_ms = self.initial_delay.as_millis(),
                "Staggering startup"
            );
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.initial_delay) => {}
            }
        }
        info!(project = %self.id, branch = %self.config.branch, "State machine started");

        loop {
            if self.ctx.shutdown.is_cancelled() {
                break;
            }

            // Re-read so admin resets between transitions take effect.
            let (state, mut stash) = {
                let mut store = lock(&self.ctx.store);
                let record = store.project(&self.id);
                (record.state, record.stash.clone())
            };

            match self.step(state, &mut stash).await {
                Ok(Step::Shutdown) => break,
                Ok(Step::Next(next)) => {
                    if state != State::Error {
                        stash.error = None;
                    }
                    self.persist(state, next, stash);
                }
                Err(e) => {
                    let count = stash.error.as_ref().map(|c| c.count).unwrap_or(0) + 1;
                    let suspended = count > SUSPEND_THRESHOLD;
                    let message = e.to_string();
                    warn!(
                        project = %self.id,
                        state = %state,
                        count,
                        error = %message,
                        "State failed"
                    );
                    {
                        let mut store = lock(&self.ctx.store);
                        store.push_log(
                            "error",
                            Some(&self.id),
                            format!("state {state} failed: {message}"),
                        );
                    }
                    stash.error = Some(ErrorContext {
                        failed_state: state,
                        message,
                        count,
                        suspended,
                    });
                    self.persist(state, State::Error, stash);
                }
            }
        }

        let store = lock(&self.ctx.store);
        if let Err(e) = store.sync() {
            error!(project = %self.id, error = %e, "Final state flush failed");
        }
        info!(project = %self.id, "State machine stopped");
    }

    /// Persists one transition, unless the stored state changed under us
    /// (an admin command won the race).
    fn persist(&self, prev: State, next: State, stash: Stash) {
        let mut store = lock(&self.ctx.store);
        if store.project(&self.id).state != prev {
            info!(project = %self.id, "State changed externally, dropping transition");
            return;
        }
        store.record_transition(&self.id, next, stash);
        if let Err(e) = store.sync() {
            error!(project = %self.id, error = %e, "State flush failed");
        }
        debug!(project = %self.id, from = %prev, to = %next, "Transition");
    }

    async fn step(&self, state: State, stash: &mut Stash) -> Result<Step, MachineError> {
        match state {
            State::Start => self.start(stash).await,
            State::WaitUntilStagingBranchExists => self.wait_until_branch_exists().await,
            State::WaitForStaging => self.wait_for_staging(stash).await,
            State::WaitForStagingQuiet => self.wait_for_staging_quiet(stash).await,
            State::StagingNewBuild => self.staging_new_build(stash).await,
            State::CheckStagedChanges => self.check_staged_changes(stash).await,
            State::TriggerJenkins => self.trigger_jenkins(stash).await,
            State::WaitForJenkinsBuildActive => self.wait_for_build_active(stash).await,
            State::SetJenkinsBuildDescription => self.set_build_description(stash).await,
            State::MonitorJenkinsBuild => self.monitor_build(stash).await,
            State::CancelJenkinsBuild => self.cancel_build(stash).await,
            State::ParseJenkinsBuild => self.parse_build(stash).await,
            State::HandleJenkinsBuildResult => self.handle_build_result(stash).await,
            State::SendMail => self.send_mail(stash).await,
            State::Error => self.handle_error(stash).await,
        }
    }

    /// Races a scope wait against shutdown. `None` means shutdown.
    async fn wait_scope(&self, key: &str, timeout: Duration) -> Option<()> {
        tokio::select! {
            _ = self.ctx.shutdown.cancelled() => None,
            _ = self.ctx.hub.wait(key, timeout) => Some(()),
        }
    }

    fn staging_scope(&self) -> String {
        SignalHub::gerrit_scope(&self.gerrit_url.project, &self.config.staging_ref())
    }

    // ─── State handlers ───────────────────────────────────────────────────

    async fn start(&self, stash: &mut Stash) -> Result<Step, MachineError> {
        stash.clear();
        let exists = self
            .gerrit
            .staging_branch_exists(&self.gerrit_url, &self.config.branch)
            .await?;
        Ok(Step::Next(if exists {
            State::WaitForStaging
        } else {
            State::WaitUntilStagingBranchExists
        }))
    }

    async fn wait_until_branch_exists(&self) -> Result<Step, MachineError> {
        let scope = self.staging_scope();
        loop {
            if self
                .gerrit
                .staging_branch_exists(&self.gerrit_url, &self.config.branch)
                .await?
            {
                return Ok(Step::Next(State::WaitForStaging));
            }
            if self
                .wait_scope(&scope, self.config.poll_interval())
                .await
                .is_none()
            {
                return Ok(Step::Shutdown);
            }
        }
    }

    async fn wait_for_staging(&self, stash: &mut Stash) -> Result<Step, MachineError> {
        let scope = self.staging_scope();
        loop {
            let staged = self
                .gerrit
                .staging_ls(&self.gerrit_url, &self.config.branch, None)
                .await?;
            if !staged.is_empty() {
                stash.staged = staged;
                return Ok(Step::Next(State::WaitForStagingQuiet));
            }
            if self
                .wait_scope(&scope, self.config.poll_interval())
                .await
                .is_none()
            {
                return Ok(Step::Shutdown);
            }
        }
    }

    /// Waits for the staged set to be unchanged for the quiet period, or
    /// for the maximum wait to elapse — whichever comes first triggers a
    /// build. An emptied set goes back to plain waiting.
    async fn wait_for_staging_quiet(&self, stash: &mut Stash) -> Result<Step, MachineError> {
        let quiet = self.config.staging_quiet_period();
        let maximum = self.config.staging_maximum_wait();
        let scope = self.staging_scope();
        let entered = Instant::now();
        let mut last_change = Instant::now();
        let mut current = stash.staged.clone();

        loop {
            let since_change = last_change.elapsed();
            let since_entry = entered.elapsed();
            if since_change >= quiet || since_entry >= maximum {
                if since_entry >= maximum {
                    info!(
                        project = %self.id,
                        "Staging never settled, forcing build after maximum wait"
                    );
                }
                stash.staged = current;
                return Ok(Step::Next(State::StagingNewBuild));
            }

            let wait = (quiet - since_change).min(maximum - since_entry);
            if self.wait_scope(&scope, wait).await.is_none() {
                return Ok(Step::Shutdown);
            }

            let staged = self
                .gerrit
                .staging_ls(&self.gerrit_url, &self.config.branch, None)
                .await?;
            if staged.is_empty() {
                stash.staged.clear();
                return Ok(Step::Next(State::WaitForStaging));
            }
            if staged != current {
                current = staged;
                last_change = Instant::now();
            }
        }
    }

    async fn staging_new_build(&self, stash: &mut Stash) -> Result<Step, MachineError> {
        let build_ref = self
            .gerrit
            .staging_new_build(&self.gerrit_url, &self.config.branch)
            .await?;
        stash.build_ref = Some(build_ref);
        Ok(Step::Next(State::CheckStagedChanges))
    }

    /// Re-queries the staged set pinned by the build ref, since more
    /// changes may have been staged between the quiet check and the ref
    /// creation. This list is what the build actually tests.
    async fn check_staged_changes(&self, stash: &mut Stash) -> Result<Step, MachineError> {
        let build_ref = stash.build_ref(State::CheckStagedChanges)?.clone();
        stash.staged = self
            .gerrit
            .staging_ls(&self.gerrit_url, &self.config.branch, Some(&build_ref))
            .await?;
        Ok(Step::Next(State::TriggerJenkins))
    }

    async fn trigger_jenkins(&self, stash: &mut Stash) -> Result<Step, MachineError> {
        stash.clear_build();
        let serial = {
            let mut store = lock(&self.ctx.store);
            store.next_id()
        };
        let request_id = RequestId::new(format!(
            "{}-{}-{}",
            self.config.jenkins_job,
            Utc::now().timestamp(),
            serial
        ));
        let build_ref = stash.build_ref(State::TriggerJenkins)?;
        self.jenkins
            .trigger_build(&self.config.jenkins_job, build_ref, &request_id)
            .await?;
        stash.request_id = Some(request_id);
        stash.build_attempt += 1;
        Ok(Step::Next(State::WaitForJenkinsBuildActive))
    }

    async fn wait_for_build_active(&self, stash: &mut Stash) -> Result<Step, MachineError> {
        let request_id = stash.request_id(State::WaitForJenkinsBuildActive)?.clone();
        let number = self
            .jenkins
            .find_build_by_request_id(
                &self.config.jenkins_job,
                &request_id,
                self.config.jenkins_trigger_timeout(),
                self.config.jenkins_trigger_poll_interval(),
            )
            .await?;
        stash.build_number = Some(number);
        Ok(Step::Next(State::SetJenkinsBuildDescription))
    }

    async fn set_build_description(&self, stash: &mut Stash) -> Result<Step, MachineError> {
        let number = stash.build_number(State::SetJenkinsBuildDescription)?;
        let html = format_change_list_html(&stash.staged);
        self.jenkins
            .set_build_description(&self.config.jenkins_job, number, &html)
            .await?;
        Ok(Step::Next(State::MonitorJenkinsBuild))
    }

    async fn monitor_build(&self, stash: &mut Stash) -> Result<Step, MachineError> {
        let number = stash.build_number(State::MonitorJenkinsBuild)?;
        let scope = SignalHub::jenkins_scope(&self.config.jenkins_job);
        loop {
            let tree = self
                .jenkins
                .get_build_tree(&self.config.jenkins_job, number)
                .await?;
            stash.build_url = Some(tree.url.clone());

            self.sync_run_logs(&tree, stash).await?;

            if self.config.jenkins_cancel_on_failure
                && tree.building
                && tree.has_completed_failed_run()
            {
                info!(
                    project = %self.id,
                    build = %number,
                    "Run failed while building, cancelling"
                );
                stash.parsed_build = Some(tree);
                return Ok(Step::Next(State::CancelJenkinsBuild));
            }
            if !tree.building && tree.result.is_some() {
                stash.parsed_build = Some(tree);
                return Ok(Step::Next(State::ParseJenkinsBuild));
            }

            if self
                .wait_scope(&scope, self.config.poll_interval())
                .await
                .is_none()
            {
                return Ok(Step::Shutdown);
            }
        }
    }

    /// Archives completed-run logs not yet synced. Successes are recorded
    /// in the stash even when others fail, so retries only cover the rest.
    async fn sync_run_logs(
        &self,
        tree: &crate::jenkins::BuildTree,
        stash: &mut Stash,
    ) -> Result<(), MachineError> {
        let Some(archive) = &self.config.log_archive else {
            return Ok(());
        };
        let failures = self
            .ctx
            .logsync
            .sync_completed_runs(archive, &self.config.jenkins_job, tree, &mut stash.synced_runs)
            .await;
        if failures.is_empty() {
            Ok(())
        } else {
            Err(MachineError::LogSync {
                failed: failures.len(),
                first: failures[0].error.to_string(),
            })
        }
    }

    async fn cancel_build(&self, stash: &mut Stash) -> Result<Step, MachineError> {
        let url = stash.build_url(State::CancelJenkinsBuild)?.to_string();
        self.jenkins.cancel_build(&url).await?;
        stash.aborted_by_integrator = true;
        if let Some(build) = stash.parsed_build.as_mut() {
            build.building = false;
            build.result = Some(BuildResult::Aborted);
        }
        Ok(Step::Next(State::ParseJenkinsBuild))
    }

    async fn parse_build(&self, stash: &mut Stash) -> Result<Step, MachineError> {
        let build = stash.parsed_build(State::ParseJenkinsBuild)?.clone();

        // Final archival pass: late runs, the state snapshot, and the
        // latest/latest-success pointers.
        self.sync_run_logs(&build, stash).await?;
        if let Some(archive) = &self.config.log_archive {
            self.ctx
                .logsync
                .finish_build(archive, &self.config.jenkins_job, &build)
                .await
                .map_err(|e| MachineError::LogSync {
                    failed: 1,
                    first: e.to_string(),
                })?;
        }

        let mut summary = self
            .summarizer
            .summarize(
                &build,
                SummaryOptions {
                    aborted_by_integrator: stash.aborted_by_integrator,
                    ignore_aborted: false,
                },
            )
            .await?;
        if !stash.staged.is_empty() {
            summary.text.push_str("\n\nTested changes:\n");
            summary.text.push_str(&format_change_list(&stash.staged));
        }
        stash.should_retry = summary::should_retry(
            &build,
            &summary,
            stash.build_attempt,
            self.config.build_attempts,
        );
        stash.summary = Some(summary);
        Ok(Step::Next(State::HandleJenkinsBuildResult))
    }

    async fn handle_build_result(&self, stash: &mut Stash) -> Result<Step, MachineError> {
        if stash.should_retry {
            let delay = summary::retry_delay(stash.build_attempt);
            info!(
                project = %self.id,
                attempt = stash.build_attempt,
                delay_secs = delay.as_secs(),
                "Retrying build after infra-flake failure"
            );
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => return Ok(Step::Shutdown),
                _ = tokio::time::sleep(delay) => {}
            }
            return Ok(Step::Next(State::TriggerJenkins));
        }

        let state = State::HandleJenkinsBuildResult;
        let build = stash.parsed_build(state)?;
        let result = if build.succeeded() {
            StagingResult::Pass
        } else {
            StagingResult::Fail
        };
        let build_ref = stash.build_ref(state)?;
        let message = stash.summary(state)?.text.clone();
        self.gerrit
            .staging_approve(
                &self.gerrit_url,
                &self.config.branch,
                build_ref,
                result,
                &message,
            )
            .await?;
        Ok(Step::Next(State::SendMail))
    }

    async fn send_mail(&self, stash: &mut Stash) -> Result<Step, MachineError> {
        let state = State::SendMail;
        let build = stash.parsed_build(state)?;
        let verdict = if build.succeeded() { "Pass" } else { "Fail" };
        let subject = format!("{verdict} | {} | build {}", self.id, build.number);
        let mut body = stash.summary(state)?.text.clone();
        body.push_str(&format!("\n\nBuild: {}\n", build.url));
        self.ctx.mailer.send(&self.recipients, &subject, &body).await?;
        Ok(Step::Next(State::Start))
    }

    async fn handle_error(&self, stash: &mut Stash) -> Result<Step, MachineError> {
        let Some(context) = stash.error.clone() else {
            // Context lost (e.g. a hand-edited state file); start over.
            return Ok(Step::Next(State::Start));
        };

        if context.suspended {
            error!(
                project = %self.id,
                failures = context.count,
                last_error = %context.message,
                "Project SUSPENDED after repeated failures; \
                 send the resume signal or reset its state to continue"
            );
            {
                let mut store = lock(&self.ctx.store);
                store.push_log(
                    "critical",
                    Some(&self.id),
                    format!(
                        "suspended after {} consecutive failures (last: {})",
                        context.count, context.message
                    ),
                );
                if let Err(e) = store.sync() {
                    error!(project = %self.id, error = %e, "State flush failed");
                }
            }
            // Operator notification is mandatory here; a suspended project
            // is otherwise silent.
            if let Err(e) = self
                .ctx
                .mailer
                .send(
                    &self.recipients,
                    &format!("SUSPENDED | {}", self.id),
                    &format!(
                        "Project {} suspended after {} consecutive failures.\n\
                         Last error: {}\n\nResume it or reset its state.\n",
                        self.id, context.count, context.message
                    ),
                )
                .await
            {
                warn!(project = %self.id, error = %e, "Cannot mail suspension notice");
            }

            // An admin reset-state also wakes the wait; the loop-top
            // re-read then picks up the reset position.
            let admin_scope = SignalHub::admin_scope(&self.id);
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => return Ok(Step::Shutdown),
                _ = self.ctx.hub.wait_for_resume() => {}
                _ = self.ctx.hub.wait_signal(&admin_scope) => {}
            }
            info!(project = %self.id, "Resumed by operator");
            if let Some(context) = stash.error.as_mut() {
                context.suspended = false;
            }
            return Ok(Step::Next(context.failed_state));
        }

        let delay = Duration::from_secs(2u64.saturating_pow(context.count));
        debug!(
            project = %self.id,
            state = %context.failed_state,
            delay_secs = delay.as_secs(),
            "Backing off before resuming failed state"
        );
        tokio::select! {
            _ = self.ctx.shutdown.cancelled() => Ok(Step::Shutdown),
            _ = tokio::time::sleep(delay) => Ok(Step::Next(context.failed_state)),
        }
    }
}

/// A uniformly random startup delay to avoid a thundering herd of Gerrit
/// probes: no stagger for up to 10 projects, scaling linearly to a 300s
/// window past 100.
pub fn startup_stagger(project_count: usize) -> Duration {
    let window = startup_window(project_count);
    if window.is_zero() {
        Duration::ZERO
    } else {
        window.mul_f64(rand::thread_rng().gen::<f64>())
    }
}

fn startup_window(project_count: usize) -> Duration {
    const FULL_WINDOW: f64 = 300.0;
    if project_count <= 10 {
        Duration::ZERO
    } else if project_count > 100 {
        Duration::from_secs_f64(FULL_WINDOW)
    } else {
        Duration::from_secs_f64(FULL_WINDOW * (project_count - 10) as f64 / 90.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JenkinsConfig, MailConfig};
    use crate::jenkins::{BuildRun, BuildTree};
    use crate::types::{BuildNumber, BuildRef, Sha, StagedChange};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    // ─── Fakes ────────────────────────────────────────────────────────────

    struct FakeGerrit {
        branch_exists: AtomicBool,
        staged: Mutex<Vec<StagedChange>>,
        /// Alternates the staged set on every listing, for the
        /// never-settling scenario.
        oscillate: AtomicBool,
        oscillation: AtomicBool,
        approvals: Mutex<Vec<(BuildRef, StagingResult, String)>>,
    }

    impl FakeGerrit {
        fn new(staged: Vec<StagedChange>) -> Self {
            FakeGerrit {
                branch_exists: AtomicBool::new(true),
                staged: Mutex::new(staged),
                oscillate: AtomicBool::new(false),
                oscillation: AtomicBool::new(false),
                approvals: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl GerritOps for FakeGerrit {
        async fn staging_branch_exists(
            &self,
            _url: &GerritUrl,
            _branch: &str,
        ) -> crate::gerrit::Result<bool> {
            Ok(self.branch_exists.load(Ordering::SeqCst))
        }

        async fn staging_ls(
            &self,
            _url: &GerritUrl,
            _branch: &str,
            _from_ref: Option<&BuildRef>,
        ) -> crate::gerrit::Result<Vec<StagedChange>> {
            let mut staged = self.staged.lock().unwrap().clone();
            if self.oscillate.load(Ordering::SeqCst) && !staged.is_empty() {
                let flip = self.oscillation.fetch_xor(true, Ordering::SeqCst);
                if flip {
                    staged.push(change(999));
                }
            }
            Ok(staged)
        }

        async fn staging_new_build(
            &self,
            _url: &GerritUrl,
            branch: &str,
        ) -> crate::gerrit::Result<BuildRef> {
            Ok(BuildRef::for_branch(branch, 1_700_000_000))
        }

        async fn staging_approve(
            &self,
            _url: &GerritUrl,
            _branch: &str,
            build_ref: &BuildRef,
            result: StagingResult,
            message: &str,
        ) -> crate::gerrit::Result<()> {
            self.approvals
                .lock()
                .unwrap()
                .push((build_ref.clone(), result, message.to_string()));
            // Approval unstages the changes.
            self.staged.lock().unwrap().clear();
            self.oscillate.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeJenkins {
        /// HTTP statuses to fail the next triggers with, in order.
        trigger_failures: Mutex<VecDeque<u16>>,
        triggered: Mutex<Vec<RequestId>>,
        tree: Mutex<BuildTree>,
        cancelled: Mutex<Vec<String>>,
    }

    impl FakeJenkins {
        fn new(tree: BuildTree) -> Self {
            FakeJenkins {
                trigger_failures: Mutex::new(VecDeque::new()),
                triggered: Mutex::new(Vec::new()),
                tree: Mutex::new(tree),
                cancelled: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl JenkinsOps for FakeJenkins {
        async fn trigger_build(
            &self,
            job: &str,
            _build_ref: &BuildRef,
            request_id: &RequestId,
        ) -> crate::jenkins::Result<()> {
            if let Some(status) = self.trigger_failures.lock().unwrap().pop_front() {
                return Err(JenkinsError::Http {
                    status,
                    context: format!("triggering {job}"),
                });
            }
            self.triggered.lock().unwrap().push(request_id.clone());
            Ok(())
        }

        async fn find_build_by_request_id(
            &self,
            _job: &str,
            _request_id: &RequestId,
            _timeout: Duration,
            _poll_interval: Duration,
        ) -> crate::jenkins::Result<BuildNumber> {
            Ok(BuildNumber(1))
        }

        async fn get_build_tree(
            &self,
            _job: &str,
            _number: BuildNumber,
        ) -> crate::jenkins::Result<BuildTree> {
            Ok(self.tree.lock().unwrap().clone())
        }

        async fn set_build_description(
            &self,
            _job: &str,
            _number: BuildNumber,
            _html: &str,
        ) -> crate::jenkins::Result<()> {
            Ok(())
        }

        async fn cancel_build(&self, build_url: &str) -> crate::jenkins::Result<()> {
            self.cancelled.lock().unwrap().push(build_url.to_string());
            let mut tree = self.tree.lock().unwrap();
            tree.building = false;
            tree.result = Some(BuildResult::Aborted);
            Ok(())
        }
    }

    // ─── Harness ──────────────────────────────────────────────────────────

    fn change(n: u64) -> StagedChange {
        StagedChange {
            sha1: Sha::parse(format!("{:040x}", n)).unwrap(),
            change: n,
            patch_set: 1,
            summary: format!("Fix bug {n}"),
        }
    }

    fn success_tree() -> BuildTree {
        BuildTree {
            number: 1,
            url: "https://ci/job/Integration/1/".to_string(),
            building: false,
            result: Some(BuildResult::Success),
            full_display_name: None,
            timestamp: None,
            duration: None,
            runs: Vec::new(),
        }
    }

    fn fast_config() -> ProjectConfig {
        ProjectConfig {
            gerrit_url: "ssh://ci@gerrit.example.com:29418/qt/qtbase".to_string(),
            branch: "dev".to_string(),
            jenkins_job: "Integration".to_string(),
            enabled: true,
            staging_quiet_period: 0.05,
            staging_maximum_wait: 10.0,
            poll_interval: 0.02,
            jenkins_trigger_timeout: 1.0,
            jenkins_trigger_poll_interval: 0.01,
            jenkins_cancel_on_failure: false,
            build_attempts: 3,
            mail_recipients: Vec::new(),
            log_archive: None,
            summarizer: None,
        }
    }

    struct Harness {
        id: ProjectId,
        store: SharedStore,
        hub: SignalHub,
        shutdown: CancellationToken,
        gerrit: Arc<FakeGerrit>,
        jenkins: Arc<FakeJenkins>,
        task: tokio::task::JoinHandle<()>,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        fn spawn(config: ProjectConfig, gerrit: FakeGerrit, jenkins: FakeJenkins) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store: SharedStore =
                Arc::new(Mutex::new(StateStore::open(dir.path(), "test").unwrap()));
            let hub = SignalHub::new();
            let shutdown = CancellationToken::new();
            let gerrit = Arc::new(gerrit);
            let jenkins = Arc::new(jenkins);
            let ctx = ProjectContext {
                store: store.clone(),
                hub: hub.clone(),
                shutdown: shutdown.clone(),
                mailer: Mailer::new(MailConfig {
                    sendmail: "/no/such/sendmail".into(),
                    from: "t@example.com".to_string(),
                    recipients: Vec::new(),
                }),
                logsync: LogSynchronizer::new(&JenkinsConfig {
                    url: "https://ci".to_string(),
                    user: "u".to_string(),
                    token: "t".to_string(),
                })
                .unwrap(),
            };
            let id = ProjectId::from("qt/qtbase#dev");
            let runner = ProjectRunner::new(
                id.clone(),
                config,
                Vec::new(),
                gerrit.clone(),
                jenkins.clone(),
                ctx,
                Duration::ZERO,
            )
            .unwrap();
            let task = tokio::spawn(runner.run());
            Harness {
                id,
                store,
                hub,
                shutdown,
                gerrit,
                jenkins,
                task,
                _dir: dir,
            }
        }

        fn current(&self) -> (State, Stash) {
            let store = self.store.lock().unwrap();
            match store.project_if_exists(&self.id) {
                Some(record) => (record.state, record.stash.clone()),
                // The runner has not taken its first step yet.
                None => (State::Start, Stash::default()),
            }
        }

        async fn wait_until<F: Fn(&Harness) -> bool>(&self, what: &str, check: F) {
            // Under `start_paused` each iteration advances virtual time by
            // only its own 10 ms sleep, and suspension tests need to cross
            // the cumulative 510 s error backoff — so the budget must be
            // well past 51_000 iterations.
            for _ in 0..100_000 {
                if check(self) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("never observed: {what}");
        }

        async fn stop(self) {
            self.shutdown.cancel();
            self.task.await.unwrap();
        }
    }

    fn approvals(h: &Harness) -> Vec<(BuildRef, StagingResult, String)> {
        h.gerrit.approvals.lock().unwrap().clone()
    }

    // ─── Scenarios ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn happy_path_approves_and_returns_to_waiting() {
        let h = Harness::spawn(
            fast_config(),
            FakeGerrit::new(vec![change(101), change(102)]),
            FakeJenkins::new(success_tree()),
        );

        h.wait_until("an approval", |h| !approvals(h).is_empty()).await;
        let (build_ref, result, message) = approvals(&h)[0].clone();
        assert_eq!(build_ref.as_str(), "refs/builds/dev_1700000000");
        assert_eq!(result, StagingResult::Pass);
        assert!(message.contains("Fix bug 101"));

        // Staging emptied by the approval; the machine idles waiting again.
        h.wait_until("back to wait-for-staging", |h| {
            h.current().0 == State::WaitForStaging
        })
        .await;
        h.stop().await;
    }

    #[tokio::test]
    async fn quiet_period_triggers_promptly() {
        let mut config = fast_config();
        config.staging_quiet_period = 0.1;
        let started = std::time::Instant::now();
        let h = Harness::spawn(
            config,
            FakeGerrit::new(vec![change(7)]),
            FakeJenkins::new(success_tree()),
        );

        h.wait_until("a trigger", |h| {
            !h.jenkins.triggered.lock().unwrap().is_empty()
        })
        .await;
        // One quiet period plus scheduling slack, not multiple poll cycles.
        assert!(started.elapsed() < Duration::from_millis(600));
        h.stop().await;
    }

    #[tokio::test]
    async fn oscillating_staging_is_forced_by_maximum_wait() {
        let mut config = fast_config();
        config.staging_quiet_period = 0.2;
        config.staging_maximum_wait = 0.4;
        let gerrit = FakeGerrit::new(vec![change(1)]);
        gerrit.oscillate.store(true, Ordering::SeqCst);
        let h = Harness::spawn(config, gerrit, FakeJenkins::new(success_tree()));

        // Every listing flips the set, so the quiet period alone would
        // never elapse.
        h.wait_until("a forced trigger", |h| {
            !h.jenkins.triggered.lock().unwrap().is_empty()
        })
        .await;
        h.stop().await;
    }

    #[tokio::test]
    async fn trigger_404_lands_in_error_state() {
        let jenkins = FakeJenkins::new(success_tree());
        jenkins.trigger_failures.lock().unwrap().push_back(404);
        // Keep failing so the machine stays observable in `error`.
        for _ in 0..20 {
            jenkins.trigger_failures.lock().unwrap().push_back(404);
        }
        let h = Harness::spawn(fast_config(), FakeGerrit::new(vec![change(1)]), jenkins);

        h.wait_until("the error state", |h| {
            let (state, stash) = h.current();
            state == State::Error
                && stash
                    .error
                    .as_ref()
                    .is_some_and(|e| e.message.contains("404"))
        })
        .await;
        let (_, stash) = h.current();
        let context = stash.error.unwrap();
        assert_eq!(context.failed_state, State::TriggerJenkins);
        assert!(!context.suspended);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_backs_off_then_recovers() {
        let jenkins = FakeJenkins::new(success_tree());
        jenkins.trigger_failures.lock().unwrap().push_back(503);
        let h = Harness::spawn(fast_config(), FakeGerrit::new(vec![change(1)]), jenkins);

        // One failure, a 2^1 s backoff (auto-advanced), then success.
        h.wait_until("an approval after recovery", |h| !approvals(h).is_empty())
            .await;
        assert_eq!(approvals(&h)[0].1, StagingResult::Pass);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_failures_suspend_until_resume() {
        let jenkins = FakeJenkins::new(success_tree());
        {
            let mut failures = jenkins.trigger_failures.lock().unwrap();
            for _ in 0..SUSPEND_THRESHOLD + 1 {
                failures.push_back(500);
            }
        }
        let h = Harness::spawn(fast_config(), FakeGerrit::new(vec![change(1)]), jenkins);

        h.wait_until("suspension", |h| {
            h.current()
                .1
                .error
                .as_ref()
                .is_some_and(|e| e.suspended)
        })
        .await;
        assert!(approvals(&h).is_empty());

        h.hub.resume_all();
        h.wait_until("an approval after resume", |h| !approvals(h).is_empty())
            .await;
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn admin_signal_wakes_a_suspended_project() {
        let jenkins = FakeJenkins::new(success_tree());
        {
            let mut failures = jenkins.trigger_failures.lock().unwrap();
            for _ in 0..SUSPEND_THRESHOLD + 1 {
                failures.push_back(500);
            }
        }
        let h = Harness::spawn(fast_config(), FakeGerrit::new(vec![change(1)]), jenkins);

        h.wait_until("suspension", |h| {
            h.current()
                .1
                .error
                .as_ref()
                .is_some_and(|e| e.suspended)
        })
        .await;

        // A reset-state admin command signals the project's admin scope.
        h.hub.notify(&SignalHub::admin_scope(&h.id));
        h.wait_until("an approval after the admin signal", |h| {
            !approvals(h).is_empty()
        })
        .await;
        h.stop().await;
    }

    #[tokio::test]
    async fn cancel_on_failure_aborts_early_and_reports_fail() {
        let mut config = fast_config();
        config.jenkins_cancel_on_failure = true;
        let tree = BuildTree {
            building: true,
            result: None,
            runs: vec![
                BuildRun {
                    number: 1,
                    url: "https://ci/job/Integration/cfg=a/1/".to_string(),
                    building: true,
                    result: None,
                },
                BuildRun {
                    number: 1,
                    url: "https://ci/job/Integration/cfg=b/1/".to_string(),
                    building: false,
                    result: Some(BuildResult::Failure),
                },
            ],
            ..success_tree()
        };
        let h = Harness::spawn(config, FakeGerrit::new(vec![change(1)]), FakeJenkins::new(tree));

        h.wait_until("a cancellation", |h| {
            !h.jenkins.cancelled.lock().unwrap().is_empty()
        })
        .await;
        h.wait_until("a fail approval", |h| !approvals(h).is_empty()).await;

        let (_, result, message) = approvals(&h)[0].clone();
        assert_eq!(result, StagingResult::Fail);
        // Integrator-aborted builds skip per-run failure analysis.
        assert!(message.contains("aborted by the integrator"));
        h.stop().await;
    }

    #[tokio::test]
    async fn shutdown_while_waiting_is_clean() {
        let h = Harness::spawn(
            fast_config(),
            FakeGerrit::new(Vec::new()),
            FakeJenkins::new(success_tree()),
        );
        h.wait_until("waiting for staging", |h| {
            h.current().0 == State::WaitForStaging
        })
        .await;
        h.stop().await;
    }

    // ─── Stagger window ───────────────────────────────────────────────────

    #[test]
    fn stagger_window_scales_with_project_count() {
        assert_eq!(startup_window(1), Duration::ZERO);
        assert_eq!(startup_window(10), Duration::ZERO);
        assert!(startup_window(11) > Duration::ZERO);
        assert_eq!(startup_window(55), Duration::from_secs(150));
        assert_eq!(startup_window(100), Duration::from_secs(300));
        assert_eq!(startup_window(500), Duration::from_secs(300));
    }

    #[test]
    fn stagger_is_within_the_window() {
        for _ in 0..50 {
            assert!(startup_stagger(200) <= Duration::from_secs(300));
        }
        assert_eq!(startup_stagger(5), Duration::ZERO);
    }
}
