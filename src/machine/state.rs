//! The closed set of state-machine states.
//!
//! State names are persisted in the state file (kebab-case), so renaming a
//! variant is a schema change.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One position in the per-project integration cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum State {
    /// Initial state; clears the stash and probes staging-branch existence.
    Start,
    /// The staging branch does not exist yet.
    WaitUntilStagingBranchExists,
    /// Nothing is staged.
    WaitForStaging,
    /// Something is staged; waiting for the set to settle.
    WaitForStagingQuiet,
    /// Creating and verifying the build ref.
    StagingNewBuild,
    /// Re-querying the staged set pinned by the build ref.
    CheckStagedChanges,
    /// Triggering the Jenkins build.
    TriggerJenkins,
    /// Waiting for the triggered build to appear in the build list.
    WaitForJenkinsBuildActive,
    /// Posting the tested-changes description onto the build.
    SetJenkinsBuildDescription,
    /// Watching the build; archiving completed-run logs as they finish.
    MonitorJenkinsBuild,
    /// Stopping the build after an early run failure.
    CancelJenkinsBuild,
    /// Summarizing the finished build and evaluating retry.
    ParseJenkinsBuild,
    /// Approving/rejecting in Gerrit, or looping back for a retry.
    HandleJenkinsBuildResult,
    /// Sending the pass/fail report.
    SendMail,
    /// Backoff-and-resume wrapper around a failed state.
    Error,
}

impl State {
    /// The persisted (kebab-case) name.
    pub fn name(&self) -> &'static str {
        match self {
            State::Start => "start",
            State::WaitUntilStagingBranchExists => "wait-until-staging-branch-exists",
            State::WaitForStaging => "wait-for-staging",
            State::WaitForStagingQuiet => "wait-for-staging-quiet",
            State::StagingNewBuild => "staging-new-build",
            State::CheckStagedChanges => "check-staged-changes",
            State::TriggerJenkins => "trigger-jenkins",
            State::WaitForJenkinsBuildActive => "wait-for-jenkins-build-active",
            State::SetJenkinsBuildDescription => "set-jenkins-build-description",
            State::MonitorJenkinsBuild => "monitor-jenkins-build",
            State::CancelJenkinsBuild => "cancel-jenkins-build",
            State::ParseJenkinsBuild => "parse-jenkins-build",
            State::HandleJenkinsBuildResult => "handle-jenkins-build-result",
            State::SendMail => "send-mail",
            State::Error => "error",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
