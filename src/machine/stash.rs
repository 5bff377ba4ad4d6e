//! The per-project working data carried between transitions.
//!
//! The stash is a strongly-typed struct with optional fields rather than an
//! open key-value bag: each state reads the fields earlier states promise to
//! have filled in, and missing data is a [`StashError`] rather than a silent
//! default.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

use crate::jenkins::BuildTree;
use crate::summary::BuildSummary;
use crate::types::{BuildNumber, BuildRef, RequestId, StagedChange};

use super::state::State;

/// A stash field an earlier state should have filled in is missing.
#[derive(Debug, Error)]
#[error("stash field {field} missing in state {state}")]
pub struct StashError {
    pub state: State,
    pub field: &'static str,
}

/// Error-state bookkeeping: which state failed, why, and how often in a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    /// The state that raised; resumed with the stash preserved.
    pub failed_state: State,

    /// Rendered error message, for the operator and the API snapshot.
    pub message: String,

    /// Consecutive failures; reset to zero by any successful state.
    pub count: u32,

    /// Set once `count` exceeds the threshold; cleared by an explicit
    /// resume signal or a state reset.
    #[serde(default)]
    pub suspended: bool,
}

/// Working data for one project's current integration cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stash {
    /// The staged changes being tested.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub staged: Vec<StagedChange>,

    /// The build ref pinning the staged set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_ref: Option<BuildRef>,

    /// Correlation ID of the current trigger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,

    /// The Jenkins build number, once found.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_number: Option<BuildNumber>,

    /// The build's canonical URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_url: Option<String>,

    /// The finished build tree, as handed from monitoring to parsing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed_build: Option<BuildTree>,

    /// The summarizer's verdict on the finished build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<BuildSummary>,

    /// Whether the build should be re-triggered (infra flake).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub should_retry: bool,

    /// How many builds have been triggered for this staged set.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub build_attempt: u32,

    /// The integrator itself cancelled this build.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub aborted_by_integrator: bool,

    /// Run URLs whose logs have already been archived.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub synced_runs: BTreeSet<String>,

    /// Present while in (or recovering from) the `error` state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorContext>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl Stash {
    /// Resets everything for a fresh cycle. The error context survives so
    /// the failure counter carries across a reset-to-start.
    pub fn clear(&mut self) {
        let error = self.error.take();
        *self = Stash {
            error,
            ..Stash::default()
        };
    }

    /// Clears per-build fields before a retry trigger, keeping the staged
    /// set, the build ref and the attempt counter.
    pub fn clear_build(&mut self) {
        self.request_id = None;
        self.build_number = None;
        self.build_url = None;
        self.parsed_build = None;
        self.summary = None;
        self.should_retry = false;
        self.aborted_by_integrator = false;
        self.synced_runs.clear();
    }

    pub fn build_ref(&self, state: State) -> Result<&BuildRef, StashError> {
        self.build_ref.as_ref().ok_or(StashError {
            state,
            field: "build_ref",
        })
    }

    pub fn request_id(&self, state: State) -> Result<&RequestId, StashError> {
        self.request_id.as_ref().ok_or(StashError {
            state,
            field: "request_id",
        })
    }

    pub fn build_number(&self, state: State) -> Result<BuildNumber, StashError> {
        self.build_number.ok_or(StashError {
            state,
            field: "build_number",
        })
    }

    pub fn build_url(&self, state: State) -> Result<&str, StashError> {
        self.build_url.as_deref().ok_or(StashError {
            state,
            field: "build_url",
        })
    }

    pub fn parsed_build(&self, state: State) -> Result<&BuildTree, StashError> {
        self.parsed_build.as_ref().ok_or(StashError {
            state,
            field: "parsed_build",
        })
    }

    pub fn summary(&self, state: State) -> Result<&BuildSummary, StashError> {
        self.summary.as_ref().ok_or(StashError {
            state,
            field: "summary",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_preserves_error_context() {
        let mut stash = Stash {
            build_attempt: 2,
            aborted_by_integrator: true,
            error: Some(ErrorContext {
                failed_state: State::TriggerJenkins,
                message: "boom".to_string(),
                count: 3,
                suspended: false,
            }),
            ..Stash::default()
        };
        stash.clear();
        assert_eq!(stash.build_attempt, 0);
        assert!(!stash.aborted_by_integrator);
        assert_eq!(stash.error.as_ref().map(|e| e.count), Some(3));
    }

    #[test]
    fn clear_build_keeps_staged_set_and_attempt() {
        let mut stash = Stash {
            build_ref: Some(BuildRef::for_branch("dev", 1_700_000_000)),
            request_id: Some(RequestId::new("r")),
            build_number: Some(BuildNumber(4)),
            build_attempt: 1,
            aborted_by_integrator: true,
            ..Stash::default()
        };
        stash.synced_runs.insert("url".to_string());
        stash.clear_build();
        assert!(stash.build_ref.is_some());
        assert_eq!(stash.build_attempt, 1);
        assert!(stash.request_id.is_none());
        assert!(stash.synced_runs.is_empty());
        assert!(!stash.aborted_by_integrator);
    }

    #[test]
    fn missing_field_names_state_and_field() {
        let stash = Stash::default();
        let err = stash.build_number(State::MonitorJenkinsBuild).unwrap_err();
        assert!(err.to_string().contains("build_number"));
        assert!(err.to_string().contains("monitor-jenkins-build"));
    }

    #[test]
    fn empty_stash_serializes_compactly() {
        let json = serde_json::to_string(&Stash::default()).unwrap();
        assert_eq!(json, "{}");
    }
}
