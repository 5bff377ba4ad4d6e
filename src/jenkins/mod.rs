//! Jenkins integration: build triggering, polling, description updates and
//! cancellation over the Jenkins HTTP/JSON API.
//!
//! Authentication is HTTP Basic with a configured user/token. Build trees are
//! fetched with a restricted field projection to bound payload size.

mod build;
mod client;

pub use build::{BuildResult, BuildRun, BuildTree, BUILD_TREE_PROJECTION};
pub use client::{JenkinsClient, JenkinsOps, BUILD_REF_PARAM, REQUEST_ID_PARAM};

use thiserror::Error;

use crate::types::RequestId;

/// Errors from Jenkins operations.
#[derive(Debug, Error)]
pub enum JenkinsError {
    /// The server answered with an unexpected HTTP status.
    #[error("Jenkins returned HTTP {status} for {context}")]
    Http { status: u16, context: String },

    /// The request could not be completed at the transport level.
    #[error("Jenkins request failed for {context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: reqwest::Error,
    },

    /// A response body could not be decoded.
    #[error("cannot parse Jenkins response for {context}: {source}")]
    Parse {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    /// The triggered build never appeared in the job's build list.
    ///
    /// A hard error: Jenkins is presumed stuck or unavailable.
    #[error(
        "no build with request id {request_id} appeared in job {job} within {timeout_secs}s"
    )]
    TriggerTimeout {
        job: String,
        request_id: RequestId,
        timeout_secs: u64,
    },
}

impl JenkinsError {
    /// Whether a retry at the transfer layer could plausibly succeed.
    /// Transport failures and server-side errors qualify; 4xx responses and
    /// trigger timeouts do not.
    pub fn is_transient(&self) -> bool {
        match self {
            JenkinsError::Transport { .. } => true,
            JenkinsError::Http { status, .. } => *status >= 500,
            JenkinsError::Parse { .. } | JenkinsError::TriggerTimeout { .. } => false,
        }
    }
}

/// Result type for Jenkins operations.
pub type Result<T> = std::result::Result<T, JenkinsError>;
