//! Gerrit integration: staging commands over SSH and the stream-events feed.
//!
//! All staging commands are fixed-shape invocations of the Gerrit SSH command
//! surface (`staging-ls`, `staging-new-build`, `staging-approve`), run through
//! the command runner with retry on SSH's network-failure exit code 255. Any
//! other non-zero exit is fatal and surfaces to the calling state.

mod client;
mod stream;

pub use client::{GerritClient, GerritOps, StagingResult};
pub use stream::{parse_stream_event, run_stream_events, RefUpdated};

use std::fmt;
use thiserror::Error;

use crate::command::CommandError;
use crate::types::BuildRef;

/// Errors from Gerrit operations.
#[derive(Debug, Error)]
pub enum GerritError {
    /// The underlying ssh/git command failed.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// `staging-new-build` exited 0 but the ref does not exist remotely.
    ///
    /// The creation command's exit code is not fully trustworthy, so the ref
    /// is always verified with a separate remote query; failing to find it is
    /// a hard error.
    #[error("build ref {build_ref} missing after staging-new-build reported success")]
    BuildRefMissing { build_ref: BuildRef },

    /// A Gerrit URL could not be parsed.
    #[error("invalid Gerrit URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: &'static str },
}

/// Result type for Gerrit operations.
pub type Result<T> = std::result::Result<T, GerritError>;

/// A parsed Gerrit SSH URL: `ssh://<user>@<host>:<port>/<project-path>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GerritUrl {
    pub user: Option<String>,
    pub host: String,
    pub port: u16,
    /// Project path with no leading slash (e.g. "qt/qtbase").
    pub project: String,
}

pub const DEFAULT_GERRIT_PORT: u16 = 29418;

impl GerritUrl {
    pub fn parse(url: &str) -> Result<GerritUrl> {
        let invalid = |reason| GerritError::InvalidUrl {
            url: url.to_string(),
            reason,
        };

        let rest = url
            .strip_prefix("ssh://")
            .ok_or_else(|| invalid("expected ssh:// scheme"))?;
        let (authority, path) = rest
            .split_once('/')
            .ok_or_else(|| invalid("missing project path"))?;
        if path.is_empty() {
            return Err(invalid("missing project path"));
        }

        let (user, host_port) = match authority.split_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
            Some(_) => return Err(invalid("empty user")),
            None => (None, authority),
        };

        let (host, port) = match host_port.split_once(':') {
            Some((host, port)) => (
                host,
                port.parse().map_err(|_| invalid("invalid port"))?,
            ),
            None => (host_port, DEFAULT_GERRIT_PORT),
        };
        if host.is_empty() {
            return Err(invalid("empty host"));
        }

        Ok(GerritUrl {
            user,
            host: host.to_string(),
            port,
            project: path.trim_end_matches('/').to_string(),
        })
    }

    /// The ssh destination, `user@host` or bare `host`.
    pub fn ssh_destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    /// Arguments for invoking a remote Gerrit command over ssh.
    pub fn ssh_args(&self, remote: &[&str]) -> Vec<String> {
        let mut args = vec![
            "-oBatchMode=yes".to_string(),
            "-p".to_string(),
            self.port.to_string(),
            self.ssh_destination(),
        ];
        args.extend(remote.iter().map(|s| s.to_string()));
        args
    }

    /// The full URL form, as accepted by `git ls-remote`.
    pub fn git_url(&self) -> String {
        format!(
            "ssh://{}:{}/{}",
            self.ssh_destination(),
            self.port,
            self.project
        )
    }

    /// Key identifying the Gerrit host for stream-events sharing: one
    /// subscription per distinct host, shared across that host's projects.
    pub fn host_key(&self) -> String {
        format!("{}:{}", self.ssh_destination(), self.port)
    }
}

impl fmt::Display for GerritUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.git_url())
    }
}
