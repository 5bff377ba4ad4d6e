//! Newtype wrappers for domain identifiers.
//!
//! These types prevent accidental mixing of different identifier kinds
//! (e.g., using a Jenkins build number where a Gerrit change number is
//! expected) and make the code more self-documenting.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A configured project key (e.g., "qt/qtbase#stable").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub String);

impl ProjectId {
    pub fn new(s: impl Into<String>) -> Self {
        ProjectId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProjectId {
    fn from(s: &str) -> Self {
        ProjectId(s.to_string())
    }
}

/// A git commit SHA-1 (40 hex characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sha(pub String);

impl Sha {
    /// Parses a SHA, requiring exactly 40 hex characters.
    pub fn parse(s: impl Into<String>) -> Option<Self> {
        let s = s.into();
        if s.len() == 40 && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(Sha(s))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short (7-character) version for display.
    pub fn short(&self) -> &str {
        self.0.get(..7).unwrap_or(&self.0)
    }
}

impl fmt::Display for Sha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An ephemeral Gerrit build ref (`refs/builds/<branch>_<unix-time>`).
///
/// Pins the exact set of staged changes tested by one CI run. Created by the
/// state machine, consumed by Jenkins triggering and the approve step; never
/// deleted by this system (garbage collection is Gerrit's responsibility).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildRef(pub String);

impl BuildRef {
    /// Constructs the build ref name for a branch at a given unix time.
    pub fn for_branch(branch: &str, unix_time: i64) -> Self {
        BuildRef(format!("refs/builds/{}_{}", branch, unix_time))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BuildRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A Jenkins build number within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildNumber(pub u64);

impl fmt::Display for BuildNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for BuildNumber {
    fn from(n: u64) -> Self {
        BuildNumber(n)
    }
}

/// A caller-generated correlation ID attached to a Jenkins trigger request.
///
/// The trigger response carries no build number, so the only way to find the
/// resulting build is to poll the job's build list for a build whose
/// parameters contain this ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new(s: impl Into<String>) -> Self {
        RequestId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
