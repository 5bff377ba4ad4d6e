//! Jenkins build-tree representation.
//!
//! A multi-configuration build has one top-level result plus a list of `runs`
//! (one per matrix configuration, e.g. one OS/compiler combination). The
//! `runs` list as returned by Jenkins also contains entries belonging to
//! other build numbers, so every consumer filters on `number == parent`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Top-level or per-run build result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildResult {
    Success,
    Failure,
    Aborted,
    Unstable,
    NotBuilt,
}

impl fmt::Display for BuildResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildResult::Success => "SUCCESS",
            BuildResult::Failure => "FAILURE",
            BuildResult::Aborted => "ABORTED",
            BuildResult::Unstable => "UNSTABLE",
            BuildResult::NotBuilt => "NOT_BUILT",
        };
        write!(f, "{s}")
    }
}

/// Field projection for build-tree fetches, bounding payload size.
pub const BUILD_TREE_PROJECTION: &str =
    "number,url,building,result,fullDisplayName,timestamp,duration,\
     runs[number,url,building,result]";

/// One build-matrix configuration within a multi-configuration build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRun {
    pub number: u64,
    pub url: String,
    #[serde(default)]
    pub building: bool,
    #[serde(default)]
    pub result: Option<BuildResult>,
}

impl BuildRun {
    /// A short human-readable name derived from the run URL's configuration
    /// segment, e.g. `cfg=linux-g++` out of `.../job/cfg=linux-g++/13/`.
    pub fn display_name(&self) -> &str {
        self.url
            .trim_end_matches('/')
            .rsplit('/')
            .find(|seg| !seg.is_empty() && seg.parse::<u64>().is_err())
            .unwrap_or(&self.url)
    }
}

/// The (projected) Jenkins build tree for one build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildTree {
    pub number: u64,
    pub url: String,
    #[serde(default)]
    pub building: bool,
    #[serde(default)]
    pub result: Option<BuildResult>,
    #[serde(rename = "fullDisplayName", default)]
    pub full_display_name: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default)]
    pub runs: Vec<BuildRun>,
}

impl BuildTree {
    /// Runs belonging to this build (Jenkins lists runs of other build
    /// numbers in the same array).
    pub fn own_runs(&self) -> impl Iterator<Item = &BuildRun> {
        let number = self.number;
        self.runs.iter().filter(move |r| r.number == number)
    }

    /// Runs of this build whose result is anything but SUCCESS.
    pub fn failed_runs(&self) -> Vec<&BuildRun> {
        self.own_runs()
            .filter(|r| r.result != Some(BuildResult::Success))
            .collect()
    }

    /// Completed runs of this build, regardless of result.
    pub fn completed_runs(&self) -> Vec<&BuildRun> {
        self.own_runs()
            .filter(|r| !r.building && r.result.is_some())
            .collect()
    }

    /// True when an in-progress build already contains a completed, failed
    /// run. With cancel-on-failure, monitoring short-circuits to cancellation
    /// on this condition instead of waiting for the whole matrix.
    pub fn has_completed_failed_run(&self) -> bool {
        self.own_runs().any(|r| {
            !r.building
                && matches!(r.result, Some(result) if result != BuildResult::Success)
        })
    }

    /// True when the build completed with SUCCESS.
    pub fn succeeded(&self) -> bool {
        !self.building && self.result == Some(BuildResult::Success)
    }
}
