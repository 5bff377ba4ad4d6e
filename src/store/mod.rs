//! The crash-safe persistent state store.
//!
//! One JSON file (`<working_dir>/<name>.state`) holds every project's
//! state-machine position and stash, a bounded per-project history ring, a
//! bounded global log ring, and the ID counter. A companion lock file
//! carries a process-wide advisory lock so two instances never share one
//! state directory.
//!
//! Durability contract: [`StateStore::sync`] writes the whole document to a
//! temp file, fsyncs it, renames it over the state file, and fsyncs the
//! directory. A crash at any instant therefore leaves either the previous
//! or the new document on disk, never a torn one. Every state-machine
//! transition calls `sync` before the next transition begins.
//!
//! The file is pretty-printed JSON on purpose: manual editing is a
//! supported escape hatch for operational recovery.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::machine::{Stash, State};
use crate::types::ProjectId;

/// Bump when the persisted layout changes incompatibly.
pub const SCHEMA_VERSION: u32 = 1;

/// `next_id` wraps at this ceiling.
pub const ID_CEILING: u64 = 1 << 32;

/// Per-project history entries kept for diagnostics.
pub const HISTORY_LIMIT: usize = 20;

/// Global log-ring entries kept for diagnostics.
pub const LOG_LIMIT: usize = 50;

/// Errors from the state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Another process holds the lock for this state directory.
    #[error("state directory already locked by another instance ({path})")]
    Locked { path: PathBuf },

    #[error("cannot parse state file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("state file {path} has schema version {found}, expected {SCHEMA_VERSION}")]
    Schema { path: PathBuf, found: u32 },
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// One persisted project: current position plus a bounded history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub state: State,
    #[serde(default)]
    pub stash: Stash,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "VecDeque::is_empty")]
    pub history: VecDeque<HistoryEntry>,
}

/// A prior (state, stash) pair, kept for diagnostics only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub state: State,
    pub stash: Stash,
    pub recorded_at: DateTime<Utc>,
}

/// One entry in the global log ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Monotonically increasing within the ring; `since_id` queries key on it.
    pub id: u64,
    pub at: DateTime<Utc>,
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<ProjectId>,
    pub message: String,
}

/// The whole persisted document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Document {
    schema_version: u32,
    #[serde(default)]
    last_id: u64,
    #[serde(default)]
    projects: BTreeMap<ProjectId, ProjectRecord>,
    #[serde(default)]
    logs: VecDeque<LogEntry>,
}

impl Default for Document {
    fn default() -> Self {
        Document {
            schema_version: SCHEMA_VERSION,
            last_id: 0,
            projects: BTreeMap::new(),
            logs: VecDeque::new(),
        }
    }
}

/// The state store. Opening it acquires the instance lock; the lock is held
/// for the life of the value.
#[derive(Debug)]
pub struct StateStore {
    state_path: PathBuf,
    dir: PathBuf,
    // Held for the advisory lock; never read.
    _lock_file: File,
    data: Document,
}

impl StateStore {
    /// Opens (or creates) the store for `instance_name` under `working_dir`,
    /// acquiring the advisory lock and loading any existing state file.
    pub fn open(working_dir: &Path, instance_name: &str) -> Result<Self> {
        std::fs::create_dir_all(working_dir).map_err(|source| StoreError::Io {
            path: working_dir.to_path_buf(),
            source,
        })?;

        let lock_path = working_dir.join(format!("{instance_name}.lock"));
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|source| StoreError::Io {
                path: lock_path.clone(),
                source,
            })?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked { path: lock_path })?;

        let state_path = working_dir.join(format!("{instance_name}.state"));
        let data = match std::fs::read(&state_path) {
            Ok(bytes) => {
                let document: Document =
                    serde_json::from_slice(&bytes).map_err(|source| StoreError::Parse {
                        path: state_path.clone(),
                        source,
                    })?;
                if document.schema_version != SCHEMA_VERSION {
                    return Err(StoreError::Schema {
                        path: state_path,
                        found: document.schema_version,
                    });
                }
                info!(
                    path = %state_path.display(),
                    projects = document.projects.len(),
                    "Loaded state file"
                );
                document
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %state_path.display(), "No state file, starting fresh");
                Document::default()
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: state_path,
                    source,
                })
            }
        };

        Ok(StateStore {
            state_path,
            dir: working_dir.to_path_buf(),
            _lock_file: lock_file,
            data,
        })
    }

    /// The next value of the wrapped ID counter. Persisted by the next
    /// `sync`, which always follows within the same transition.
    pub fn next_id(&mut self) -> u64 {
        self.data.last_id = (self.data.last_id + 1) % ID_CEILING;
        self.data.last_id
    }

    /// The project's current record, creating a fresh `start` record on
    /// first sight.
    pub fn project(&mut self, id: &ProjectId) -> &mut ProjectRecord {
        self.data
            .projects
            .entry(id.clone())
            .or_insert_with(|| ProjectRecord {
                state: State::Start,
                stash: Stash::default(),
                updated_at: Utc::now(),
                history: VecDeque::new(),
            })
    }

    /// A read-only view of a project's record, if it exists.
    pub fn project_if_exists(&self, id: &ProjectId) -> Option<&ProjectRecord> {
        self.data.projects.get(id)
    }

    /// Records a completed transition: the previous position goes into the
    /// history ring, the new one becomes current. The caller syncs.
    pub fn record_transition(&mut self, id: &ProjectId, state: State, stash: Stash) {
        let now = Utc::now();
        let record = self.project(id);
        record.history.push_back(HistoryEntry {
            state: record.state,
            stash: std::mem::take(&mut record.stash),
            recorded_at: record.updated_at,
        });
        while record.history.len() > HISTORY_LIMIT {
            record.history.pop_front();
        }
        record.state = state;
        record.stash = stash;
        record.updated_at = now;
    }

    /// Drops a project's record entirely (the `remove-state` admin command).
    pub fn remove_project(&mut self, id: &ProjectId) -> bool {
        self.data.projects.remove(id).is_some()
    }

    /// Resets a project to `start` with an empty stash, keeping its history
    /// (the `reset-state` admin command).
    pub fn reset_project(&mut self, id: &ProjectId) -> bool {
        match self.data.projects.get_mut(id) {
            Some(record) => {
                record.state = State::Start;
                record.stash = Stash::default();
                record.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// All project IDs currently in the store.
    pub fn project_ids(&self) -> Vec<ProjectId> {
        self.data.projects.keys().cloned().collect()
    }

    /// Appends to the bounded log ring.
    pub fn push_log(&mut self, level: &str, project: Option<&ProjectId>, message: String) {
        let id = self.next_id();
        self.data.logs.push_back(LogEntry {
            id,
            at: Utc::now(),
            level: level.to_string(),
            project: project.cloned(),
            message,
        });
        while self.data.logs.len() > LOG_LIMIT {
            self.data.logs.pop_front();
        }
    }

    /// Log entries with `id > since_id`, oldest first.
    pub fn logs_since(&self, since_id: u64) -> Vec<&LogEntry> {
        self.data.logs.iter().filter(|l| l.id > since_id).collect()
    }

    /// A JSON snapshot of everything, for the remote read API.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "schema_version": self.data.schema_version,
            "last_id": self.data.last_id,
            "projects": self.data.projects,
            "logs": self.data.logs,
        })
    }

    /// Flushes the document to stable storage atomically.
    pub fn sync(&self) -> Result<()> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| StoreError::Io {
                path: path.clone(),
                source,
            }
        };

        let mut rendered =
            serde_json::to_vec_pretty(&self.data).map_err(|source| StoreError::Parse {
                path: self.state_path.clone(),
                source,
            })?;
        rendered.push(b'\n');

        let temp_path = self.state_path.with_extension("state.tmp");
        let mut temp = File::create(&temp_path).map_err(io_err(&temp_path))?;
        temp.write_all(&rendered).map_err(io_err(&temp_path))?;
        temp.sync_all().map_err(io_err(&temp_path))?;
        drop(temp);

        std::fs::rename(&temp_path, &self.state_path).map_err(io_err(&self.state_path))?;

        // The rename itself must reach the disk before the transition is
        // considered durable.
        match File::open(&self.dir) {
            Ok(dir) => {
                if let Err(e) = dir.sync_all() {
                    warn!(dir = %self.dir.display(), error = %e, "Cannot fsync state directory");
                }
            }
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "Cannot open state directory for fsync");
            }
        }
        Ok(())
    }
}
