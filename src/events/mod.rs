//! Wakeup-signal dispatch for state machines blocked in a wait state.
//!
//! External activity (a Gerrit ref update, a Jenkins build-updated
//! notification, an operator resume) is translated into named wakeup signals.
//! A state machine waiting on a scope races the signal against a timer;
//! whichever fires first wins, and a timer firing is equivalent to a poll
//! attempt, never an error.
//!
//! Signals carry no data. The waiting state re-queries the external system
//! after any wakeup, so a lost or spurious signal costs at most one poll
//! interval of latency.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::types::ProjectId;

/// Why a wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// The scope was signalled.
    Signal,
    /// The timer fired first; treat as a poll attempt.
    Timeout,
}

/// Shared table of named wakeup signals plus the global resume signal.
///
/// Scope naming convention:
/// - `gerrit:<gerrit-project>:<ref>` — a watched ref was updated
/// - `jenkins:<job>` — a build in the job changed state
#[derive(Clone, Default)]
pub struct SignalHub {
    scopes: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
    resume_all: Arc<Notify>,
}

impl SignalHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn scope(&self, key: &str) -> Arc<Notify> {
        let mut scopes = match self.scopes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        scopes.entry(key.to_string()).or_default().clone()
    }

    /// Signals a scope. If nobody is waiting, one permit is stored so a
    /// waiter that registers immediately afterwards still wakes.
    pub fn notify(&self, key: &str) {
        self.scope(key).notify_one();
    }

    /// Waits for a scope signal or a timeout, whichever comes first.
    pub async fn wait(&self, key: &str, timeout: Duration) -> Wakeup {
        let notify = self.scope(key);
        match tokio::time::timeout(timeout, notify.notified()).await {
            Ok(()) => Wakeup::Signal,
            Err(_) => Wakeup::Timeout,
        }
    }

    /// Waits for a scope signal with no timeout.
    pub async fn wait_signal(&self, key: &str) {
        self.scope(key).notified().await;
    }

    /// Resumes every project suspended in the error state.
    pub fn resume_all(&self) {
        self.resume_all.notify_waiters();
    }

    /// Blocks until the next resume broadcast.
    pub async fn wait_for_resume(&self) {
        self.resume_all.notified().await;
    }

    /// The scope key for a Gerrit ref update.
    pub fn gerrit_scope(gerrit_project: &str, ref_name: &str) -> String {
        format!("gerrit:{gerrit_project}:{ref_name}")
    }

    /// The scope key for Jenkins activity in a job.
    pub fn jenkins_scope(job: &str) -> String {
        format!("jenkins:{job}")
    }

    /// The scope key for admin mutations of a project.
    pub fn admin_scope(project: &ProjectId) -> String {
        format!("admin:{project}")
    }
}
