//! The bare-TCP control surfaces.
//!
//! Admin channel: one JSON object per connection, e.g.
//! `{"type":"remove-state","project":"qt/qtbase#dev","token":"secret"}`,
//! answered with `{"result":"ok"}` or `{"error":"..."}`. Commands are
//! token-gated; `remove-state` is additionally refused for projects still
//! in the active configuration, since their runner would immediately
//! recreate the record.
//!
//! Notify channel: Jenkins (a post-build step) connects and writes
//! `{"type":"build-updated","job":"<name>"}`; the matching job scope is
//! signalled so monitoring picks up the change without waiting out its
//! poll interval.

use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::SignalHub;
use crate::machine::SharedStore;
use crate::types::ProjectId;

/// Admin channel policy.
#[derive(Debug, Clone)]
pub struct AdminOptions {
    /// The shared secret; with none configured every command is refused.
    pub token: Option<String>,

    /// Projects in the active configuration; their state cannot be removed.
    pub active_projects: HashSet<ProjectId>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", deny_unknown_fields)]
enum AdminCommand {
    RemoveState { project: ProjectId, token: String },
    ResetState { project: ProjectId, token: String },
}

/// Applies one admin command line. Pure apart from the store/hub effects,
/// so it is directly testable.
fn apply_admin_command(
    line: &str,
    store: &SharedStore,
    hub: &SignalHub,
    options: &AdminOptions,
) -> Result<&'static str, String> {
    let command: AdminCommand =
        serde_json::from_str(line.trim()).map_err(|e| format!("malformed command: {e}"))?;

    let (token, project) = match &command {
        AdminCommand::RemoveState { project, token }
        | AdminCommand::ResetState { project, token } => (token, project),
    };
    match &options.token {
        Some(expected) if expected == token => {}
        _ => return Err("invalid token".to_string()),
    }

    let mut store = match store.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let outcome = match &command {
        AdminCommand::RemoveState { project, .. } => {
            if options.active_projects.contains(project) {
                return Err(format!(
                    "project {project} is active; disable it in the configuration first"
                ));
            }
            if store.remove_project(project) {
                info!(project = %project, "Removed project state by admin command");
                Ok("removed")
            } else {
                Err(format!("no state for project {project}"))
            }
        }
        AdminCommand::ResetState { project, .. } => {
            if store.reset_project(project) {
                info!(project = %project, "Reset project state by admin command");
                Ok("reset")
            } else {
                Err(format!("no state for project {project}"))
            }
        }
    };

    if outcome.is_ok() {
        if let Err(e) = store.sync() {
            return Err(format!("state flush failed: {e}"));
        }
        // Wake the runner (it may be suspended) so the change applies now.
        hub.notify(&SignalHub::admin_scope(project));
    }
    outcome
}

async fn handle_admin_connection(
    stream: TcpStream,
    store: SharedStore,
    hub: SignalHub,
    options: Arc<AdminOptions>,
) {
    let peer = stream.peer_addr().ok();
    let (read, mut write) = stream.into_split();
    let mut line = String::new();
    if BufReader::new(read).read_line(&mut line).await.is_err() {
        return;
    }

    let reply = match apply_admin_command(&line, &store, &hub, &options) {
        Ok(result) => serde_json::json!({ "result": result }),
        Err(error) => {
            warn!(peer = ?peer, error = %error, "Admin command refused");
            serde_json::json!({ "error": error })
        }
    };
    let mut rendered = reply.to_string();
    rendered.push('\n');
    let _ = write.write_all(rendered.as_bytes()).await;
}

/// Serves the admin command channel until shutdown.
pub async fn run_admin_listener(
    addr: SocketAddr,
    store: SharedStore,
    hub: SignalHub,
    options: AdminOptions,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Admin channel listening");
    let options = Arc::new(options);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                tokio::spawn(handle_admin_connection(
                    stream,
                    store.clone(),
                    hub.clone(),
                    options.clone(),
                ));
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct BuildNotification {
    #[serde(rename = "type")]
    kind: String,
    job: String,
}

/// Parses one notify line into the scope to signal.
fn notification_scope(line: &str) -> Option<String> {
    let notification: BuildNotification = serde_json::from_str(line.trim()).ok()?;
    if notification.kind != "build-updated" {
        return None;
    }
    Some(SignalHub::jenkins_scope(&notification.job))
}

async fn handle_notify_connection(stream: TcpStream, hub: SignalHub) {
    let mut line = String::new();
    if BufReader::new(stream).read_line(&mut line).await.is_err() {
        return;
    }
    match notification_scope(&line) {
        Some(scope) => {
            debug!(scope = %scope, "Build notification");
            hub.notify(&scope);
        }
        None => debug!(line = %line.trim(), "Ignored notification"),
    }
}

/// Serves the Jenkins build-notification channel until shutdown.
pub async fn run_notify_listener(
    addr: SocketAddr,
    hub: SignalHub,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Notify channel listening");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                tokio::spawn(handle_notify_connection(stream, hub.clone()));
            }
        }
    }
}
