//! The Gerrit `stream-events` subscription.
//!
//! One persistent ssh subprocess per distinct Gerrit host, shared across all
//! projects on that host. The feed is a line-delimited stream of JSON
//! objects; only `ref-updated` events carrying a project and ref are
//! relevant, and each one becomes a wakeup signal on the matching scope.
//!
//! The subscription auto-reconnects with backoff when the connection drops.
//! Missed events are harmless: every wait in the state machine also has a
//! poll timer.

use serde::Deserialize;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::SignalHub;

use super::GerritUrl;

/// Reconnect backoff bounds.
const RECONNECT_INITIAL: Duration = Duration::from_secs(5);
const RECONNECT_MAX: Duration = Duration::from_secs(60);
/// A connection that survived this long resets the backoff.
const STABLE_CONNECTION: Duration = Duration::from_secs(60);

/// A `ref-updated` notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdated {
    pub project: String,
    pub ref_name: String,
}

#[derive(Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "refUpdate")]
    ref_update: Option<RefUpdate>,
}

#[derive(Deserialize)]
struct RefUpdate {
    project: String,
    #[serde(rename = "refName")]
    ref_name: String,
}

/// Parses one stream-events line, returning the ref update if the line is a
/// well-formed `ref-updated` event. All other event types, and malformed
/// lines, yield `None`.
pub fn parse_stream_event(line: &str) -> Option<RefUpdated> {
    let event: StreamEvent = serde_json::from_str(line).ok()?;
    if event.kind != "ref-updated" {
        return None;
    }
    let update = event.ref_update?;
    Some(RefUpdated {
        project: update.project,
        ref_name: update.ref_name,
    })
}

/// Runs the stream-events subscription for one Gerrit host until shutdown.
///
/// `url` only contributes host/port/user; the project path is ignored since
/// the feed covers the whole host.
pub async fn run_stream_events(url: GerritUrl, hub: SignalHub, shutdown: CancellationToken) {
    let mut backoff = RECONNECT_INITIAL;

    loop {
        if shutdown.is_cancelled() {
            return;
        }

        let connected_at = Instant::now();
        match stream_once(&url, &hub, &shutdown).await {
            Ok(()) => return, // shutdown requested
            Err(e) => {
                warn!(host = %url.host_key(), error = %e, "stream-events connection lost");
            }
        }

        if connected_at.elapsed() >= STABLE_CONNECTION {
            backoff = RECONNECT_INITIAL;
        }

        debug!(
            host = %url.host_key(),
            delay_secs = backoff.as_secs(),
            "Reconnecting to stream-events"
        );
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(RECONNECT_MAX);
    }
}

/// One subscription attempt: spawns ssh and pumps events until the stream
/// ends (`Err`) or shutdown is requested (`Ok`).
async fn stream_once(
    url: &GerritUrl,
    hub: &SignalHub,
    shutdown: &CancellationToken,
) -> std::io::Result<()> {
    let mut child = Command::new("ssh")
        .args(url.ssh_args(&["gerrit", "stream-events"]))
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("stream-events stdout missing"))?;
    let mut lines = BufReader::new(stdout).lines();

    info!(host = %url.host_key(), "stream-events connected");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                child.start_kill().ok();
                let _ = child.wait().await;
                return Ok(());
            }
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        if let Some(update) = parse_stream_event(&line) {
                            debug!(
                                project = %update.project,
                                ref_name = %update.ref_name,
                                "ref-updated"
                            );
                            hub.notify(&SignalHub::gerrit_scope(
                                &update.project,
                                &update.ref_name,
                            ));
                        }
                    }
                    None => {
                        let _ = child.wait().await;
                        return Err(std::io::Error::other("stream-events closed"));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ref_updated() {
        let line = r#"{"type":"ref-updated","refUpdate":{"project":"qt/qtbase","refName":"refs/staging/dev","oldRev":"0","newRev":"1"}}"#;
        let update = parse_stream_event(line).unwrap();
        assert_eq!(update.project, "qt/qtbase");
        assert_eq!(update.ref_name, "refs/staging/dev");
    }

    #[test]
    fn ignores_other_event_types() {
        let line = r#"{"type":"comment-added","change":{"project":"qt/qtbase"}}"#;
        assert!(parse_stream_event(line).is_none());
    }

    #[test]
    fn ignores_ref_updated_without_payload() {
        assert!(parse_stream_event(r#"{"type":"ref-updated"}"#).is_none());
    }

    #[test]
    fn ignores_malformed_lines() {
        assert!(parse_stream_event("not json").is_none());
        assert!(parse_stream_event("").is_none());
    }

    #[tokio::test]
    async fn ref_updated_signals_matching_scope() {
        let hub = SignalHub::new();
        let line = r#"{"type":"ref-updated","refUpdate":{"project":"p","refName":"refs/staging/dev"}}"#;
        let update = parse_stream_event(line).unwrap();
        hub.notify(&SignalHub::gerrit_scope(&update.project, &update.ref_name));

        let wakeup = hub
            .wait("gerrit:p:refs/staging/dev", Duration::from_millis(50))
            .await;
        assert_eq!(wakeup, crate::events::Wakeup::Signal);
    }
}
