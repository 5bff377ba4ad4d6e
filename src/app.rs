//! Process assembly.
//!
//! Builds the shared context (store, signal hub, clients), spawns one
//! stream-events subscription per distinct Gerrit host, one state-machine
//! task per enabled project, and the configured network listeners, then
//! waits on OS signals:
//!
//! - SIGHUP: flush and exit with [`RESTART_EXIT_CODE`] so the supervisor
//!   restarts the process with fresh configuration (and code).
//! - SIGUSR2: resume every error-suspended project.
//! - SIGINT/SIGTERM: clean shutdown, flushing state before exit.

use anyhow::Context as _;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::events::SignalHub;
use crate::gerrit::{self, GerritClient, GerritUrl};
use crate::jenkins::JenkinsClient;
use crate::logsync::LogSynchronizer;
use crate::machine::{startup_stagger, ProjectContext, ProjectRunner, SharedStore};
use crate::mail::Mailer;
use crate::server::{self, AdminOptions, ApiState};
use crate::store::StateStore;

/// Exit code asking the supervisor for a restart (EX_TEMPFAIL).
pub const RESTART_EXIT_CODE: u8 = 75;

/// Why the process is exiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppExit {
    /// Terminate for good.
    Shutdown,
    /// Exit with [`RESTART_EXIT_CODE`]; the supervisor restarts us.
    Restart,
}

/// Runs the integrator until a terminating signal.
pub async fn run(config: Config) -> anyhow::Result<AppExit> {
    let store: SharedStore = Arc::new(Mutex::new(
        StateStore::open(&config.working_dir, &config.instance_name)
            .context("opening state store")?,
    ));
    let hub = SignalHub::new();
    let shutdown = CancellationToken::new();

    let gerrit = Arc::new(GerritClient::new());
    let jenkins =
        Arc::new(JenkinsClient::new(&config.jenkins).context("building Jenkins client")?);
    let ctx = ProjectContext {
        store: store.clone(),
        hub: hub.clone(),
        shutdown: shutdown.clone(),
        mailer: Mailer::new(config.mail.clone()),
        logsync: LogSynchronizer::new(&config.jenkins).context("building log synchronizer")?,
    };

    // One stream-events subscription per distinct Gerrit host, shared by
    // every project on that host.
    let mut stream_hosts: HashMap<String, GerritUrl> = HashMap::new();
    for (_, project) in config.enabled_projects() {
        let url = GerritUrl::parse(&project.gerrit_url).context("parsing gerrit_url")?;
        stream_hosts.entry(url.host_key()).or_insert(url);
    }
    for (host, url) in stream_hosts {
        info!(host = %host, "Starting stream-events subscription");
        tokio::spawn(gerrit::run_stream_events(
            url,
            hub.clone(),
            shutdown.clone(),
        ));
    }

    let enabled: Vec<_> = config.enabled_projects().collect();
    let project_count = enabled.len();
    info!(projects = project_count, "Starting project state machines");
    let mut runners: Vec<JoinHandle<()>> = Vec::new();
    for (id, project) in &enabled {
        let runner = ProjectRunner::new(
            id.clone(),
            (*project).clone(),
            config.mail_recipients_for(project).to_vec(),
            gerrit.clone(),
            jenkins.clone(),
            ctx.clone(),
            startup_stagger(project_count),
        )
        .with_context(|| format!("setting up project {id}"))?;
        runners.push(tokio::spawn(runner.run()));
    }

    if let Some(addr) = config.listen.api_addr {
        let state = ApiState::new(store.clone());
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server::run_api_server(addr, state, shutdown).await {
                error!(error = %e, "Read API server failed");
            }
        });
    }
    if let Some(addr) = config.listen.admin_addr {
        if config.listen.admin_token.is_none() {
            warn!("admin_addr configured without admin_token; all commands will be refused");
        }
        let options = AdminOptions {
            token: config.listen.admin_token.clone(),
            active_projects: enabled.iter().map(|(id, _)| id.clone()).collect(),
        };
        let store = store.clone();
        let hub = hub.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server::run_admin_listener(addr, store, hub, options, shutdown).await
            {
                error!(error = %e, "Admin listener failed");
            }
        });
    }
    if let Some(addr) = config.listen.notify_addr {
        let hub = hub.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server::run_notify_listener(addr, hub, shutdown).await {
                error!(error = %e, "Notify listener failed");
            }
        });
    }

    let exit = wait_for_signal(&hub).await?;

    info!(?exit, "Shutting down");
    shutdown.cancel();
    for runner in runners {
        if let Err(e) = runner.await {
            error!(error = %e, "Runner task panicked");
        }
    }
    {
        let store = match store.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        store.sync().context("final state flush")?;
    }
    info!("State flushed, exiting");
    Ok(exit)
}

async fn wait_for_signal(hub: &SignalHub) -> anyhow::Result<AppExit> {
    let mut sighup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    let mut sigusr2 =
        signal(SignalKind::user_defined2()).context("installing SIGUSR2 handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                info!("SIGHUP: restarting for configuration reload");
                return Ok(AppExit::Restart);
            }
            _ = sigusr2.recv() => {
                info!("SIGUSR2: resuming suspended projects");
                hub.resume_all();
            }
            _ = sigterm.recv() => return Ok(AppExit::Shutdown),
            _ = sigint.recv() => return Ok(AppExit::Shutdown),
        }
    }
}
