//! Configuration loading.
//!
//! The integrator reads a single TOML file at startup. Configuration is
//! immutable for the life of the process; changing it requires a restart
//! (SIGHUP triggers a clean flush-and-exit so a supervisor can restart with
//! the new file).
//!
//! Layout:
//!
//! ```toml
//! working_dir = "/var/lib/staging-integrator"
//! instance_name = "integrator"
//!
//! [listen]
//! api_addr = "0.0.0.0:7181"
//! admin_addr = "127.0.0.1:7182"
//! admin_token = "shared-secret"
//!
//! [jenkins]
//! url = "https://ci.example.com/jenkins"
//! user = "integrator"
//! token = "..."
//!
//! [projects."qt/qtbase#dev"]
//! gerrit_url = "ssh://integrator@gerrit.example.com:29418/qt/qtbase"
//! branch = "dev"
//! jenkins_job = "QtBase_dev_Integration"
//! ```

use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::types::ProjectId;

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading the file.
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// TOML syntax or type error.
    #[error("cannot parse config file {path}: {source}")]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// Semantic validation failure.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Directory holding the state file, its lock file, and scratch space.
    pub working_dir: PathBuf,

    /// Name of this instance; the state file is `<working_dir>/<name>.state`.
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    #[serde(default)]
    pub listen: ListenConfig,

    pub jenkins: JenkinsConfig,

    #[serde(default)]
    pub mail: MailConfig,

    /// Configured projects, keyed by project identifier.
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectConfig>,
}

fn default_instance_name() -> String {
    "integrator".to_string()
}

/// Network listener configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ListenConfig {
    /// Address for the remote read API (`GET /api/json`). Disabled if unset.
    pub api_addr: Option<SocketAddr>,

    /// Address for the admin command channel. Disabled if unset.
    pub admin_addr: Option<SocketAddr>,

    /// Address for Jenkins build-updated notifications. Disabled if unset.
    pub notify_addr: Option<SocketAddr>,

    /// Shared secret required by admin commands.
    pub admin_token: Option<String>,
}

/// Jenkins server access.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JenkinsConfig {
    /// Base URL, e.g. `https://ci.example.com/jenkins`.
    pub url: String,

    /// HTTP Basic user.
    pub user: String,

    /// HTTP Basic API token.
    pub token: String,
}

/// Mail delivery for pass/fail reports and suspension notices.
///
/// Delivery goes through the local `sendmail` binary; SMTP itself is an
/// external concern.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MailConfig {
    #[serde(default = "default_sendmail")]
    pub sendmail: PathBuf,

    #[serde(default = "default_mail_from")]
    pub from: String,

    /// Default recipients; per-project recipients take precedence.
    #[serde(default)]
    pub recipients: Vec<String>,
}

impl Default for MailConfig {
    fn default() -> Self {
        MailConfig {
            sendmail: default_sendmail(),
            from: default_mail_from(),
            recipients: Vec::new(),
        }
    }
}

fn default_sendmail() -> PathBuf {
    PathBuf::from("/usr/sbin/sendmail")
}

fn default_mail_from() -> String {
    "staging-integrator@localhost".to_string()
}

/// Log archival destination for one project.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogArchiveConfig {
    /// SSH destination, e.g. `logs@archive.example.com`.
    pub ssh_host: String,

    /// Base directory on the archive host.
    pub base_path: String,
}

/// Per-project tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    /// Gerrit URL: `ssh://<user>@<host>:<port>/<project-path>`.
    pub gerrit_url: String,

    /// Gerrit branch under CI (e.g. "dev"); the staging branch is
    /// `refs/staging/<branch>`.
    pub branch: String,

    /// Jenkins job testing this branch.
    pub jenkins_job: String,

    /// Whether this project is managed. Disabled projects keep their
    /// persisted state but never run.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum staging-branch inactivity before triggering a build.
    #[serde(default = "default_quiet_period")]
    pub staging_quiet_period: f64,

    /// Upper bound on waiting for quiescence; once elapsed a build is
    /// triggered even if the staged set keeps changing.
    #[serde(default = "default_maximum_wait")]
    pub staging_maximum_wait: f64,

    /// Poll interval for waits that also accept push signals.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,

    /// How long to wait for a triggered build to appear in Jenkins.
    #[serde(default = "default_trigger_timeout")]
    pub jenkins_trigger_timeout: f64,

    /// Poll interval while searching for the triggered build.
    #[serde(default = "default_trigger_poll_interval")]
    pub jenkins_trigger_poll_interval: f64,

    /// Cancel the whole build as soon as any completed run has failed.
    #[serde(default)]
    pub jenkins_cancel_on_failure: bool,

    /// Maximum build attempts per staged set (retries of infra flakes).
    #[serde(default = "default_build_attempts")]
    pub build_attempts: u32,

    /// Recipients for this project's pass/fail reports.
    #[serde(default)]
    pub mail_recipients: Vec<String>,

    /// Where to archive build logs; log sync is skipped if unset.
    pub log_archive: Option<LogArchiveConfig>,

    /// Path to the build summarizer program; a built-in fallback summary is
    /// used if unset.
    pub summarizer: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_quiet_period() -> f64 {
    30.0
}

fn default_maximum_wait() -> f64 {
    3600.0
}

fn default_poll_interval() -> f64 {
    30.0
}

fn default_trigger_timeout() -> f64 {
    600.0
}

fn default_trigger_poll_interval() -> f64 {
    5.0
}

fn default_build_attempts() -> u32 {
    3
}

impl ProjectConfig {
    pub fn staging_quiet_period(&self) -> Duration {
        Duration::from_secs_f64(self.staging_quiet_period)
    }

    pub fn staging_maximum_wait(&self) -> Duration {
        Duration::from_secs_f64(self.staging_maximum_wait)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval)
    }

    pub fn jenkins_trigger_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.jenkins_trigger_timeout)
    }

    pub fn jenkins_trigger_poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.jenkins_trigger_poll_interval)
    }

    /// The staging ref for this project's branch.
    pub fn staging_ref(&self) -> String {
        format!("refs/staging/{}", self.branch)
    }

    /// The destination ref changes merge into once approved.
    pub fn destination_ref(&self) -> String {
        format!("refs/heads/{}", self.branch)
    }
}

impl Config {
    /// Loads and validates configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&text).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.instance_name.is_empty()
            || self.instance_name.contains('/')
            || self.instance_name.starts_with('.')
        {
            return Err(ConfigError::Invalid(format!(
                "instance_name {:?} is not a plain file name",
                self.instance_name
            )));
        }
        for (id, project) in &self.projects {
            if project.branch.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "project {id}: branch must not be empty"
                )));
            }
            if project.staging_quiet_period < 0.0 || project.staging_maximum_wait < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "project {id}: negative wait durations"
                )));
            }
            if project.staging_maximum_wait < project.staging_quiet_period {
                return Err(ConfigError::Invalid(format!(
                    "project {id}: staging_maximum_wait is shorter than staging_quiet_period"
                )));
            }
            crate::gerrit::GerritUrl::parse(&project.gerrit_url).map_err(|e| {
                ConfigError::Invalid(format!("project {id}: {e}"))
            })?;
        }
        Ok(())
    }

    /// Enabled projects, in deterministic order.
    pub fn enabled_projects(&self) -> impl Iterator<Item = (ProjectId, &ProjectConfig)> {
        self.projects
            .iter()
            .filter(|(_, p)| p.enabled)
            .map(|(id, p)| (ProjectId::new(id.clone()), p))
    }

    /// Recipients for a project's mail, falling back to the global list.
    pub fn mail_recipients_for<'a>(&'a self, project: &'a ProjectConfig) -> &'a [String] {
        if project.mail_recipients.is_empty() {
            &self.mail.recipients
        } else {
            &project.mail_recipients
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        working_dir = "/tmp/integrator"

        [jenkins]
        url = "https://ci.example.com/jenkins"
        user = "ci"
        token = "secret"

        [projects."qt/qtbase#dev"]
        gerrit_url = "ssh://ci@gerrit.example.com:29418/qt/qtbase"
        branch = "dev"
        jenkins_job = "QtBase_dev_Integration"
    "#;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        config.validate().unwrap();

        let project = &config.projects["qt/qtbase#dev"];
        assert!(project.enabled);
        assert_eq!(project.staging_quiet_period, 30.0);
        assert_eq!(project.build_attempts, 3);
        assert!(!project.jenkins_cancel_on_failure);
        assert_eq!(project.staging_ref(), "refs/staging/dev");
        assert_eq!(project.destination_ref(), "refs/heads/dev");
        assert_eq!(config.instance_name, "integrator");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let text = format!("{MINIMAL}\nno_such_key = 1\n");
        assert!(toml::from_str::<Config>(&text).is_err());
    }

    #[test]
    fn maximum_wait_shorter_than_quiet_period_is_invalid() {
        let text = MINIMAL.replace(
            "jenkins_job = \"QtBase_dev_Integration\"",
            "jenkins_job = \"j\"\nstaging_quiet_period = 60.0\nstaging_maximum_wait = 10.0",
        );
        let config: Config = toml::from_str(&text).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn bad_gerrit_url_is_invalid() {
        let text = MINIMAL.replace(
            "ssh://ci@gerrit.example.com:29418/qt/qtbase",
            "http://gerrit.example.com/qt/qtbase",
        );
        let config: Config = toml::from_str(&text).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn per_project_recipients_override_global() {
        let text = MINIMAL.replace(
            "[jenkins]",
            "[mail]\nrecipients = [\"ops@example.com\"]\n\n[jenkins]",
        );
        let config: Config = toml::from_str(&text).unwrap();
        let project = &config.projects["qt/qtbase#dev"];
        assert_eq!(config.mail_recipients_for(project), ["ops@example.com"]);
    }
}
