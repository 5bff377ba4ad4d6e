//! Pass/fail report delivery through the local `sendmail` binary.
//!
//! SMTP is an external concern; the integrator only composes an RFC-822
//! message and hands it to `sendmail -t`, which reads the recipients from
//! the headers.

use thiserror::Error;
use tracing::{debug, info};

use crate::command::{run, CommandError, CommandSpec};
use crate::config::MailConfig;

/// Errors from mail delivery.
#[derive(Debug, Error)]
pub enum MailError {
    /// sendmail could not be run.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// sendmail exited non-zero.
    #[error("sendmail exited with status {status}: {stderr}")]
    Sendmail { status: i32, stderr: String },
}

/// Result type for mail operations.
pub type Result<T> = std::result::Result<T, MailError>;

/// Composes and delivers reports.
#[derive(Debug, Clone)]
pub struct Mailer {
    config: MailConfig,
}

impl Mailer {
    pub fn new(config: MailConfig) -> Self {
        Mailer { config }
    }

    /// Sends one message. With no recipients this is a no-op, not an
    /// error: mail is config-gated per project.
    pub async fn send(&self, recipients: &[String], subject: &str, body: &str) -> Result<()> {
        if recipients.is_empty() {
            debug!(subject, "No mail recipients configured, skipping");
            return Ok(());
        }

        let message = compose(&self.config.from, recipients, subject, body);
        let spec = CommandSpec::new(
            self.config.sendmail.display().to_string(),
            ["-t".to_string()],
        )
        .with_stdin(message.into_bytes());

        let output = run(&spec).await?;
        if !output.success() {
            return Err(MailError::Sendmail {
                status: output.status,
                stderr: output.stderr,
            });
        }
        info!(subject, recipients = recipients.len(), "Sent mail");
        Ok(())
    }
}

fn compose(from: &str, recipients: &[String], subject: &str, body: &str) -> String {
    let mut message = String::new();
    message.push_str(&format!("From: {from}\n"));
    message.push_str(&format!("To: {}\n", recipients.join(", ")));
    message.push_str(&format!("Subject: {subject}\n"));
    message.push_str("MIME-Version: 1.0\n");
    message.push_str("Content-Type: text/plain; charset=utf-8\n");
    message.push('\n');
    message.push_str(body);
    if !body.ends_with('\n') {
        message.push('\n');
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    fn capture_sendmail(dir: &Path, capture: &Path) -> PathBuf {
        let path = dir.join("sendmail");
        std::fs::write(
            &path,
            format!("#!/bin/sh\ncat > {}\n", capture.display()),
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn mailer(sendmail: PathBuf) -> Mailer {
        Mailer::new(MailConfig {
            sendmail,
            from: "integrator@example.com".to_string(),
            recipients: Vec::new(),
        })
    }

    #[tokio::test]
    async fn message_carries_headers_and_body() {
        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("message");
        let mailer = mailer(capture_sendmail(dir.path(), &capture));

        mailer
            .send(
                &["dev@example.com".to_string(), "qa@example.com".to_string()],
                "Pass: qt/qtbase#dev",
                "All changes merged.",
            )
            .await
            .unwrap();

        let message = std::fs::read_to_string(&capture).unwrap();
        assert!(message.starts_with("From: integrator@example.com\n"));
        assert!(message.contains("To: dev@example.com, qa@example.com\n"));
        assert!(message.contains("Subject: Pass: qt/qtbase#dev\n"));
        assert!(message.ends_with("\nAll changes merged.\n"));
    }

    #[tokio::test]
    async fn no_recipients_is_a_noop() {
        // Would fail if sendmail were invoked.
        let mailer = mailer(PathBuf::from("/no/such/sendmail"));
        mailer.send(&[], "subject", "body").await.unwrap();
    }

    #[tokio::test]
    async fn sendmail_failure_surfaces_status() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sendmail");
        std::fs::write(&path, "#!/bin/sh\ncat > /dev/null\nexit 64\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mailer = mailer(path);
        let err = mailer
            .send(&["x@example.com".to_string()], "s", "b")
            .await
            .unwrap_err();
        assert!(matches!(err, MailError::Sendmail { status: 64, .. }));
    }
}
