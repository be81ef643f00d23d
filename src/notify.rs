//! Re-authentication notifications.
//!
//! Fired only when a run discovers that interactive two-factor
//! authentication is needed and nobody is at the terminal — never on
//! transient errors. Delivery mechanisms are pluggable; the external
//! script runner ships here, SMTP parameters are carried in the config and
//! handed to whichever [`ReauthNotifier`] the binary is wired with.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::SyncResult;

/// SMTP parameters as collected from the command line. Consumed by mailer
/// implementations of [`ReauthNotifier`].
#[derive(Debug, Clone, Default)]
pub struct SmtpSettings {
    pub username: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: u16,
    pub no_tls: bool,
    pub to: Option<String>,
    pub from: Option<String>,
}

impl SmtpSettings {
    pub fn configured(&self) -> bool {
        self.username.is_some() || self.to.is_some()
    }
}

#[async_trait]
pub trait ReauthNotifier: Send + Sync {
    /// The account needs interactive re-authentication.
    async fn notify_reauth_needed(&self, username: &str) -> SyncResult<()>;
}

/// Runs the configured `--notification-script`.
pub struct ScriptNotifier {
    script: PathBuf,
}

impl ScriptNotifier {
    pub fn new(script: PathBuf) -> Self {
        Self { script }
    }
}

#[async_trait]
impl ReauthNotifier for ScriptNotifier {
    async fn notify_reauth_needed(&self, username: &str) -> SyncResult<()> {
        tracing::info!(
            "Running notification script {} for {}",
            self.script.display(),
            username
        );
        let status = tokio::process::Command::new(&self.script)
            .env("ICSYNC_USERNAME", username)
            .status()
            .await
            .map_err(|e| crate::error::SyncError::fs(&self.script, e))?;
        if !status.success() {
            tracing::warn!(
                "Notification script exited with {}",
                status.code().unwrap_or(-1)
            );
        }
        Ok(())
    }
}

/// Fan-out to every configured notifier, ignoring individual failures —
/// a broken mailer must not mask the actionable log line.
pub struct NotifierSet {
    notifiers: Vec<Box<dyn ReauthNotifier>>,
}

impl NotifierSet {
    pub fn new(notifiers: Vec<Box<dyn ReauthNotifier>>) -> Self {
        Self { notifiers }
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }

    pub async fn notify_reauth_needed(&self, username: &str) {
        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify_reauth_needed(username).await {
                tracing::warn!("Notification failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct CountingNotifier(Arc<AtomicU32>);

    #[async_trait]
    impl ReauthNotifier for CountingNotifier {
        async fn notify_reauth_needed(&self, _username: &str) -> SyncResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingNotifier;

    #[async_trait]
    impl ReauthNotifier for FailingNotifier {
        async fn notify_reauth_needed(&self, _username: &str) -> SyncResult<()> {
            Err(crate::error::SyncError::Service("smtp down".into()))
        }
    }

    #[tokio::test]
    async fn test_set_runs_all_notifiers_despite_failure() {
        let count = Arc::new(AtomicU32::new(0));
        let set = NotifierSet::new(vec![
            Box::new(FailingNotifier),
            Box::new(CountingNotifier(Arc::clone(&count))),
        ]);
        set.notify_reauth_needed("u@example.com").await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_script_notifier_runs_script() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let script = dir.path().join("notify.sh");
        std::fs::write(
            &script,
            format!("#!/bin/sh\ntouch {}\n", marker.display()),
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        ScriptNotifier::new(script)
            .notify_reauth_needed("u@example.com")
            .await
            .unwrap();
        assert!(marker.exists());
    }

    #[test]
    fn test_smtp_settings_configured() {
        let mut s = SmtpSettings::default();
        assert!(!s.configured());
        s.to = Some("me@example.com".into());
        assert!(s.configured());
    }
}
