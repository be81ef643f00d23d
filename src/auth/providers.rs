//! Credential and MFA acquisition contracts.
//!
//! The engine never reads passwords itself; it walks an ordered chain of
//! [`CredentialProvider`]s and asks the configured [`MfaProvider`] for
//! second-factor codes. Console and parameter/environment providers ship
//! in-tree; keyring and web-UI front ends implement the same traits out of
//! tree.

use std::io::IsTerminal;

use async_trait::async_trait;

use crate::error::{SyncError, SyncResult};
use crate::types::{MfaProviderKind, PasswordProviderKind};

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// A password for the account, or `None` when this provider has
    /// nothing to offer (the chain then moves on).
    async fn password(&self, username: &str) -> SyncResult<Option<String>>;

    fn name(&self) -> &'static str;
}

#[async_trait]
pub trait MfaProvider: Send + Sync {
    /// The 6-digit verification code sent to a trusted device.
    async fn code(&self, username: &str) -> SyncResult<String>;
}

/// `--password` / `ICLOUD_PASSWORD` passthrough.
pub struct ParameterProvider {
    password: Option<String>,
}

impl ParameterProvider {
    pub fn new(password: Option<String>) -> Self {
        Self { password }
    }
}

#[async_trait]
impl CredentialProvider for ParameterProvider {
    async fn password(&self, _username: &str) -> SyncResult<Option<String>> {
        Ok(self.password.clone())
    }

    fn name(&self) -> &'static str {
        "parameter"
    }
}

/// Interactive prompt on the controlling terminal. Must be the last
/// provider in the chain; refuses to prompt without a TTY so headless runs
/// fail fast instead of hanging.
pub struct ConsoleProvider;

#[async_trait]
impl CredentialProvider for ConsoleProvider {
    async fn password(&self, username: &str) -> SyncResult<Option<String>> {
        if !std::io::stdin().is_terminal() {
            return Ok(None);
        }
        let prompt = format!("iCloud password for {username}: ");
        let password = tokio::task::block_in_place(|| rpassword::prompt_password(prompt))
            .map_err(|e| SyncError::AuthFailed {
                reason: format!("password prompt failed: {e}"),
            })?;
        Ok(Some(password))
    }

    fn name(&self) -> &'static str {
        "console"
    }
}

/// Placeholder for providers whose implementations live out of tree
/// (OS keyring, web UI). Always passes to the next provider in the chain.
pub struct UnavailableProvider {
    kind: &'static str,
}

#[async_trait]
impl CredentialProvider for UnavailableProvider {
    async fn password(&self, _username: &str) -> SyncResult<Option<String>> {
        tracing::warn!(
            "Password provider '{}' is not built into this binary, skipping",
            self.kind
        );
        Ok(None)
    }

    fn name(&self) -> &'static str {
        self.kind
    }
}

/// Ordered chain over the configured providers.
pub struct ProviderChain {
    providers: Vec<Box<dyn CredentialProvider>>,
}

impl ProviderChain {
    pub fn from_kinds(kinds: &[PasswordProviderKind], parameter: Option<String>) -> Self {
        let providers = kinds
            .iter()
            .map(|kind| -> Box<dyn CredentialProvider> {
                match kind {
                    PasswordProviderKind::Parameter => {
                        Box::new(ParameterProvider::new(parameter.clone()))
                    }
                    PasswordProviderKind::Console => Box::new(ConsoleProvider),
                    PasswordProviderKind::Keyring => {
                        Box::new(UnavailableProvider { kind: "keyring" })
                    }
                    PasswordProviderKind::Webui => Box::new(UnavailableProvider { kind: "webui" }),
                }
            })
            .collect();
        Self { providers }
    }

    /// First password any provider produces, in configured order.
    pub async fn password(&self, username: &str) -> SyncResult<String> {
        for provider in &self.providers {
            if let Some(password) = provider.password(username).await? {
                tracing::debug!("Password obtained from provider '{}'", provider.name());
                return Ok(password);
            }
        }
        Err(SyncError::AuthFailed {
            reason: "no configured password provider produced a password".to_string(),
        })
    }
}

/// Read the MFA code from the terminal.
pub struct ConsoleMfaProvider;

#[async_trait]
impl MfaProvider for ConsoleMfaProvider {
    async fn code(&self, username: &str) -> SyncResult<String> {
        if !std::io::stdin().is_terminal() {
            // A code is needed but nobody can type one; the sync loop turns
            // this into a notification instead of hanging forever.
            return Err(SyncError::MfaRequired);
        }
        println!("Enter the verification code for {username}:");
        let code = tokio::task::block_in_place(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|_| line)
        })
        .map_err(|e| SyncError::MfaFailed(format!("failed to read code: {e}")))?;
        let code = code.trim().to_string();
        if code.is_empty() {
            return Err(SyncError::MfaFailed("empty verification code".to_string()));
        }
        Ok(code)
    }
}

pub fn mfa_provider_for(kind: MfaProviderKind) -> Box<dyn MfaProvider> {
    match kind {
        MfaProviderKind::Console => Box::new(ConsoleMfaProvider),
        MfaProviderKind::Webui => {
            tracing::warn!("MFA provider 'webui' is not built into this binary, using console");
            Box::new(ConsoleMfaProvider)
        }
    }
}
