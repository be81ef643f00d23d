//! Typed errors carried through the reconciliation engine and sync loop.
//!
//! Every failure is a value of [`SyncError`]; the sync loop never sees a
//! panic or a stringly-typed error from the engine. Classification helpers
//! let callers distinguish transient failures (retry with backoff) from
//! session loss (re-authenticate) and genuinely fatal conditions.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The service rejected our session cookies or tokens mid-pass.
    #[error("session expired or invalidated")]
    AuthExpired,

    #[error("authentication failed: {reason}")]
    AuthFailed { reason: String },

    #[error("two-factor authentication required")]
    MfaRequired,

    #[error("two-factor authentication failed: {0}")]
    MfaFailed(String),

    /// 5xx or connection-level failure; worth retrying with backoff.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("rate limited by the service")]
    RateLimited,

    /// Signed URL returned 404 — the asset was most likely deleted remotely
    /// between enumeration and download.
    #[error("remote asset not found: {0}")]
    NotFound(String),

    #[error("download length mismatch: expected {expected_len} bytes, got {got_len}")]
    IntegrityMismatch { expected_len: u64, got_len: u64 },

    #[error("filesystem error at {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("cancelled")]
    Cancelled,

    /// Transport-level failure that is not one of the specific classes
    /// above (unexpected 4xx, malformed response body, ...).
    #[error("service error: {0}")]
    Service(String),
}

impl SyncError {
    /// Classify an HTTP status from the service into the taxonomy.
    pub fn from_status(status: u16, context: &str) -> Self {
        match status {
            401 | 421 | 450 => SyncError::AuthExpired,
            404 => SyncError::NotFound(context.to_string()),
            429 => SyncError::RateLimited,
            500..=599 => SyncError::ServiceUnavailable(format!("HTTP {status}: {context}")),
            _ => SyncError::Service(format!("HTTP {status}: {context}")),
        }
    }

    /// Wrap an I/O error with the path it happened on.
    pub fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Whether retrying the same operation with backoff can help.
    ///
    /// Integrity mismatches are retryable because they usually indicate a
    /// truncated transfer or an expired CDN URL, not corrupt source data.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ServiceUnavailable(_)
                | SyncError::RateLimited
                | SyncError::IntegrityMismatch { .. }
        )
    }

    /// Whether the sync loop must re-authenticate before continuing.
    pub fn requires_reauth(&self) -> bool {
        matches!(self, SyncError::AuthExpired)
    }

    /// Whether the current asset can be skipped while the pass continues.
    pub fn is_per_asset(&self) -> bool {
        matches!(
            self,
            SyncError::NotFound(_)
                | SyncError::IntegrityMismatch { .. }
                | SyncError::Filesystem { .. }
        )
    }

    /// Whether the error must terminate the configuration with a non-zero
    /// exit. Filesystem errors on the output root are promoted to fatal by
    /// the caller, which knows the path.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::AuthFailed { .. }
                | SyncError::MfaFailed(_)
                | SyncError::Config(_)
                | SyncError::Service(_)
        )
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            SyncError::ServiceUnavailable(e.to_string())
        } else if let Some(status) = e.status() {
            SyncError::from_status(status.as_u16(), &e.to_string())
        } else {
            SyncError::ServiceUnavailable(e.to_string())
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
