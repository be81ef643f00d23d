//! Streaming download of one rendition to its `.part` file, with HTTP
//! range continuation, length verification, and atomic publication.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::Client;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::{SyncError, SyncResult};
use crate::local;
use crate::photos::Rendition;
use crate::retry::{retry_with_backoff, RetryConfig};

/// Bytes written between explicit flushes of the `.part` file. Bounds data
/// loss on power failure without paying a syscall per chunk.
const FLUSH_STRIDE_BYTES: u64 = 8 * 1024 * 1024;

#[derive(Clone)]
pub struct Downloader {
    client: Client,
    retry: RetryConfig,
    cancel: CancellationToken,
}

impl Downloader {
    pub fn new(client: Client, retry: RetryConfig, cancel: CancellationToken) -> Self {
        Self {
            client,
            retry,
            cancel,
        }
    }

    /// Download `rendition` to `target`, resuming from an existing partial.
    ///
    /// Transient failures are retried internally with bounded backoff (the
    /// retry layer consults the error taxonomy itself); auth expiry, 404s,
    /// and unexpected 4xx propagate to the caller. On cancellation the
    /// partial is flushed and left in place.
    pub async fn download(&self, rendition: &Rendition, target: &Path) -> SyncResult<()> {
        let part = local::prepare_partial(target).await?;
        retry_with_backoff(&self.retry, &self.cancel, || {
            self.attempt(rendition, target, &part)
        })
        .await
    }

    /// Single download attempt. Resumes from the partial's length when the
    /// server honors Range; falls back to a fresh download when it does not.
    async fn attempt(&self, rendition: &Rendition, target: &Path, part: &Path) -> SyncResult<()> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let mut have = match fs::metadata(part).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        // An over-long partial cannot belong to this rendition; restart.
        if have > rendition.byte_length {
            tracing::warn!(
                "Partial {} has {} bytes, expected at most {}; restarting",
                part.display(),
                have,
                rendition.byte_length
            );
            let _ = fs::remove_file(part).await;
            have = 0;
        }

        // A complete partial just needs publication.
        if have == rendition.byte_length && have > 0 {
            return local::publish(part, target).await;
        }

        let mut request = self.client.get(&rendition.url);
        if have > 0 {
            tracing::info!(
                "Resuming {} from byte {} (partial file exists)",
                target.display(),
                have
            );
            request = request.header("Range", format!("bytes={have}-"));
        }

        let response = request.send().await?;
        let status = response.status().as_u16();

        // 206 = resumed; any other success means the server ignored the
        // Range header and is sending the whole body.
        let truncate = match status {
            206 if have > 0 => false,
            _ if response.status().is_success() => {
                if have > 0 {
                    tracing::info!(
                        "Server returned {} instead of 206 for Range request, restarting {}",
                        status,
                        target.display()
                    );
                    have = 0;
                }
                true
            }
            _ => {
                return Err(SyncError::from_status(status, &rendition.url));
            }
        };

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(truncate)
            .append(!truncate)
            .open(part)
            .await
            .map_err(|e| SyncError::fs(part, e))?;

        let mut written = have;
        let mut unflushed: u64 = 0;
        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = self.cancel.cancelled() => {
                    // Leave the partial behind for the next pass.
                    file.flush().await.map_err(|e| SyncError::fs(part, e))?;
                    return Err(SyncError::Cancelled);
                }
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(SyncError::from)?;
            file.write_all(&chunk)
                .await
                .map_err(|e| SyncError::fs(part, e))?;
            written += chunk.len() as u64;
            unflushed += chunk.len() as u64;
            if unflushed >= FLUSH_STRIDE_BYTES {
                file.flush().await.map_err(|e| SyncError::fs(part, e))?;
                unflushed = 0;
            }
        }
        file.flush().await.map_err(|e| SyncError::fs(part, e))?;
        file.sync_data().await.map_err(|e| SyncError::fs(part, e))?;
        drop(file);

        if written != rendition.byte_length {
            // Truncated transfer or a URL that no longer matches the asset;
            // a stale partial would poison every later resume.
            let _ = fs::remove_file(part).await;
            return Err(SyncError::IntegrityMismatch {
                expected_len: rendition.byte_length,
                got_len: written,
            });
        }

        local::publish(part, target).await
    }
}

/// Set mtime (and atime) to the asset's creation instant, in UTC.
/// Pre-epoch timestamps are clamped to the epoch. Runs after every other
/// post-processing step so EXIF rewrites don't disturb the provenance.
pub async fn set_mtime(path: &Path, mtime: DateTime<Utc>) {
    let ts = mtime.timestamp();
    let path = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || set_file_mtime(&path, ts)).await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("Could not set mtime: {}", e),
        Err(e) => tracing::warn!("mtime task panicked: {}", e),
    }
}

fn set_file_mtime(path: &Path, timestamp: i64) -> std::io::Result<()> {
    let time = if timestamp >= 0 {
        UNIX_EPOCH + Duration::from_secs(timestamp as u64)
    } else {
        UNIX_EPOCH
            .checked_sub(Duration::from_secs(timestamp.unsigned_abs()))
            .unwrap_or(SystemTime::UNIX_EPOCH)
    };
    let times = std::fs::FileTimes::new().set_modified(time).set_accessed(time);
    let file = std::fs::File::options().write(true).open(path)?;
    file.set_times(times)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendition(len: u64, url: &str) -> Rendition {
        Rendition {
            byte_length: len,
            url: url.to_string(),
            content_type: "public.jpeg".to_string(),
        }
    }

    #[test]
    fn test_set_file_mtime_positive_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("pos.txt");
        std::fs::write(&p, b"test").unwrap();
        set_file_mtime(&p, 1_700_000_000).unwrap();
        let meta = std::fs::metadata(&p).unwrap();
        assert_eq!(
            meta.modified().unwrap(),
            UNIX_EPOCH + Duration::from_secs(1_700_000_000)
        );
    }

    #[test]
    fn test_set_file_mtime_negative_timestamp_clamps() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("neg.txt");
        std::fs::write(&p, b"test").unwrap();
        // Pre-1970 creation dates must not panic.
        set_file_mtime(&p, -86400).unwrap();
    }

    #[test]
    fn test_set_file_mtime_nonexistent_file() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("missing.txt");
        assert!(set_file_mtime(&p, 0).is_err());
    }

    #[tokio::test]
    async fn test_complete_partial_published_without_network() {
        // have == byte_length: the attempt publishes and never dials out
        // (the URL is unreachable, so reaching the network would error).
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("IMG_1.JPG");
        let part = local::part_path(&target);
        std::fs::write(&part, vec![7u8; 1000]).unwrap();

        let dl = Downloader::new(
            Client::new(),
            RetryConfig {
                max_retries: 0,
                base_delay_secs: 0,
                max_delay_secs: 0,
            },
            CancellationToken::new(),
        );
        let r = rendition(1000, "http://127.0.0.1:1/unreachable");
        dl.attempt(&r, &target, &part).await.unwrap();
        assert!(target.exists());
        assert!(!part.exists());
        assert_eq!(std::fs::metadata(&target).unwrap().len(), 1000);
    }

    #[tokio::test]
    async fn test_overlong_partial_discarded_before_restart() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("IMG_1.JPG");
        let part = local::part_path(&target);
        std::fs::write(&part, vec![7u8; 2000]).unwrap();

        let dl = Downloader::new(
            Client::new(),
            RetryConfig {
                max_retries: 0,
                base_delay_secs: 0,
                max_delay_secs: 0,
            },
            CancellationToken::new(),
        );
        // Unreachable URL: the attempt fails at the network step, but the
        // poisoned partial must already be gone.
        let r = rendition(1000, "http://127.0.0.1:1/unreachable");
        let result = dl.attempt(&r, &target, &part).await;
        assert!(result.is_err());
        assert!(!part.exists());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("IMG_1.JPG");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let dl = Downloader::new(Client::new(), RetryConfig::default(), cancel);
        let r = rendition(1000, "http://127.0.0.1:1/unreachable");
        let result = dl.download(&r, &target).await;
        assert!(matches!(result.unwrap_err(), SyncError::Cancelled));
    }

    #[tokio::test]
    async fn test_unreachable_host_classified_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("IMG_1.JPG");
        let dl = Downloader::new(
            Client::new(),
            RetryConfig {
                max_retries: 0,
                base_delay_secs: 0,
                max_delay_secs: 0,
            },
            CancellationToken::new(),
        );
        let r = rendition(1000, "http://127.0.0.1:1/unreachable");
        let part = local::prepare_partial(&target).await.unwrap();
        let result = dl.attempt(&r, &target, &part).await;
        assert!(matches!(
            result.unwrap_err(),
            SyncError::ServiceUnavailable(_)
        ));
    }
}
