//! Per-asset reconciliation: decide, for every selected rendition, whether
//! it already exists locally, needs a fresh download, or resumes a partial,
//! and run the post-download side effects (mtime, EXIF, XMP sidecar).

pub mod exif;
pub mod file;
pub mod xmp;

pub use file::Downloader;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Local, Utc};

use crate::error::SyncResult;
use crate::local::{self, LocalState};
use crate::naming::NamingPolicy;
use crate::photos::{Asset, Rendition};
use crate::selector::{select_versions, SelectorOptions};
use crate::types::{FileMatchPolicy, VersionSize};

/// What happened to one rendition target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetEventKind {
    /// Present under an admissible path; nothing downloaded.
    Existed,
    /// Dry run: would have been downloaded.
    WouldDownload,
    /// Bytes were fetched (fresh or resumed) and the file published.
    Downloaded,
}

#[derive(Debug, Clone)]
pub struct AssetEvent {
    pub kind: AssetEventKind,
    pub path: PathBuf,
}

/// Hook for downstream catalog integration. Implementations must be cheap;
/// they run inline with the sequential pass.
pub trait SyncObserver: Send + Sync {
    fn asset_event(&self, _asset: &Asset, _event: &AssetEvent) {}
    /// Every rendition (stills and live video) of the asset has been
    /// processed.
    fn all_sizes_complete(&self, _asset: &Asset) {}
}

/// Default observer: no hooks installed.
pub struct NoopObserver;
impl SyncObserver for NoopObserver {}

/// Reconciliation switches resolved from the account configuration.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub sizes: Vec<VersionSize>,
    pub selector: SelectorOptions,
    pub naming: NamingPolicy,
    pub file_match_policy: FileMatchPolicy,
    pub dry_run: bool,
    pub only_print_filenames: bool,
    pub set_exif_datetime: bool,
    pub xmp_sidecar: bool,
}

/// Summary of one asset's reconciliation, consumed by the pass loop for
/// `--until-found` accounting and delete-intent collection.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssetOutcome {
    pub downloaded: u32,
    pub existed: u32,
    pub skipped_errors: u32,
    /// At least one target was absent (so the consecutive-existing counter
    /// must reset, even in dry-run mode).
    pub missing_seen: bool,
}

impl AssetOutcome {
    /// Every processed target was already present.
    pub fn fully_existing(&self) -> bool {
        !self.missing_seen && self.existed > 0 && self.skipped_errors == 0
    }
}

pub struct ReconcileEngine {
    options: EngineOptions,
    downloader: Downloader,
    observer: Arc<dyn SyncObserver>,
}

impl ReconcileEngine {
    pub fn new(
        options: EngineOptions,
        downloader: Downloader,
        observer: Arc<dyn SyncObserver>,
    ) -> Self {
        Self {
            options,
            downloader,
            observer,
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Reconcile one asset: all selected stills, then the live video.
    ///
    /// Per-asset failures (404 on a signed URL, a full disk under one
    /// target, an irrecoverable length mismatch) are logged and counted;
    /// pass-level failures (auth expiry, rate limiting after retries)
    /// propagate to the sync loop.
    pub async fn process_asset(&self, asset: &Asset) -> SyncResult<AssetOutcome> {
        let mut outcome = AssetOutcome::default();
        let selection = select_versions(asset, &self.options.sizes, &self.options.selector);

        for (size, rendition) in &selection.stills {
            let admissible = self.options.naming.admissible_paths(
                asset,
                *size,
                rendition,
                selection.original.as_ref(),
            );
            self.process_target(asset, rendition, admissible, &mut outcome)
                .await?;
        }

        if let Some((live_size, live_rendition)) = &selection.live_video {
            let target = self
                .options
                .naming
                .download_dir(asset)
                .join(self.options.naming.live_video_filename(asset, *live_size));
            self.process_target(asset, live_rendition, vec![target], &mut outcome)
                .await?;
        }

        self.observer.all_sizes_complete(asset);
        Ok(outcome)
    }

    async fn process_target(
        &self,
        asset: &Asset,
        rendition: &Rendition,
        admissible: Vec<PathBuf>,
        outcome: &mut AssetOutcome,
    ) -> SyncResult<()> {
        let probe = local::probe(&admissible, rendition, self.options.file_match_policy).await?;

        match probe.state {
            LocalState::Existing { path, .. } | LocalState::LegacyAt { path } => {
                tracing::debug!("{} already exists", path.display());
                outcome.existed += 1;
                self.observer.asset_event(
                    asset,
                    &AssetEvent {
                        kind: AssetEventKind::Existed,
                        path,
                    },
                );
            }
            LocalState::Missing | LocalState::Partial { .. } => {
                outcome.missing_seen = true;
                if self.options.only_print_filenames {
                    println!("{}", probe.target.display());
                    return Ok(());
                }
                if self.options.dry_run {
                    tracing::info!("[DRY RUN] Would download {}", probe.target.display());
                    self.observer.asset_event(
                        asset,
                        &AssetEvent {
                            kind: AssetEventKind::WouldDownload,
                            path: probe.target,
                        },
                    );
                    return Ok(());
                }
                match self.fetch_and_publish(asset, rendition, &probe.target).await {
                    Ok(()) => {
                        outcome.downloaded += 1;
                        tracing::info!("Downloaded {}", probe.target.display());
                        self.observer.asset_event(
                            asset,
                            &AssetEvent {
                                kind: AssetEventKind::Downloaded,
                                path: probe.target,
                            },
                        );
                    }
                    Err(e) if e.is_per_asset() => {
                        tracing::warn!(
                            "Skipping {} for asset {}: {}",
                            probe.target.display(),
                            asset.id(),
                            e
                        );
                        outcome.skipped_errors += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    async fn fetch_and_publish(
        &self,
        asset: &Asset,
        rendition: &Rendition,
        target: &PathBuf,
    ) -> SyncResult<()> {
        self.downloader.download(rendition, target).await?;

        if self.options.set_exif_datetime {
            self.maybe_set_exif(asset, target).await;
        }
        if self.options.xmp_sidecar {
            xmp::write_sidecar(target, asset).await?;
        }
        // Stamp provenance last; the EXIF rewrite above would otherwise
        // reset the mtime to "now".
        file::set_mtime(target, asset.created_at()).await;
        Ok(())
    }

    /// Inject `DateTimeOriginal` from the creation date into JPEGs that
    /// carry no EXIF timestamp of their own.
    async fn maybe_set_exif(&self, asset: &Asset, target: &PathBuf) {
        let ext = target
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        if !matches!(ext.as_str(), "jpg" | "jpeg") {
            return;
        }

        let date_str = self
            .exif_datetime(asset.created_at())
            .format("%Y:%m:%d %H:%M:%S")
            .to_string();
        let path = target.clone();
        let result = tokio::task::spawn_blocking(move || match exif::get_photo_exif(&path) {
            Ok(None) => {
                if let Err(e) = exif::set_photo_exif(&path, &date_str) {
                    tracing::warn!("Failed to set EXIF on {}: {}", path.display(), e);
                }
            }
            Ok(Some(_)) => {}
            Err(e) => {
                tracing::warn!("Failed to read EXIF from {}: {}", path.display(), e);
            }
        })
        .await;
        if let Err(e) = result {
            tracing::warn!("EXIF task panicked: {}", e);
        }
    }

    fn exif_datetime(&self, created: DateTime<Utc>) -> chrono::NaiveDateTime {
        if self.options.naming.use_os_locale {
            created.with_timezone(&Local).naive_local()
        } else {
            created.naive_utc()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::photos::{AssetItemType, RenditionSize};
    use crate::retry::RetryConfig;
    use crate::types::{LivePhotoMovFilenamePolicy, LivePhotoSize, RawTreatmentPolicy};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    struct RecordingObserver {
        events: Mutex<Vec<(String, AssetEventKind)>>,
        completed: Mutex<Vec<String>>,
    }

    impl SyncObserver for RecordingObserver {
        fn asset_event(&self, asset: &Asset, event: &AssetEvent) {
            self.events
                .lock()
                .unwrap()
                .push((asset.id().to_string(), event.kind));
        }
        fn all_sizes_complete(&self, asset: &Asset) {
            self.completed.lock().unwrap().push(asset.id().to_string());
        }
    }

    fn engine_with(
        dir: &std::path::Path,
        dry_run: bool,
        observer: Arc<dyn SyncObserver>,
    ) -> ReconcileEngine {
        let options = EngineOptions {
            sizes: vec![VersionSize::Original],
            selector: SelectorOptions {
                force_size: false,
                align_raw: RawTreatmentPolicy::AsIs,
                skip_live_photos: false,
                live_photo_size: LivePhotoSize::Original,
            },
            naming: NamingPolicy {
                directory: dir.to_path_buf(),
                folder_structure: "{:%Y/%m/%d}".to_string(),
                keep_unicode: false,
                file_match_policy: FileMatchPolicy::NameSizeDedupWithSuffix,
                live_photo_mov_policy: LivePhotoMovFilenamePolicy::Suffix,
                use_os_locale: false,
            },
            file_match_policy: FileMatchPolicy::NameSizeDedupWithSuffix,
            dry_run,
            only_print_filenames: false,
            set_exif_datetime: false,
            xmp_sidecar: false,
        };
        let downloader = Downloader::new(
            reqwest::Client::new(),
            RetryConfig {
                max_retries: 0,
                base_delay_secs: 0,
                max_delay_secs: 0,
            },
            CancellationToken::new(),
        );
        ReconcileEngine::new(options, downloader, observer)
    }

    fn asset_with_original(id: &str, filename: &str, byte_length: u64) -> Asset {
        let created = DateTime::parse_from_rfc3339("2025-01-02T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let versions = HashMap::from([(
            RenditionSize::Original,
            Rendition {
                byte_length,
                url: "http://127.0.0.1:1/unreachable".to_string(),
                content_type: "public.jpeg".to_string(),
            },
        )]);
        Asset::for_tests(
            id,
            Some(filename),
            AssetItemType::Image,
            created,
            created,
            versions,
        )
    }

    #[tokio::test]
    async fn test_existing_file_not_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        let target_dir = dir.path().join("2025/01/02");
        std::fs::create_dir_all(&target_dir).unwrap();
        std::fs::write(target_dir.join("IMG_1.JPG"), vec![0u8; 100]).unwrap();

        let observer = Arc::new(RecordingObserver {
            events: Mutex::new(Vec::new()),
            completed: Mutex::new(Vec::new()),
        });
        let engine = engine_with(dir.path(), false, observer.clone());
        let asset = asset_with_original("A1", "IMG_1.JPG", 100);

        let outcome = engine.process_asset(&asset).await.unwrap();
        assert_eq!(outcome.existed, 1);
        assert_eq!(outcome.downloaded, 0);
        assert!(outcome.fully_existing());
        assert_eq!(
            observer.events.lock().unwrap()[0],
            ("A1".to_string(), AssetEventKind::Existed)
        );
        assert_eq!(observer.completed.lock().unwrap().as_slice(), ["A1"]);
    }

    #[tokio::test]
    async fn test_dry_run_reports_would_download() {
        let dir = tempfile::tempdir().unwrap();
        let observer = Arc::new(RecordingObserver {
            events: Mutex::new(Vec::new()),
            completed: Mutex::new(Vec::new()),
        });
        let engine = engine_with(dir.path(), true, observer.clone());
        let asset = asset_with_original("A1", "IMG_1.JPG", 100);

        let outcome = engine.process_asset(&asset).await.unwrap();
        assert!(outcome.missing_seen);
        assert!(!outcome.fully_existing());
        assert_eq!(outcome.downloaded, 0);
        assert_eq!(
            observer.events.lock().unwrap()[0].1,
            AssetEventKind::WouldDownload
        );
        // Dry run leaves no files behind.
        assert!(!dir.path().join("2025").exists());
    }

    #[tokio::test]
    async fn test_unreachable_cdn_aborts_pass() {
        // Connection-level failures are pass-level (retry/backoff), not
        // per-asset skips.
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(dir.path(), false, Arc::new(NoopObserver));
        let asset = asset_with_original("A1", "IMG_1.JPG", 100);
        let result = engine.process_asset(&asset).await;
        assert!(matches!(
            result.unwrap_err(),
            SyncError::ServiceUnavailable(_)
        ));
    }

    #[tokio::test]
    async fn test_legacy_file_counts_as_existing() {
        let dir = tempfile::tempdir().unwrap();
        let target_dir = dir.path().join("2025/01/02");
        std::fs::create_dir_all(&target_dir).unwrap();
        std::fs::write(target_dir.join("IMG_1-original.JPG"), vec![0u8; 100]).unwrap();

        let engine = engine_with(dir.path(), false, Arc::new(NoopObserver));
        let asset = asset_with_original("A1", "IMG_1.JPG", 100);
        let outcome = engine.process_asset(&asset).await.unwrap();
        assert_eq!(outcome.existed, 1);
        assert!(outcome.fully_existing());
        // No rename happened.
        assert!(target_dir.join("IMG_1-original.JPG").exists());
        assert!(!target_dir.join("IMG_1.JPG").exists());
    }
}
