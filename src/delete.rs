//! Deletion planning and realization.
//!
//! Intents are collected while the main pass runs and realized strictly
//! after it finishes: local deletes mirror the remote Recently-Deleted
//! album, remote deletes enforce `--keep-icloud-recent-days` (and the
//! deprecated `--delete-after-download`). Every remote intent comes from
//! an asset that passed the active filters; filtered-out assets are never
//! deleted anywhere.

use chrono::{DateTime, Duration, Utc};
use tokio::fs;
use tokio_util::sync::CancellationToken;

use crate::download::{xmp, EngineOptions};
use crate::error::{SyncError, SyncResult};
use crate::local::{self, DeleteOutcome};
use crate::photos::{Asset, AssetIterator, IterationFilter, PhotoLibrary};
use crate::selector::apply_raw_policy;

/// Which deletions a configuration performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    /// Download only; touch nothing on either side.
    Copy,
    /// Remove local files whose assets sit in Recently Deleted.
    AutoDelete,
    /// Move remote assets older than N days to Recently Deleted. Zero
    /// deletes every processed asset.
    KeepRecentDays(i64),
    /// Deprecated: move only assets downloaded in this pass.
    DeleteAfterDownload,
}

/// One pending move-to-Recently-Deleted.
#[derive(Debug, Clone)]
pub struct RemoteDeleteIntent {
    pub record_name: String,
    pub change_tag: String,
    /// For log lines only.
    pub label: String,
}

impl RemoteDeleteIntent {
    pub fn for_asset(asset: &Asset) -> Self {
        let (record_name, change_tag) = asset.delete_target();
        Self {
            record_name,
            change_tag,
            label: asset
                .filename()
                .map(str::to_string)
                .unwrap_or_else(|| asset.id().to_string()),
        }
    }
}

/// Whether this asset earns a remote delete intent under the configured
/// mode. `downloaded_this_pass` distinguishes the deprecated
/// delete-after-download semantics from keep-recent-days 0.
pub fn wants_remote_delete(
    mode: DeleteMode,
    asset: &Asset,
    downloaded_this_pass: bool,
    now: DateTime<Utc>,
) -> bool {
    match mode {
        DeleteMode::Copy | DeleteMode::AutoDelete => false,
        DeleteMode::KeepRecentDays(days) => asset.created_at() < now - Duration::days(days),
        DeleteMode::DeleteAfterDownload => downloaded_this_pass,
    }
}

/// Service batch size for records/modify operations.
const DELETE_BATCH: usize = 50;

/// Realize remote delete intents in batches.
///
/// Auth expiry propagates to the caller, which re-authenticates and calls
/// again with the remaining intents (the retry-once contract lives in the
/// sync loop). Returns the number of assets moved.
pub async fn realize_remote_deletes(
    library: &PhotoLibrary,
    intents: &[RemoteDeleteIntent],
    dry_run: bool,
    cancel: &CancellationToken,
) -> SyncResult<u64> {
    if intents.is_empty() {
        return Ok(0);
    }

    if dry_run {
        for intent in intents {
            tracing::info!("[DRY RUN] Would delete {} in iCloud", intent.label);
        }
        return Ok(intents.len() as u64);
    }

    let mut moved = 0u64;
    for batch in intents.chunks(DELETE_BATCH) {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let targets: Vec<(String, String)> = batch
            .iter()
            .map(|i| (i.record_name.clone(), i.change_tag.clone()))
            .collect();
        library.move_to_recently_deleted(&targets).await?;
        for intent in batch {
            tracing::info!("Deleted {} in iCloud", intent.label);
        }
        moved += batch.len() as u64;
    }
    Ok(moved)
}

/// Scan the Recently Deleted album and delete matching local files.
///
/// Every rendition path the current configuration could have produced is
/// checked; companion `.xmp` sidecars go with their files. Deletes are
/// guarded: a file whose size disagrees with the asset record is left in
/// place with a warning.
pub async fn autodelete_photos(
    library: &PhotoLibrary,
    options: &EngineOptions,
    dry_run: bool,
    cancel: &CancellationToken,
) -> SyncResult<u64> {
    tracing::info!("Deleting any local files found in 'Recently Deleted'...");

    let mut deleted = 0u64;
    let mut iter = AssetIterator::new(
        vec![library.recently_deleted()],
        IterationFilter::default(),
    );
    while let Some(asset) = iter.next().await? {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        deleted += autodelete_one(&asset, options, dry_run).await?;
    }
    Ok(deleted)
}

async fn autodelete_one(
    asset: &Asset,
    options: &EngineOptions,
    dry_run: bool,
) -> SyncResult<u64> {
    let versions = apply_raw_policy(asset.versions(), options.selector.align_raw);
    let original = versions.get(&crate::photos::RenditionSize::Original).cloned();

    let mut deleted = 0u64;
    for (size, rendition) in &versions {
        let path = if size.is_live() {
            options
                .naming
                .download_dir(asset)
                .join(options.naming.live_video_filename(asset, *size))
        } else {
            options
                .naming
                .canonical_still_path(asset, *size, rendition, original.as_ref())
        };

        // The canonical path plus the collision-suffixed variant the dedup
        // policy could have written.
        let mut candidates = vec![path.clone()];
        if options.file_match_policy == crate::types::FileMatchPolicy::NameSizeDedupWithSuffix {
            candidates.push(crate::naming::NamingPolicy::dedup_path(
                &path,
                rendition.byte_length,
            ));
        }

        for candidate in candidates {
            if fs::metadata(&candidate).await.is_err() {
                continue;
            }
            if dry_run {
                tracing::info!("[DRY RUN] Would delete {}", candidate.display());
                deleted += 1;
                continue;
            }
            match local::delete_local(&candidate, rendition, None).await? {
                DeleteOutcome::Deleted => {
                    tracing::info!("Deleted {}", candidate.display());
                    deleted += 1;
                    let sidecar = xmp::sidecar_path(&candidate);
                    if fs::remove_file(&sidecar).await.is_ok() {
                        tracing::info!("Deleted {}", sidecar.display());
                    }
                }
                DeleteOutcome::Conflict | DeleteOutcome::Missing => {}
            }
        }
    }
    Ok(deleted)
}
