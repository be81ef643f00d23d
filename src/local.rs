//! Local filesystem index: what do we already have for an asset, and where
//! do new bytes go.
//!
//! Partial downloads live next to their target as `<name>.part`; at most
//! one partial exists per target. Publication is an atomic same-directory
//! rename, so a file is never visible at its final path with fewer bytes
//! than the rendition's length.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::fs;

use crate::error::{SyncError, SyncResult};
use crate::naming::NamingPolicy;
use crate::photos::Rendition;
use crate::types::FileMatchPolicy;

/// What the filesystem holds for one rendition target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalState {
    Missing,
    Existing { path: PathBuf, byte_length: u64 },
    /// An interrupted download; `have_bytes` of the target are on disk in
    /// the `.part` file.
    Partial { path: PathBuf, have_bytes: u64 },
    /// Present under a path an older naming policy produced. Accepted as-is,
    /// never renamed.
    LegacyAt { path: PathBuf },
}

/// Result of probing the admissible paths of a rendition.
#[derive(Debug, Clone)]
pub struct Probe {
    pub state: LocalState,
    /// Where a fresh download must be written. Already collision-resolved
    /// under `name-size-dedup-with-suffix`.
    pub target: PathBuf,
}

/// Outcome of a guarded local delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The file on disk does not match the asset record; left alone.
    Conflict,
    Missing,
}

/// The partial-file path for a target: the exact target name plus `.part`.
pub fn part_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    target.with_file_name(name)
}

/// Probe the admissible paths of a rendition, canonical path first.
///
/// Under the dedup policy, a canonical-path file whose length differs from
/// the rendition belongs to a colliding asset; the probe transparently
/// redirects to the `-{byte_length}` suffixed path.
pub async fn probe(
    admissible: &[PathBuf],
    rendition: &Rendition,
    policy: FileMatchPolicy,
) -> SyncResult<Probe> {
    let canonical = admissible
        .first()
        .ok_or_else(|| SyncError::Config("empty admissible path list".into()))?;

    for (i, path) in admissible.iter().enumerate() {
        let Ok(meta) = fs::metadata(path).await else {
            continue;
        };
        if i == 0 {
            if policy == FileMatchPolicy::NameSizeDedupWithSuffix
                && meta.len() != rendition.byte_length
            {
                let dedup = NamingPolicy::dedup_path(canonical, rendition.byte_length);
                tracing::debug!("{} deduplicated", dedup.display());
                return probe_target(dedup).await;
            }
            return Ok(Probe {
                state: LocalState::Existing {
                    path: path.clone(),
                    byte_length: meta.len(),
                },
                target: canonical.clone(),
            });
        }
        return Ok(Probe {
            state: LocalState::LegacyAt { path: path.clone() },
            target: canonical.clone(),
        });
    }

    probe_target(canonical.clone()).await
}

async fn probe_target(target: PathBuf) -> SyncResult<Probe> {
    if let Ok(meta) = fs::metadata(&target).await {
        return Ok(Probe {
            state: LocalState::Existing {
                path: target.clone(),
                byte_length: meta.len(),
            },
            target,
        });
    }
    let part = part_path(&target);
    if let Ok(meta) = fs::metadata(&part).await {
        return Ok(Probe {
            state: LocalState::Partial {
                path: target.clone(),
                have_bytes: meta.len(),
            },
            target,
        });
    }
    Ok(Probe {
        state: LocalState::Missing,
        target,
    })
}

/// Make sure the target's directory exists and report where the partial
/// should be written.
pub async fn prepare_partial(target: &Path) -> SyncResult<PathBuf> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| SyncError::fs(parent, e))?;
    }
    Ok(part_path(target))
}

/// Atomically publish a completed partial at its final path. On failure the
/// partial is left in place for the next pass to resume.
pub async fn publish(part: &Path, target: &Path) -> SyncResult<()> {
    fs::rename(part, target)
        .await
        .map_err(|e| SyncError::fs(target, e))
}

/// Remove a local file, but only if it still matches the asset record it is
/// being deleted on behalf of: the byte length must equal the rendition's,
/// and when the file carries our mtime provenance it must agree with the
/// asset's creation instant.
pub async fn delete_local(
    path: &Path,
    rendition: &Rendition,
    created: Option<DateTime<Utc>>,
) -> SyncResult<DeleteOutcome> {
    let meta = match fs::metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(DeleteOutcome::Missing),
        Err(e) => return Err(SyncError::fs(path, e)),
    };

    if meta.len() != rendition.byte_length {
        tracing::warn!(
            "Not deleting {}: size {} disagrees with asset record {}",
            path.display(),
            meta.len(),
            rendition.byte_length
        );
        return Ok(DeleteOutcome::Conflict);
    }

    if let (Some(created), Ok(modified)) = (created, meta.modified()) {
        let mtime: DateTime<Utc> = modified.into();
        let drift = (mtime - created).num_seconds().abs();
        if drift > 2 {
            tracing::warn!(
                "Not deleting {}: mtime {} disagrees with asset record {}",
                path.display(),
                mtime,
                created
            );
            return Ok(DeleteOutcome::Conflict);
        }
    }

    fs::remove_file(path)
        .await
        .map_err(|e| SyncError::fs(path, e))?;
    Ok(DeleteOutcome::Deleted)
}

/// Remove empty directories under `root`, deepest first. Only directories
/// the folder template could have created are touched; `root` itself stays.
pub async fn remove_empty_dirs(root: &Path) -> SyncResult<()> {
    let mut dirs: Vec<PathBuf> = Vec::new();
    collect_dirs(root, &mut dirs).await?;
    // Deepest first so a parent emptied by its children is also removed.
    dirs.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    for dir in dirs {
        if dir == root {
            continue;
        }
        // remove_dir fails on non-empty directories, which is exactly the
        // guard we want.
        if fs::remove_dir(&dir).await.is_ok() {
            tracing::debug!("Removed empty directory {}", dir.display());
        }
    }
    Ok(())
}

async fn collect_dirs(root: &Path, out: &mut Vec<PathBuf>) -> SyncResult<()> {
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(SyncError::fs(&dir, e)),
        };
        out.push(dir.clone());
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SyncError::fs(&dir, e))?
        {
            if entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false)
            {
                pending.push(entry.path());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendition(byte_length: u64) -> Rendition {
        Rendition {
            byte_length,
            url: "https://cdn/x".to_string(),
            content_type: "public.jpeg".to_string(),
        }
    }

    #[test]
    fn test_part_path_appends_suffix() {
        assert_eq!(
            part_path(Path::new("/out/IMG_1.JPG")),
            PathBuf::from("/out/IMG_1.JPG.part")
        );
    }

    #[tokio::test]
    async fn test_probe_missing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("IMG_1.JPG");
        let probe = probe(
            &[target.clone()],
            &rendition(100),
            FileMatchPolicy::NameSizeDedupWithSuffix,
        )
        .await
        .unwrap();
        assert_eq!(probe.state, LocalState::Missing);
        assert_eq!(probe.target, target);
    }

    #[tokio::test]
    async fn test_probe_existing_matching_size() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("IMG_1.JPG");
        std::fs::write(&target, vec![0u8; 100]).unwrap();
        let probe = probe(
            &[target.clone()],
            &rendition(100),
            FileMatchPolicy::NameSizeDedupWithSuffix,
        )
        .await
        .unwrap();
        assert_eq!(
            probe.state,
            LocalState::Existing {
                path: target,
                byte_length: 100
            }
        );
    }

    #[tokio::test]
    async fn test_probe_size_mismatch_redirects_to_dedup_path() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("IMG_0001.JPG");
        // A different asset's file occupies the canonical path.
        std::fs::write(&target, vec![0u8; 12345]).unwrap();
        let probe = probe(
            &[target.clone()],
            &rendition(67890),
            FileMatchPolicy::NameSizeDedupWithSuffix,
        )
        .await
        .unwrap();
        assert_eq!(probe.state, LocalState::Missing);
        assert_eq!(probe.target, dir.path().join("IMG_0001-67890.JPG"));
    }

    #[tokio::test]
    async fn test_probe_dedup_path_already_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("IMG_0001.JPG");
        std::fs::write(&target, vec![0u8; 12345]).unwrap();
        let dedup = dir.path().join("IMG_0001-67890.JPG");
        std::fs::write(&dedup, vec![0u8; 67890]).unwrap();
        let probe = probe(
            &[target],
            &rendition(67890),
            FileMatchPolicy::NameSizeDedupWithSuffix,
        )
        .await
        .unwrap();
        assert!(matches!(probe.state, LocalState::Existing { path, .. } if path == dedup));
    }

    #[tokio::test]
    async fn test_probe_id7_never_dedups() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("IMG_0001_TOKEN.JPG");
        std::fs::write(&target, vec![0u8; 55]).unwrap();
        // Size differs but under name-id7 the name is already unique.
        let probe = probe(&[target.clone()], &rendition(100), FileMatchPolicy::NameId7)
            .await
            .unwrap();
        assert!(matches!(probe.state, LocalState::Existing { .. }));
    }

    #[tokio::test]
    async fn test_probe_legacy_path() {
        let dir = tempfile::tempdir().unwrap();
        let canonical = dir.path().join("IMG_1.JPG");
        let legacy = dir.path().join("IMG_1-original.JPG");
        std::fs::write(&legacy, vec![0u8; 100]).unwrap();
        let probe = probe(
            &[canonical.clone(), legacy.clone()],
            &rendition(100),
            FileMatchPolicy::NameSizeDedupWithSuffix,
        )
        .await
        .unwrap();
        assert_eq!(probe.state, LocalState::LegacyAt { path: legacy });
        // New downloads would still land at the canonical path.
        assert_eq!(probe.target, canonical);
    }

    #[tokio::test]
    async fn test_probe_partial() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("IMG_1.JPG");
        std::fs::write(part_path(&target), vec![0u8; 60]).unwrap();
        let probe = probe(
            &[target.clone()],
            &rendition(100),
            FileMatchPolicy::NameSizeDedupWithSuffix,
        )
        .await
        .unwrap();
        assert_eq!(
            probe.state,
            LocalState::Partial {
                path: target,
                have_bytes: 60
            }
        );
    }

    #[tokio::test]
    async fn test_publish_renames_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("IMG_1.JPG");
        let part = prepare_partial(&target).await.unwrap();
        std::fs::write(&part, b"complete").unwrap();
        publish(&part, &target).await.unwrap();
        assert!(target.exists());
        assert!(!part.exists());
        assert_eq!(std::fs::read(&target).unwrap(), b"complete");
    }

    #[tokio::test]
    async fn test_prepare_partial_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("2025/01/02/IMG_1.JPG");
        let part = prepare_partial(&target).await.unwrap();
        assert!(target.parent().unwrap().is_dir());
        assert_eq!(part, part_path(&target));
    }

    #[tokio::test]
    async fn test_delete_local_matching_size() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("IMG_1.JPG");
        std::fs::write(&target, vec![0u8; 100]).unwrap();
        let outcome = delete_local(&target, &rendition(100), None).await.unwrap();
        assert_eq!(outcome, DeleteOutcome::Deleted);
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_delete_local_size_conflict_refused() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("IMG_1.JPG");
        std::fs::write(&target, vec![0u8; 50]).unwrap();
        let outcome = delete_local(&target, &rendition(100), None).await.unwrap();
        assert_eq!(outcome, DeleteOutcome::Conflict);
        assert!(target.exists());
    }

    #[tokio::test]
    async fn test_delete_local_missing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("IMG_1.JPG");
        let outcome = delete_local(&target, &rendition(100), None).await.unwrap();
        assert_eq!(outcome, DeleteOutcome::Missing);
    }

    #[tokio::test]
    async fn test_delete_local_mtime_conflict_refused() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("IMG_1.JPG");
        std::fs::write(&target, vec![0u8; 100]).unwrap();
        // File mtime is "now"; the asset record says 2020.
        let created = DateTime::parse_from_rfc3339("2020-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let outcome = delete_local(&target, &rendition(100), Some(created))
            .await
            .unwrap();
        assert_eq!(outcome, DeleteOutcome::Conflict);
    }

    #[tokio::test]
    async fn test_remove_empty_dirs_bottom_up() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("2025/01/02");
        std::fs::create_dir_all(&nested).unwrap();
        let kept = dir.path().join("2025/02");
        std::fs::create_dir_all(&kept).unwrap();
        std::fs::write(kept.join("keep.jpg"), b"x").unwrap();

        remove_empty_dirs(dir.path()).await.unwrap();

        assert!(!dir.path().join("2025/01").exists());
        assert!(kept.join("keep.jpg").exists());
        assert!(dir.path().exists());
    }
}
