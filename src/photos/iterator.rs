//! Lazy iteration over the filtered asset set, newest-added first.
//!
//! The iterator owns the "added-date, not creation-date" contract: albums
//! are merged by `added_at`, `recent` caps the number of yielded assets,
//! and the created-date options act purely as filters because added order
//! and creation order need not agree.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};

use super::asset::{Asset, AssetKind};
use super::PhotoCollection;
use crate::error::SyncResult;

/// Filters and termination bounds applied during iteration.
#[derive(Debug, Clone, Default)]
pub struct IterationFilter {
    pub skip_photos: bool,
    pub skip_videos: bool,
    pub skip_live_photos: bool,
    pub skip_created_before: Option<DateTime<Utc>>,
    pub skip_created_after: Option<DateTime<Utc>>,
    /// Yield at most this many assets.
    pub recent: Option<u32>,
}

impl IterationFilter {
    /// Whether an asset passes the kind and created-date filters.
    ///
    /// Deletion safety depends on this function: only assets it admits are
    /// ever considered for remote deletion.
    pub fn admits(&self, asset: &Asset) -> bool {
        // A live photo is still a photo for the skip-photos filter; the
        // skip-live-photos flag alone only suppresses the video half and is
        // handled at selection time.
        match asset.kind() {
            AssetKind::Photo | AssetKind::Live if self.skip_photos => return false,
            AssetKind::Video if self.skip_videos => return false,
            _ => {}
        }
        let created = asset.created_at();
        if let Some(before) = self.skip_created_before {
            if created < before {
                return false;
            }
        }
        if let Some(after) = self.skip_created_after {
            if created > after {
                return false;
            }
        }
        true
    }
}

/// Buffered cursor over one collection's pages.
struct CollectionCursor {
    collection: PhotoCollection,
    buffer: VecDeque<Asset>,
    next_offset: Option<u64>,
}

impl CollectionCursor {
    fn new(collection: PhotoCollection) -> Self {
        Self {
            collection,
            buffer: VecDeque::new(),
            next_offset: Some(0),
        }
    }

    /// Ensure the head of the buffer is available, fetching the next page
    /// if needed. Returns the head without consuming it.
    async fn peek(&mut self) -> SyncResult<Option<&Asset>> {
        while self.buffer.is_empty() {
            let Some(offset) = self.next_offset else {
                return Ok(None);
            };
            let page = self.collection.fetch_page(offset).await?;
            self.next_offset = page.next_offset;
            self.buffer.extend(page.assets);
            if self.next_offset.is_none() {
                break;
            }
        }
        Ok(self.buffer.front())
    }

    fn pop(&mut self) -> Option<Asset> {
        self.buffer.pop_front()
    }
}

/// A lazy, finite, non-restartable sequence of assets in `added_at`
/// descending order, merged across the selected collections.
pub struct AssetIterator {
    cursors: Vec<CollectionCursor>,
    filter: IterationFilter,
    seen: HashSet<String>,
    yielded: u32,
}

impl AssetIterator {
    pub fn new(collections: Vec<PhotoCollection>, filter: IterationFilter) -> Self {
        Self {
            cursors: collections.into_iter().map(CollectionCursor::new).collect(),
            filter,
            seen: HashSet::new(),
            yielded: 0,
        }
    }

    /// Next asset that passes all filters, or `None` when the sequence is
    /// exhausted or the `recent` bound is reached.
    pub async fn next(&mut self) -> SyncResult<Option<Asset>> {
        loop {
            if let Some(limit) = self.filter.recent {
                if self.yielded >= limit {
                    return Ok(None);
                }
            }

            // k-way merge: pick the cursor whose head has the newest
            // added date. Each collection is itself already descending.
            let mut best: Option<(usize, DateTime<Utc>)> = None;
            for (i, cursor) in self.cursors.iter_mut().enumerate() {
                if let Some(head) = cursor.peek().await? {
                    let added = head.added_at();
                    if best.map(|(_, b)| added > b).unwrap_or(true) {
                        best = Some((i, added));
                    }
                }
            }

            let Some((idx, _)) = best else {
                return Ok(None);
            };
            let asset = self.cursors[idx]
                .pop()
                .expect("peek guaranteed a buffered head");

            // Union semantics: an asset in several selected albums is
            // yielded once, at its first (newest) appearance.
            if !self.seen.insert(asset.id().to_string()) {
                continue;
            }

            if !self.filter.admits(&asset) {
                continue;
            }

            self.yielded += 1;
            return Ok(Some(asset));
        }
    }
}
