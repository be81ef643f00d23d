//! Version selection: which renditions to download for an asset, and under
//! which logical identity.
//!
//! Everything here is a pure function of the asset's rendition map and the
//! user's size list — the service, session, and filesystem are never
//! consulted.

use std::collections::HashMap;

use crate::photos::{Asset, Rendition, RenditionSize};
use crate::types::{LivePhotoSize, RawTreatmentPolicy, VersionSize};

#[derive(Debug, Clone)]
pub struct SelectorOptions {
    /// Only download the requested sizes; never fall back to original for a
    /// missing medium/thumb. `adjusted` and `alternative` are not forced.
    pub force_size: bool,
    pub align_raw: RawTreatmentPolicy,
    pub skip_live_photos: bool,
    pub live_photo_size: LivePhotoSize,
}

/// The download plan for one asset.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Still renditions in request order. The size is the logical identity
    /// used for naming: a fallback selected in place of a missing size is
    /// labeled `Original`.
    pub stills: Vec<(RenditionSize, Rendition)>,
    /// The video half of a live photo, selected once per asset.
    pub live_video: Option<(RenditionSize, Rendition)>,
    /// The original rendition after RAW relabeling, for naming decisions
    /// (the adjusted-suffix rule compares extensions against it).
    pub original: Option<Rendition>,
}

/// Relabel a RAW+JPEG pair according to the `--align-raw` policy. With only
/// one representation, or a policy already satisfied, the map is unchanged.
pub fn apply_raw_policy(
    versions: &HashMap<RenditionSize, Rendition>,
    policy: RawTreatmentPolicy,
) -> HashMap<RenditionSize, Rendition> {
    let mut versions = versions.clone();
    let should_swap = match (
        versions.get(&RenditionSize::Original),
        versions.get(&RenditionSize::Alternative),
    ) {
        (Some(original), Some(alternative)) => match policy {
            RawTreatmentPolicy::AsIs => false,
            RawTreatmentPolicy::AsOriginal => alternative.is_raw(),
            RawTreatmentPolicy::AsAlternative => original.is_raw(),
        },
        _ => false,
    };
    if should_swap {
        let o = versions
            .remove(&RenditionSize::Original)
            .expect("swap requires both representations");
        let a = versions
            .remove(&RenditionSize::Alternative)
            .expect("swap requires both representations");
        versions.insert(RenditionSize::Original, a);
        versions.insert(RenditionSize::Alternative, o);
    }
    versions
}

/// Choose the renditions to download for `asset` given the requested size
/// list (ordered, duplicates ignored).
pub fn select_versions(
    asset: &Asset,
    sizes: &[VersionSize],
    opts: &SelectorOptions,
) -> Selection {
    let versions = apply_raw_policy(asset.versions(), opts.align_raw);
    let requested: Vec<VersionSize> = dedup_preserving_order(sizes);
    let original_requested = requested.contains(&VersionSize::Original);

    let mut selection = Selection::default();
    let mut original_selected = false;
    let mut push = |selection: &mut Selection, size: RenditionSize, r: &Rendition| {
        if size == RenditionSize::Original {
            if original_selected {
                return;
            }
            original_selected = true;
        }
        selection.stills.push((size, r.clone()));
    };

    for size in &requested {
        let rendition_size = RenditionSize::from(*size);
        if let Some(r) = versions.get(&rendition_size) {
            push(&mut selection, rendition_size, r);
            continue;
        }

        // The requested size does not exist for this asset.
        match size {
            VersionSize::Original => {
                tracing::warn!("Asset {} has no original rendition", asset.id());
            }
            VersionSize::Adjusted | VersionSize::Alternative => {
                // No edit / no second representation: covered by original.
                // When original is also requested it is downloaded anyway.
                if !original_requested {
                    if let Some(orig) = versions.get(&RenditionSize::Original) {
                        push(&mut selection, RenditionSize::Original, orig);
                    }
                }
            }
            VersionSize::Medium | VersionSize::Thumb => {
                if opts.force_size {
                    tracing::warn!(
                        "{:?} size does not exist for asset {}, skipping (--force-size)",
                        size,
                        asset.id()
                    );
                } else if !original_requested {
                    if let Some(orig) = versions.get(&RenditionSize::Original) {
                        push(&mut selection, RenditionSize::Original, orig);
                    }
                }
            }
        }
    }

    if !opts.skip_live_photos {
        let live_size = opts.live_photo_size.to_rendition_size();
        if let Some(r) = versions.get(&live_size) {
            selection.live_video = Some((live_size, r.clone()));
        }
    }

    selection.original = versions.get(&RenditionSize::Original).cloned();
    selection
}

fn dedup_preserving_order(sizes: &[VersionSize]) -> Vec<VersionSize> {
    let mut seen = Vec::new();
    for s in sizes {
        if !seen.contains(s) {
            seen.push(*s);
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::photos::AssetItemType;
    use chrono::Utc;

    fn rendition(content_type: &str, byte_length: u64) -> Rendition {
        Rendition {
            byte_length,
            url: format!("https://cdn/{content_type}/{byte_length}"),
            content_type: content_type.to_string(),
        }
    }

    fn asset_with(versions: HashMap<RenditionSize, Rendition>) -> Asset {
        Asset::for_tests(
            "A1",
            Some("IMG_1.JPG"),
            AssetItemType::Image,
            Utc::now(),
            Utc::now(),
            versions,
        )
    }

    fn opts() -> SelectorOptions {
        SelectorOptions {
            force_size: false,
            align_raw: RawTreatmentPolicy::AsIs,
            skip_live_photos: false,
            live_photo_size: LivePhotoSize::Original,
        }
    }

    #[test]
    fn test_requested_size_present_is_selected() {
        let asset = asset_with(HashMap::from([
            (RenditionSize::Original, rendition("public.jpeg", 100)),
            (RenditionSize::Medium, rendition("public.jpeg", 50)),
        ]));
        let sel = select_versions(&asset, &[VersionSize::Medium], &opts());
        assert_eq!(sel.stills.len(), 1);
        assert_eq!(sel.stills[0].0, RenditionSize::Medium);
    }

    #[test]
    fn test_missing_size_falls_back_to_original_once() {
        let asset = asset_with(HashMap::from([(
            RenditionSize::Original,
            rendition("public.jpeg", 100),
        )]));
        // Both medium and thumb are missing; original must be selected once.
        let sel = select_versions(&asset, &[VersionSize::Medium, VersionSize::Thumb], &opts());
        assert_eq!(sel.stills.len(), 1);
        assert_eq!(sel.stills[0].0, RenditionSize::Original);
    }

    #[test]
    fn test_missing_size_with_original_requested_no_double_download() {
        let asset = asset_with(HashMap::from([(
            RenditionSize::Original,
            rendition("public.jpeg", 100),
        )]));
        let sel = select_versions(
            &asset,
            &[VersionSize::Original, VersionSize::Medium],
            &opts(),
        );
        assert_eq!(sel.stills.len(), 1);
        assert_eq!(sel.stills[0].0, RenditionSize::Original);
    }

    #[test]
    fn test_force_size_skips_missing_medium() {
        let asset = asset_with(HashMap::from([(
            RenditionSize::Original,
            rendition("public.jpeg", 100),
        )]));
        let mut o = opts();
        o.force_size = true;
        let sel = select_versions(&asset, &[VersionSize::Medium], &o);
        assert!(sel.stills.is_empty());
    }

    #[test]
    fn test_adjusted_falls_back_to_original_when_no_edit() {
        let asset = asset_with(HashMap::from([(
            RenditionSize::Original,
            rendition("public.jpeg", 100),
        )]));
        let sel = select_versions(&asset, &[VersionSize::Adjusted], &opts());
        assert_eq!(sel.stills.len(), 1);
        assert_eq!(sel.stills[0].0, RenditionSize::Original);
    }

    #[test]
    fn test_adjusted_not_forced_even_with_force_size() {
        let asset = asset_with(HashMap::from([(
            RenditionSize::Original,
            rendition("public.jpeg", 100),
        )]));
        let mut o = opts();
        o.force_size = true;
        let sel = select_versions(&asset, &[VersionSize::Adjusted], &o);
        assert_eq!(sel.stills.len(), 1);
        assert_eq!(sel.stills[0].0, RenditionSize::Original);
    }

    #[test]
    fn test_duplicate_requested_sizes_selected_once() {
        let asset = asset_with(HashMap::from([(
            RenditionSize::Original,
            rendition("public.jpeg", 100),
        )]));
        let sel = select_versions(
            &asset,
            &[VersionSize::Original, VersionSize::Original],
            &opts(),
        );
        assert_eq!(sel.stills.len(), 1);
    }

    #[test]
    fn test_raw_policy_as_original_swaps_when_alternative_is_raw() {
        let versions = HashMap::from([
            (RenditionSize::Original, rendition("public.jpeg", 100)),
            (
                RenditionSize::Alternative,
                rendition("com.adobe.raw-image", 900),
            ),
        ]);
        let swapped = apply_raw_policy(&versions, RawTreatmentPolicy::AsOriginal);
        assert!(swapped[&RenditionSize::Original].is_raw());
        assert!(!swapped[&RenditionSize::Alternative].is_raw());
    }

    #[test]
    fn test_raw_policy_as_alternative_swaps_when_original_is_raw() {
        let versions = HashMap::from([
            (
                RenditionSize::Original,
                rendition("com.canon.cr2-raw-image", 900),
            ),
            (RenditionSize::Alternative, rendition("public.jpeg", 100)),
        ]);
        let swapped = apply_raw_policy(&versions, RawTreatmentPolicy::AsAlternative);
        assert!(!swapped[&RenditionSize::Original].is_raw());
        assert!(swapped[&RenditionSize::Alternative].is_raw());
    }

    #[test]
    fn test_raw_policy_as_is_preserves_assignment() {
        let versions = HashMap::from([
            (RenditionSize::Original, rendition("public.jpeg", 100)),
            (
                RenditionSize::Alternative,
                rendition("com.adobe.raw-image", 900),
            ),
        ]);
        let unchanged = apply_raw_policy(&versions, RawTreatmentPolicy::AsIs);
        assert!(!unchanged[&RenditionSize::Original].is_raw());
    }

    #[test]
    fn test_raw_policy_noop_without_alternative() {
        let versions = HashMap::from([(RenditionSize::Original, rendition("public.jpeg", 100))]);
        let out = apply_raw_policy(&versions, RawTreatmentPolicy::AsOriginal);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_live_video_selected_at_live_size() {
        let asset = asset_with(HashMap::from([
            (RenditionSize::Original, rendition("public.heic", 100)),
            (
                RenditionSize::LiveOriginal,
                rendition("com.apple.quicktime-movie", 500),
            ),
        ]));
        let sel = select_versions(&asset, &[VersionSize::Original], &opts());
        let (size, r) = sel.live_video.expect("live video selected");
        assert_eq!(size, RenditionSize::LiveOriginal);
        assert_eq!(r.byte_length, 500);
    }

    #[test]
    fn test_live_video_skipped_with_skip_live_photos() {
        let asset = asset_with(HashMap::from([
            (RenditionSize::Original, rendition("public.heic", 100)),
            (
                RenditionSize::LiveOriginal,
                rendition("com.apple.quicktime-movie", 500),
            ),
        ]));
        let mut o = opts();
        o.skip_live_photos = true;
        let sel = select_versions(&asset, &[VersionSize::Original], &o);
        assert!(sel.live_video.is_none());
    }

    #[test]
    fn test_live_video_absent_size_not_selected() {
        let asset = asset_with(HashMap::from([(
            RenditionSize::Original,
            rendition("public.heic", 100),
        )]));
        let mut o = opts();
        o.live_photo_size = LivePhotoSize::Medium;
        let sel = select_versions(&asset, &[VersionSize::Original], &o);
        assert!(sel.live_video.is_none());
    }
}
