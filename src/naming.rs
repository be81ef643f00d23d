//! Canonical on-disk naming for asset renditions.
//!
//! Everything in this module is a pure function of `(asset, rendition,
//! policy)` — no clock reads, no filesystem probes. The reconciliation
//! engine builds every path through [`NamingPolicy`] so that a given
//! configuration always maps an asset to the same location.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use base64::Engine;
use chrono::{DateTime, Local, NaiveDateTime, Utc};
use data_encoding::BASE32_NOPAD;
use sha2::{Digest, Sha256};

use crate::photos::{Asset, Rendition, RenditionSize};
use crate::types::{FileMatchPolicy, LivePhotoMovFilenamePolicy, LivePhotoSize};

/// Map UTI content-type strings to standardized uppercase file extensions.
const ITEM_TYPE_EXTENSIONS: &[(&str, &str)] = &[
    ("public.heic", "HEIC"),
    ("public.heif", "HEIF"),
    ("public.jpeg", "JPG"),
    ("public.png", "PNG"),
    ("com.apple.quicktime-movie", "MOV"),
    ("com.adobe.raw-image", "DNG"),
    ("com.canon.cr2-raw-image", "CR2"),
    ("com.canon.crw-raw-image", "CRW"),
    ("com.sony.arw-raw-image", "ARW"),
    ("com.fuji.raw-image", "RAF"),
    ("com.panasonic.rw2-raw-image", "RW2"),
    ("com.nikon.nrw-raw-image", "NRF"),
    ("com.pentax.raw-image", "PEF"),
    ("com.nikon.raw-image", "NEF"),
    ("com.olympus.raw-image", "ORF"),
    ("com.canon.cr3-raw-image", "CR3"),
    ("com.olympus.or-raw-image", "ORF"),
];

/// Look up the file extension for a UTI content-type string.
pub fn item_type_extension(content_type: &str) -> Option<&'static str> {
    ITEM_TYPE_EXTENSIONS
        .iter()
        .find(|(key, _)| *key == content_type)
        .map(|(_, ext)| *ext)
}

/// Replace characters that are invalid on common filesystems with `_`.
pub fn clean_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| {
            if matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '\0') {
                '_'
            } else {
                c
            }
        })
        .collect()
}

/// Remove non-ASCII characters from a filename.
pub fn remove_unicode_chars(filename: &str) -> String {
    filename.chars().filter(|c| c.is_ascii()).collect()
}

/// Insert a suffix (separator included) before the file extension.
///
/// `add_suffix_to_filename("-medium", "photo.jpg")` → `"photo-medium.jpg"`.
pub fn add_suffix_to_filename(suffix: &str, filename: &str) -> String {
    match filename.rfind('.') {
        Some(dot) => {
            let (stem, ext) = filename.split_at(dot);
            format!("{stem}{suffix}{ext}")
        }
        None => format!("{filename}{suffix}"),
    }
}

/// Disambiguating token for the `name-id7` policy: the first 7 characters
/// of the base64-encoded asset id.
pub fn id7_token(asset_id: &str) -> String {
    base64::engine::general_purpose::STANDARD
        .encode(asset_id.as_bytes())
        .chars()
        .take(7)
        .collect()
}

/// Stable token for assets the service reports without a filename: the
/// first 7 base32 characters of SHA-256(asset_id).
pub fn fingerprint_token(asset_id: &str) -> String {
    let digest = Sha256::digest(asset_id.as_bytes());
    BASE32_NOPAD.encode(&digest).chars().take(7).collect()
}

/// Replace a filename's extension based on a UTI content-type string, when
/// the mapping is known. `photo.jpeg` + `public.heic` → `photo.HEIC`.
fn map_filename_extension(filename: &str, content_type: &str) -> String {
    let Some(ext) = item_type_extension(content_type) else {
        return filename.to_string();
    };
    match filename.rfind('.') {
        Some(dot) => format!("{}.{}", &filename[..dot], ext),
        None => format!("{filename}.{ext}"),
    }
}

fn extension_of(filename: &str) -> &str {
    filename.rfind('.').map(|dot| &filename[dot + 1..]).unwrap_or("")
}

/// Live-photo MOV name under the `suffix` policy: HEIC stills become
/// `<stem>_HEVC.MOV`, everything else `<stem>.MOV`.
fn live_video_name_suffix(still: &str) -> String {
    match still.rfind('.') {
        Some(dot) => {
            let (stem, ext) = still.split_at(dot);
            if ext[1..].eq_ignore_ascii_case("heic") {
                format!("{stem}_HEVC.MOV")
            } else {
                format!("{stem}.MOV")
            }
        }
        None => format!("{still}.MOV"),
    }
}

/// Live-photo MOV name under the `original` policy: extension replaced with
/// `.MOV`. Collisions with video assets of the same stem must be avoided by
/// combining with `name-id7`.
fn live_video_name_original(still: &str) -> String {
    match still.rfind('.') {
        Some(dot) => format!("{}.MOV", &still[..dot]),
        None => format!("{still}.MOV"),
    }
}

/// The naming configuration for one account. Pure data; all methods are
/// deterministic functions of their inputs.
#[derive(Debug, Clone)]
pub struct NamingPolicy {
    pub directory: PathBuf,
    /// strftime-style template, the Python `{:...}` wrapper accepted; the
    /// sentinel `none` collapses the hierarchy.
    pub folder_structure: String,
    pub keep_unicode: bool,
    pub file_match_policy: FileMatchPolicy,
    pub live_photo_mov_policy: LivePhotoMovFilenamePolicy,
    /// Format folder dates in the host's local timezone instead of UTC.
    pub use_os_locale: bool,
}

impl NamingPolicy {
    /// Sanitized base filename for an asset, before any rendition-specific
    /// transformation. Applies the unicode policy, the forbidden-character
    /// substitution, the fingerprint fallback, and the `name-id7` token.
    pub fn base_filename(&self, asset: &Asset) -> String {
        let raw = match asset.filename() {
            Some(f) => f.to_string(),
            None => {
                let ext = asset
                    .versions()
                    .get(&RenditionSize::Original)
                    .and_then(|r| item_type_extension(&r.content_type))
                    .unwrap_or("unknown");
                format!("{}.{}", fingerprint_token(asset.id()), ext)
            }
        };
        let cleaned = clean_filename(&raw);
        let cleaned = if self.keep_unicode {
            cleaned
        } else {
            remove_unicode_chars(&cleaned)
        };
        match self.file_match_policy {
            FileMatchPolicy::NameId7 => {
                add_suffix_to_filename(&format!("_{}", id7_token(asset.id())), &cleaned)
            }
            FileMatchPolicy::NameSizeDedupWithSuffix => cleaned,
        }
    }

    /// Filename for one still rendition of an asset.
    ///
    /// The suffix contract: `medium`/`thumb` always suffixed, `adjusted`
    /// only when it would otherwise collide with the original's extension,
    /// `alternative` never (its extension already differs), `original`
    /// untouched.
    pub fn version_filename(
        &self,
        asset: &Asset,
        size: RenditionSize,
        rendition: &Rendition,
        original: Option<&Rendition>,
    ) -> String {
        let base = self.base_filename(asset);
        let named = map_filename_extension(&base, &rendition.content_type);
        match size {
            RenditionSize::Original | RenditionSize::Alternative => named,
            RenditionSize::Medium => add_suffix_to_filename("-medium", &named),
            RenditionSize::Thumb => add_suffix_to_filename("-thumb", &named),
            RenditionSize::Adjusted => {
                let original_named = original
                    .map(|o| map_filename_extension(&base, &o.content_type))
                    .unwrap_or_else(|| base.clone());
                if extension_of(&named).eq_ignore_ascii_case(extension_of(&original_named)) {
                    add_suffix_to_filename("-adjusted", &named)
                } else {
                    named
                }
            }
            RenditionSize::LiveOriginal | RenditionSize::LiveMedium | RenditionSize::LiveThumb => {
                self.live_video_filename(asset, size)
            }
        }
    }

    /// Filename for the video half of a live photo at the given live size.
    pub fn live_video_filename(&self, asset: &Asset, live_size: RenditionSize) -> String {
        let still = self.base_filename(asset);
        let mov = match self.live_photo_mov_policy {
            LivePhotoMovFilenamePolicy::Suffix => live_video_name_suffix(&still),
            LivePhotoMovFilenamePolicy::Original => live_video_name_original(&still),
        };
        match live_size {
            RenditionSize::LiveMedium => add_suffix_to_filename("-medium", &mov),
            RenditionSize::LiveThumb => add_suffix_to_filename("-thumb", &mov),
            _ => mov,
        }
    }

    /// Folder-date for an asset: local wall clock when the OS locale is in
    /// use, UTC otherwise.
    fn folder_date(&self, created: DateTime<Utc>) -> NaiveDateTime {
        if self.use_os_locale {
            created.with_timezone(&Local).naive_local()
        } else {
            created.naive_utc()
        }
    }

    /// Directory an asset's files belong in: `directory` plus the expanded
    /// folder template.
    pub fn download_dir(&self, asset: &Asset) -> PathBuf {
        if self.folder_structure.eq_ignore_ascii_case("none") {
            return self.directory.clone();
        }

        // Accept the Python-style `{:%Y/%m/%d}` wrapper.
        let template = self
            .folder_structure
            .strip_prefix("{:")
            .and_then(|s| s.strip_suffix('}'))
            .unwrap_or(&self.folder_structure);

        let date = self.folder_date(asset.created_at());
        let mut expanded = String::new();
        if write!(expanded, "{}", date.format(template)).is_err() {
            tracing::warn!(
                "Invalid folder-structure template '{}', using %Y/%m/%d",
                self.folder_structure
            );
            expanded.clear();
            let _ = write!(expanded, "{}", date.format("%Y/%m/%d"));
        }

        // Join on "/" so the template stays portable across path separators.
        let mut path = self.directory.clone();
        for component in expanded.split('/') {
            if !component.is_empty() {
                path.push(component);
            }
        }
        path
    }

    /// Canonical path for a still rendition.
    pub fn canonical_still_path(
        &self,
        asset: &Asset,
        size: RenditionSize,
        rendition: &Rendition,
        original: Option<&Rendition>,
    ) -> PathBuf {
        self.download_dir(asset)
            .join(self.version_filename(asset, size, rendition, original))
    }

    /// Canonical path for the video half of a live photo.
    pub fn canonical_live_video_path(&self, asset: &Asset, live_size: LivePhotoSize) -> PathBuf {
        self.download_dir(asset)
            .join(self.live_video_filename(asset, live_size.to_rendition_size()))
    }

    /// All paths at which a previously downloaded copy of this rendition is
    /// accepted, current policy's canonical path first. Files found at a
    /// legacy path are treated as present but never renamed; new files are
    /// always written to the canonical path.
    pub fn admissible_paths(
        &self,
        asset: &Asset,
        size: RenditionSize,
        rendition: &Rendition,
        original: Option<&Rendition>,
    ) -> Vec<PathBuf> {
        let canonical = self.canonical_still_path(asset, size, rendition, original);
        let mut paths = vec![canonical.clone()];
        if size == RenditionSize::Original {
            // Early releases wrote originals as IMG_1234-original.JPG.
            if let Some(name) = canonical.file_name().and_then(|n| n.to_str()) {
                let legacy = add_suffix_to_filename("-original", name);
                paths.push(canonical.with_file_name(legacy));
            }
        }
        paths
    }

    /// Collision path under `name-size-dedup-with-suffix`: the byte length
    /// inserted before the extension.
    pub fn dedup_path(path: &Path, byte_length: u64) -> PathBuf {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        path.with_file_name(add_suffix_to_filename(&format!("-{byte_length}"), name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::photos::AssetItemType;
    use std::collections::HashMap;

    fn rendition(content_type: &str, byte_length: u64) -> Rendition {
        Rendition {
            byte_length,
            url: "https://cdn/x".to_string(),
            content_type: content_type.to_string(),
        }
    }

    fn asset_named(id: &str, filename: Option<&str>) -> Asset {
        let created = DateTime::parse_from_rfc3339("2025-01-02T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let versions = HashMap::from([(RenditionSize::Original, rendition("public.jpeg", 100))]);
        Asset::for_tests(id, filename, AssetItemType::Image, created, created, versions)
    }

    fn policy() -> NamingPolicy {
        NamingPolicy {
            directory: PathBuf::from("/out"),
            folder_structure: "{:%Y/%m/%d}".to_string(),
            keep_unicode: false,
            file_match_policy: FileMatchPolicy::NameSizeDedupWithSuffix,
            live_photo_mov_policy: LivePhotoMovFilenamePolicy::Suffix,
            use_os_locale: false,
        }
    }

    #[test]
    fn test_clean_filename_replaces_invalid_chars() {
        assert_eq!(clean_filename("photo:1.jpg"), "photo_1.jpg");
        assert_eq!(clean_filename("a/b\\c*d?e\"f<g>h|i"), "a_b_c_d_e_f_g_h_i");
        assert_eq!(clean_filename("normal.jpg"), "normal.jpg");
    }

    #[test]
    fn test_remove_unicode_chars() {
        assert_eq!(remove_unicode_chars("héllo wörld"), "hllo wrld");
        // U+202F (narrow no-break space) shows up before AM/PM in screenshots
        assert_eq!(
            remove_unicode_chars("Screenshot at 1.40.01\u{202F}PM.PNG"),
            "Screenshot at 1.40.01PM.PNG"
        );
    }

    #[test]
    fn test_add_suffix_to_filename() {
        assert_eq!(add_suffix_to_filename("-medium", "a.jpg"), "a-medium.jpg");
        assert_eq!(add_suffix_to_filename("-thumb", "noext"), "noext-thumb");
        assert_eq!(add_suffix_to_filename("-x", "a.b.mov"), "a.b-x.mov");
    }

    #[test]
    fn test_id7_token() {
        // base64("ABC123") = "QUJDMTIz", first 7 = "QUJDMTI"
        assert_eq!(id7_token("ABC123"), "QUJDMTI");
    }

    #[test]
    fn test_fingerprint_token_stable_and_short() {
        let t1 = fingerprint_token("asset-1");
        let t2 = fingerprint_token("asset-1");
        let t3 = fingerprint_token("asset-2");
        assert_eq!(t1, t2);
        assert_ne!(t1, t3);
        assert_eq!(t1.len(), 7);
        // base32 alphabet only
        assert!(t1.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_base_filename_missing_service_name_uses_fingerprint() {
        let asset = asset_named("CCPO9c3V/MTwWZJ9bw==", None);
        let name = policy().base_filename(&asset);
        assert_eq!(name, format!("{}.JPG", fingerprint_token(asset.id())));
    }

    #[test]
    fn test_base_filename_id7_policy_tokenizes_every_name() {
        let mut p = policy();
        p.file_match_policy = FileMatchPolicy::NameId7;
        let asset = asset_named("ABC123", Some("IMG_0001.JPG"));
        assert_eq!(p.base_filename(&asset), "IMG_0001_QUJDMTI.JPG");
    }

    #[test]
    fn test_version_filename_medium_thumb_suffixes() {
        let asset = asset_named("A", Some("IMG_5526.JPG"));
        let orig = rendition("public.jpeg", 100);
        let p = policy();
        assert_eq!(
            p.version_filename(&asset, RenditionSize::Medium, &orig, Some(&orig)),
            "IMG_5526-medium.JPG"
        );
        assert_eq!(
            p.version_filename(&asset, RenditionSize::Thumb, &orig, Some(&orig)),
            "IMG_5526-thumb.JPG"
        );
    }

    #[test]
    fn test_version_filename_adjusted_suffix_only_on_shared_extension() {
        let asset = asset_named("A", Some("IMG_1.JPG"));
        let p = policy();
        let orig = rendition("public.jpeg", 100);
        let adjusted_same = rendition("public.jpeg", 90);
        let adjusted_diff = rendition("public.heic", 90);
        assert_eq!(
            p.version_filename(&asset, RenditionSize::Adjusted, &adjusted_same, Some(&orig)),
            "IMG_1-adjusted.JPG"
        );
        assert_eq!(
            p.version_filename(&asset, RenditionSize::Adjusted, &adjusted_diff, Some(&orig)),
            "IMG_1.HEIC"
        );
    }

    #[test]
    fn test_version_filename_alternative_keeps_mapped_extension() {
        let asset = asset_named("A", Some("IMG_1.JPG"));
        let p = policy();
        let alt_raw = rendition("com.adobe.raw-image", 100);
        assert_eq!(
            p.version_filename(&asset, RenditionSize::Alternative, &alt_raw, None),
            "IMG_1.DNG"
        );
    }

    #[test]
    fn test_live_video_filename_suffix_policy() {
        let asset = asset_named("A", Some("IMG_1234.HEIC"));
        let p = policy();
        assert_eq!(
            p.live_video_filename(&asset, RenditionSize::LiveOriginal),
            "IMG_1234_HEVC.MOV"
        );
        let asset_jpg = asset_named("A", Some("IMG_1234.JPG"));
        assert_eq!(
            p.live_video_filename(&asset_jpg, RenditionSize::LiveOriginal),
            "IMG_1234.MOV"
        );
    }

    #[test]
    fn test_live_video_filename_original_policy() {
        let mut p = policy();
        p.live_photo_mov_policy = LivePhotoMovFilenamePolicy::Original;
        let asset = asset_named("A", Some("IMG_1234.HEIC"));
        assert_eq!(
            p.live_video_filename(&asset, RenditionSize::LiveOriginal),
            "IMG_1234.MOV"
        );
    }

    #[test]
    fn test_live_video_filename_non_original_size_suffixed() {
        let asset = asset_named("A", Some("IMG_1234.HEIC"));
        let p = policy();
        assert_eq!(
            p.live_video_filename(&asset, RenditionSize::LiveMedium),
            "IMG_1234_HEVC-medium.MOV"
        );
    }

    #[test]
    fn test_download_dir_expands_template_in_utc() {
        let asset = asset_named("A", Some("IMG_1234.HEIC"));
        let p = policy();
        assert_eq!(p.download_dir(&asset), PathBuf::from("/out/2025/01/02"));
    }

    #[test]
    fn test_download_dir_none_collapses() {
        let asset = asset_named("A", Some("IMG_1234.HEIC"));
        let mut p = policy();
        p.folder_structure = "none".to_string();
        assert_eq!(p.download_dir(&asset), PathBuf::from("/out"));
        p.folder_structure = "NONE".to_string();
        assert_eq!(p.download_dir(&asset), PathBuf::from("/out"));
    }

    #[test]
    fn test_download_dir_accepts_bare_template() {
        let asset = asset_named("A", Some("IMG_1234.HEIC"));
        let mut p = policy();
        p.folder_structure = "%Y-%m".to_string();
        assert_eq!(p.download_dir(&asset), PathBuf::from("/out/2025-01"));
    }

    #[test]
    fn test_canonical_still_path_basic_download_scenario() {
        // Remote photo IMG_1234.HEIC created 2025-01-02T10:00:00Z, size
        // original → /out/2025/01/02/IMG_1234.HEIC
        let asset = asset_named("A", Some("IMG_1234.HEIC"));
        let orig = rendition("public.heic", 100);
        let p = policy();
        assert_eq!(
            p.canonical_still_path(&asset, RenditionSize::Original, &orig, Some(&orig)),
            PathBuf::from("/out/2025/01/02/IMG_1234.HEIC")
        );
    }

    #[test]
    fn test_admissible_paths_include_legacy_original_suffix() {
        let asset = asset_named("A", Some("IMG_1234.JPG"));
        let orig = rendition("public.jpeg", 100);
        let p = policy();
        let paths = p.admissible_paths(&asset, RenditionSize::Original, &orig, Some(&orig));
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/out/2025/01/02/IMG_1234.JPG"),
                PathBuf::from("/out/2025/01/02/IMG_1234-original.JPG"),
            ]
        );
    }

    #[test]
    fn test_admissible_paths_superset_of_canonical() {
        let asset = asset_named("A", Some("IMG_1234.JPG"));
        let orig = rendition("public.jpeg", 100);
        let p = policy();
        for size in [RenditionSize::Original, RenditionSize::Medium] {
            let canonical = p.canonical_still_path(&asset, size, &orig, Some(&orig));
            let admissible = p.admissible_paths(&asset, size, &orig, Some(&orig));
            assert_eq!(admissible[0], canonical);
        }
    }

    #[test]
    fn test_dedup_path_appends_byte_length() {
        assert_eq!(
            NamingPolicy::dedup_path(Path::new("/out/IMG_0001.JPG"), 67890),
            PathBuf::from("/out/IMG_0001-67890.JPG")
        );
    }

    #[test]
    fn test_dedup_scenario_two_assets_same_name() {
        // Under name-id7 each asset carries its own deterministic token, so
        // no collision is possible regardless of discovery order.
        let mut p = policy();
        p.file_match_policy = FileMatchPolicy::NameId7;
        let a = asset_named("ASSET-ONE", Some("IMG_0001.JPG"));
        let b = asset_named("ASSET-TWO", Some("IMG_0001.JPG"));
        let orig = rendition("public.jpeg", 12345);
        let pa = p.canonical_still_path(&a, RenditionSize::Original, &orig, Some(&orig));
        let pb = p.canonical_still_path(&b, RenditionSize::Original, &orig, Some(&orig));
        assert_ne!(pa, pb);
    }

    #[test]
    fn test_canonical_path_is_pure() {
        let asset = asset_named("A", Some("IMG_1234.JPG"));
        let orig = rendition("public.jpeg", 100);
        let p = policy();
        let first = p.canonical_still_path(&asset, RenditionSize::Original, &orig, Some(&orig));
        for _ in 0..3 {
            assert_eq!(
                p.canonical_still_path(&asset, RenditionSize::Original, &orig, Some(&orig)),
                first
            );
        }
    }

    #[test]
    fn test_item_type_extension_known_and_unknown() {
        assert_eq!(item_type_extension("public.jpeg"), Some("JPG"));
        assert_eq!(item_type_extension("com.apple.quicktime-movie"), Some("MOV"));
        assert_eq!(item_type_extension("something.else"), None);
    }
}
