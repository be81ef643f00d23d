use std::collections::HashMap;

use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::warn;

use super::records::{item_type_from_str, PHOTO_VERSION_LOOKUP, VIDEO_VERSION_LOOKUP};

/// One downloadable form of an asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendition {
    /// Length in bytes as reported by the service. Downloads are verified
    /// against this value before publication.
    pub byte_length: u64,
    /// Signed CDN URL. Expires; must be used within the pass that fetched it.
    pub url: String,
    /// UTI string such as `public.jpeg` or `com.apple.quicktime-movie`.
    pub content_type: String,
}

impl Rendition {
    /// Whether this rendition is a RAW representation (relevant for
    /// `--align-raw` swapping of RAW+JPEG pairs).
    pub fn is_raw(&self) -> bool {
        self.content_type.contains("raw")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetItemType {
    Image,
    Movie,
}

/// Coarse asset kind as exposed to filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    Photo,
    Video,
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenditionSize {
    Original,
    Alternative,
    Medium,
    Thumb,
    Adjusted,
    LiveOriginal,
    LiveMedium,
    LiveThumb,
}

impl RenditionSize {
    pub fn is_live(self) -> bool {
        matches!(
            self,
            RenditionSize::LiveOriginal | RenditionSize::LiveMedium | RenditionSize::LiveThumb
        )
    }
}

impl From<crate::types::VersionSize> for RenditionSize {
    fn from(v: crate::types::VersionSize) -> Self {
        match v {
            crate::types::VersionSize::Original => RenditionSize::Original,
            crate::types::VersionSize::Medium => RenditionSize::Medium,
            crate::types::VersionSize::Thumb => RenditionSize::Thumb,
            crate::types::VersionSize::Adjusted => RenditionSize::Adjusted,
            crate::types::VersionSize::Alternative => RenditionSize::Alternative,
        }
    }
}

/// A single photo or video entity, immutable for the duration of the
/// iteration pass that produced it.
#[derive(Debug, Clone)]
pub struct Asset {
    record_name: String,
    asset_record_name: String,
    asset_change_tag: String,
    filename: Option<String>,
    item_type_val: Option<AssetItemType>,
    created_ms: Option<f64>,
    added_ms: Option<f64>,
    is_favorite: bool,
    caption: Option<String>,
    description: Option<String>,
    versions: HashMap<RenditionSize, Rendition>,
}

/// Decode a filename from the service's `filenameEnc` field.
/// Either plain STRING or base64-encoded ENCRYPTED_BYTES depending on the
/// account's configuration.
fn decode_filename(fields: &Value) -> Option<String> {
    decode_string_field(fields, "filenameEnc")
}

fn decode_string_field(fields: &Value, name: &str) -> Option<String> {
    let enc = &fields[name];
    if enc.is_null() {
        return None;
    }
    let value = enc["value"].as_str()?;
    let enc_type = enc["type"].as_str().unwrap_or("STRING");
    match enc_type {
        "STRING" => Some(value.to_string()),
        "ENCRYPTED_BYTES" => {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(value)
                .ok()?;
            String::from_utf8(decoded).ok()
        }
        other => {
            warn!("Unsupported {} encoding: {}", name, other);
            None
        }
    }
}

/// Determine asset type from the `itemType` field, falling back to file
/// extension heuristics. Defaults to Movie for unknown types because videos
/// are more likely to have non-standard UTI strings.
fn resolve_item_type(fields: &Value, filename: &Option<String>) -> Option<AssetItemType> {
    if let Some(s) = fields["itemType"]["value"].as_str() {
        if let Some(t) = item_type_from_str(s) {
            return Some(t);
        }
    }
    if let Some(name) = &filename {
        let lower = name.to_lowercase();
        if lower.ends_with(".heic")
            || lower.ends_with(".png")
            || lower.ends_with(".jpg")
            || lower.ends_with(".jpeg")
        {
            return Some(AssetItemType::Image);
        }
    }
    Some(AssetItemType::Movie)
}

/// Pre-parse rendition URLs at construction so `Asset` carries no raw JSON.
/// Incomplete entries (missing URL or length) are logged and skipped; the
/// caller sees a smaller map rather than a runtime error.
fn extract_versions(
    item_type: Option<AssetItemType>,
    master_fields: &Value,
    asset_fields: &Value,
    record_name: &str,
) -> HashMap<RenditionSize, Rendition> {
    let lookup = if item_type == Some(AssetItemType::Movie) {
        VIDEO_VERSION_LOOKUP
    } else {
        PHOTO_VERSION_LOOKUP
    };

    let mut versions = HashMap::new();
    for (key, prefix) in lookup {
        let res_field = format!("{prefix}Res");
        let type_field = format!("{prefix}FileType");

        // Asset record carries adjusted renditions; master carries originals.
        // Prefer the asset record so edits take priority.
        let fields = if !asset_fields[&res_field].is_null() {
            asset_fields
        } else if !master_fields[&res_field].is_null() {
            master_fields
        } else {
            continue;
        };

        let res_entry = &fields[&res_field]["value"];
        if res_entry.is_null() {
            continue;
        }

        let byte_length = res_entry["size"].as_u64().unwrap_or(0);

        let url = match res_entry["downloadURL"].as_str() {
            Some(u) => u.to_string(),
            None => {
                warn!(
                    "Asset {}: missing {prefix}Res.downloadURL, skipping rendition",
                    record_name
                );
                continue;
            }
        };

        let content_type = fields[&type_field]["value"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        versions.insert(
            *key,
            Rendition {
                byte_length,
                url,
                content_type,
            },
        );
    }
    versions
}

impl Asset {
    /// Construct from the master/asset record pair of a list query.
    pub fn from_records(master: super::records::Record, asset: super::records::Record) -> Self {
        let filename = decode_filename(&master.fields);
        let item_type_val = resolve_item_type(&master.fields, &filename);
        let created_ms = asset.fields["assetDate"]["value"].as_f64();
        let added_ms = asset.fields["addedDate"]["value"].as_f64();
        let is_favorite = asset.fields["isFavorite"]["value"]
            .as_u64()
            .map(|v| v == 1)
            .unwrap_or(false);
        let caption = decode_string_field(&asset.fields, "captionEnc");
        let description = decode_string_field(&asset.fields, "extendedDescEnc");
        let versions = extract_versions(
            item_type_val,
            &master.fields,
            &asset.fields,
            &master.record_name,
        );
        Self {
            record_name: master.record_name,
            asset_record_name: asset.record_name,
            asset_change_tag: asset.record_change_tag,
            filename,
            item_type_val,
            created_ms,
            added_ms,
            is_favorite,
            caption,
            description,
            versions,
        }
    }

    pub fn id(&self) -> &str {
        &self.record_name
    }

    /// Identity of the mutable asset record, needed to move the asset to
    /// Recently Deleted.
    pub fn delete_target(&self) -> (String, String) {
        (
            self.asset_record_name.clone(),
            self.asset_change_tag.clone(),
        )
    }

    /// Raw service-reported filename, if any. Sanitization and fallback
    /// naming are the naming policy's concern.
    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    /// The instant the photo was taken, falling back to the added date when
    /// the service did not report one.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_ms
            .and_then(|ms| Utc.timestamp_millis_opt(ms as i64).single())
            .unwrap_or_else(|| self.added_at())
    }

    /// The instant the asset entered the library. Iteration order and all
    /// termination predicates are defined over this value.
    pub fn added_at(&self) -> DateTime<Utc> {
        self.added_ms
            .and_then(|ms| Utc.timestamp_millis_opt(ms as i64).single())
            .unwrap_or(DateTime::UNIX_EPOCH)
    }

    pub fn is_favorite(&self) -> bool {
        self.is_favorite
    }

    pub fn caption(&self) -> Option<&str> {
        self.caption.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn item_type(&self) -> Option<AssetItemType> {
        self.item_type_val
    }

    /// Coarse kind for the skip-photos/videos/live filters. An image with a
    /// correlated video rendition is a live photo.
    pub fn kind(&self) -> AssetKind {
        match self.item_type_val {
            Some(AssetItemType::Movie) => AssetKind::Video,
            _ => {
                if self.versions.contains_key(&RenditionSize::LiveOriginal) {
                    AssetKind::Live
                } else {
                    AssetKind::Photo
                }
            }
        }
    }

    /// Available renditions, keyed by size. Pre-parsed at construction so no
    /// JSON traversal happens at reconciliation time.
    pub fn versions(&self) -> &HashMap<RenditionSize, Rendition> {
        &self.versions
    }

    #[cfg(test)]
    pub fn for_tests(
        id: &str,
        filename: Option<&str>,
        item_type: AssetItemType,
        created: DateTime<Utc>,
        added: DateTime<Utc>,
        versions: HashMap<RenditionSize, Rendition>,
    ) -> Self {
        Self {
            record_name: id.to_string(),
            asset_record_name: format!("{id}-asset"),
            asset_change_tag: String::new(),
            filename: filename.map(str::to_string),
            item_type_val: Some(item_type),
            created_ms: Some(created.timestamp_millis() as f64),
            added_ms: Some(added.timestamp_millis() as f64),
            is_favorite: false,
            caption: None,
            description: None,
            versions,
        }
    }
}

impl std::fmt::Display for Asset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<Asset: id={}>", self.id())
    }
}
