use std::collections::HashMap;
use std::sync::LazyLock;

use serde::Deserialize;
use serde_json::{json, Value};

use super::asset::{AssetItemType, RenditionSize};

/// Response from `/records/query`.
#[derive(Debug, Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub records: Vec<Record>,
}

/// A service record. Fields stay dynamic JSON because the schema varies by
/// record type and changes without notice.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    #[serde(default)]
    pub record_name: String,
    #[serde(default)]
    pub record_type: String,
    #[serde(default)]
    pub fields: Value,
    #[serde(default)]
    pub record_change_tag: String,
}

/// Field names requested in every list query: everything needed for
/// filename resolution, rendition URLs, iteration order, and sidecar
/// metadata.
pub(crate) const DESIRED_KEYS: &[&str] = &[
    "resJPEGFullFileType",
    "resJPEGFullRes",
    "resJPEGMedFileType",
    "resJPEGMedRes",
    "resJPEGThumbFileType",
    "resJPEGThumbRes",
    "resVidMedFileType",
    "resVidMedRes",
    "resVidSmallFileType",
    "resVidSmallRes",
    "resOriginalFileType",
    "resOriginalRes",
    "resOriginalAltFileType",
    "resOriginalAltRes",
    "resOriginalVidComplFileType",
    "resOriginalVidComplRes",
    "itemType",
    "filenameEnc",
    "isDeleted",
    "isExpunged",
    "dateExpunged",
    "recordName",
    "recordType",
    "recordChangeTag",
    "masterRef",
    "assetDate",
    "addedDate",
    "isFavorite",
    "isHidden",
    "captionEnc",
    "extendedDescEnc",
    "timeZoneOffset",
];

pub(crate) static DESIRED_KEYS_VALUES: LazyLock<Vec<Value>> = LazyLock::new(|| {
    DESIRED_KEYS
        .iter()
        .map(|k| Value::String((*k).to_string()))
        .collect()
});

pub(crate) fn item_type_from_str(s: &str) -> Option<AssetItemType> {
    match s {
        "public.heic"
        | "public.heif"
        | "public.jpeg"
        | "public.png"
        | "com.adobe.raw-image"
        | "com.canon.cr2-raw-image"
        | "com.canon.crw-raw-image"
        | "com.sony.arw-raw-image"
        | "com.fuji.raw-image"
        | "com.panasonic.rw2-raw-image"
        | "com.nikon.nrw-raw-image"
        | "com.pentax.raw-image"
        | "com.nikon.raw-image"
        | "com.olympus.raw-image"
        | "com.canon.cr3-raw-image"
        | "com.olympus.or-raw-image" => Some(AssetItemType::Image),
        "com.apple.quicktime-movie" => Some(AssetItemType::Movie),
        _ => None,
    }
}

/// Maps logical rendition sizes to service field prefixes.
/// Prefix + "Res" gives the resource field (e.g. "resOriginalRes").
pub(crate) const PHOTO_VERSION_LOOKUP: &[(RenditionSize, &str)] = &[
    (RenditionSize::Original, "resOriginal"),
    (RenditionSize::Alternative, "resOriginalAlt"),
    (RenditionSize::Medium, "resJPEGMed"),
    (RenditionSize::Thumb, "resJPEGThumb"),
    (RenditionSize::Adjusted, "resJPEGFull"),
    (RenditionSize::LiveOriginal, "resOriginalVidCompl"),
    (RenditionSize::LiveMedium, "resVidMed"),
    (RenditionSize::LiveThumb, "resVidSmall"),
];

pub(crate) const VIDEO_VERSION_LOOKUP: &[(RenditionSize, &str)] = &[
    (RenditionSize::Original, "resOriginal"),
    (RenditionSize::Medium, "resVidMed"),
    (RenditionSize::Thumb, "resVidSmall"),
];

pub(crate) fn encode_params(params: &HashMap<String, Value>) -> String {
    use std::borrow::Cow;
    let mut pairs: Vec<String> = params
        .iter()
        .map(|(k, v)| {
            let val: Cow<'_, str> = match v {
                Value::String(s) => Cow::Borrowed(s.as_str()),
                Value::Bool(b) => Cow::Owned(b.to_string()),
                Value::Number(n) => Cow::Owned(n.to_string()),
                other => Cow::Owned(other.to_string()),
            };
            format!("{}={}", urlencoding::encode(k), urlencoding::encode(&val))
        })
        .collect();
    pairs.sort();
    pairs.join("&")
}

/// Body of a paged list query, newest-added first.
///
/// `list_type` selects the collection view (whole library, album contents,
/// Recently Deleted); the direction override keeps iteration in added-date
/// descending order regardless of the view's default.
pub(crate) fn list_query(
    offset: u64,
    page_size: usize,
    list_type: &str,
    query_filter: Option<&Value>,
    zone_id: &Value,
) -> Value {
    let mut filter_by = vec![json!({
        "fieldName": "startRank",
        "fieldValue": {"type": "INT64", "value": offset},
        "comparator": "EQUALS",
    })];
    filter_by.push(json!({
        "fieldName": "direction",
        "fieldValue": {"type": "STRING", "value": "DESCENDING"},
        "comparator": "EQUALS",
    }));
    if let Some(extra) = query_filter {
        if let Some(arr) = extra.as_array() {
            filter_by.extend(arr.iter().cloned());
        }
    }

    json!({
        "query": {
            "filterBy": filter_by,
            "recordType": list_type,
        },
        "resultsLimit": page_size * 2,
        "desiredKeys": &*DESIRED_KEYS_VALUES,
        "zoneID": zone_id,
    })
}

/// Body of the item-count lookup for a collection.
pub(crate) fn count_query(obj_type: &str, zone_id: &Value) -> Value {
    json!({
        "batch": [{
            "resultsLimit": 1,
            "query": {
                "filterBy": {
                    "fieldName": "indexCountID",
                    "fieldValue": {
                        "type": "STRING_LIST",
                        "value": [obj_type]
                    },
                    "comparator": "IN",
                },
                "recordType": "HyperionIndexCountLookup",
            },
            "zoneWide": true,
            "zoneID": zone_id,
        }]
    })
}

/// Body of a batched soft-delete: each operation flips `isDeleted` on a
/// CPLAsset record, which moves the asset to Recently Deleted.
pub(crate) fn delete_operations(
    targets: &[(String, String)], // (record_name, record_change_tag)
    zone_id: &Value,
) -> Value {
    let operations: Vec<Value> = targets
        .iter()
        .map(|(name, tag)| {
            json!({
                "operationType": "update",
                "record": {
                    "fields": {"isDeleted": {"value": 1}},
                    "recordChangeTag": tag,
                    "recordName": name,
                    "recordType": "CPLAsset",
                }
            })
        })
        .collect();
    json!({
        "atomic": true,
        "desiredKeys": ["isDeleted"],
        "operations": operations,
        "zoneID": zone_id,
    })
}
