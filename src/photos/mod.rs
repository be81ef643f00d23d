//! Remote photo library access.
//!
//! The wire protocol is deliberately hidden behind [`ServiceSession`]: the
//! rest of the engine only sees typed collections, assets, and renditions,
//! and every operation is a pure function of its explicit inputs plus the
//! session it is handed.

pub mod asset;
mod iterator;
pub mod records;

pub use asset::{Asset, AssetItemType, AssetKind, Rendition, RenditionSize};
pub use iterator::{AssetIterator, IterationFilter};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};

/// Minimal async session used by the photos service. The concrete
/// implementation lives in `crate::session`; tests substitute their own.
#[async_trait]
pub trait ServiceSession: Send + Sync {
    async fn post_json(&self, url: &str, body: &str) -> SyncResult<Value>;

    /// Clone this session into a new boxed trait object.
    fn clone_box(&self) -> Box<dyn ServiceSession>;
}

/// Blanket implementation for a bare `reqwest::Client`, used by tests and
/// by the downloader's CDN fetches which need no service headers.
#[async_trait]
impl ServiceSession for reqwest::Client {
    async fn post_json(&self, url: &str, body: &str) -> SyncResult<Value> {
        let resp = self
            .post(url)
            .header("Content-type", "text/plain")
            .body(body.to_owned())
            .send()
            .await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            return Err(SyncError::from_status(status, url));
        }
        let json: Value = resp
            .json()
            .await
            .map_err(|e| SyncError::Service(format!("malformed response from {url}: {e}")))?;
        Ok(json)
    }

    fn clone_box(&self) -> Box<dyn ServiceSession> {
        Box::new(self.clone())
    }
}

const ROOT_FOLDER: &str = "----Root-Folder----";
const PROJECT_ROOT_FOLDER: &str = "----Project-Root-Folder----";

/// Default page size for list queries.
const PAGE_SIZE: usize = 100;

/// One page of assets from a collection, plus the cursor to continue from.
pub struct AssetPage {
    pub assets: Vec<Asset>,
    /// Offset of the next page, or `None` when the collection is exhausted.
    pub next_offset: Option<u64>,
}

/// A queryable view over a set of assets: the whole library, a user album,
/// or the Recently Deleted folder.
pub struct PhotoCollection {
    name: String,
    params: Arc<HashMap<String, Value>>,
    session: Box<dyn ServiceSession>,
    service_endpoint: String,
    list_type: String,
    obj_type: String,
    query_filter: Option<Value>,
    zone_id: Value,
}

impl PhotoCollection {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total item count via `HyperionIndexCountLookup`. Advisory only — the
    /// collection can change between the count and the iteration.
    #[allow(dead_code)]
    pub async fn len(&self) -> SyncResult<u64> {
        let url = format!(
            "{}/internal/records/query/batch?{}",
            self.service_endpoint,
            records::encode_params(&self.params)
        );
        let body = records::count_query(&self.obj_type, &self.zone_id);
        let response = self.session.post_json(&url, &body.to_string()).await?;
        let count = response["batch"][0]["records"][0]["fields"]["itemCount"]["value"]
            .as_u64()
            .unwrap_or(0);
        Ok(count)
    }

    /// Fetch one page of assets starting at `offset`, newest-added first.
    ///
    /// Each page pairs CPLMaster records with their CPLAsset counterparts;
    /// masters without a matching asset record still advance the cursor so
    /// pagination cannot stall.
    pub async fn fetch_page(&self, offset: u64) -> SyncResult<AssetPage> {
        let url = format!(
            "{}/records/query?{}",
            self.service_endpoint,
            records::encode_params(&self.params)
        );
        let body = records::list_query(
            offset,
            PAGE_SIZE,
            &self.list_type,
            self.query_filter.as_ref(),
            &self.zone_id,
        );
        let response = self.session.post_json(&url, &body.to_string()).await?;
        let parsed: records::QueryResponse = serde_json::from_value(response)
            .map_err(|e| SyncError::Service(format!("malformed list response: {e}")))?;

        if parsed.records.is_empty() {
            return Ok(AssetPage {
                assets: Vec::new(),
                next_offset: None,
            });
        }

        let mut asset_records: HashMap<String, records::Record> = HashMap::new();
        let mut master_records: Vec<records::Record> = Vec::new();
        for rec in parsed.records {
            match rec.record_type.as_str() {
                "CPLAsset" => {
                    if let Some(master_id) =
                        rec.fields["masterRef"]["value"]["recordName"].as_str()
                    {
                        asset_records.insert(master_id.to_string(), rec);
                    }
                }
                "CPLMaster" => master_records.push(rec),
                other => debug!("Ignoring record type {other}"),
            }
        }

        if master_records.is_empty() {
            return Ok(AssetPage {
                assets: Vec::new(),
                next_offset: None,
            });
        }

        let mut next_offset = offset;
        let mut assets = Vec::with_capacity(master_records.len());
        for master in master_records {
            next_offset += 1;
            match asset_records.remove(&master.record_name) {
                Some(asset_rec) => assets.push(Asset::from_records(master, asset_rec)),
                None => warn!(
                    "Master {} has no asset record, skipping",
                    master.record_name
                ),
            }
        }

        Ok(AssetPage {
            assets,
            next_offset: Some(next_offset),
        })
    }
}

/// One library zone (personal or shared) within the account.
pub struct PhotoLibrary {
    service_endpoint: String,
    params: Arc<HashMap<String, Value>>,
    session: Box<dyn ServiceSession>,
    zone_id: Value,
    library_type: String,
}

impl std::fmt::Debug for PhotoLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhotoLibrary")
            .field("service_endpoint", &self.service_endpoint)
            .field("params", &self.params)
            .field("zone_id", &self.zone_id)
            .field("library_type", &self.library_type)
            .finish()
    }
}

impl PhotoLibrary {
    /// Create a new `PhotoLibrary`, verifying that remote indexing has
    /// finished (queries against a mid-index zone return partial data).
    pub async fn new(
        service_endpoint: String,
        params: Arc<HashMap<String, Value>>,
        session: Box<dyn ServiceSession>,
        zone_id: Value,
        library_type: String,
    ) -> SyncResult<Self> {
        let url = format!(
            "{}/records/query?{}",
            service_endpoint,
            records::encode_params(&params)
        );
        let body = json!({
            "query": {"recordType": "CheckIndexingState"},
            "zoneID": &zone_id,
        });
        let response = session.post_json(&url, &body.to_string()).await?;
        let indexing_state = response["records"][0]["fields"]["state"]["value"]
            .as_str()
            .unwrap_or("");
        if indexing_state != "FINISHED" {
            return Err(SyncError::ServiceUnavailable(
                "library indexing has not finished; try again later".to_string(),
            ));
        }

        Ok(Self {
            service_endpoint,
            params,
            session,
            zone_id,
            library_type,
        })
    }

    fn collection(
        &self,
        name: String,
        list_type: &str,
        obj_type: &str,
        query_filter: Option<Value>,
    ) -> PhotoCollection {
        PhotoCollection {
            name,
            params: Arc::clone(&self.params),
            session: self.session.clone_box(),
            service_endpoint: self.service_endpoint.clone(),
            list_type: list_type.to_string(),
            obj_type: obj_type.to_string(),
            query_filter,
            zone_id: self.zone_id.clone(),
        }
    }

    /// The whole collection, added-date descending.
    pub fn all(&self) -> PhotoCollection {
        self.collection(
            "All Photos".to_string(),
            "CPLAssetAndMasterByAddedDate",
            "CPLAssetByAddedDate",
            None,
        )
    }

    /// The Recently Deleted folder.
    pub fn recently_deleted(&self) -> PhotoCollection {
        self.collection(
            "Recently Deleted".to_string(),
            "CPLAssetAndMasterDeletedByExpungedDate",
            "CPLAssetDeletedByExpungedDate",
            None,
        )
    }

    /// User-created albums by name.
    pub async fn albums(&self) -> SyncResult<HashMap<String, PhotoCollection>> {
        let mut albums = HashMap::new();

        // User albums are not exposed for shared libraries.
        if self.library_type == "shared" {
            return Ok(albums);
        }

        for folder in self.fetch_folders().await? {
            let record_name = folder["recordName"].as_str().unwrap_or_default();
            if record_name == ROOT_FOLDER || record_name == PROJECT_ROOT_FOLDER {
                continue;
            }
            if folder["fields"]["isDeleted"]["value"]
                .as_bool()
                .unwrap_or(false)
            {
                continue;
            }

            let folder_id = record_name.to_string();
            let folder_obj_type = format!("CPLContainerRelationNotDeletedByAssetDate:{folder_id}");
            let folder_name = match folder["fields"]["albumNameEnc"]["value"].as_str() {
                Some(enc) => {
                    let decoded = base64::engine::general_purpose::STANDARD
                        .decode(enc)
                        .unwrap_or_default();
                    String::from_utf8(decoded).unwrap_or_else(|_| folder_id.clone())
                }
                None => folder_id.clone(),
            };

            let query_filter = json!([{
                "fieldName": "parentId",
                "comparator": "EQUALS",
                "fieldValue": {"type": "STRING", "value": &folder_id},
            }]);

            albums.insert(
                folder_name.clone(),
                self.collection(
                    folder_name,
                    "CPLContainerRelationLiveByAssetDate",
                    &folder_obj_type,
                    Some(query_filter),
                ),
            );
        }

        Ok(albums)
    }

    /// Move the given assets to Recently Deleted in one atomic batch.
    pub async fn move_to_recently_deleted(
        &self,
        targets: &[(String, String)],
    ) -> SyncResult<()> {
        if targets.is_empty() {
            return Ok(());
        }
        let url = format!(
            "{}/records/modify?{}",
            self.service_endpoint,
            records::encode_params(&self.params)
        );
        let body = records::delete_operations(targets, &self.zone_id);
        let response = self.session.post_json(&url, &body.to_string()).await?;
        if let Some(errors) = response["errors"].as_array() {
            if !errors.is_empty() {
                return Err(SyncError::Service(format!(
                    "remote delete rejected: {}",
                    serde_json::to_string(errors).unwrap_or_default()
                )));
            }
        }
        Ok(())
    }

    async fn fetch_folders(&self) -> SyncResult<Vec<Value>> {
        let url = format!(
            "{}/records/query?{}",
            self.service_endpoint,
            records::encode_params(&self.params)
        );
        let body = json!({
            "query": {"recordType": "CPLAlbumByPositionLive"},
            "zoneID": &self.zone_id,
        });
        let response = self.session.post_json(&url, &body.to_string()).await?;
        Ok(response["records"].as_array().cloned().unwrap_or_default())
    }
}

/// Entry point into the photos backend for one authenticated account.
pub struct PhotosService {
    service_root: String,
    session: Box<dyn ServiceSession>,
    params: Arc<HashMap<String, Value>>,
    primary_library: PhotoLibrary,
}

impl std::fmt::Debug for PhotosService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhotosService")
            .field("service_root", &self.service_root)
            .finish_non_exhaustive()
    }
}

impl PhotosService {
    pub async fn new(
        service_root: String,
        session: Box<dyn ServiceSession>,
        mut params: HashMap<String, Value>,
    ) -> SyncResult<Self> {
        params.insert("remapEnums".to_string(), Value::Bool(true));
        params.insert("getCurrentSyncToken".to_string(), Value::Bool(true));
        let params = Arc::new(params);

        let endpoint = Self::build_service_endpoint(&service_root, "private");
        let zone_id = json!({"zoneName": "PrimarySync"});
        let primary_library = PhotoLibrary::new(
            endpoint,
            Arc::clone(&params),
            session.clone_box(),
            zone_id,
            "private".to_string(),
        )
        .await?;

        Ok(Self {
            service_root,
            session,
            params,
            primary_library,
        })
    }

    fn build_service_endpoint(service_root: &str, library_type: &str) -> String {
        format!("{service_root}/database/1/com.apple.photos.cloud/production/{library_type}")
    }

    /// Look up a library by zone name. `PrimarySync` resolves to the
    /// already-validated primary library; anything else is searched in both
    /// private and shared zone lists.
    pub async fn library(&self, name: &str) -> SyncResult<PhotoLibrary> {
        if name == "PrimarySync" {
            return Ok(PhotoLibrary {
                service_endpoint: self.primary_library.service_endpoint.clone(),
                params: Arc::clone(&self.primary_library.params),
                session: self.primary_library.session.clone_box(),
                zone_id: self.primary_library.zone_id.clone(),
                library_type: self.primary_library.library_type.clone(),
            });
        }
        for library_type in ["private", "shared"] {
            if let Some(lib) = self.find_zone(library_type, name).await? {
                return Ok(lib);
            }
        }
        Err(SyncError::Config(format!(
            "unknown library '{name}'; use --list-libraries to see what is available"
        )))
    }

    /// Zone names available for a library type.
    pub async fn library_names(&self, library_type: &str) -> SyncResult<Vec<String>> {
        Ok(self
            .list_zones(library_type)
            .await?
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    async fn find_zone(&self, library_type: &str, name: &str) -> SyncResult<Option<PhotoLibrary>> {
        for (zone_name, zone_id) in self.list_zones(library_type).await? {
            if zone_name == name {
                let endpoint = Self::build_service_endpoint(&self.service_root, library_type);
                let lib = PhotoLibrary::new(
                    endpoint,
                    Arc::clone(&self.params),
                    self.session.clone_box(),
                    zone_id,
                    library_type.to_string(),
                )
                .await?;
                return Ok(Some(lib));
            }
        }
        Ok(None)
    }

    async fn list_zones(&self, library_type: &str) -> SyncResult<Vec<(String, Value)>> {
        let endpoint = Self::build_service_endpoint(&self.service_root, library_type);
        let url = format!("{endpoint}/zones/list");
        let response = self.session.post_json(&url, "{}").await?;
        let mut zones = Vec::new();
        for zone in response["zones"].as_array().cloned().unwrap_or_default() {
            if zone["deleted"].as_bool().unwrap_or(false) {
                continue;
            }
            if let Some(name) = zone["zoneID"]["zoneName"].as_str() {
                zones.push((name.to_string(), zone["zoneID"].clone()));
            }
        }
        Ok(zones)
    }
}
