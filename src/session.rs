//! Cookie and service-token persistence.
//!
//! The session store is a directory (default `~/.pyicloud`) holding one
//! cookie file and one `.session` JSON file per username, names derived
//! deterministically so that several configurations for the same account
//! share state. A per-`(directory, username)` advisory lock guards against
//! two processes clobbering each other's cookies.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;
use reqwest::header::{HeaderMap, HeaderValue, ORIGIN, REFERER, USER_AGENT};
use reqwest::{Client, Response};
use serde_json::Value;
use tokio::fs;

use crate::error::{SyncError, SyncResult};
use crate::photos::ServiceSession;

/// Maps HTTP response headers to session data keys.
const HEADER_DATA: &[(&str, &str)] = &[
    ("X-Apple-ID-Account-Country", "account_country"),
    ("X-Apple-ID-Session-Id", "session_id"),
    ("X-Apple-Session-Token", "session_token"),
    ("X-Apple-TwoSV-Trust-Token", "trust_token"),
    ("scnt", "scnt"),
];

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/138.0.0.0 Safari/537.36";

/// Keep only word characters so the username is safe as a file name. Two
/// configurations for the same account always map to the same files.
pub fn sanitize_username(username: &str) -> String {
    username
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect()
}

/// Exclusive advisory lock on a `(cookie_dir, username)` pair, held for as
/// long as the account's pass is running.
pub struct StoreLock {
    file: std::fs::File,
    path: PathBuf,
}

impl StoreLock {
    pub fn acquire(cookie_dir: &Path, username: &str) -> SyncResult<Self> {
        std::fs::create_dir_all(cookie_dir).map_err(|e| SyncError::fs(cookie_dir, e))?;
        let path = cookie_dir.join(format!("{}.lock", sanitize_username(username)));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| SyncError::fs(&path, e))?;
        file.try_lock_exclusive().map_err(|_| {
            SyncError::Config(format!(
                "session store {} is locked by another process for this username",
                cookie_dir.display()
            ))
        })?;
        Ok(Self { file, path })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            tracing::debug!("Failed to unlock {}: {}", self.path.display(), e);
        }
    }
}

/// HTTP session that persists cookies and service tokens to the store.
pub struct Session {
    client: Client,
    cookie_jar: Arc<reqwest::cookie::Jar>,
    pub session_data: HashMap<String, String>,
    cookie_dir: PathBuf,
    sanitized_username: String,
    home_endpoint: String,
    _lock: StoreLock,
}

impl Session {
    /// Create a session, loading existing cookies and tokens from disk and
    /// taking the store lock for this username.
    pub async fn new(
        cookie_dir: &Path,
        username: &str,
        home_endpoint: &str,
        timeout_secs: Option<u64>,
    ) -> SyncResult<Self> {
        let lock = StoreLock::acquire(cookie_dir, username)?;
        let sanitized = sanitize_username(username);
        let cookie_dir = cookie_dir.to_path_buf();
        let timeout = Duration::from_secs(timeout_secs.unwrap_or(30));

        let cookie_jar = Arc::new(reqwest::cookie::Jar::default());
        let cookiejar_path = cookie_dir.join(&sanitized);
        if cookiejar_path.exists() {
            match fs::read_to_string(&cookiejar_path).await {
                Ok(contents) => {
                    // Cookies are stored as "url\tSet-Cookie-value" lines.
                    for line in contents.lines() {
                        let trimmed = line.trim();
                        if trimmed.is_empty() || trimmed.starts_with('#') {
                            continue;
                        }
                        if let Some((url_str, cookie_str)) = trimmed.split_once('\t') {
                            if let Ok(url) = url_str.parse::<url::Url>() {
                                cookie_jar.add_cookie_str(cookie_str, &url);
                            }
                        }
                    }
                    tracing::debug!("Read cookies from {}", cookiejar_path.display());
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to read cookiejar {}: {}",
                        cookiejar_path.display(),
                        e
                    );
                }
            }
        }

        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            ORIGIN,
            HeaderValue::from_str(home_endpoint)
                .map_err(|e| SyncError::Config(format!("invalid endpoint: {e}")))?,
        );
        default_headers.insert(
            REFERER,
            HeaderValue::from_str(&format!("{home_endpoint}/"))
                .map_err(|e| SyncError::Config(format!("invalid endpoint: {e}")))?,
        );
        default_headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));

        let client = Client::builder()
            .cookie_provider(cookie_jar.clone())
            .default_headers(default_headers)
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build HTTP client: {e}")))?;

        let session_path = cookie_dir.join(format!("{sanitized}.session"));
        let session_data = match fs::read_to_string(&session_path).await {
            Ok(contents) => match serde_json::from_str::<HashMap<String, Value>>(&contents) {
                Ok(map) => map
                    .into_iter()
                    .map(|(k, v)| match v {
                        Value::String(s) => (k, s),
                        other => (k, other.to_string()),
                    })
                    .collect(),
                Err(_) => {
                    tracing::info!("Session file corrupt, starting fresh");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Ok(Self {
            client,
            cookie_jar,
            session_data,
            cookie_dir,
            sanitized_username: sanitized,
            home_endpoint: home_endpoint.to_string(),
            _lock: lock,
        })
    }

    pub fn cookiejar_path(&self) -> PathBuf {
        self.cookie_dir.join(&self.sanitized_username)
    }

    pub fn session_path(&self) -> PathBuf {
        self.cookie_dir
            .join(format!("{}.session", self.sanitized_username))
    }

    pub fn client_id(&self) -> Option<&String> {
        self.session_data.get("client_id")
    }

    pub fn set_client_id(&mut self, client_id: &str) {
        self.session_data
            .insert("client_id".to_string(), client_id.to_string());
    }

    pub fn home_endpoint(&self) -> &str {
        &self.home_endpoint
    }

    /// Client for streaming CDN downloads: same cookies, but per-read
    /// timeouts instead of a whole-request deadline — a large video must
    /// not be cut off by the 30-second API timeout.
    pub fn download_client(&self) -> SyncResult<Client> {
        Client::builder()
            .cookie_provider(self.cookie_jar.clone())
            .connect_timeout(Duration::from_secs(30))
            .read_timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build download client: {e}")))
    }

    /// POST, then fold tracked response headers into the session data and
    /// persist both tokens and cookies.
    pub async fn post(
        &mut self,
        url: &str,
        body: Option<String>,
        extra_headers: Option<HeaderMap>,
    ) -> SyncResult<Response> {
        let mut builder = self.client.post(url);
        if let Some(h) = extra_headers {
            builder = builder.headers(h);
        }
        if let Some(b) = body {
            builder = builder.header("Content-Type", "application/json").body(b);
        }
        tracing::debug!("POST {}", url);
        let response = builder.send().await?;
        self.extract_and_save(&response).await?;
        Ok(response)
    }

    pub async fn get(
        &mut self,
        url: &str,
        extra_headers: Option<HeaderMap>,
    ) -> SyncResult<Response> {
        let mut builder = self.client.get(url);
        if let Some(h) = extra_headers {
            builder = builder.headers(h);
        }
        tracing::debug!("GET {}", url);
        let response = builder.send().await?;
        self.extract_and_save(&response).await?;
        Ok(response)
    }

    /// Persist current tokens and cookies. Called on every tracked response
    /// and once more on clean shutdown.
    pub async fn flush(&self) -> SyncResult<()> {
        let session_path = self.session_path();
        let json = serde_json::to_string_pretty(&self.session_data)
            .map_err(|e| SyncError::Service(format!("failed to serialize session: {e}")))?;
        fs::write(&session_path, json)
            .await
            .map_err(|e| SyncError::fs(&session_path, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(&session_path, perms);
        }
        Ok(())
    }

    async fn extract_and_save(&mut self, response: &Response) -> SyncResult<()> {
        let headers = response.headers();
        for &(header_name, session_key) in HEADER_DATA {
            if let Some(val) = headers.get(header_name) {
                if let Ok(val_str) = val.to_str() {
                    self.session_data
                        .insert(session_key.to_string(), val_str.to_string());
                }
            }
        }
        self.flush().await?;

        // reqwest's Jar doesn't expose iteration; capture Set-Cookie headers
        // and append them to the cookie file, replacing same-name entries.
        let cookiejar_path = self.cookiejar_path();
        let url_str = response.url().to_string();
        let mut cookie_lines: Vec<String> = match fs::read_to_string(&cookiejar_path).await {
            Ok(contents) => contents.lines().map(|l| l.to_string()).collect(),
            Err(_) => Vec::new(),
        };

        for cookie_header in headers.get_all("set-cookie") {
            if let Ok(val) = cookie_header.to_str() {
                let new_name = val.split('=').next().unwrap_or("");
                cookie_lines.retain(|line| {
                    if let Some((line_url, line_cookie)) = line.split_once('\t') {
                        if line_url == url_str {
                            let existing_name = line_cookie.split('=').next().unwrap_or("");
                            return existing_name != new_name;
                        }
                    }
                    true
                });
                cookie_lines.push(format!("{url_str}\t{val}"));
            }
        }
        fs::write(&cookiejar_path, cookie_lines.join("\n"))
            .await
            .map_err(|e| SyncError::fs(&cookiejar_path, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(&cookiejar_path, perms);
        }
        Ok(())
    }
}

/// The session as shared between the sync loop (which may replace it on
/// re-auth) and the photos service.
pub type SharedSession = Arc<tokio::sync::RwLock<Session>>;

#[async_trait::async_trait]
impl ServiceSession for SharedSession {
    async fn post_json(&self, url: &str, body: &str) -> SyncResult<Value> {
        let mut session = self.write().await;
        let response = session
            .post(
                url,
                Some(body.to_string()),
                Some({
                    let mut h = HeaderMap::new();
                    h.insert("Content-type", HeaderValue::from_static("text/plain"));
                    h
                }),
            )
            .await?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(SyncError::from_status(status, url));
        }
        let json: Value = response
            .json()
            .await
            .map_err(|e| SyncError::Service(format!("malformed response from {url}: {e}")))?;
        // The photos backend reports an invalidated session inside a 200.
        if json["reason"]
            .as_str()
            .map(|r| r.contains("Invalid global session"))
            .unwrap_or(false)
        {
            return Err(SyncError::AuthExpired);
        }
        Ok(json)
    }

    fn clone_box(&self) -> Box<dyn ServiceSession> {
        Box::new(Arc::clone(self))
    }
}
