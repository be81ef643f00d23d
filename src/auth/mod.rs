//! Authentication orchestration.
//!
//! Session tokens from the store are validated first; only when they are
//! missing or rejected is a password requested from the provider chain and
//! a fresh sign-in performed, followed by an MFA challenge when the
//! account demands one. All wire specifics live here, behind the
//! [`crate::session::Session`] transport.

pub mod providers;

use std::collections::HashMap;

use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{SyncError, SyncResult};
use crate::session::Session;
use crate::types::Domain;
use providers::{MfaProvider, ProviderChain};

/// First-party web client key, sent with every auth call.
const WIDGET_KEY: &str = "d39ba9916b7251055b22c7f910e2ea796ee65e98b2ddecea8f5dde8d9d1a815d";

#[derive(Debug, Clone, Copy)]
pub struct Endpoints {
    pub home: &'static str,
    pub setup: &'static str,
    pub auth: &'static str,
}

impl Endpoints {
    pub fn for_domain(domain: Domain) -> Endpoints {
        match domain {
            Domain::Com => Endpoints {
                home: "https://www.icloud.com",
                setup: "https://setup.icloud.com/setup/ws/1",
                auth: "https://idmsa.apple.com/appleauth/auth",
            },
            Domain::Cn => Endpoints {
                home: "https://www.icloud.com.cn",
                setup: "https://setup.icloud.com.cn/setup/ws/1",
                auth: "https://idmsa.apple.com.cn/appleauth/auth",
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DsInfo {
    #[serde(rename = "hsaVersion", default)]
    pub hsa_version: i64,
    #[serde(default)]
    pub dsid: Option<Value>,
    #[serde(rename = "hasICloudQualifyingDevice", default)]
    pub has_i_cloud_qualifying_device: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebserviceEndpoint {
    pub url: String,
}

/// Payload of a successful `accountLogin`.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountData {
    #[serde(rename = "dsInfo", default)]
    pub ds_info: Option<DsInfo>,
    #[serde(default)]
    pub webservices: Option<HashMap<String, WebserviceEndpoint>>,
    #[serde(rename = "hsaChallengeRequired", default)]
    pub hsa_challenge_required: bool,
    #[serde(rename = "hsaTrustedBrowser", default)]
    pub hsa_trusted_browser: bool,
}

impl AccountData {
    pub fn ckdatabasews_url(&self) -> Option<&str> {
        self.webservices
            .as_ref()
            .and_then(|ws| ws.get("ckdatabasews"))
            .map(|ep| ep.url.as_str())
    }

    pub fn dsid(&self) -> Option<String> {
        self.ds_info.as_ref().and_then(|ds| match &ds.dsid {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
    }

    /// HSA2 accounts require a second factor when the browser is not yet
    /// trusted and a device can receive codes.
    pub fn requires_2fa(&self) -> bool {
        let (hsa_version, has_qualifying_device) = match &self.ds_info {
            Some(ds) => (ds.hsa_version, ds.has_i_cloud_qualifying_device),
            None => (0, false),
        };
        hsa_version == 2
            && (self.hsa_challenge_required || !self.hsa_trusted_browser)
            && has_qualifying_device
    }
}

pub struct Authenticator {
    username: String,
    endpoints: Endpoints,
    credentials: ProviderChain,
    mfa: Box<dyn MfaProvider>,
}

impl Authenticator {
    pub fn new(
        username: String,
        domain: Domain,
        credentials: ProviderChain,
        mfa: Box<dyn MfaProvider>,
    ) -> Self {
        Self {
            username,
            endpoints: Endpoints::for_domain(domain),
            credentials,
            mfa,
        }
    }

    pub fn endpoints(&self) -> Endpoints {
        self.endpoints
    }

    /// Authenticate the session in place.
    ///
    /// Order: stored session token, then password sign-in, then the MFA
    /// challenge and session trust. Returns the account payload carrying
    /// the photo-service URL.
    pub async fn authenticate(&self, session: &mut Session) -> SyncResult<AccountData> {
        if session.client_id().is_none() {
            session.set_client_id(&format!("auth-{}", uuid::Uuid::new_v4()));
        }

        if session.session_data.contains_key("session_token") {
            tracing::debug!("Checking stored session token");
            match self.account_login(session).await {
                Ok(data) if !data.requires_2fa() => {
                    tracing::debug!("Existing session token is valid");
                    return Ok(data);
                }
                Ok(_) => {
                    tracing::debug!("Stored token valid but session is no longer trusted");
                }
                Err(e) => {
                    tracing::debug!("Stored session token rejected: {e}");
                }
            }
        }

        let password = self.credentials.password(&self.username).await?;
        let requires_2fa = self.sign_in(session, &password).await?;

        if requires_2fa {
            tracing::info!("Two-factor authentication is required");
            let code = self.mfa.code(&self.username).await?;
            self.submit_mfa_code(session, &code).await?;
            self.trust_session(session).await?;
        }

        let data = self.account_login(session).await?;
        if data.requires_2fa() {
            return Err(SyncError::MfaFailed(
                "session still untrusted after verification".to_string(),
            ));
        }
        tracing::info!("Authentication completed successfully");
        Ok(data)
    }

    /// Validate the stored token and fetch the account payload.
    pub async fn account_login(&self, session: &mut Session) -> SyncResult<AccountData> {
        let token = session
            .session_data
            .get("session_token")
            .cloned()
            .ok_or(SyncError::AuthExpired)?;
        let body = json!({
            "accountCountryCode": session.session_data.get("account_country"),
            "dsWebAuthToken": token,
            "extended_login": true,
            "trustToken": session.session_data.get("trust_token"),
        });
        let url = format!("{}/accountLogin", self.endpoints.setup);
        let response = session.post(&url, Some(body.to_string()), None).await?;
        let status = response.status().as_u16();
        if status == 401 || status == 421 {
            return Err(SyncError::AuthExpired);
        }
        if !response.status().is_success() {
            return Err(SyncError::from_status(status, "accountLogin"));
        }
        let data: AccountData = response
            .json()
            .await
            .map_err(|e| SyncError::Service(format!("malformed accountLogin response: {e}")))?;
        Ok(data)
    }

    /// Password sign-in. Returns whether an MFA challenge is pending.
    async fn sign_in(&self, session: &mut Session, password: &str) -> SyncResult<bool> {
        let client_id = session.client_id().cloned().unwrap_or_default();
        let scnt = session.session_data.get("scnt").cloned();
        let trust_tokens: Vec<String> = session
            .session_data
            .get("trust_token")
            .map(|t| vec![t.clone()])
            .unwrap_or_default();
        let body = json!({
            "accountName": self.username,
            "password": password,
            "rememberMe": true,
            "trustTokens": trust_tokens,
        });
        let url = format!("{}/signin?isRememberMeEnabled=true", self.endpoints.auth);
        let response = session
            .post(
                &url,
                Some(body.to_string()),
                Some(self.oauth_headers(&client_id, scnt.as_deref())),
            )
            .await?;

        match response.status().as_u16() {
            409 => Ok(true),
            401 | 403 => Err(SyncError::AuthFailed {
                reason: "invalid username or password".to_string(),
            }),
            s if response.status().is_success() => {
                tracing::debug!("Sign-in returned {s}, no MFA challenge");
                Ok(false)
            }
            s => Err(SyncError::from_status(s, "signin")),
        }
    }

    async fn submit_mfa_code(&self, session: &mut Session, code: &str) -> SyncResult<()> {
        let client_id = session.client_id().cloned().unwrap_or_default();
        let scnt = session.session_data.get("scnt").cloned();
        let body = json!({"securityCode": {"code": code}});
        let url = format!(
            "{}/verify/trusteddevice/securitycode",
            self.endpoints.auth
        );
        let response = session
            .post(
                &url,
                Some(body.to_string()),
                Some(self.oauth_headers(&client_id, scnt.as_deref())),
            )
            .await?;
        if !response.status().is_success() {
            return Err(SyncError::MfaFailed(format!(
                "verification code rejected (HTTP {})",
                response.status().as_u16()
            )));
        }
        Ok(())
    }

    /// Ask the service to trust this session so later runs skip MFA.
    async fn trust_session(&self, session: &mut Session) -> SyncResult<()> {
        let client_id = session.client_id().cloned().unwrap_or_default();
        let scnt = session.session_data.get("scnt").cloned();
        let url = format!("{}/2sv/trust", self.endpoints.auth);
        let response = session
            .get(&url, Some(self.oauth_headers(&client_id, scnt.as_deref())))
            .await?;
        if !response.status().is_success() {
            tracing::warn!(
                "Could not trust session (HTTP {}); MFA may be required again",
                response.status().as_u16()
            );
        }
        Ok(())
    }

    fn oauth_headers(&self, client_id: &str, scnt: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("Accept", HeaderValue::from_static("application/json"));
        headers.insert(
            "X-Apple-OAuth-Client-Id",
            HeaderValue::from_static(WIDGET_KEY),
        );
        headers.insert(
            "X-Apple-OAuth-Client-Type",
            HeaderValue::from_static("firstPartyAuth"),
        );
        if let Ok(v) = HeaderValue::from_str(self.endpoints.home) {
            headers.insert("X-Apple-OAuth-Redirect-URI", v);
        }
        headers.insert(
            "X-Apple-OAuth-Response-Mode",
            HeaderValue::from_static("web_message"),
        );
        headers.insert(
            "X-Apple-OAuth-Response-Type",
            HeaderValue::from_static("code"),
        );
        if let Ok(v) = HeaderValue::from_str(client_id) {
            headers.insert("X-Apple-OAuth-State", v);
        }
        headers.insert("X-Apple-Widget-Key", HeaderValue::from_static(WIDGET_KEY));
        if let Some(Ok(v)) = scnt.map(HeaderValue::from_str) {
            headers.insert("scnt", v);
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account_data(
        hsa_version: i64,
        challenge: bool,
        trusted: bool,
        qualifying: bool,
    ) -> AccountData {
        AccountData {
            ds_info: Some(DsInfo {
                hsa_version,
                dsid: Some(Value::String("123".into())),
                has_i_cloud_qualifying_device: qualifying,
            }),
            webservices: None,
            hsa_challenge_required: challenge,
            hsa_trusted_browser: trusted,
        }
    }

    #[test]
    fn test_requires_2fa_all_conditions_met() {
        assert!(account_data(2, true, false, true).requires_2fa());
    }

    #[test]
    fn test_requires_2fa_trusted_no_challenge() {
        assert!(!account_data(2, false, true, true).requires_2fa());
    }

    #[test]
    fn test_requires_2fa_wrong_hsa_version() {
        assert!(!account_data(1, true, false, true).requires_2fa());
    }

    #[test]
    fn test_requires_2fa_no_qualifying_device() {
        assert!(!account_data(2, true, false, false).requires_2fa());
    }

    #[test]
    fn test_requires_2fa_untrusted_no_challenge() {
        assert!(account_data(2, false, false, true).requires_2fa());
    }

    #[test]
    fn test_dsid_accepts_string_and_number() {
        let mut data = account_data(2, false, true, true);
        assert_eq!(data.dsid(), Some("123".to_string()));
        data.ds_info.as_mut().unwrap().dsid = Some(Value::Number(456.into()));
        assert_eq!(data.dsid(), Some("456".to_string()));
    }

    #[test]
    fn test_ckdatabasews_url_lookup() {
        let mut data = account_data(2, false, true, true);
        assert!(data.ckdatabasews_url().is_none());
        data.webservices = Some(HashMap::from([(
            "ckdatabasews".to_string(),
            WebserviceEndpoint {
                url: "https://p42-ckdatabasews.icloud.com:443".to_string(),
            },
        )]));
        assert_eq!(
            data.ckdatabasews_url(),
            Some("https://p42-ckdatabasews.icloud.com:443")
        );
    }

    #[test]
    fn test_endpoints_for_domain() {
        assert!(Endpoints::for_domain(Domain::Com).setup.contains(".com/"));
        assert!(Endpoints::for_domain(Domain::Cn).home.ends_with(".cn"));
    }

    #[test]
    fn test_account_data_parses_minimal_payload() {
        let data: AccountData = serde_json::from_str("{}").unwrap();
        assert!(!data.requires_2fa());
        assert!(data.ckdatabasews_url().is_none());
    }
}
