//! HTTP client for the encrypted-folder endpoints.
//!
//! Speaks the OCS end-to-end encryption API for locks and catalogs and
//! WebDAV for ciphertext. Authenticates with the account's user id and app
//! password. Uses reqwest with JSON responses.

use crate::config::E2eeConfig;
use crate::error::{E2eeError, E2eeResult};
use crate::remote::{LockApi, MetadataApi, TransferApi};
use crate::types::*;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_LENGTH, DATE, ETAG};
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Header carrying the folder lock token.
pub const E2E_TOKEN_HEADER: &str = "e2e-token";

const E2EE_API_PATH: &str = "/ocs/v2.php/apps/end_to_end_encryption/api/v1";

/// State shared across API client clones.
struct AuthState {
    user_id: Option<String>,
    app_password: Option<String>,
}

/// HTTP client for locks, catalogs, ciphertext and capabilities.
pub struct E2eeApiClient {
    client: Client,
    config: E2eeConfig,
    auth: Arc<RwLock<AuthState>>,
}

#[derive(Deserialize)]
struct OcsEnvelope<T> {
    ocs: OcsBody<T>,
}

#[derive(Deserialize)]
struct OcsBody<T> {
    data: T,
}

#[derive(Deserialize)]
struct LockData {
    #[serde(rename = "e2e-token")]
    token: String,
}

#[derive(Deserialize)]
struct MetaDataData {
    #[serde(rename = "meta-data")]
    meta_data: String,
}

fn status_error(status: StatusCode, context: &str) -> E2eeError {
    if status == StatusCode::UNAUTHORIZED {
        E2eeError::AuthFailed(format!("{context}: HTTP {status}"))
    } else {
        E2eeError::Api(format!("{context}: HTTP {status}"))
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

impl E2eeApiClient {
    pub fn new(config: E2eeConfig) -> E2eeResult<Self> {
        config.validate()?;
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            config,
            auth: Arc::new(RwLock::new(AuthState {
                user_id: None,
                app_password: None,
            })),
        })
    }

    /// Sets the account credentials (for restoring a saved session).
    pub async fn set_credentials(&self, user_id: String, app_password: String) {
        let mut auth = self.auth.write().await;
        auth.user_id = Some(user_id);
        auth.app_password = Some(app_password);
    }

    pub async fn is_authenticated(&self) -> bool {
        let auth = self.auth.read().await;
        auth.user_id.is_some() && auth.app_password.is_some()
    }

    pub async fn user_id(&self) -> Option<String> {
        self.auth.read().await.user_id.clone()
    }

    pub async fn logout(&self) {
        let mut auth = self.auth.write().await;
        auth.user_id = None;
        auth.app_password = None;
    }

    async fn credentials(&self) -> E2eeResult<(String, String)> {
        let auth = self.auth.read().await;
        match (&auth.user_id, &auth.app_password) {
            (Some(user), Some(password)) => Ok((user.clone(), password.clone())),
            _ => Err(E2eeError::AuthRequired),
        }
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs)
    }

    /// Builds an authenticated OCS request against the encryption API.
    async fn ocs_request(&self, method: Method, path: &str) -> E2eeResult<RequestBuilder> {
        let url = format!("{}{E2EE_API_PATH}{path}", self.config.api_base_url);
        self.authed(method, &url).await
    }

    async fn authed(&self, method: Method, url: &str) -> E2eeResult<RequestBuilder> {
        let (user, password) = self.credentials().await?;
        Ok(self
            .client
            .request(method, url)
            .basic_auth(user, Some(password))
            .header("OCS-APIRequest", "true")
            .header(ACCEPT, "application/json")
            .query(&[("format", "json")])
            .timeout(self.request_timeout()))
    }

    /// WebDAV URL of a file inside an encrypted folder.
    fn dav_url(&self, user: &str, folder_path: &str, name: &str) -> E2eeResult<Url> {
        let mut url = Url::parse(&self.config.api_base_url)
            .map_err(|e| E2eeError::Config(format!("invalid api_base_url: {e}")))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| E2eeError::Config("api_base_url cannot be a base".to_string()))?;
            segments.pop_if_empty();
            segments.extend(["remote.php", "dav", "files", user]);
            segments.extend(folder_path.split('/').filter(|s| !s.is_empty()));
            segments.push(name);
        }
        Ok(url)
    }

    // ── Capabilities ──

    /// Fetches what the server supports for encrypted folders.
    pub async fn get_capabilities(&self) -> E2eeResult<ServerCapabilities> {
        let url = format!("{}/ocs/v2.php/cloud/capabilities", self.config.api_base_url);
        let resp = self.authed(Method::GET, &url).await?.send().await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(status, "capabilities"));
        }

        let body: serde_json::Value = resp.json().await?;
        let e2ee = &body["ocs"]["data"]["capabilities"]["end-to-end-encryption"];
        Ok(ServerCapabilities {
            e2ee_enabled: e2ee["enabled"].as_bool().unwrap_or(false),
            e2ee_api_version: e2ee["api-version"].as_str().map(|v| v.to_string()),
        })
    }
}

// ── Locks ──

#[async_trait]
impl LockApi for E2eeApiClient {
    async fn lock_folder(
        &self,
        folder_id: &str,
        existing: Option<&LockToken>,
    ) -> E2eeResult<LockToken> {
        let mut req = self
            .ocs_request(Method::POST, &format!("/lock/{folder_id}"))
            .await?;
        if let Some(token) = existing {
            req = req.header(E2E_TOKEN_HEADER, token.as_str());
        }

        let resp = req.send().await?;
        let status = resp.status();

        if status == StatusCode::LOCKED
            || status == StatusCode::CONFLICT
            || status == StatusCode::FORBIDDEN
        {
            return Err(E2eeError::LockContention(format!(
                "folder {folder_id} is locked by another client (HTTP {status})"
            )));
        }
        if !status.is_success() {
            return Err(status_error(status, &format!("lock folder {folder_id}")));
        }

        let data: OcsEnvelope<LockData> = resp.json().await?;
        Ok(LockToken::new(data.ocs.data.token))
    }

    async fn unlock_folder(&self, folder_id: &str, token: &LockToken) -> E2eeResult<()> {
        let resp = self
            .ocs_request(Method::DELETE, &format!("/lock/{folder_id}"))
            .await?
            .header(E2E_TOKEN_HEADER, token.as_str())
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(E2eeError::NotFound(format!("lock on folder {folder_id}")));
        }
        if !status.is_success() {
            return Err(status_error(status, &format!("unlock folder {folder_id}")));
        }
        Ok(())
    }
}

// ── Catalogs ──

#[async_trait]
impl MetadataApi for E2eeApiClient {
    async fn get_metadata(
        &self,
        folder_id: &str,
        token: &LockToken,
    ) -> E2eeResult<Option<String>> {
        let resp = self
            .ocs_request(Method::GET, &format!("/meta-data/{folder_id}"))
            .await?
            .header(E2E_TOKEN_HEADER, token.as_str())
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            debug!("no catalog on server for folder {folder_id}");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(status_error(status, &format!("get metadata {folder_id}")));
        }

        let data: OcsEnvelope<MetaDataData> = resp.json().await?;
        let blob = data.ocs.data.meta_data;
        if blob.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(blob))
    }

    async fn put_metadata(
        &self,
        folder_id: &str,
        token: &LockToken,
        blob: &str,
        mode: CatalogWriteMode,
    ) -> E2eeResult<()> {
        let method = match mode {
            CatalogWriteMode::Create => Method::POST,
            CatalogWriteMode::Replace => Method::PUT,
        };

        let resp = self
            .ocs_request(method, &format!("/meta-data/{folder_id}"))
            .await?
            .header(E2E_TOKEN_HEADER, token.as_str())
            .form(&[("metaData", blob), ("e2e-token", token.as_str())])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(
                status,
                &format!("{mode:?} metadata {folder_id}").to_lowercase(),
            ));
        }
        Ok(())
    }
}

// ── Ciphertext ──

#[async_trait]
impl TransferApi for E2eeApiClient {
    async fn upload(
        &self,
        request: TransferRequest,
        progress: Option<ProgressCallback>,
        cancel: CancellationToken,
    ) -> E2eeResult<TransferReceipt> {
        let (user, password) = self.credentials().await?;
        let url = self.dav_url(&user, &request.folder_path, &request.destination_name)?;

        let total = request.ciphertext.len() as u64;
        let chunk_size = self.config.transfer_chunk_size.max(1);
        let ciphertext = request.ciphertext.clone();
        let offsets = (0..ciphertext.len()).step_by(chunk_size);

        let body = futures::stream::iter(offsets.map(move |start| {
            let end = (start + chunk_size).min(ciphertext.len());
            if let Some(report) = &progress {
                report(TransferProgress {
                    bytes_sent: end as u64,
                    total_bytes: total,
                });
            }
            Ok::<Bytes, std::io::Error>(ciphertext.slice(start..end))
        }));

        let send = self
            .client
            .put(url)
            .basic_auth(user, Some(password))
            .header(E2E_TOKEN_HEADER, request.token.as_str())
            .header(CONTENT_LENGTH, total)
            .body(reqwest::Body::wrap_stream(body))
            .send();

        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("upload of {} cancelled", request.destination_name);
                return Err(E2eeError::Cancelled);
            }
            resp = send => resp?,
        };

        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(
                status,
                &format!("upload {}", request.destination_name),
            ));
        }

        let headers = resp.headers();
        let remote_id = header_str(headers, "oc-fileid")
            .ok_or_else(|| E2eeError::Api("upload response missing OC-FileId".to_string()))?;
        let etag = header_str(headers, "oc-etag")
            .or_else(|| header_str(headers, ETAG.as_str()))
            .map(|e| e.trim_matches('"').to_string());
        let timestamp = header_str(headers, DATE.as_str())
            .and_then(|d| DateTime::parse_from_rfc2822(&d).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        debug!(
            "uploaded {total} bytes as {} (remote id {remote_id})",
            request.destination_name
        );
        Ok(TransferReceipt {
            remote_id,
            etag,
            timestamp,
        })
    }
}
