use crate::remote::{BlobError, BlobStore, FolderEntry, Metadata};
use log::{info, warn};
use rand::Rng;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::env;
use std::fs::File;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;

const TOKEN_URL: &str = "https://api.dropbox.com/oauth2/token";
const API_BASE: &str = "https://api.dropboxapi.com/2";
const CONTENT_BASE: &str = "https://content.dropboxapi.com/2";

/// Dropbox app credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct DropboxConfig {
    #[serde(rename = "DROPBOX_APP_KEY")]
    pub app_key: String,
    #[serde(rename = "DROPBOX_APP_SECRET")]
    pub app_secret: String,
    #[serde(rename = "DROPBOX_REFRESH_TOKEN")]
    pub refresh_token: String,
}

impl DropboxConfig {
    /// Resolve credentials from the environment, falling back to a local
    /// `secrets.json`. Returns `None` when no complete set is found; the
    /// store then runs local-only.
    pub fn load() -> Option<Self> {
        let mut app_key = env::var("DROPBOX_APP_KEY").ok();
        let mut app_secret = env::var("DROPBOX_APP_SECRET").ok();
        let mut refresh_token = env::var("DROPBOX_REFRESH_TOKEN").ok();

        if app_key.is_none() || app_secret.is_none() || refresh_token.is_none() {
            if let Ok(file) = File::open("secrets.json") {
                if let Ok(from_file) = serde_json::from_reader::<_, DropboxConfig>(file) {
                    app_key = app_key.or(Some(from_file.app_key));
                    app_secret = app_secret.or(Some(from_file.app_secret));
                    refresh_token = refresh_token.or(Some(from_file.refresh_token));
                }
            }
        }

        match (app_key, app_secret, refresh_token) {
            (Some(app_key), Some(app_secret), Some(refresh_token)) => Some(Self {
                app_key,
                app_secret,
                refresh_token,
            }),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct TokenPayload {
    access_token: String,
}

#[derive(Deserialize)]
struct EntryPayload {
    name: String,
    path_lower: Option<String>,
}

#[derive(Deserialize)]
struct ListFolderPayload {
    entries: Vec<EntryPayload>,
    cursor: String,
    has_more: bool,
}

#[derive(Deserialize)]
struct MetadataPayload {
    path_lower: Option<String>,
    size: Option<u64>,
}

#[derive(Deserialize)]
struct SharedLinkPayload {
    url: String,
}

#[derive(Deserialize)]
struct SharedLinkListPayload {
    links: Vec<SharedLinkPayload>,
}

/// What a single API call needs beyond the access token.
struct ApiRequest<'a> {
    url: String,
    path: &'a str,
    json: Option<serde_json::Value>,
    api_arg: Option<String>,
    body: Option<&'a [u8]>,
}

impl<'a> ApiRequest<'a> {
    fn rpc(endpoint: &str, path: &'a str, body: serde_json::Value) -> Self {
        Self {
            url: format!("{API_BASE}{endpoint}"),
            path,
            json: Some(body),
            api_arg: None,
            body: None,
        }
    }
}

/// Dropbox-backed blob store.
///
/// The access token is exchanged from the refresh token at connect time
/// and re-exchanged when a call comes back 401. Transient failures are
/// retried with exponential backoff and jitter.
pub struct DropboxClient {
    http: Client,
    config: DropboxConfig,
    access_token: Mutex<String>,
    pub(crate) base_delay: Duration,
    pub(crate) max_retries: u32,
}

impl DropboxClient {
    pub async fn connect(config: DropboxConfig) -> Result<Self, BlobError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BlobError::Transport(e.to_string()))?;

        let client = Self {
            http,
            config,
            access_token: Mutex::new(String::new()),
            base_delay: Duration::from_millis(500),
            max_retries: 3,
        };
        client.refresh_access_token().await?;
        info!("Connected to Dropbox");
        Ok(client)
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.base_delay = Duration::from_millis(delay_ms.max(1));
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    async fn refresh_access_token(&self) -> Result<(), BlobError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", self.config.refresh_token.as_str()),
            ("client_id", self.config.app_key.as_str()),
            ("client_secret", self.config.app_secret.as_str()),
        ];
        let response = self.http.post(TOKEN_URL).form(&params).send().await?;
        if !response.status().is_success() {
            return Err(BlobError::Auth(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }
        let payload: TokenPayload = response
            .json()
            .await
            .map_err(|e| BlobError::Decode(e.to_string()))?;
        *self.access_token.lock().unwrap() = payload.access_token;
        Ok(())
    }

    /// Send one API call with bounded retries: exponential backoff with
    /// jitter, 429 treated as retryable, 401 triggers a token
    /// re-exchange, 409 is a terminal path error.
    async fn send_with_retry(&self, request: &ApiRequest<'_>) -> Result<reqwest::Response, BlobError> {
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let base_ms = self.base_delay.as_millis() as u64;
                let backoff = Duration::from_millis(
                    2_u64.pow(attempt) * base_ms + rand::rng().random_range(0..base_ms),
                );
                info!(
                    "Retrying {} (attempt {}) after {}ms delay",
                    request.path,
                    attempt + 1,
                    backoff.as_millis()
                );
                sleep(backoff).await;
            }

            let token = { self.access_token.lock().unwrap().clone() };
            let mut builder = self.http.post(&request.url).bearer_auth(token);
            if let Some(body) = &request.json {
                builder = builder.json(body);
            }
            if let Some(arg) = &request.api_arg {
                builder = builder
                    .header("Dropbox-API-Arg", arg)
                    .header("Content-Type", "application/octet-stream");
            }
            if let Some(bytes) = request.body {
                builder = builder.body(bytes.to_vec());
            }

            match builder.send().await {
                Ok(response) => match response.status().as_u16() {
                    200..=299 => return Ok(response),
                    401 => {
                        warn!("Access token rejected, re-exchanging refresh token");
                        self.refresh_access_token().await?;
                        continue;
                    }
                    429 => {
                        if attempt < self.max_retries {
                            warn!("Rate limited for {}, retrying...", request.path);
                            continue;
                        }
                        return Err(BlobError::Api {
                            path: request.path.to_string(),
                            status: 429,
                        });
                    }
                    409 => {
                        let text = response.text().await.unwrap_or_default();
                        if text.contains("not_found") {
                            return Err(BlobError::NotFound(request.path.to_string()));
                        }
                        return Err(BlobError::Api {
                            path: request.path.to_string(),
                            status: 409,
                        });
                    }
                    status => {
                        if attempt < self.max_retries {
                            warn!("HTTP error {status} for {}, retrying...", request.path);
                            continue;
                        }
                        return Err(BlobError::Api {
                            path: request.path.to_string(),
                            status,
                        });
                    }
                },
                Err(e) => {
                    if attempt < self.max_retries {
                        warn!("Request failed for {}, retrying...: {e}", request.path);
                        continue;
                    }
                    return Err(e.into());
                }
            }
        }
        Err(BlobError::Transport(format!(
            "retries exhausted for {}",
            request.path
        )))
    }

    async fn list_shared_links(&self, path: &str) -> Result<String, BlobError> {
        let request = ApiRequest::rpc(
            "/sharing/list_shared_links",
            path,
            json!({ "path": path, "direct_only": true }),
        );
        let response = self.send_with_retry(&request).await?;
        let payload: SharedLinkListPayload = response.json().await.map_err(BlobError::from)?;
        payload
            .links
            .into_iter()
            .next()
            .map(|l| l.url)
            .ok_or_else(|| BlobError::NotFound(path.to_string()))
    }
}

impl BlobStore for DropboxClient {
    async fn get_metadata(&self, path: &str) -> Result<Metadata, BlobError> {
        let request = ApiRequest::rpc("/files/get_metadata", path, json!({ "path": path }));
        let response = self.send_with_retry(&request).await?;
        let payload: MetadataPayload = response.json().await.map_err(BlobError::from)?;
        Ok(Metadata {
            path: payload.path_lower.unwrap_or_else(|| path.to_string()),
            size: payload.size,
        })
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>, BlobError> {
        let request = ApiRequest {
            url: format!("{CONTENT_BASE}/files/download"),
            path,
            json: None,
            api_arg: Some(json!({ "path": path }).to_string()),
            body: None,
        };
        let response = self.send_with_retry(&request).await?;
        let bytes = response.bytes().await.map_err(BlobError::from)?;
        Ok(bytes.to_vec())
    }

    async fn upload(&self, path: &str, bytes: &[u8]) -> Result<(), BlobError> {
        let request = ApiRequest {
            url: format!("{CONTENT_BASE}/files/upload"),
            path,
            json: None,
            api_arg: Some(
                json!({ "path": path, "mode": "overwrite", "mute": true }).to_string(),
            ),
            body: Some(bytes),
        };
        self.send_with_retry(&request).await?;
        Ok(())
    }

    async fn list_folder(&self, path: &str) -> Result<Vec<FolderEntry>, BlobError> {
        let request = ApiRequest::rpc("/files/list_folder", path, json!({ "path": path }));
        let response = self.send_with_retry(&request).await?;
        let mut page: ListFolderPayload = response.json().await.map_err(BlobError::from)?;

        let mut entries = Vec::new();
        loop {
            for entry in page.entries.drain(..) {
                let full_path = entry
                    .path_lower
                    .unwrap_or_else(|| format!("{}/{}", path.trim_end_matches('/'), entry.name));
                entries.push(FolderEntry {
                    name: entry.name,
                    path: full_path,
                });
            }
            if !page.has_more {
                break;
            }
            let request = ApiRequest::rpc(
                "/files/list_folder/continue",
                path,
                json!({ "cursor": page.cursor }),
            );
            let response = self.send_with_retry(&request).await?;
            page = response.json().await.map_err(BlobError::from)?;
        }
        Ok(entries)
    }

    async fn create_shared_link(&self, path: &str) -> Result<String, BlobError> {
        let request = ApiRequest::rpc(
            "/sharing/create_shared_link_with_settings",
            path,
            json!({ "path": path }),
        );
        match self.send_with_retry(&request).await {
            Ok(response) => {
                let payload: SharedLinkPayload = response.json().await.map_err(BlobError::from)?;
                Ok(payload.url)
            }
            // Link already exists: fetch it instead
            Err(BlobError::Api { status: 409, .. }) => self.list_shared_links(path).await,
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_secrets_json() {
        let raw = r#"{
            "DROPBOX_APP_KEY": "key",
            "DROPBOX_APP_SECRET": "secret",
            "DROPBOX_REFRESH_TOKEN": "token"
        }"#;
        let config: DropboxConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.app_key, "key");
        assert_eq!(config.app_secret, "secret");
        assert_eq!(config.refresh_token, "token");
    }

    #[test]
    fn test_rpc_request_shape() {
        let request = ApiRequest::rpc("/files/get_metadata", "/observations/observations.csv", json!({
            "path": "/observations/observations.csv"
        }));
        assert_eq!(request.url, format!("{API_BASE}/files/get_metadata"));
        assert!(request.api_arg.is_none());
        assert!(request.body.is_none());
    }
}
