//! GitHub gist blob store
//!
//! The encrypted vault is stored base64-encoded inside a single file of a
//! secret gist. Gist history versions serve as revisions.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use reqwest::header::ACCEPT;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::engine::error::{EngineError, EngineResult};
use crate::sync::blob_store::{BlobStore, Pushed, RemoteBlob, Revision};
use crate::vault::SecretString;

const API_BASE_URL: &str = "https://api.github.com";
const API_VERSION: &str = "2022-11-28";
const FILE_NAME: &str = "rmount-vault.json";
const DESCRIPTION: &str = "rmount encrypted vault backup";
const BACKUP_FORMAT: u32 = 1;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Contents of the gist file
#[derive(Debug, Serialize, Deserialize)]
struct BackupFile {
    format: u32,
    /// Unix seconds of the upload
    timestamp: i64,
    /// Encrypted vault, base64
    vault: String,
}

fn encode_backup(bytes: &[u8]) -> EngineResult<String> {
    let file = BackupFile {
        format: BACKUP_FORMAT,
        timestamp: Utc::now().timestamp(),
        vault: BASE64.encode(bytes),
    };
    serde_json::to_string_pretty(&file)
        .map_err(|e| EngineError::internal(format!("Backup serialization failed: {}", e)))
}

fn decode_backup(content: &str) -> EngineResult<Vec<u8>> {
    let file: BackupFile = serde_json::from_str(content)
        .map_err(|e| EngineError::corrupt(format!("Remote backup is malformed: {}", e)))?;
    if file.format != BACKUP_FORMAT {
        return Err(EngineError::corrupt(format!(
            "Unsupported remote backup format {}",
            file.format
        )));
    }
    BASE64
        .decode(file.vault.as_bytes())
        .map_err(|e| EngineError::corrupt(format!("Remote backup is malformed: {}", e)))
}

#[derive(Debug, Deserialize)]
struct Gist {
    id: String,
    #[serde(default)]
    files: HashMap<String, GistFile>,
    #[serde(default)]
    history: Vec<GistHistory>,
}

#[derive(Debug, Deserialize)]
struct GistFile {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    truncated: bool,
    #[serde(default)]
    raw_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GistHistory {
    version: String,
}

impl Gist {
    fn revision(&self) -> EngineResult<Revision> {
        self.history
            .first()
            .map(|h| h.version.clone())
            .ok_or_else(|| EngineError::remote_unavailable("Gist has no revision history"))
    }
}

fn network_error(e: reqwest::Error) -> EngineError {
    if e.is_timeout() {
        EngineError::Timeout {
            timeout_ms: REQUEST_TIMEOUT.as_millis() as u64,
        }
    } else {
        EngineError::remote_unavailable(format!("GitHub request failed: {}", e))
    }
}

fn status_error(status: StatusCode, blob_id: Option<&str>) -> EngineError {
    match (status, blob_id) {
        (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, _) => {
            EngineError::validation("GitHub rejected the sync token")
        }
        (StatusCode::NOT_FOUND, Some(id)) => EngineError::NotFound {
            kind: "Gist",
            name: id.to_string(),
        },
        (other, _) => EngineError::remote_unavailable(format!("GitHub returned {}", other)),
    }
}

/// Blob store backed by the GitHub gists API
#[derive(Debug, Clone)]
pub struct GistBlobStore {
    client: reqwest::Client,
    base_url: String,
}

impl GistBlobStore {
    pub fn new() -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("rmount/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| EngineError::internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: API_BASE_URL.to_string(),
        })
    }

    fn request(&self, method: Method, path: &str, token: &SecretString) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(token.expose())
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    async fn send_gist(&self, request: RequestBuilder, blob_id: Option<&str>) -> EngineResult<Gist> {
        let response = request.send().await.map_err(network_error)?;
        let status = response.status();
        tracing::debug!(status = %status, "GitHub gist response");
        if !status.is_success() {
            return Err(status_error(status, blob_id));
        }
        response
            .json::<Gist>()
            .await
            .map_err(|e| EngineError::remote_unavailable(format!("Unexpected GitHub response: {}", e)))
    }

    /// Content of the backup file, following `raw_url` when GitHub truncated it
    async fn file_content(&self, gist: &Gist, token: &SecretString) -> EngineResult<String> {
        let file = gist.files.get(FILE_NAME).ok_or_else(|| {
            EngineError::corrupt(format!("Gist {} does not contain {}", gist.id, FILE_NAME))
        })?;

        match (&file.content, file.truncated, &file.raw_url) {
            (Some(content), false, _) => Ok(content.clone()),
            (_, _, Some(raw_url)) => {
                let response = self
                    .client
                    .get(raw_url)
                    .bearer_auth(token.expose())
                    .send()
                    .await
                    .map_err(network_error)?;
                if !response.status().is_success() {
                    return Err(status_error(response.status(), Some(&gist.id)));
                }
                response.text().await.map_err(network_error)
            }
            _ => Err(EngineError::corrupt(format!(
                "Gist {} has no readable content",
                gist.id
            ))),
        }
    }
}

#[async_trait]
impl BlobStore for GistBlobStore {
    fn store_id(&self) -> &'static str {
        "github-gist"
    }

    async fn check_access(&self, token: &SecretString) -> EngineResult<()> {
        let response = self
            .request(Method::GET, "/user", token)
            .send()
            .await
            .map_err(network_error)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(status_error(response.status(), None))
        }
    }

    async fn push(
        &self,
        token: &SecretString,
        blob_id: Option<&str>,
        bytes: &[u8],
    ) -> EngineResult<Pushed> {
        let files = json!({ FILE_NAME: { "content": encode_backup(bytes)? } });
        let request = match blob_id {
            Some(id) => self
                .request(Method::PATCH, &format!("/gists/{}", id), token)
                .json(&json!({ "files": files })),
            None => self.request(Method::POST, "/gists", token).json(&json!({
                "description": DESCRIPTION,
                "public": false,
                "files": files,
            })),
        };

        let gist = self.send_gist(request, blob_id).await?;
        Ok(Pushed {
            revision: gist.revision()?,
            blob_id: gist.id,
        })
    }

    async fn pull(&self, token: &SecretString, blob_id: &str) -> EngineResult<RemoteBlob> {
        let request = self.request(Method::GET, &format!("/gists/{}", blob_id), token);
        let gist = self.send_gist(request, Some(blob_id)).await?;
        let content = self.file_content(&gist, token).await?;
        Ok(RemoteBlob {
            bytes: decode_backup(&content)?,
            revision: gist.revision()?,
        })
    }
}
