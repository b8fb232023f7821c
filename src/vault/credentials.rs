//! Data source credentials
//!
//! Represents a saved S3-compatible endpoint. The secret key only ever lives
//! decrypted inside the unlocked vault session; everything handed to the
//! presentation layer goes through [`DataSourceConfig::redacted`].

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::engine::error::{EngineError, EngineResult};

pub const REDACTED: &str = "********";
pub const DEFAULT_REGION: &str = "us-east-1";
const MAX_NAME_LEN: usize = 64;

/// A string that is wiped on drop and never printed
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when the value is absent or is the placeholder produced by redaction
    pub fn is_placeholder(&self) -> bool {
        self.0.trim().is_empty() || self.0 == REDACTED
    }
}

impl From<&str> for SecretString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SecretString {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[redacted]")
    }
}

impl std::fmt::Display for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[redacted]")
    }
}

impl Drop for SecretString {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// A saved S3-compatible data source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceConfig {
    /// Stable identifier, assigned once on add
    #[serde(default)]
    pub id: String,
    /// Unique user-facing key; also the mount directory name
    pub name: String,
    /// Custom endpoint URL (MinIO, R2, ...); `None` means AWS
    #[serde(default)]
    pub endpoint: Option<String>,
    pub access_key: String,
    pub secret_key: SecretString,
    #[serde(default)]
    pub region: String,
    /// Restrict to a single bucket; `None` exposes every bucket
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub description: String,
}

impl DataSourceConfig {
    /// Copy that is safe to hand out: the secret is replaced by a placeholder
    pub fn redacted(&self) -> Self {
        Self {
            secret_key: SecretString::new(REDACTED),
            ..self.clone()
        }
    }

    pub fn is_redacted(&self) -> bool {
        self.secret_key.expose() == REDACTED
    }
}

fn trim_opt(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn validate_name(name: &str) -> EngineResult<()> {
    if name.is_empty() {
        return Err(EngineError::validation("Name is required"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::validation(format!(
            "Name must be at most {} characters",
            MAX_NAME_LEN
        )));
    }
    if name == "." || name == ".." {
        return Err(EngineError::validation("Name cannot be '.' or '..'"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(EngineError::validation(
            "Name may only contain letters, digits, '-', '_' and '.'",
        ));
    }
    Ok(())
}

/// Trims fields, fills validated defaults and rejects malformed input.
///
/// The secret is only required when `require_secret` is set; updates may
/// leave it empty to keep the stored one.
pub fn normalize_config(
    mut config: DataSourceConfig,
    require_secret: bool,
) -> EngineResult<DataSourceConfig> {
    config.name = config.name.trim().to_string();
    validate_name(&config.name)?;

    config.access_key = config.access_key.trim().to_string();
    if config.access_key.is_empty() {
        return Err(EngineError::validation("Access key is required"));
    }

    if require_secret && config.secret_key.is_placeholder() {
        return Err(EngineError::validation("Secret key is required"));
    }

    config.endpoint = trim_opt(config.endpoint);
    if let Some(endpoint) = config.endpoint.as_deref() {
        let parsed = url::Url::parse(endpoint)
            .map_err(|e| EngineError::validation(format!("Invalid endpoint: {}", e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(EngineError::validation(
                "Endpoint must use http:// or https://",
            ));
        }
    }

    config.region = config.region.trim().to_string();
    if config.region.is_empty() {
        config.region = DEFAULT_REGION.to_string();
    }

    config.bucket = trim_opt(config.bucket);
    if let Some(bucket) = config.bucket.as_deref() {
        if bucket.contains('/') {
            return Err(EngineError::validation("Bucket name cannot contain '/'"));
        }
    }

    config.description = config.description.trim().to_string();
    Ok(config)
}

/// Blob-store credentials for vault backup, stored inside the vault
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default)]
    pub token: SecretString,
    /// Remote blob (gist) id; assigned on first push when absent
    #[serde(default)]
    pub blob_id: Option<String>,
}

impl SyncSettings {
    pub fn is_configured(&self) -> bool {
        !self.token.is_placeholder()
    }

    /// `abcd...wxyz` for long tokens, `set` for short ones, empty when absent
    pub fn masked_token(&self) -> String {
        let token = self.token.expose();
        if token.is_empty() {
            String::new()
        } else if token.chars().count() > 8 {
            let chars: Vec<char> = token.chars().collect();
            let head: String = chars[..4].iter().collect();
            let tail: String = chars[chars.len() - 4..].iter().collect();
            format!("{}...{}", head, tail)
        } else {
            "set".to_string()
        }
    }
}

/// Plaintext contents of the vault
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultDocument {
    /// Ordered by insertion
    #[serde(default)]
    pub data_sources: Vec<DataSourceConfig>,
    #[serde(default)]
    pub sync: SyncSettings,
}

impl VaultDocument {
    pub fn find(&self, name: &str) -> Option<&DataSourceConfig> {
        self.data_sources.iter().find(|ds| ds.name == name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.data_sources.iter().position(|ds| ds.name == name)
    }

    /// Rejects documents that break the unique-name invariant.
    pub fn validate(&self) -> EngineResult<()> {
        let mut seen = std::collections::HashSet::new();
        for ds in &self.data_sources {
            validate_name(&ds.name)
                .map_err(|e| EngineError::corrupt(format!("Invalid data source in vault: {}", e)))?;
            if !seen.insert(ds.name.as_str()) {
                return Err(EngineError::corrupt(format!(
                    "Duplicate data source '{}' in vault",
                    ds.name
                )));
            }
        }
        Ok(())
    }
}
