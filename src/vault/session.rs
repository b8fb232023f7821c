//! Unlocked vault session
//!
//! Created by [`CredentialVault::unlock`](super::CredentialVault::unlock) and
//! dropped on lock. Holds the decrypted document and the derived key; every
//! mutation re-encrypts the whole document and atomically replaces the vault
//! file while holding the write lock, so concurrent writers cannot lose
//! updates and memory never gets ahead of disk.

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::instrument;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::engine::error::{ConflictKind, EngineError, EngineResult};
use crate::engine::traits::CredentialSource;
use crate::vault::credentials::{
    normalize_config, DataSourceConfig, SecretString, SyncSettings, VaultDocument,
};
use crate::vault::crypto::{self, Envelope, KdfHeader, KdfParams, VaultKey};
use crate::vault::storage::VaultStorage;

struct SessionInner {
    password: Zeroizing<String>,
    key: VaultKey,
    document: VaultDocument,
    /// Bumped whenever the password or key changes
    epoch: u64,
}

pub struct VaultSession {
    storage: VaultStorage,
    inner: RwLock<SessionInner>,
}

impl std::fmt::Debug for VaultSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultSession")
            .field("path", &self.storage.path())
            .finish_non_exhaustive()
    }
}

/// Runs the KDF on the blocking pool
pub(crate) async fn derive_key(password: &str, header: KdfHeader) -> EngineResult<VaultKey> {
    let password = Zeroizing::new(password.to_string());
    tokio::task::spawn_blocking(move || VaultKey::derive(&password, header))
        .await
        .map_err(|e| EngineError::internal(format!("Key derivation task failed: {}", e)))?
}

pub(crate) fn decode_document(plaintext: &[u8]) -> EngineResult<VaultDocument> {
    let document: VaultDocument = serde_json::from_slice(plaintext)
        .map_err(|e| EngineError::corrupt(format!("Vault contents are unreadable: {}", e)))?;
    document.validate()?;
    Ok(document)
}

fn encode_document(document: &VaultDocument) -> EngineResult<Zeroizing<Vec<u8>>> {
    serde_json::to_vec(document)
        .map(Zeroizing::new)
        .map_err(|e| EngineError::internal(format!("Vault serialization failed: {}", e)))
}

impl VaultSession {
    pub(crate) fn new(
        storage: VaultStorage,
        password: Zeroizing<String>,
        key: VaultKey,
        document: VaultDocument,
    ) -> Self {
        Self {
            storage,
            inner: RwLock::new(SessionInner {
                password,
                key,
                document,
                epoch: 0,
            }),
        }
    }

    /// Seals `document` and replaces the vault file, then adopts it in memory.
    fn commit(&self, inner: &mut SessionInner, document: VaultDocument) -> EngineResult<()> {
        let plaintext = encode_document(&document)?;
        let sealed = inner.key.seal(&plaintext)?;
        self.storage.write_raw(&sealed)?;
        inner.document = document;
        Ok(())
    }

    /// All data sources, secrets redacted
    pub async fn list(&self) -> Vec<DataSourceConfig> {
        let inner = self.inner.read().await;
        inner
            .document
            .data_sources
            .iter()
            .map(DataSourceConfig::redacted)
            .collect()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.inner.read().await.document.find(name).is_some()
    }

    /// Full configuration including the secret key.
    ///
    /// Only the mount and connection-test paths may call this; the result
    /// must never be logged or persisted outside the vault.
    pub async fn resolve(&self, name: &str) -> EngineResult<DataSourceConfig> {
        let inner = self.inner.read().await;
        inner
            .document
            .find(name)
            .cloned()
            .ok_or_else(|| EngineError::data_source_not_found(name))
    }

    #[instrument(skip(self, config), fields(name = %config.name))]
    pub async fn add(&self, config: DataSourceConfig) -> EngineResult<DataSourceConfig> {
        let mut config = normalize_config(config, true)?;

        let mut inner = self.inner.write().await;
        if inner.document.find(&config.name).is_some() {
            return Err(EngineError::duplicate_name(&config.name));
        }

        config.id = Uuid::new_v4().to_string();
        let mut document = inner.document.clone();
        document.data_sources.push(config.clone());
        self.commit(&mut inner, document)?;

        tracing::info!(id = %config.id, "Data source added");
        Ok(config.redacted())
    }

    /// Replaces the data source stored under `name`.
    ///
    /// The id is preserved. An empty or redacted secret keeps the stored one.
    /// Callers must make sure a renamed data source is not mounted.
    #[instrument(skip(self, config))]
    pub async fn update(
        &self,
        name: &str,
        config: DataSourceConfig,
    ) -> EngineResult<DataSourceConfig> {
        let mut config = normalize_config(config, false)?;

        let mut inner = self.inner.write().await;
        let index = inner
            .document
            .position(name)
            .ok_or_else(|| EngineError::data_source_not_found(name))?;

        if config.name != name && inner.document.find(&config.name).is_some() {
            return Err(EngineError::duplicate_name(&config.name));
        }

        let existing = &inner.document.data_sources[index];
        config.id = existing.id.clone();
        if config.secret_key.is_placeholder() {
            config.secret_key = existing.secret_key.clone();
        }

        let mut document = inner.document.clone();
        document.data_sources[index] = config.clone();
        self.commit(&mut inner, document)?;

        tracing::info!(new_name = %config.name, "Data source updated");
        Ok(config.redacted())
    }

    /// Deletes a data source.
    ///
    /// Mount usage is checked by the caller while it holds the mount
    /// supervisor's per-name slot.
    #[instrument(skip(self))]
    pub async fn remove(&self, name: &str) -> EngineResult<()> {
        let mut inner = self.inner.write().await;
        let index = inner
            .document
            .position(name)
            .ok_or_else(|| EngineError::data_source_not_found(name))?;

        let mut document = inner.document.clone();
        document.data_sources.remove(index);
        self.commit(&mut inner, document)?;

        tracing::info!("Data source removed");
        Ok(())
    }

    pub async fn sync_settings(&self) -> SyncSettings {
        self.inner.read().await.document.sync.clone()
    }

    /// Stores blob-store credentials. A placeholder token keeps the stored one.
    pub async fn set_sync_settings(
        &self,
        token: SecretString,
        blob_id: Option<String>,
    ) -> EngineResult<()> {
        let mut inner = self.inner.write().await;
        let mut document = inner.document.clone();
        if !token.is_placeholder() {
            document.sync.token = token;
        }
        document.sync.blob_id = blob_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());
        self.commit(&mut inner, document)
    }

    pub async fn set_blob_id(&self, blob_id: &str) -> EngineResult<()> {
        let mut inner = self.inner.write().await;
        if inner.document.sync.blob_id.as_deref() == Some(blob_id) {
            return Ok(());
        }
        let mut document = inner.document.clone();
        document.sync.blob_id = Some(blob_id.to_string());
        self.commit(&mut inner, document)
    }

    /// The encrypted vault exactly as persisted
    pub async fn export_encrypted(&self) -> EngineResult<Vec<u8>> {
        let _inner = self.inner.read().await;
        self.storage.read_raw()
    }

    /// Replaces the whole vault with an encrypted blob from another device.
    ///
    /// The blob is decrypted with this session's master password. Every name
    /// in `keep` must still be present in the new vault, otherwise the pull
    /// fails with `InUse`. On any failure the local vault is left untouched.
    /// Returns the number of data sources in the new vault.
    #[instrument(skip(self, encrypted, keep), fields(fingerprint = %crypto::fingerprint(encrypted)))]
    pub async fn replace_from_encrypted(&self, encrypted: &[u8], keep: &[String]) -> EngineResult<usize> {
        let envelope = Envelope::parse(encrypted)?;
        let (password, epoch) = {
            let inner = self.inner.read().await;
            (Zeroizing::new(inner.password.to_string()), inner.epoch)
        };

        let key = derive_key(&password, envelope.kdf.clone()).await?;
        let plaintext = key.open(&envelope).map_err(|e| match e {
            EngineError::InvalidPassword | EngineError::CorruptState { .. } => {
                EngineError::DecryptionFailed
            }
            other => other,
        })?;
        let document = decode_document(&plaintext)?;
        if let Some(missing) = keep.iter().find(|name| document.find(name).is_none()) {
            tracing::warn!(name = %missing, "Remote vault drops a data source that is in use");
            return Err(EngineError::conflict(ConflictKind::InUse, missing.as_str()));
        }
        let count = document.data_sources.len();

        let mut inner = self.inner.write().await;
        if inner.epoch != epoch {
            // The password changed while we were decrypting
            return Err(EngineError::conflict(ConflictKind::OperationInProgress, "vault"));
        }
        self.storage.write_raw(encrypted)?;
        inner.key = key;
        inner.document = document;
        inner.epoch += 1;

        tracing::info!(data_sources = count, "Vault replaced from remote copy");
        Ok(count)
    }

    /// Re-keys the vault under a new password with a fresh salt.
    ///
    /// `current` is checked the way unlock checks it: by deriving the key
    /// from the stored header and opening the canary.
    #[instrument(skip_all)]
    pub async fn change_password(
        &self,
        current: &str,
        new_password: &str,
        params: KdfParams,
    ) -> EngineResult<()> {
        super::validate_password(new_password)?;

        let (envelope, epoch) = {
            let inner = self.inner.read().await;
            (self.storage.read_envelope()?, inner.epoch)
        };
        derive_key(current, envelope.kdf.clone())
            .await?
            .open(&envelope)?;

        let key = derive_key(new_password, KdfHeader::generate(params)).await?;

        let mut inner = self.inner.write().await;
        if inner.epoch != epoch {
            return Err(EngineError::conflict(ConflictKind::OperationInProgress, "vault"));
        }
        let plaintext = encode_document(&inner.document)?;
        let sealed = key.seal(&plaintext)?;
        self.storage.write_raw(&sealed)?;
        inner.key = key;
        inner.password = Zeroizing::new(new_password.to_string());
        inner.epoch += 1;

        tracing::info!("Master password changed");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn document(&self) -> VaultDocument {
        self.inner.read().await.document.clone()
    }
}

#[async_trait]
impl CredentialSource for VaultSession {
    async fn resolve(&self, name: &str) -> EngineResult<DataSourceConfig> {
        VaultSession::resolve(self, name).await
    }
}
