//! Vault Module
//!
//! Encrypted-at-rest registry of data source configurations, protected by a
//! master password.

pub mod credentials;
pub mod crypto;
pub mod session;
pub mod storage;

use std::path::PathBuf;

use tracing::instrument;
use zeroize::Zeroizing;

pub use credentials::{DataSourceConfig, SecretString, SyncSettings, VaultDocument};
pub use session::VaultSession;
pub use storage::VaultStorage;

use crate::engine::error::{EngineError, EngineResult};
use crate::persist;
use crypto::{KdfHeader, KdfParams};

pub const MIN_PASSWORD_LEN: usize = 8;

pub(crate) fn validate_password(password: &str) -> EngineResult<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(EngineError::validation(format!(
            "Master password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

/// Entry point to the vault file: creates it or opens a session on it
#[derive(Debug, Clone)]
pub struct CredentialVault {
    storage: VaultStorage,
    kdf: KdfParams,
}

impl CredentialVault {
    pub fn new(path: impl Into<PathBuf>, kdf: KdfParams) -> Self {
        Self {
            storage: VaultStorage::new(path),
            kdf,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.storage.exists()
    }

    pub fn storage(&self) -> &VaultStorage {
        &self.storage
    }

    /// First run only: creates an empty vault under `password`.
    #[instrument(skip_all, fields(path = %self.storage.path().display()))]
    pub async fn initialize(&self, password: &str) -> EngineResult<VaultSession> {
        if self.is_initialized() {
            return Err(EngineError::AlreadyInitialized);
        }
        validate_password(password)?;

        let key = session::derive_key(password, KdfHeader::generate(self.kdf)).await?;
        let document = VaultDocument::default();
        let plaintext = Zeroizing::new(
            serde_json::to_vec(&document)
                .map_err(|e| EngineError::internal(format!("Vault serialization failed: {}", e)))?,
        );
        let sealed = key.seal(&plaintext)?;

        if !persist::write_new(self.storage.path(), &sealed)? {
            return Err(EngineError::AlreadyInitialized);
        }

        tracing::info!("Vault initialized");
        Ok(VaultSession::new(
            self.storage.clone(),
            Zeroizing::new(password.to_string()),
            key,
            document,
        ))
    }

    /// Derives the key from the stored salt and decrypts the vault.
    ///
    /// A wrong password fails with `InvalidPassword`; a vault that cannot be
    /// parsed or authenticated fails with `CorruptState`.
    #[instrument(skip_all, fields(path = %self.storage.path().display()))]
    pub async fn unlock(&self, password: &str) -> EngineResult<VaultSession> {
        let envelope = self.storage.read_envelope()?;

        let key = session::derive_key(password, envelope.kdf.clone()).await?;
        let plaintext = key.open(&envelope).map_err(|e| {
            if matches!(e, EngineError::InvalidPassword) {
                tracing::warn!("Vault unlock rejected: wrong password");
            }
            e
        })?;
        let document = session::decode_document(&plaintext)?;

        tracing::info!(data_sources = document.data_sources.len(), "Vault unlocked");
        Ok(VaultSession::new(
            self.storage.clone(),
            Zeroizing::new(password.to_string()),
            key,
            document,
        ))
    }
}
