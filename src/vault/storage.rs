//! Vault Storage
//!
//! The encrypted vault lives in one file. Reads return the raw envelope;
//! writes always go through an atomic replace.

use std::path::{Path, PathBuf};

use crate::engine::error::{EngineError, EngineResult};
use crate::persist;
use crate::vault::crypto::Envelope;

/// Location of the encrypted vault on disk
#[derive(Debug, Clone)]
pub struct VaultStorage {
    path: PathBuf,
}

impl VaultStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Reads the raw envelope bytes
    pub fn read_raw(&self) -> EngineResult<Vec<u8>> {
        persist::read_optional(&self.path)?.ok_or(EngineError::NotInitialized)
    }

    /// Reads and structurally validates the envelope
    pub fn read_envelope(&self) -> EngineResult<Envelope> {
        Envelope::parse(&self.read_raw()?)
    }

    pub fn write_raw(&self, bytes: &[u8]) -> EngineResult<()> {
        persist::write_atomic(&self.path, bytes)?;
        tracing::debug!(path = %self.path.display(), bytes = bytes.len(), "Vault persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_vault_is_not_initialized() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = VaultStorage::new(dir.path().join("vault.enc"));

        assert!(!storage.exists());
        assert!(matches!(storage.read_raw(), Err(EngineError::NotInitialized)));
    }

    #[test]
    fn unreadable_envelope_is_corrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = VaultStorage::new(dir.path().join("vault.enc"));
        storage.write_raw(b"{\"version\":1}").expect("write");

        assert!(matches!(
            storage.read_envelope(),
            Err(EngineError::CorruptState { .. })
        ));
    }
}
