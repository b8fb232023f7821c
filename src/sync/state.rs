//! Persisted sync bookkeeping

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::error::{EngineError, EngineResult};
use crate::persist;

/// What this device last saw of the remote blob
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncState {
    /// Remote revision after the last successful push or pull
    pub last_revision: Option<String>,
    /// Fingerprint of the local vault file at that moment
    pub last_digest: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl SyncState {
    /// True when the remote is still at the revision we last saw
    pub fn is_current(&self, revision: &str) -> bool {
        self.last_revision.as_deref() == Some(revision)
    }
}

#[derive(Debug, Clone)]
pub struct SyncStateStore {
    path: PathBuf,
}

impl SyncStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable state is treated as "never synced".
    pub fn load(&self) -> SyncState {
        match persist::read_optional(&self.path) {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(path = %self.path.display(), error = %e, "Ignoring unreadable sync state");
                SyncState::default()
            }),
            Ok(None) => SyncState::default(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read sync state");
                SyncState::default()
            }
        }
    }

    pub fn save(&self, state: &SyncState) -> EngineResult<()> {
        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| EngineError::internal(format!("Sync state serialization failed: {}", e)))?;
        persist::write_atomic(&self.path, &json)
    }
}
