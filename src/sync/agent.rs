//! Sync Agent
//!
//! Pushes and pulls the encrypted vault blob. There is no field-level merge:
//! whichever device writes last wins, at whole-blob granularity.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::instrument;

use crate::engine::error::{EngineError, EngineResult};
use crate::sync::blob_store::{BlobStore, Revision};
use crate::sync::state::{SyncState, SyncStateStore};
use crate::vault::crypto::fingerprint;
use crate::vault::{SyncSettings, VaultSession};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushOutcome {
    pub blob_id: String,
    pub revision: Revision,
    /// False when the remote already held this exact vault
    pub uploaded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullOutcome {
    pub revision: Revision,
    /// False when the remote revision was already applied
    pub applied: bool,
    pub data_sources: usize,
}

fn require_token(settings: &SyncSettings) -> EngineResult<()> {
    if settings.is_configured() {
        Ok(())
    } else {
        Err(EngineError::validation("Sync token is not configured"))
    }
}

pub struct SyncAgent {
    store: Arc<dyn BlobStore>,
    state: SyncStateStore,
    // Push and pull never overlap
    running: Mutex<()>,
}

impl SyncAgent {
    pub fn new(store: Arc<dyn BlobStore>, state: SyncStateStore) -> Self {
        Self {
            store,
            state,
            running: Mutex::new(()),
        }
    }

    pub fn state(&self) -> SyncState {
        self.state.load()
    }

    /// Checks the stored token against the blob store
    pub async fn check_access(&self, session: &VaultSession) -> EngineResult<()> {
        let settings = session.sync_settings().await;
        require_token(&settings)?;
        self.store.check_access(&settings.token).await
    }

    /// Uploads the encrypted vault exactly as stored on disk.
    ///
    /// Skips the upload when neither the local vault nor the remote revision
    /// changed since the last sync. A remote that moved on without us is
    /// overwritten.
    #[instrument(skip_all, fields(store = self.store.store_id()))]
    pub async fn push(&self, session: &VaultSession) -> EngineResult<PushOutcome> {
        let _running = self.running.lock().await;
        let settings = session.sync_settings().await;
        require_token(&settings)?;

        let bytes = session.export_encrypted().await?;
        let digest = fingerprint(&bytes);
        let previous = self.state.load();

        if let Some(blob_id) = settings.blob_id.as_deref() {
            if previous.last_digest.as_deref() == Some(digest.as_str()) {
                let remote = self.store.revision(&settings.token, blob_id).await?;
                if previous.is_current(&remote) {
                    tracing::debug!(revision = %remote, "Remote already up to date");
                    return Ok(PushOutcome {
                        blob_id: blob_id.to_string(),
                        revision: remote,
                        uploaded: false,
                    });
                }
                tracing::warn!(
                    seen = ?previous.last_revision,
                    remote = %remote,
                    "Remote vault changed since last sync, overwriting"
                );
            }
        }

        let pushed = self
            .store
            .push(&settings.token, settings.blob_id.as_deref(), &bytes)
            .await?;
        tracing::info!(blob_id = %pushed.blob_id, revision = %pushed.revision, "Vault pushed");

        let mut digest = Some(digest);
        if settings.blob_id.as_deref() != Some(pushed.blob_id.as_str()) {
            // New remote blob: remember it. This rewrites the local vault, so
            // the pushed digest no longer describes it.
            session.set_blob_id(&pushed.blob_id).await?;
            digest = None;
        }

        self.state.save(&SyncState {
            last_revision: Some(pushed.revision.clone()),
            last_digest: digest,
            last_synced_at: Some(Utc::now()),
        })?;

        Ok(PushOutcome {
            blob_id: pushed.blob_id,
            revision: pushed.revision,
            uploaded: true,
        })
    }

    /// Replaces the local vault with the remote one when the remote revision
    /// differs from the last one seen.
    ///
    /// Network failures surface as `RemoteUnavailable`, a blob sealed under
    /// another password as `DecryptionFailed`; the local vault is untouched in
    /// both cases. A remote vault that lacks any name in `keep` is refused
    /// with `InUse`. This device's sync settings survive the replacement.
    #[instrument(skip_all, fields(store = self.store.store_id()))]
    pub async fn pull(&self, session: &VaultSession, keep: &[String]) -> EngineResult<PullOutcome> {
        let _running = self.running.lock().await;
        let settings = session.sync_settings().await;
        require_token(&settings)?;
        let blob_id = settings
            .blob_id
            .clone()
            .ok_or_else(|| EngineError::validation("No remote vault configured; push first or set a gist id"))?;

        let remote = self.store.pull(&settings.token, &blob_id).await?;
        let previous = self.state.load();
        if previous.is_current(&remote.revision) {
            tracing::debug!(revision = %remote.revision, "Remote revision already applied");
            return Ok(PullOutcome {
                revision: remote.revision,
                applied: false,
                data_sources: session.list().await.len(),
            });
        }

        let count = session.replace_from_encrypted(&remote.bytes, keep).await?;

        let pulled = session.sync_settings().await;
        if pulled.token != settings.token || pulled.blob_id.as_deref() != Some(blob_id.as_str()) {
            session
                .set_sync_settings(settings.token.clone(), Some(blob_id.clone()))
                .await?;
        }

        let local = session.export_encrypted().await?;
        self.state.save(&SyncState {
            last_revision: Some(remote.revision.clone()),
            last_digest: Some(fingerprint(&local)),
            last_synced_at: Some(Utc::now()),
        })?;

        tracing::info!(revision = %remote.revision, data_sources = count, "Vault pulled");
        Ok(PullOutcome {
            revision: remote.revision,
            applied: true,
            data_sources: count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::error::ConflictKind;
    use crate::engine::testing::{sample_source, MemoryBlobStore};
    use crate::vault::crypto::KdfParams;
    use crate::vault::{CredentialVault, SecretString};

    const PASSWORD: &str = "shared master password";
    const TOKEN: &str = "ghp_0123456789abcdef";

    struct Device {
        _dir: tempfile::TempDir,
        vault: CredentialVault,
        session: VaultSession,
        agent: SyncAgent,
    }

    async fn device(store: &Arc<MemoryBlobStore>, password: &str) -> Device {
        let dir = tempfile::tempdir().unwrap();
        let vault = CredentialVault::new(dir.path().join("vault.enc"), KdfParams::minimal());
        let session = vault.initialize(password).await.unwrap();
        let agent = SyncAgent::new(
            store.clone(),
            SyncStateStore::new(dir.path().join("sync_state.json")),
        );
        Device {
            _dir: dir,
            vault,
            session,
            agent,
        }
    }

    #[tokio::test]
    async fn push_then_pull_reproduces_config_set() {
        let store = Arc::new(MemoryBlobStore::default());
        let a = device(&store, PASSWORD).await;
        a.session.add(sample_source("minio-1")).await.unwrap();
        a.session.add(sample_source("archive")).await.unwrap();
        a.session.set_sync_settings(SecretString::new(TOKEN), None).await.unwrap();

        let pushed = a.agent.push(&a.session).await.expect("push");
        assert!(pushed.uploaded);
        assert_eq!(a.session.sync_settings().await.blob_id, Some(pushed.blob_id.clone()));

        let b = device(&store, PASSWORD).await;
        b.session
            .set_sync_settings(SecretString::new(TOKEN), Some(pushed.blob_id.clone()))
            .await
            .unwrap();
        let pulled = b.agent.pull(&b.session, &[]).await.expect("pull");
        assert!(pulled.applied);
        assert_eq!(pulled.data_sources, 2);

        let a_doc = a.session.document().await;
        let b_doc = b.session.document().await;
        assert_eq!(a_doc.data_sources, b_doc.data_sources);
        assert_eq!(b_doc.sync.blob_id, Some(pushed.blob_id));
        assert_eq!(b.session.resolve("minio-1").await.unwrap().secret_key.expose(), "SK");

        // Survives a restart of device B
        drop(b.session);
        let reopened = b.vault.unlock(PASSWORD).await.unwrap();
        assert_eq!(reopened.list().await.len(), 2);
    }

    #[tokio::test]
    async fn pull_of_seen_revision_is_a_noop() {
        let store = Arc::new(MemoryBlobStore::default());
        let a = device(&store, PASSWORD).await;
        a.session.set_sync_settings(SecretString::new(TOKEN), None).await.unwrap();
        a.agent.push(&a.session).await.unwrap();

        let b = device(&store, PASSWORD).await;
        let blob_id = a.session.sync_settings().await.blob_id;
        b.session.set_sync_settings(SecretString::new(TOKEN), blob_id).await.unwrap();

        assert!(b.agent.pull(&b.session, &[]).await.unwrap().applied);
        let before = b.session.export_encrypted().await.unwrap();
        assert!(!b.agent.pull(&b.session, &[]).await.unwrap().applied);
        assert_eq!(b.session.export_encrypted().await.unwrap(), before);
    }

    #[tokio::test]
    async fn pull_under_other_password_fails_and_keeps_local_vault() {
        let store = Arc::new(MemoryBlobStore::default());
        let a = device(&store, PASSWORD).await;
        a.session.add(sample_source("remote-only")).await.unwrap();
        a.session.set_sync_settings(SecretString::new(TOKEN), None).await.unwrap();
        a.agent.push(&a.session).await.unwrap();

        let b = device(&store, "a different password").await;
        b.session.add(sample_source("local-only")).await.unwrap();
        let blob_id = a.session.sync_settings().await.blob_id;
        b.session.set_sync_settings(SecretString::new(TOKEN), blob_id).await.unwrap();
        let before = b.session.export_encrypted().await.unwrap();

        let err = b.agent.pull(&b.session, &[]).await.expect_err("wrong password");
        assert!(matches!(err, EngineError::DecryptionFailed));
        assert!(!err.is_recoverable());

        assert_eq!(b.session.export_encrypted().await.unwrap(), before);
        let names: Vec<_> = b.session.list().await.into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["local-only"]);
        assert!(b.agent.state().last_revision.is_none());
    }

    #[tokio::test]
    async fn pull_refuses_to_drop_names_in_use() {
        let store = Arc::new(MemoryBlobStore::default());
        let a = device(&store, PASSWORD).await;
        a.session.add(sample_source("other")).await.unwrap();
        a.session.set_sync_settings(SecretString::new(TOKEN), None).await.unwrap();
        a.agent.push(&a.session).await.unwrap();

        let b = device(&store, PASSWORD).await;
        b.session.add(sample_source("minio-1")).await.unwrap();
        let blob_id = a.session.sync_settings().await.blob_id;
        b.session.set_sync_settings(SecretString::new(TOKEN), blob_id).await.unwrap();
        let before = b.session.export_encrypted().await.unwrap();

        let err = b
            .agent
            .pull(&b.session, &["minio-1".to_string()])
            .await
            .expect_err("name in use");
        assert_eq!(err.conflict_kind(), Some(ConflictKind::InUse));
        assert_eq!(b.session.export_encrypted().await.unwrap(), before);
        assert!(b.session.contains("minio-1").await);
        assert!(b.agent.state().last_revision.is_none());

        // Once nothing holds the name the same pull goes through
        assert!(b.agent.pull(&b.session, &[]).await.unwrap().applied);
        assert!(!b.session.contains("minio-1").await);
    }

    #[tokio::test]
    async fn offline_store_is_recoverable_and_harmless() {
        let store = Arc::new(MemoryBlobStore::default());
        let a = device(&store, PASSWORD).await;
        a.session.add(sample_source("minio-1")).await.unwrap();
        a.session.set_sync_settings(SecretString::new(TOKEN), None).await.unwrap();
        a.agent.push(&a.session).await.unwrap();
        let before = a.session.export_encrypted().await.unwrap();

        store.set_offline(true);
        let err = a.agent.pull(&a.session, &[]).await.expect_err("offline pull");
        assert!(matches!(err, EngineError::RemoteUnavailable { .. }));
        assert!(err.is_recoverable());
        let err = a.agent.push(&a.session).await.expect_err("offline push");
        assert!(matches!(err, EngineError::RemoteUnavailable { .. }));

        assert_eq!(a.session.export_encrypted().await.unwrap(), before);
    }

    #[tokio::test]
    async fn unchanged_vault_is_not_uploaded_twice() {
        let store = Arc::new(MemoryBlobStore::default());
        let a = device(&store, PASSWORD).await;
        a.session
            .set_sync_settings(SecretString::new(TOKEN), Some("blob-preset".into()))
            .await
            .unwrap();

        assert!(a.agent.push(&a.session).await.unwrap().uploaded);
        assert!(!a.agent.push(&a.session).await.unwrap().uploaded);
        assert_eq!(store.uploads(), 1);

        a.session.add(sample_source("new")).await.unwrap();
        assert!(a.agent.push(&a.session).await.unwrap().uploaded);
        assert_eq!(store.uploads(), 2);
    }

    #[tokio::test]
    async fn sync_requires_a_token() {
        let store = Arc::new(MemoryBlobStore::default());
        let a = device(&store, PASSWORD).await;

        let err = a.agent.push(&a.session).await.expect_err("no token");
        assert!(matches!(err, EngineError::Validation { .. }));
        let err = a.agent.pull(&a.session, &[]).await.expect_err("no token");
        assert!(matches!(err, EngineError::Validation { .. }));
        assert_eq!(store.uploads(), 0);
    }
}
