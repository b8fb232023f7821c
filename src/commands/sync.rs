//! Sync Commands
//!
//! Blob-store credentials and push/pull of the encrypted vault.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::CommandResult;
use crate::engine::error::{EngineError, ErrorCategory};
use crate::sync::{PullOutcome, PushOutcome};
use crate::vault::SecretString;
use crate::SharedState;

/// Sync settings as shown to the user; the token is never returned
#[derive(Debug, Serialize)]
pub struct SyncSettingsResponse {
    pub configured: bool,
    pub masked_token: String,
    pub blob_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SyncAccessResponse {
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SyncStatusResponse {
    pub last_revision: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

pub async fn get_sync_settings(state: &SharedState) -> CommandResult<SyncSettingsResponse> {
    let settings = state.session().await?.sync_settings().await;
    Ok(SyncSettingsResponse {
        configured: settings.is_configured(),
        masked_token: settings.masked_token(),
        blob_id: settings.blob_id,
    })
}

/// Stores the token and gist id in the vault. An empty or redacted token
/// keeps the stored one.
pub async fn set_sync_settings(
    state: &SharedState,
    token: String,
    blob_id: Option<String>,
) -> CommandResult<SyncSettingsResponse> {
    let session = state.session().await?;
    session
        .set_sync_settings(SecretString::new(token), blob_id)
        .await?;
    get_sync_settings(state).await
}

/// Checks the stored token. A rejected token or an unreachable API is a
/// failed test, not an error.
pub async fn test_sync_access(state: &SharedState) -> CommandResult<SyncAccessResponse> {
    let session = state.session().await?;
    match state.sync.check_access(&session).await {
        Ok(()) => Ok(SyncAccessResponse {
            success: true,
            error: None,
        }),
        Err(e) if matches!(e.category(), ErrorCategory::Validation | ErrorCategory::Transport) => {
            Ok(SyncAccessResponse {
                success: false,
                error: Some(e.to_string()),
            })
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn push_vault(state: &SharedState) -> CommandResult<PushOutcome> {
    let session = state.session().await?;
    Ok(state.sync.push(&session).await?)
}

/// Replaces the local vault with the remote copy when it changed.
///
/// Pulling while data sources are mounted is allowed: running mounts keep
/// the credentials they were started with. A remote vault that no longer
/// has a mounted data source is refused with `InUse`.
pub async fn pull_vault(state: &SharedState) -> CommandResult<PullOutcome> {
    let session = state.session().await?;
    let in_use: Vec<String> = state
        .supervisor
        .list()
        .into_iter()
        .filter(|record| !record.status.is_idle())
        .map(|record| record.name)
        .collect();
    Ok(state.sync.pull(&session, &in_use).await?)
}

pub async fn get_sync_state(state: &SharedState) -> CommandResult<SyncStatusResponse> {
    if !state.vault.is_initialized() {
        return Err(EngineError::NotInitialized.into());
    }
    let sync = state.sync.state();
    Ok(SyncStatusResponse {
        last_revision: sync.last_revision,
        last_synced_at: sync.last_synced_at,
    })
}
