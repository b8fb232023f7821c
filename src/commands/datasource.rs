//! Data Source Commands
//!
//! CRUD on saved data sources, connection tests and remote browsing.

use serde::Serialize;

use super::CommandResult;
use crate::engine::error::{ConflictKind, EngineError};
use crate::engine::types::{normalize_remote_path, RemoteEntry};
use crate::vault::credentials::normalize_config;
use crate::vault::DataSourceConfig;
use crate::SharedState;

/// Response for connection tests
#[derive(Debug, Serialize)]
pub struct ConnectionTestResponse {
    pub success: bool,
    pub error: Option<String>,
}

impl ConnectionTestResponse {
    fn from_result(result: Result<(), EngineError>) -> CommandResult<Self> {
        match result {
            Ok(()) => Ok(Self {
                success: true,
                error: None,
            }),
            Err(e @ (EngineError::RemoteUnavailable { .. } | EngineError::Timeout { .. })) => {
                Ok(Self {
                    success: false,
                    error: Some(e.to_string()),
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// All data sources, secrets redacted
pub async fn list_data_sources(state: &SharedState) -> CommandResult<Vec<DataSourceConfig>> {
    let session = state.session().await?;
    Ok(session.list().await)
}

pub async fn add_data_source(
    state: &SharedState,
    config: DataSourceConfig,
) -> CommandResult<DataSourceConfig> {
    let session = state.session().await?;
    Ok(session.add(config).await?)
}

/// Replaces the data source saved as `name`. Renaming a data source that is
/// mounted fails with `InUse`.
pub async fn update_data_source(
    state: &SharedState,
    name: String,
    config: DataSourceConfig,
) -> CommandResult<DataSourceConfig> {
    let session = state.session().await?;
    let new_name = config.name.trim().to_string();
    if new_name == name {
        return Ok(session.update(&name, config).await?);
    }

    if !state.supervisor.status(&new_name).is_idle() {
        return Err(EngineError::conflict(ConflictKind::InUse, new_name).into());
    }
    let updated = state
        .supervisor
        .with_idle(&name, || session.update(&name, config))
        .await?;
    Ok(updated)
}

/// Deletes a data source. Fails with `InUse` unless its mount is `Unmounted`.
pub async fn remove_data_source(state: &SharedState, name: String) -> CommandResult<()> {
    let session = state.session().await?;
    state
        .supervisor
        .with_idle(&name, || session.remove(&name))
        .await?;
    Ok(())
}

/// Tests an unsaved configuration. Nothing is persisted.
pub async fn test_connection(
    state: &SharedState,
    config: DataSourceConfig,
) -> CommandResult<ConnectionTestResponse> {
    let config = normalize_config(config, true)?;
    ConnectionTestResponse::from_result(state.object_store.test_connection(&config).await)
}

/// Tests a saved data source with its stored secret
pub async fn test_saved_connection(
    state: &SharedState,
    name: String,
) -> CommandResult<ConnectionTestResponse> {
    let session = state.session().await?;
    let config = session.resolve(&name).await?;
    ConnectionTestResponse::from_result(state.object_store.test_connection(&config).await)
}

/// Lists the entries under `path` of a saved data source
pub async fn list_remote_files(
    state: &SharedState,
    name: String,
    path: Option<String>,
) -> CommandResult<Vec<RemoteEntry>> {
    let path = normalize_remote_path(path.as_deref().unwrap_or_default())?;
    let session = state.session().await?;
    let config = session.resolve(&name).await?;
    Ok(state.object_store.list(&config, &path).await?)
}
