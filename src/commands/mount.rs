//! Mount Commands
//!
//! Thin wrappers over the mount supervisor. Mounting needs an unlocked vault;
//! unmounting and inspection do not.

use std::path::PathBuf;

use serde::Serialize;

use super::CommandResult;
use crate::engine::types::{MountRecord, MountStatus, ReconcileReport};
use crate::SharedState;

#[derive(Debug, Serialize)]
pub struct MountStatusResponse {
    pub name: String,
    pub status: MountStatus,
    pub local_path: PathBuf,
    pub remote_path: Option<String>,
    pub error: Option<String>,
}

/// Starts mounting `name`; returns as soon as `Mounting` is recorded.
pub async fn mount(
    state: &SharedState,
    name: String,
    remote_path: Option<String>,
) -> CommandResult<MountRecord> {
    let session = state.session().await?;
    let record = state
        .supervisor
        .mount(&*session, &name, remote_path.as_deref().unwrap_or_default())
        .await?;
    Ok(record)
}

/// Stops the driver and removes the record once its exit is confirmed.
pub async fn unmount(state: &SharedState, name: String) -> CommandResult<()> {
    Ok(state.supervisor.unmount(&name).await?)
}

pub async fn list_mounts(state: &SharedState) -> CommandResult<Vec<MountRecord>> {
    Ok(state.supervisor.list())
}

pub async fn get_mount_status(
    state: &SharedState,
    name: String,
) -> CommandResult<MountStatusResponse> {
    let record = state.supervisor.get(&name);
    Ok(MountStatusResponse {
        status: record
            .as_ref()
            .map(|r| r.status)
            .unwrap_or(MountStatus::Unmounted),
        local_path: state.supervisor.local_path(&name),
        remote_path: record.as_ref().map(|r| r.remote_path.clone()),
        error: record.and_then(|r| r.error),
        name,
    })
}

/// Runs a reconcile sweep now instead of waiting for the next tick
pub async fn reconcile_mounts(state: &SharedState) -> CommandResult<ReconcileReport> {
    Ok(state.supervisor.reconcile().await)
}
