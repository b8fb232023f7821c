//! System Commands
//!
//! Login-item registration and application settings.

use serde::Serialize;

use super::CommandResult;
use crate::engine::error::EngineError;
use crate::settings::{AppSettings, MAX_TIMEOUT_SECS};
use crate::SharedState;

#[derive(Debug, Serialize)]
pub struct AutoStartResponse {
    pub supported: bool,
    pub enabled: bool,
}

pub async fn get_auto_start(state: &SharedState) -> CommandResult<AutoStartResponse> {
    Ok(AutoStartResponse {
        supported: state.autostart.is_some(),
        enabled: state.autostart.as_ref().is_some_and(|a| a.is_enabled()),
    })
}

/// Registers or removes the login item and remembers the choice
pub async fn set_auto_start(state: &SharedState, enabled: bool) -> CommandResult<AutoStartResponse> {
    let autostart = state
        .autostart
        .as_ref()
        .ok_or_else(|| EngineError::validation("Auto-start is not supported on this platform"))?;
    autostart.set_enabled(enabled).await?;

    let mut settings = state.settings.write().await;
    if settings.auto_start != enabled {
        let mut updated = settings.clone();
        updated.auto_start = enabled;
        updated.save_to_file(&state.paths.settings_file())?;
        *settings = updated;
    }

    Ok(AutoStartResponse {
        supported: true,
        enabled: autostart.is_enabled(),
    })
}

pub async fn get_settings(state: &SharedState) -> CommandResult<AppSettings> {
    Ok(state.settings.read().await.clone())
}

/// Persists new settings. Mount timeouts and paths apply after a restart;
/// `auto_start` is only changed through [`set_auto_start`].
pub async fn update_settings(
    state: &SharedState,
    new_settings: AppSettings,
) -> CommandResult<AppSettings> {
    if new_settings.mount_startup_timeout_secs == 0 {
        return Err(EngineError::validation("Mount startup timeout must be positive").into());
    }
    if new_settings.reconcile_interval_secs == 0 {
        return Err(EngineError::validation("Reconcile interval must be positive").into());
    }
    let largest = new_settings
        .mount_startup_timeout_secs
        .max(new_settings.unmount_grace_secs)
        .max(new_settings.reconcile_interval_secs);
    if largest > MAX_TIMEOUT_SECS {
        return Err(EngineError::validation(format!(
            "Timeouts and intervals must not exceed {} seconds",
            MAX_TIMEOUT_SECS
        ))
        .into());
    }
    if new_settings.rclone_binary.trim().is_empty() {
        return Err(EngineError::validation("rclone binary is required").into());
    }
    if new_settings.mounts_root.as_os_str().is_empty() {
        return Err(EngineError::validation("Mounts directory is required").into());
    }
    new_settings
        .kdf
        .validate()
        .map_err(|e| EngineError::validation(e.to_string()))?;

    let mut settings = state.settings.write().await;
    let updated = AppSettings {
        auto_start: settings.auto_start,
        ..new_settings
    };
    updated.save_to_file(&state.paths.settings_file())?;
    *settings = updated.clone();

    tracing::info!("Settings updated");
    Ok(updated)
}
