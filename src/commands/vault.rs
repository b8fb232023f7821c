//! Vault Commands
//!
//! Master password lifecycle: first-run setup, unlock, lock and re-key.

use serde::Serialize;
use zeroize::Zeroizing;

use super::CommandResult;
use crate::SharedState;

/// Response for checking vault status
#[derive(Debug, Serialize)]
pub struct VaultStatusResponse {
    pub initialized: bool,
    pub unlocked: bool,
}

/// Response for vault operations
#[derive(Debug, Serialize)]
pub struct VaultResponse {
    pub success: bool,
    pub data_sources: usize,
}

pub async fn get_vault_status(state: &SharedState) -> CommandResult<VaultStatusResponse> {
    Ok(VaultStatusResponse {
        initialized: state.vault.is_initialized(),
        unlocked: state.is_unlocked().await,
    })
}

/// Creates the vault and leaves it unlocked
pub async fn initialize_vault(state: &SharedState, password: String) -> CommandResult<VaultResponse> {
    let password = Zeroizing::new(password);
    let session = state.vault.initialize(&password).await?;
    state.set_session(session).await;

    Ok(VaultResponse {
        success: true,
        data_sources: 0,
    })
}

pub async fn unlock_vault(state: &SharedState, password: String) -> CommandResult<VaultResponse> {
    let password = Zeroizing::new(password);
    let session = state.vault.unlock(&password).await?;
    let data_sources = session.list().await.len();
    state.set_session(session).await;

    Ok(VaultResponse {
        success: true,
        data_sources,
    })
}

/// Drops the session. Running mounts keep their credentials; nothing new can
/// be mounted until the next unlock.
pub async fn lock_vault(state: &SharedState) -> CommandResult<VaultResponse> {
    let was_unlocked = state.clear_session().await;
    if was_unlocked {
        tracing::info!("Vault locked");
    }
    Ok(VaultResponse {
        success: was_unlocked,
        data_sources: 0,
    })
}

pub async fn change_master_password(
    state: &SharedState,
    current: String,
    new_password: String,
) -> CommandResult<VaultResponse> {
    let current = Zeroizing::new(current);
    let new_password = Zeroizing::new(new_password);
    let session = state.session().await?;
    let kdf = state.settings.read().await.kdf;

    session.change_password(&current, &new_password, kdf).await?;
    Ok(VaultResponse {
        success: true,
        data_sources: session.list().await.len(),
    })
}
