// rmount - S3-compatible storage mounted locally
// Core library

pub mod commands;
pub mod engine;
pub mod observability;
pub mod persist;
pub mod settings;
pub mod sync;
pub mod system;
pub mod vault;

use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use engine::error::{EngineError, EngineResult};
use engine::{MountDriver, MountRegistry, MountSupervisor, ObjectStore, Rclone, SupervisorOptions};
use settings::{AppPaths, AppSettings};
use sync::{BlobStore, GistBlobStore, SyncAgent, SyncStateStore};
use system::AutoStart;
use vault::{CredentialVault, VaultSession};

pub type SharedState = Arc<AppState>;

/// External capabilities the core drives
pub struct Capabilities {
    pub driver: Arc<dyn MountDriver>,
    pub object_store: Arc<dyn ObjectStore>,
    pub blob_store: Arc<dyn BlobStore>,
    /// `None` where the platform has no login items
    pub autostart: Option<AutoStart>,
}

pub struct AppState {
    pub paths: AppPaths,
    pub settings: RwLock<AppSettings>,
    pub vault: CredentialVault,
    session: RwLock<Option<Arc<VaultSession>>>,
    pub supervisor: Arc<MountSupervisor>,
    pub object_store: Arc<dyn ObjectStore>,
    pub sync: SyncAgent,
    pub autostart: Option<AutoStart>,
}

impl AppState {
    /// Production wiring: rclone for mounts and listings, GitHub gists for sync.
    pub fn new(paths: AppPaths) -> EngineResult<Self> {
        let settings_file = paths.settings_file();
        let settings = AppSettings::load(&settings_file);
        if !settings_file.exists() {
            settings.save_to_file(&settings_file)?;
        }

        let rclone = Arc::new(Rclone::new(
            settings.rclone_binary.clone(),
            paths.cache_dir(),
            paths.log_dir(),
        ));
        let autostart = match std::env::current_exe() {
            Ok(program) => AutoStart::for_current_user(program)
                .map_err(|e| tracing::warn!(error = %e, "Auto-start unavailable"))
                .ok(),
            Err(e) => {
                tracing::warn!(error = %e, "Cannot locate executable, auto-start disabled");
                None
            }
        };

        Self::with_capabilities(
            paths,
            settings,
            Capabilities {
                driver: rclone.clone(),
                object_store: rclone,
                blob_store: Arc::new(GistBlobStore::new()?),
                autostart,
            },
        )
    }

    /// Loads the mount registry and assembles the components around
    /// `capabilities`. A corrupt registry file is an error, not a reset.
    pub fn with_capabilities(
        paths: AppPaths,
        settings: AppSettings,
        capabilities: Capabilities,
    ) -> EngineResult<Self> {
        let registry = MountRegistry::load(paths.mounts_file())?;
        let supervisor = Arc::new(MountSupervisor::new(
            registry,
            capabilities.driver,
            SupervisorOptions {
                mounts_root: settings.mounts_root.clone(),
                startup_timeout: settings.mount_startup_timeout(),
                unmount_grace: settings.unmount_grace(),
            },
        ));
        let vault = CredentialVault::new(paths.vault_file(), settings.kdf);
        let sync = SyncAgent::new(
            capabilities.blob_store,
            SyncStateStore::new(paths.sync_state_file()),
        );

        Ok(Self {
            paths,
            settings: RwLock::new(settings),
            vault,
            session: RwLock::new(None),
            supervisor,
            object_store: capabilities.object_store,
            sync,
            autostart: capabilities.autostart,
        })
    }

    /// The unlocked session, or why there is none
    pub async fn session(&self) -> EngineResult<Arc<VaultSession>> {
        match self.session.read().await.as_ref() {
            Some(session) => Ok(Arc::clone(session)),
            None if self.vault.is_initialized() => Err(EngineError::VaultLocked),
            None => Err(EngineError::NotInitialized),
        }
    }

    pub async fn is_unlocked(&self) -> bool {
        self.session.read().await.is_some()
    }

    pub(crate) async fn set_session(&self, session: VaultSession) {
        *self.session.write().await = Some(Arc::new(session));
    }

    /// Drops the session; returns whether one was open
    pub(crate) async fn clear_session(&self) -> bool {
        self.session.write().await.take().is_some()
    }

    /// Recovers mount bookkeeping left by a previous run, then keeps
    /// reconciling in the background.
    pub async fn start(&self) -> JoinHandle<()> {
        let report = self.supervisor.reconcile().await;
        tracing::info!(
            mounts = self.supervisor.list().len(),
            errored = report.errored.len(),
            recovered = report.recovered.len(),
            "Startup reconcile complete"
        );
        let every = self.settings.read().await.reconcile_interval();
        self.supervisor.spawn_reconciler(every)
    }

    /// Unmounts everything and locks the vault.
    pub async fn shutdown(&self) {
        for (name, result) in self.supervisor.unmount_all().await {
            if let Err(e) = result {
                tracing::warn!(name = %name, error = %e, "Unmount on shutdown failed");
            }
        }
        self.clear_session().await;
        tracing::info!("Shutdown complete");
    }
}

/// Process entry point for a presentation layer: logging, state, startup
/// reconcile and the background reconciler.
pub async fn run() -> EngineResult<(SharedState, JoinHandle<()>)> {
    let paths = AppPaths::from_env();
    let log_dir = paths.log_dir();
    observability::init_tracing(&log_dir)
        .map_err(|e| EngineError::io(format!("Cannot create log directory {}", log_dir.display()), e))?;
    tracing::info!(config_dir = %paths.config_dir.display(), "Starting rmount");

    let state: SharedState = Arc::new(AppState::new(paths)?);
    let reconciler = state.start().await;
    Ok((state, reconciler))
}
