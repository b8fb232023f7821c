//! Application settings.
//!
//! Non-secret preferences are persisted to a per-user JSON file. Environment
//! variables override stored values so managed deployments and tests can pin
//! locations and timeouts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::error::{EngineError, EngineResult};
use crate::persist;
use crate::vault::crypto::KdfParams;

const APP_DIR_NAME: &str = "rmount";

/// Upper bound for every timeout and interval setting, in seconds
pub const MAX_TIMEOUT_SECS: u64 = 3600;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppSettings {
    /// Parent directory of every local mount point
    pub mounts_root: PathBuf,
    pub rclone_binary: String,
    pub mount_startup_timeout_secs: u64,
    pub unmount_grace_secs: u64,
    pub reconcile_interval_secs: u64,
    pub auto_start: bool,
    /// KDF cost used when a vault is created or re-keyed
    pub kdf: KdfParams,
}

/// Every on-disk location, derived from one config directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub config_dir: PathBuf,
}

impl AppPaths {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    /// `$RMOUNT_CONFIG_DIR`, else `~/.rmount` (`%APPDATA%\rmount` on Windows)
    pub fn from_env() -> Self {
        if let Some(dir) = std::env::var_os("RMOUNT_CONFIG_DIR") {
            return Self::new(dir);
        }
        Self::new(default_config_dir())
    }

    pub fn vault_file(&self) -> PathBuf {
        self.config_dir.join("vault.enc")
    }

    pub fn mounts_file(&self) -> PathBuf {
        self.config_dir.join("mounts.json")
    }

    pub fn sync_state_file(&self) -> PathBuf {
        self.config_dir.join("sync_state.json")
    }

    pub fn settings_file(&self) -> PathBuf {
        self.config_dir.join("settings.json")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.config_dir.join("logs")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.config_dir.join("cache")
    }
}

fn home_dir() -> PathBuf {
    if cfg!(windows) {
        let appdata = std::env::var_os("APPDATA")
            .unwrap_or_else(|| std::env::var_os("USERPROFILE").unwrap_or_default());
        PathBuf::from(appdata)
    } else {
        PathBuf::from(std::env::var_os("HOME").unwrap_or_default())
    }
}

fn default_config_dir() -> PathBuf {
    if cfg!(windows) {
        home_dir().join(APP_DIR_NAME)
    } else {
        home_dir().join(format!(".{}", APP_DIR_NAME))
    }
}

fn env_u64_opt(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            mounts_root: home_dir().join("mounts"),
            rclone_binary: "rclone".to_string(),
            mount_startup_timeout_secs: 30,
            unmount_grace_secs: 5,
            reconcile_interval_secs: 30,
            auto_start: false,
            kdf: KdfParams::default(),
        }
    }
}

impl AppSettings {
    fn apply_env_overrides(&mut self) {
        if let Some(root) = std::env::var_os("RMOUNT_MOUNTS_ROOT") {
            self.mounts_root = PathBuf::from(root);
        }
        if let Ok(binary) = std::env::var("RMOUNT_RCLONE_BINARY") {
            if !binary.trim().is_empty() {
                self.rclone_binary = binary.trim().to_string();
            }
        }
        if let Some(value) = env_u64_opt("RMOUNT_MOUNT_TIMEOUT_SECS") {
            self.mount_startup_timeout_secs = value;
        }
        if let Some(value) = env_u64_opt("RMOUNT_UNMOUNT_GRACE_SECS") {
            self.unmount_grace_secs = value;
        }
    }

    /// Replaces nonsensical values with defaults instead of refusing to start.
    fn normalize(&mut self) {
        let defaults = Self::default();
        if self.mount_startup_timeout_secs == 0 {
            self.mount_startup_timeout_secs = defaults.mount_startup_timeout_secs;
        }
        if self.reconcile_interval_secs == 0 {
            self.reconcile_interval_secs = defaults.reconcile_interval_secs;
        }
        for (key, value) in [
            ("mount_startup_timeout_secs", &mut self.mount_startup_timeout_secs),
            ("unmount_grace_secs", &mut self.unmount_grace_secs),
            ("reconcile_interval_secs", &mut self.reconcile_interval_secs),
        ] {
            if *value > MAX_TIMEOUT_SECS {
                tracing::warn!(key, value = *value, max = MAX_TIMEOUT_SECS, "Setting too large, clamping");
                *value = MAX_TIMEOUT_SECS;
            }
        }
        if self.rclone_binary.trim().is_empty() {
            self.rclone_binary = defaults.rclone_binary;
        }
        if self.mounts_root.as_os_str().is_empty() {
            self.mounts_root = defaults.mounts_root;
        }
        if self.kdf.validate().is_err() {
            tracing::warn!("Stored KDF parameters are out of range, using defaults");
            self.kdf = defaults.kdf;
        }
    }

    /// Loads settings from `path`; a missing or unreadable file yields defaults.
    pub fn load(path: &Path) -> Self {
        let stored = persist::read_optional(path)
            .ok()
            .flatten()
            .and_then(|raw| match serde_json::from_slice::<AppSettings>(&raw) {
                Ok(settings) => Some(settings),
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "Ignoring malformed settings file");
                    None
                }
            });

        let mut settings = stored.unwrap_or_default();
        settings.apply_env_overrides();
        settings.normalize();
        settings
    }

    pub fn save_to_file(&self, path: &Path) -> EngineResult<()> {
        let payload = serde_json::to_vec_pretty(self)
            .map_err(|e| EngineError::internal(format!("Settings serialization failed: {}", e)))?;
        persist::write_atomic(path, &payload)
    }

    pub fn mount_startup_timeout(&self) -> Duration {
        Duration::from_secs(self.mount_startup_timeout_secs)
    }

    pub fn unmount_grace(&self) -> Duration {
        Duration::from_secs(self.unmount_grace_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}
