//! External capability traits
//!
//! The object-store client and the mount driver are collaborators outside the
//! core. The supervisor and the command layer only talk to these traits; the
//! rclone implementations live in [`crate::engine::rclone`].

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::engine::error::EngineResult;
use crate::engine::process;
use crate::engine::types::RemoteEntry;
use crate::vault::DataSourceConfig;

/// Connectivity test and directory listing against an S3-compatible store
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Returns the unique identifier for this client (e.g., "rclone")
    fn store_id(&self) -> &'static str;

    /// Verifies the credentials and endpoint without persisting anything
    async fn test_connection(&self, source: &DataSourceConfig) -> EngineResult<()>;

    /// Lists the direct children of `remote_path`.
    ///
    /// With no bucket configured, the root lists buckets as directories.
    async fn list(&self, source: &DataSourceConfig, remote_path: &str)
        -> EngineResult<Vec<RemoteEntry>>;
}

/// Everything a driver needs to project a remote onto a local path.
///
/// `source` carries the decrypted secret; drivers must hand it to the
/// process directly and never write it to disk or logs.
pub struct MountRequest<'a> {
    pub source: &'a DataSourceConfig,
    pub remote_path: &'a str,
    pub local_path: &'a Path,
}

/// A launched driver process
#[async_trait]
pub trait MountProcess: Send {
    fn pid(&self) -> u32;

    /// Resolves once the mount is serving, or fails if the process exits first.
    ///
    /// Never times out on its own; the supervisor bounds it.
    async fn wait_ready(&mut self) -> EngineResult<()>;
}

/// Projects a remote store onto a local directory as a live filesystem
#[async_trait]
pub trait MountDriver: Send + Sync {
    fn driver_id(&self) -> &'static str;

    /// Starts the driver process. Returns as soon as the pid is known.
    async fn launch(&self, request: MountRequest<'_>) -> EngineResult<Box<dyn MountProcess>>;

    fn is_alive(&self, pid: u32) -> bool {
        process::is_process_alive(pid)
    }

    /// Whether `pid` is still this driver's process for `local_path`, and
    /// not an unrelated process that was handed a recycled pid.
    fn owns(&self, pid: u32, local_path: &Path) -> bool {
        process::serves_mount(pid, local_path)
    }

    /// Asks the process to exit, force-killing it after `grace`.
    async fn terminate(&self, pid: u32, grace: Duration) -> EngineResult<()> {
        process::terminate(pid, grace).await.map(|_| ())
    }

    /// Detaches a mount point left behind by a dead driver.
    async fn release(&self, local_path: &Path) -> EngineResult<()> {
        let _ = local_path;
        Ok(())
    }
}

/// Resolves full credentials by data source name at mount time
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn resolve(&self, name: &str) -> EngineResult<DataSourceConfig>;
}
