// Engine Module
// Mount lifecycle and the external capabilities it drives

pub mod error;
pub mod mount_registry;
pub mod mount_supervisor;
pub mod process;
pub mod rclone;
pub mod traits;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{EngineError, EngineResult, ErrorCategory};
pub use mount_registry::MountRegistry;
pub use mount_supervisor::{MountSupervisor, SupervisorOptions};
pub use rclone::Rclone;
pub use traits::{CredentialSource, MountDriver, MountProcess, MountRequest, ObjectStore};
pub use types::*;
