//! Commands
//!
//! The surface consumed by the presentation layer. Each command is a plain
//! async function over [`SharedState`](crate::SharedState); failures are
//! flattened into a serializable [`CommandError`].

pub mod datasource;
pub mod mount;
pub mod sync;
pub mod system;
pub mod vault;

use serde::Serialize;

use crate::engine::error::{ConflictKind, EngineError, ErrorCategory};

/// Error shape handed to the presentation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandError {
    pub category: ErrorCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict: Option<ConflictKind>,
    pub message: String,
    /// Whether retrying later may succeed without user action
    pub recoverable: bool,
}

impl From<EngineError> for CommandError {
    fn from(error: EngineError) -> Self {
        Self {
            category: error.category(),
            conflict: error.conflict_kind(),
            message: error.to_string(),
            recoverable: error.is_recoverable(),
        }
    }
}

pub type CommandResult<T> = Result<T, CommandError>;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use crate::engine::testing::{FakeBehavior, FakeMountDriver, FakeObjectStore, MemoryBlobStore};
    use crate::settings::{AppPaths, AppSettings};
    use crate::system::{AutoStart, EntryKind};
    use crate::vault::crypto::KdfParams;
    use crate::{AppState, Capabilities, SharedState};

    pub const PASSWORD: &str = "correct horse battery";

    pub struct TestApp {
        pub dir: tempfile::TempDir,
        pub state: SharedState,
        pub driver: Arc<FakeMountDriver>,
        pub blobs: Arc<MemoryBlobStore>,
        pub store: Arc<FakeObjectStore>,
    }

    pub fn app_with_store(object_store: FakeObjectStore) -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::new(dir.path().join("config"));
        let settings = AppSettings {
            mounts_root: dir.path().join("mounts"),
            kdf: KdfParams::minimal(),
            ..AppSettings::default()
        };
        let driver = Arc::new(FakeMountDriver::new(FakeBehavior::Ready));
        let blobs = Arc::new(MemoryBlobStore::default());
        let store = Arc::new(object_store);
        let autostart = AutoStart::at(
            EntryKind::XdgDesktop,
            dir.path().join("autostart").join("rmount.desktop"),
            dir.path().join("bin").join("rmount"),
        );

        let state = AppState::with_capabilities(
            paths,
            settings,
            Capabilities {
                driver: driver.clone(),
                object_store: store.clone(),
                blob_store: blobs.clone(),
                autostart: Some(autostart),
            },
        )
        .unwrap();

        TestApp {
            dir,
            state: Arc::new(state),
            driver,
            blobs,
            store,
        }
    }

    pub fn app() -> TestApp {
        app_with_store(FakeObjectStore::default())
    }

    /// App with an initialized, unlocked vault
    pub async fn unlocked_app() -> TestApp {
        let app = app();
        crate::commands::vault::initialize_vault(&app.state, PASSWORD.to_string())
            .await
            .unwrap();
        app
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_errors_keep_their_kind() {
        let err: CommandError =
            EngineError::conflict(ConflictKind::AlreadyMounted, "minio-1").into();
        assert_eq!(err.category, ErrorCategory::Conflict);
        assert_eq!(err.conflict, Some(ConflictKind::AlreadyMounted));
        assert!(err.recoverable);

        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["category"], "conflict");
        assert_eq!(json["conflict"], "already_mounted");
    }

    #[test]
    fn auth_errors_are_not_recoverable() {
        let err: CommandError = EngineError::InvalidPassword.into();
        assert_eq!(err.category, ErrorCategory::Auth);
        assert!(!err.recoverable);
        assert_eq!(err.conflict, None);
    }
}
