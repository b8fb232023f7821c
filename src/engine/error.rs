//! Engine errors
//!
//! A single error type shared by the vault, the mount supervisor and the
//! sync agent. Every variant belongs to exactly one [`ErrorCategory`], which
//! is what the presentation layer uses to decide how to react.

use serde::Serialize;
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Coarse classification of failures surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Auth,
    NotFound,
    Conflict,
    Driver,
    Transport,
    CorruptState,
    Internal,
}

/// Reason a state-changing request collided with existing state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    AlreadyMounted,
    OperationInProgress,
    InUse,
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ConflictKind::AlreadyMounted => "is already mounted",
            ConflictKind::OperationInProgress => "has an operation in progress",
            ConflictKind::InUse => "is in use by an active mount",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid input: {message}")]
    Validation { message: String },

    #[error("A data source named '{name}' already exists")]
    DuplicateName { name: String },

    #[error("Vault is already initialized")]
    AlreadyInitialized,

    #[error("Vault has not been initialized")]
    NotInitialized,

    #[error("Vault is locked")]
    VaultLocked,

    #[error("Invalid master password")]
    InvalidPassword,

    #[error("Remote vault could not be decrypted with the current master password")]
    DecryptionFailed,

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("'{name}' {kind}")]
    Conflict { kind: ConflictKind, name: String },

    #[error("Mount driver error for '{name}': {message}")]
    Driver { name: String, message: String },

    #[error("Remote unavailable: {message}")]
    RemoteUnavailable { message: String },

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Corrupt state: {message}")]
    CorruptState { message: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn duplicate_name(name: impl Into<String>) -> Self {
        Self::DuplicateName { name: name.into() }
    }

    pub fn data_source_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "Data source",
            name: name.into(),
        }
    }

    pub fn mount_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "Mount",
            name: name.into(),
        }
    }

    pub fn conflict(kind: ConflictKind, name: impl Into<String>) -> Self {
        Self::Conflict {
            kind,
            name: name.into(),
        }
    }

    pub fn driver(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Driver {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn remote_unavailable(message: impl Into<String>) -> Self {
        Self::RemoteUnavailable {
            message: message.into(),
        }
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::CorruptState {
            message: message.into(),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::Validation { .. }
            | EngineError::DuplicateName { .. }
            | EngineError::AlreadyInitialized
            | EngineError::NotInitialized => ErrorCategory::Validation,
            EngineError::VaultLocked
            | EngineError::InvalidPassword
            | EngineError::DecryptionFailed => ErrorCategory::Auth,
            EngineError::NotFound { .. } => ErrorCategory::NotFound,
            EngineError::Conflict { .. } => ErrorCategory::Conflict,
            EngineError::Driver { .. } => ErrorCategory::Driver,
            EngineError::RemoteUnavailable { .. } | EngineError::Timeout { .. } => {
                ErrorCategory::Transport
            }
            EngineError::CorruptState { .. } => ErrorCategory::CorruptState,
            EngineError::Io { .. } | EngineError::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Whether retrying the same request later can succeed without user action
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Conflict | ErrorCategory::Transport
        )
    }

    pub fn conflict_kind(&self) -> Option<ConflictKind> {
        match self {
            EngineError::Conflict { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_and_corruption_are_reported_distinctly() {
        assert_eq!(EngineError::InvalidPassword.category(), ErrorCategory::Auth);
        assert_eq!(
            EngineError::corrupt("bad tag").category(),
            ErrorCategory::CorruptState
        );
        assert!(!EngineError::InvalidPassword.is_recoverable());
    }

    #[test]
    fn conflicts_are_recoverable() {
        let err = EngineError::conflict(ConflictKind::OperationInProgress, "minio-1");
        assert!(err.is_recoverable());
        assert_eq!(err.conflict_kind(), Some(ConflictKind::OperationInProgress));
        assert_eq!(err.to_string(), "'minio-1' has an operation in progress");
    }
}
