//! Mount and remote-listing types shared by the supervisor, the registry and
//! the external capabilities.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::error::{EngineError, EngineResult};

/// Lifecycle state of a mount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountStatus {
    Unmounted,
    Mounting,
    Mounted,
    Unmounting,
    Error,
}

impl MountStatus {
    /// Whether a data source in this state may be removed or renamed
    pub fn is_idle(self) -> bool {
        matches!(self, MountStatus::Unmounted)
    }
}

impl std::fmt::Display for MountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            MountStatus::Unmounted => "unmounted",
            MountStatus::Mounting => "mounting",
            MountStatus::Mounted => "mounted",
            MountStatus::Unmounting => "unmounting",
            MountStatus::Error => "error",
        };
        f.write_str(text)
    }
}

/// Bookkeeping for one mount, persisted across restarts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRecord {
    pub name: String,
    /// Sub-path inside the remote, empty for the root
    #[serde(default)]
    pub remote_path: String,
    pub local_path: PathBuf,
    /// Driver process; absent until launched
    #[serde(default)]
    pub pid: Option<u32>,
    pub status: MountStatus,
    /// Cause of the last failure, kept verbatim from the driver
    #[serde(default)]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl MountRecord {
    pub fn mounting(name: &str, remote_path: &str, local_path: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            remote_path: remote_path.to_string(),
            local_path,
            pid: None,
            status: MountStatus::Mounting,
            error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn set_status(&mut self, status: MountStatus) {
        self.status = status;
        if status != MountStatus::Error {
            self.error = None;
        }
        self.updated_at = Utc::now();
    }

    pub fn fail(&mut self, cause: impl Into<String>) {
        self.status = MountStatus::Error;
        self.error = Some(cause.into());
        self.updated_at = Utc::now();
    }
}

/// Status change notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountEvent {
    pub name: String,
    pub status: MountStatus,
    pub error: Option<String>,
}

/// Outcome of one reconcile sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Mounted records whose driver died
    pub errored: Vec<String>,
    /// Unmounting records whose driver is gone and were finalised
    pub completed: Vec<String>,
    /// Mounting records left by a previous run whose driver is still alive
    pub recovered: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.errored.is_empty() && self.completed.is_empty() && self.recovered.is_empty()
    }
}

/// One entry of a remote directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub name: String,
    /// Full path from the remote root
    pub path: String,
    pub size: i64,
    pub mod_time: Option<DateTime<Utc>>,
    pub is_dir: bool,
    pub mime_type: Option<String>,
}

/// Canonical form of a remote sub-path: no leading/trailing slashes, no
/// empty, `.` or `..` segments.
pub fn normalize_remote_path(path: &str) -> EngineResult<String> {
    let mut segments = Vec::new();
    for segment in path.trim().split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(EngineError::validation(
                    "Remote path cannot contain '..'",
                ))
            }
            other => segments.push(other),
        }
    }
    Ok(segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_paths_are_canonicalised() {
        assert_eq!(normalize_remote_path("").unwrap(), "");
        assert_eq!(normalize_remote_path("/").unwrap(), "");
        assert_eq!(normalize_remote_path("/photos//2024/").unwrap(), "photos/2024");
        assert_eq!(normalize_remote_path(" ./a/./b ").unwrap(), "a/b");
        assert!(normalize_remote_path("a/../b").is_err());
    }

    #[test]
    fn failing_keeps_cause_until_next_transition() {
        let mut record = MountRecord::mounting("m", "", PathBuf::from("/mnt/m"));
        record.fail("bad credentials");
        assert_eq!(record.status, MountStatus::Error);
        assert_eq!(record.error.as_deref(), Some("bad credentials"));

        record.set_status(MountStatus::Mounting);
        assert_eq!(record.error, None);
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&MountStatus::Unmounting).unwrap();
        assert_eq!(json, "\"unmounting\"");
    }
}
