//! Atomic file persistence.
//!
//! Every file the application owns is replaced by writing a sibling temp file,
//! syncing it, and renaming it over the target. A crash at any point leaves
//! either the previous file or the new one, never a torn write.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;

use tempfile::NamedTempFile;

use crate::engine::error::{EngineError, EngineResult};

/// Writes `contents` to a synced temp file next to `path`.
fn stage(path: &Path, contents: &[u8]) -> EngineResult<NamedTempFile> {
    let dir = path
        .parent()
        .ok_or_else(|| EngineError::internal(format!("No parent directory: {}", path.display())))?;
    fs::create_dir_all(dir)
        .map_err(|e| EngineError::io(format!("Failed to create {}", dir.display()), e))?;

    let mut tmp = NamedTempFile::new_in(dir)
        .map_err(|e| EngineError::io("Failed to create temp file", e))?;
    tmp.write_all(contents)
        .map_err(|e| EngineError::io("Failed to write temp file", e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| EngineError::io("Failed to sync temp file", e))?;
    Ok(tmp)
}

/// Atomically replaces `path` with `contents`.
///
/// Temp files are created with owner-only permissions on unix.
pub fn write_atomic(path: &Path, contents: &[u8]) -> EngineResult<()> {
    stage(path, contents)?.persist(path).map_err(|e| {
        EngineError::io(format!("Failed to replace {}", path.display()), e.error)
    })?;
    Ok(())
}

/// Like [`write_atomic`] but refuses to replace an existing file.
///
/// Returns `Ok(false)` when `path` already exists.
pub fn write_new(path: &Path, contents: &[u8]) -> EngineResult<bool> {
    match stage(path, contents)?.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(EngineError::io(
            format!("Failed to create {}", path.display()),
            e.error,
        )),
    }
}

/// Reads a file, mapping "not found" to `None`.
pub fn read_optional(path: &Path) -> EngineResult<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(EngineError::io(format!("Failed to read {}", path.display()), e)),
    }
}
