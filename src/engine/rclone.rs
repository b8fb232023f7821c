//! rclone driver
//!
//! Implements both the mount driver and the object-store client on top of the
//! `rclone` binary. Credentials reach rclone through `RCLONE_S3_*` environment
//! variables of the child process only; no rclone config file is written.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::process::{Child, Command};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::process::is_mount_point;
use crate::engine::traits::{MountDriver, MountProcess, MountRequest, ObjectStore};
use crate::engine::types::RemoteEntry;
use crate::vault::DataSourceConfig;

const DRIVER_ID: &str = "rclone";
const READY_POLL_INTERVAL: Duration = Duration::from_millis(200);
const LIST_TIMEOUT: Duration = Duration::from_secs(30);
const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const LOG_TAIL_LINES: usize = 5;

/// rclone-backed driver
#[derive(Debug, Clone)]
pub struct Rclone {
    binary: String,
    cache_root: PathBuf,
    log_root: PathBuf,
}

impl Rclone {
    pub fn new(binary: impl Into<String>, cache_root: PathBuf, log_root: PathBuf) -> Self {
        Self {
            binary: binary.into(),
            cache_root,
            log_root,
        }
    }

    fn command(&self, source: &DataSourceConfig) -> Command {
        let mut cmd = Command::new(&self.binary);
        // In-memory config: nothing is read from or written to rclone.conf
        cmd.arg("--config").arg("");

        let provider = if source.endpoint.is_some() { "Other" } else { "AWS" };
        cmd.env("RCLONE_S3_PROVIDER", provider)
            .env("RCLONE_S3_ENV_AUTH", "false")
            .env("RCLONE_S3_ACCESS_KEY_ID", &source.access_key)
            .env("RCLONE_S3_SECRET_ACCESS_KEY", source.secret_key.expose())
            .env("RCLONE_S3_REGION", &source.region);
        if let Some(endpoint) = &source.endpoint {
            cmd.env("RCLONE_S3_ENDPOINT", endpoint)
                .env("RCLONE_S3_FORCE_PATH_STYLE", "true");
        }
        cmd.stdin(Stdio::null());
        cmd
    }

    fn spawn_error(&self, e: std::io::Error) -> EngineError {
        EngineError::driver(
            DRIVER_ID,
            format!("Failed to spawn {}: {}. Is rclone installed?", self.binary, e),
        )
    }

    /// Runs a short-lived rclone command and returns its stdout.
    async fn run(
        &self,
        source: &DataSourceConfig,
        args: &[&str],
        limit: Duration,
    ) -> EngineResult<Vec<u8>> {
        let mut cmd = self.command(source);
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(limit, cmd.output())
            .await
            .map_err(|_| EngineError::Timeout {
                timeout_ms: limit.as_millis() as u64,
            })?
            .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::remote_unavailable(last_lines(&stderr)));
        }
        Ok(output.stdout)
    }

    fn log_path(&self, local_path: &Path) -> PathBuf {
        let name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mount".to_string());
        self.log_root.join(format!("rclone-{}.log", name))
    }
}

/// `:s3:` on-the-fly remote for the configured bucket and sub-path
fn remote_spec(source: &DataSourceConfig, remote_path: &str) -> String {
    let path = match (&source.bucket, remote_path.is_empty()) {
        (Some(bucket), true) => bucket.clone(),
        (Some(bucket), false) => format!("{}/{}", bucket, remote_path),
        (None, _) => remote_path.to_string(),
    };
    format!(":s3:{}", path)
}

fn last_lines(text: &str) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(LOG_TAIL_LINES);
    let tail = lines[start..].join("\n");
    if tail.is_empty() {
        "rclone exited without output".to_string()
    } else {
        tail
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LsJsonEntry {
    path: String,
    name: String,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    mod_time: Option<DateTime<Utc>>,
    #[serde(default)]
    is_dir: bool,
    #[serde(default)]
    mime_type: Option<String>,
}

fn parse_listing(stdout: &[u8], remote_path: &str) -> EngineResult<Vec<RemoteEntry>> {
    let raw: Vec<LsJsonEntry> = serde_json::from_slice(stdout)
        .map_err(|e| EngineError::driver(DRIVER_ID, format!("Unexpected lsjson output: {}", e)))?;

    let mut entries: Vec<RemoteEntry> = raw
        .into_iter()
        .map(|entry| RemoteEntry {
            path: if remote_path.is_empty() {
                entry.path
            } else {
                format!("{}/{}", remote_path, entry.path)
            },
            name: entry.name,
            size: entry.size.max(0),
            mod_time: entry.mod_time,
            is_dir: entry.is_dir,
            mime_type: entry.mime_type.filter(|m| !m.is_empty() && m != "inode/directory"),
        })
        .collect();
    // Directories first, then by name
    entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
    Ok(entries)
}

#[async_trait]
impl ObjectStore for Rclone {
    fn store_id(&self) -> &'static str {
        DRIVER_ID
    }

    async fn test_connection(&self, source: &DataSourceConfig) -> EngineResult<()> {
        let remote = remote_spec(source, "");
        self.run(source, &["lsjson", "--max-depth", "1", "--dirs-only", &remote], TEST_TIMEOUT)
            .await
            .map(|_| ())
    }

    async fn list(
        &self,
        source: &DataSourceConfig,
        remote_path: &str,
    ) -> EngineResult<Vec<RemoteEntry>> {
        let remote = remote_spec(source, remote_path);
        let stdout = self.run(source, &["lsjson", &remote], LIST_TIMEOUT).await?;
        parse_listing(&stdout, remote_path)
    }
}

/// A running `rclone mount`
pub struct RcloneMount {
    child: Child,
    pid: u32,
    local_path: PathBuf,
    log_path: PathBuf,
}

#[async_trait]
impl MountProcess for RcloneMount {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn wait_ready(&mut self) -> EngineResult<()> {
        loop {
            let exited = self
                .child
                .try_wait()
                .map_err(|e| EngineError::driver(DRIVER_ID, format!("Failed to poll rclone: {}", e)))?;
            if let Some(status) = exited {
                let log = tokio::fs::read_to_string(&self.log_path).await.unwrap_or_default();
                return Err(EngineError::driver(
                    DRIVER_ID,
                    format!("rclone mount exited ({}): {}", status, last_lines(&log)),
                ));
            }
            if is_mount_point(&self.local_path) {
                return Ok(());
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl MountDriver for Rclone {
    fn driver_id(&self) -> &'static str {
        DRIVER_ID
    }

    async fn launch(&self, request: MountRequest<'_>) -> EngineResult<Box<dyn MountProcess>> {
        let name = request
            .local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let cache_dir = self.cache_root.join(&name);
        let log_path = self.log_path(request.local_path);

        std::fs::create_dir_all(&self.log_root)
            .map_err(|e| EngineError::io("Failed to create rclone log directory", e))?;
        // rclone appends; start each mount with a fresh log
        let _ = std::fs::remove_file(&log_path);

        // rclone mount :s3:bucket/path <local> --vfs-cache-mode full
        let mut cmd = self.command(request.source);
        cmd.arg("mount")
            .arg(remote_spec(request.source, request.remote_path))
            .arg(request.local_path)
            .arg("--vfs-cache-mode")
            .arg("full")
            .arg("--cache-dir")
            .arg(&cache_dir)
            .arg("--log-file")
            .arg(&log_path)
            .arg("--log-level")
            .arg("INFO");
        #[cfg(target_os = "macos")]
        cmd.arg("--volname").arg(&name);

        // The mount outlives this handle, so no pipes are kept open to it
        let child = cmd
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;
        let pid = child
            .id()
            .ok_or_else(|| EngineError::driver(DRIVER_ID, "rclone exited before reporting a pid"))?;

        tracing::info!(pid, local_path = %request.local_path.display(), "rclone mount launched");
        Ok(Box::new(RcloneMount {
            child,
            pid,
            local_path: request.local_path.to_path_buf(),
            log_path,
        }))
    }

    async fn release(&self, local_path: &Path) -> EngineResult<()> {
        if !is_mount_point(local_path) {
            return Ok(());
        }
        tracing::info!(path = %local_path.display(), "Releasing stale mount point");
        for (program, args) in release_commands() {
            let status = Command::new(program)
                .args(*args)
                .arg(local_path)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            if matches!(status, Ok(s) if s.success()) && !is_mount_point(local_path) {
                return Ok(());
            }
        }
        Err(EngineError::driver(
            DRIVER_ID,
            format!("Could not release mount point {}", local_path.display()),
        ))
    }
}

#[cfg(target_os = "macos")]
fn release_commands() -> &'static [(&'static str, &'static [&'static str])] {
    &[("umount", &["-f"]), ("diskutil", &["unmount", "force"])]
}

#[cfg(not(target_os = "macos"))]
fn release_commands() -> &'static [(&'static str, &'static [&'static str])] {
    &[("fusermount3", &["-uz"]), ("fusermount", &["-uz"]), ("umount", &["-l"])]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::sample_source;

    #[test]
    fn remote_spec_joins_bucket_and_path() {
        let mut source = sample_source("s");
        source.bucket = Some("media".to_string());
        assert_eq!(remote_spec(&source, ""), ":s3:media");
        assert_eq!(remote_spec(&source, "photos/2024"), ":s3:media/photos/2024");

        source.bucket = None;
        assert_eq!(remote_spec(&source, ""), ":s3:");
        assert_eq!(remote_spec(&source, "other-bucket/x"), ":s3:other-bucket/x");
    }

    #[test]
    fn lsjson_output_is_mapped_and_sorted() {
        let stdout = br#"[
            {"Path":"b.txt","Name":"b.txt","Size":12,"MimeType":"text/plain","ModTime":"2024-03-01T10:00:00.5+01:00","IsDir":false},
            {"Path":"albums","Name":"albums","Size":-1,"MimeType":"inode/directory","ModTime":"2000-01-01T00:00:00Z","IsDir":true}
        ]"#;

        let entries = parse_listing(stdout, "photos").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "albums");
        assert!(entries[0].is_dir);
        assert_eq!(entries[0].size, 0);
        assert_eq!(entries[0].mime_type, None);
        assert_eq!(entries[1].path, "photos/b.txt");
        assert_eq!(entries[1].mime_type.as_deref(), Some("text/plain"));
        assert!(entries[1].mod_time.is_some());
    }

    #[test]
    fn garbage_listing_is_driver_error() {
        let err = parse_listing(b"not json", "").unwrap_err();
        assert!(matches!(err, EngineError::Driver { .. }));
    }

    #[test]
    fn stderr_tail_keeps_last_lines() {
        let text = "1\n2\n\n3\n4\n5\n6\n";
        assert_eq!(last_lines(text), "2\n3\n4\n5\n6");
        assert_eq!(last_lines(""), "rclone exited without output");
    }
}
