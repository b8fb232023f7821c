//! Login-item registration
//!
//! macOS: a LaunchAgent plist loaded through `launchctl`.
//! Linux and other unixes: an XDG autostart `.desktop` entry.

use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::engine::error::{EngineError, EngineResult};
use crate::persist;

pub const APP_LABEL: &str = "com.rmount.app";
const DESKTOP_FILE: &str = "rmount.desktop";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    LaunchAgent,
    XdgDesktop,
}

#[derive(Debug, Clone)]
pub struct AutoStart {
    kind: EntryKind,
    entry_path: PathBuf,
    program: PathBuf,
    use_launchctl: bool,
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Quotes a path for the `Exec=` key of a desktop entry
fn exec_quote(path: &Path) -> String {
    let mut quoted = String::from("\"");
    for c in path.to_string_lossy().chars() {
        if matches!(c, '"' | '`' | '$' | '\\') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

impl AutoStart {
    /// Entry location for the current user on this platform
    pub fn for_current_user(program: PathBuf) -> EngineResult<Self> {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .ok_or_else(|| EngineError::internal("HOME is not set"))?;

        if cfg!(target_os = "macos") {
            Ok(Self {
                kind: EntryKind::LaunchAgent,
                entry_path: home
                    .join("Library")
                    .join("LaunchAgents")
                    .join(format!("{}.plist", APP_LABEL)),
                program,
                use_launchctl: true,
            })
        } else if cfg!(unix) {
            let config_home = std::env::var_os("XDG_CONFIG_HOME")
                .map(PathBuf::from)
                .filter(|p| p.is_absolute())
                .unwrap_or_else(|| home.join(".config"));
            Ok(Self {
                kind: EntryKind::XdgDesktop,
                entry_path: config_home.join("autostart").join(DESKTOP_FILE),
                program,
                use_launchctl: false,
            })
        } else {
            Err(EngineError::validation(
                "Auto-start is not supported on this platform",
            ))
        }
    }

    /// Entry at an explicit location, without touching launchd
    pub fn at(kind: EntryKind, entry_path: PathBuf, program: PathBuf) -> Self {
        Self {
            kind,
            entry_path,
            program,
            use_launchctl: false,
        }
    }

    pub fn entry_path(&self) -> &Path {
        &self.entry_path
    }

    pub fn is_enabled(&self) -> bool {
        self.entry_path.is_file()
    }

    fn render(&self) -> String {
        match self.kind {
            EntryKind::LaunchAgent => format!(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>{}</string>
    <key>ProgramArguments</key>
    <array>
        <string>{}</string>
    </array>
    <key>RunAtLoad</key>
    <true/>
    <key>KeepAlive</key>
    <false/>
</dict>
</plist>
"#,
                APP_LABEL,
                xml_escape(&self.program.to_string_lossy())
            ),
            EntryKind::XdgDesktop => format!(
                "[Desktop Entry]\nType=Application\nName=rmount\nComment=S3 remote mount manager\nExec={}\nTerminal=false\nX-GNOME-Autostart-enabled=true\n",
                exec_quote(&self.program)
            ),
        }
    }

    async fn launchctl(&self, action: &str) -> EngineResult<()> {
        let output = Command::new("launchctl")
            .arg(action)
            .arg(&self.entry_path)
            .output()
            .await
            .map_err(|e| EngineError::io("Failed to run launchctl", e))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(EngineError::internal(format!(
                "launchctl {} failed: {}",
                action,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    pub async fn set_enabled(&self, enabled: bool) -> EngineResult<()> {
        if enabled {
            persist::write_atomic(&self.entry_path, self.render().as_bytes())?;
            if self.use_launchctl {
                self.launchctl("load").await?;
            }
            tracing::info!(entry = %self.entry_path.display(), "Auto-start enabled");
            return Ok(());
        }

        if !self.is_enabled() {
            return Ok(());
        }
        if self.use_launchctl {
            if let Err(e) = self.launchctl("unload").await {
                tracing::warn!(error = %e, "launchctl unload failed");
            }
        }
        std::fs::remove_file(&self.entry_path).map_err(|e| {
            EngineError::io(format!("Failed to remove {}", self.entry_path.display()), e)
        })?;
        tracing::info!("Auto-start disabled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn desktop_entry_toggles() {
        let dir = tempfile::tempdir().unwrap();
        let entry = dir.path().join("autostart").join(DESKTOP_FILE);
        let autostart = AutoStart::at(
            EntryKind::XdgDesktop,
            entry.clone(),
            PathBuf::from("/opt/r mount/bin/rmount"),
        );

        assert!(!autostart.is_enabled());
        autostart.set_enabled(true).await.unwrap();
        assert!(autostart.is_enabled());
        let content = std::fs::read_to_string(&entry).unwrap();
        assert!(content.contains("Exec=\"/opt/r mount/bin/rmount\""));

        autostart.set_enabled(false).await.unwrap();
        assert!(!autostart.is_enabled());
        // Disabling twice is fine
        autostart.set_enabled(false).await.unwrap();
    }

    #[test]
    fn plist_escapes_program_path() {
        let autostart = AutoStart::at(
            EntryKind::LaunchAgent,
            PathBuf::from("/tmp/x.plist"),
            PathBuf::from("/Applications/R&D <beta>.app/rmount"),
        );
        let plist = autostart.render();
        assert!(plist.contains("<string>/Applications/R&amp;D &lt;beta&gt;.app/rmount</string>"));
        assert!(plist.contains(APP_LABEL));
    }

    #[test]
    fn exec_quote_escapes_shell_specials() {
        assert_eq!(exec_quote(Path::new("/a/$b\"c")), "\"/a/\\$b\\\"c\"");
    }
}
