//! Logging and observability helpers.

use std::fs;
use std::io;
use std::path::Path;

use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "rmount.log";
const DEFAULT_FILTER: &str = "rmount=info,rmount_lib=info";

/// Installs the global subscriber writing to a daily file under `log_dir`.
///
/// `RUST_LOG` overrides the default filter. Calling it twice is a no-op.
/// Fails without installing anything when `log_dir` cannot be created.
pub fn init_tracing(log_dir: &Path) -> io::Result<()> {
    fs::create_dir_all(log_dir)?;

    let file_appender: RollingFileAppender =
        tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(file_appender)
        .with_ansi(false)
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
    Ok(())
}
