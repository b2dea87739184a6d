//! Logging configuration using tracing
//!
//! Two sinks exist: the host-wide rolling log set up by [`init`], and one
//! [`DeviceLog`] per device that components receive at construction. The
//! device log scopes artifacts (logcat, agent output, bug reports) to the
//! device's directory and carries the `device` span its operations run in.

use std::path::{Path, PathBuf};
use tracing::Span;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::Result;

const LOG_FILE_NAME: &str = "devhost.log";

/// Initialize the logging subsystem
///
/// Logs are written to `log_dir` (default `~/.local/share/devhost/logs/`) and
/// mirrored to stderr. Log level is controlled by the `DEVHOST_LOG`
/// environment variable.
///
/// # Examples
/// ```bash
/// DEVHOST_LOG=debug devhost start -c devhost.toml
/// ```
pub fn init(log_dir: Option<&Path>) -> Result<PathBuf> {
    let log_dir = match log_dir {
        Some(dir) => dir.to_path_buf(),
        None => default_log_directory(),
    };
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, LOG_FILE_NAME);

    let env_filter = EnvFilter::try_from_env("DEVHOST_LOG").unwrap_or_else(|_| {
        EnvFilter::new("devhost=info,devhost_session=info,devhost_bridge=info,warn")
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_timer(fmt::time::ChronoLocal::new(
                    "%Y-%m-%d %H:%M:%S%.3f".to_string(),
                )),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .init();

    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("devhost starting");
    tracing::info!("Log directory: {}", log_dir.display());
    tracing::info!("═══════════════════════════════════════════════════════");

    Ok(log_dir)
}

/// Default base directory for host and device logs
pub fn default_log_directory() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("devhost").join("logs")
}

/// Per-device logging sink.
///
/// Cheap to clone. Every component of a device session holds one, so log
/// artifacts never depend on process-global state.
#[derive(Debug, Clone)]
pub struct DeviceLog {
    serial: String,
    dir: PathBuf,
    span: Span,
}

impl DeviceLog {
    /// Create the sink for `serial` under `base_dir`.
    ///
    /// The directory is `<base_dir>/AndroidDevice<serial>`; it is created
    /// lazily by [`DeviceLog::ensure_dir`].
    pub fn new(base_dir: &Path, serial: &str) -> Self {
        Self {
            serial: serial.to_string(),
            dir: base_dir.join(format!("AndroidDevice{serial}")),
            span: tracing::info_span!("device", serial = %serial),
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Device log directory (may not exist yet)
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Span that device operations are instrumented with
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Path of a file inside the device log directory
    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Create the device log directory (and an optional subdirectory).
    pub fn ensure_dir(&self, sub: Option<&str>) -> Result<PathBuf> {
        let dir = match sub {
            Some(sub) => self.dir.join(sub),
            None => self.dir.clone(),
        };
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}
