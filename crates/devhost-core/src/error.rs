//! Application error types with rich context

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], used by callers to decide whether
/// to abort, retry, or log and carry on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or missing configuration. Never retried.
    Configuration,
    /// A port role or process slot is already held.
    ResourceBusy,
    /// A bridge command failed, typically while the device is mid-boot.
    TransientDevice,
    /// A standing process exited early or could not be stopped.
    ProcessLifecycle,
    /// The scripting service or session bookkeeping broke its contract.
    ProtocolViolation,
    /// A bounded wait expired.
    Timeout,
    /// Host-side I/O or serialization failure.
    Io,
}

/// Application error types organized by layer/domain
#[derive(Debug, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Common/Infrastructure Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Channel closed unexpectedly")]
    ChannelClosed,

    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Invalid configuration in {path}: {message}")]
    ConfigInvalid { path: PathBuf, message: String },

    #[error("Android device {serial} is specified in config but is not attached")]
    DeviceNotAttached { serial: String },

    #[error("Could not find a target device that matches: {filter}")]
    DeviceNotFound { filter: String },

    #[error("More than one device matched: {serials:?}")]
    AmbiguousDevice { serials: Vec<String> },

    // ─────────────────────────────────────────────────────────────
    // Bridge (adb / fastboot) Errors
    // ─────────────────────────────────────────────────────────────
    #[error("{tool} not found. Ensure it is on PATH or set ANDROID_HOME.")]
    ToolNotFound { tool: &'static str },

    #[error("Bridge command `{command}` failed (exit {code:?}): {stderr}")]
    Bridge {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Bridge command `{command}` timed out after {timeout:?}")]
    BridgeTimeout { command: String, timeout: Duration },

    // ─────────────────────────────────────────────────────────────
    // Resource Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Port role {role} already holds host port {host_port}")]
    PortRoleLeased { role: String, host_port: u16 },

    #[error("No free host port found after {attempts} attempts")]
    NoFreePort { attempts: usize },

    #[error("A {slot} process is already running on {serial}")]
    AlreadyRunning { serial: String, slot: String },

    // ─────────────────────────────────────────────────────────────
    // Process Lifecycle Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Failed to spawn `{command}`: {reason}")]
    ProcessSpawn { command: String, reason: String },

    #[error("`{command}` exited during the health check with code {code:?}")]
    EarlyExit {
        command: String,
        code: Option<i32>,
        output: String,
    },

    #[error("Could not confirm that `{command}` stopped: {message}")]
    StopError { command: String, message: String },

    #[error("Agent failed to start on {serial} after {attempts} launch attempt(s)")]
    AgentStartFailure {
        serial: String,
        attempts: usize,
        log: String,
    },

    // ─────────────────────────────────────────────────────────────
    // Protocol Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Scripting protocol error: {message}")]
    Protocol { message: String },

    #[error("Scripting RPC `{method}` failed: {message}")]
    Rpc { method: String, message: String },

    #[error("Scripting service returned an existing session id {session_id} for a new session")]
    DuplicateSessionId { session_id: u32 },

    #[error("Scripting session {session_id} does not exist")]
    UnknownSession { session_id: u32 },

    #[error("Event dispatcher for session {session_id} is registered but missing")]
    DispatcherMissing { session_id: u32 },

    // ─────────────────────────────────────────────────────────────
    // Timeout Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Agent on {serial} not ready after {attempts} attempts ({elapsed:?})")]
    AgentNotReady {
        serial: String,
        attempts: u32,
        elapsed: Duration,
    },

    #[error("{serial} did not complete booting within {elapsed:?} (last state: {last_state})")]
    BootTimeout {
        serial: String,
        elapsed: Duration,
        last_state: String,
    },

    #[error("Timed out after {timeout:?} waiting for event `{name}`")]
    EventTimeout { name: String, timeout: Duration },

    #[error("Timed out connecting to scripting service on port {port}")]
    ConnectTimeout { port: u16 },
}

// ─────────────────────────────────────────────────────────────────
// Convenience Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn rpc(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rpc {
            method: method.into(),
            message: message.into(),
        }
    }

    pub fn bridge(command: impl Into<String>, code: Option<i32>, stderr: impl Into<String>) -> Self {
        Self::Bridge {
            command: command.into(),
            code,
            stderr: stderr.into(),
        }
    }

    pub fn process_spawn(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProcessSpawn {
            command: command.into(),
            reason: reason.into(),
        }
    }

    pub fn already_running(serial: impl Into<String>, slot: impl Into<String>) -> Self {
        Self::AlreadyRunning {
            serial: serial.into(),
            slot: slot.into(),
        }
    }

    /// Map this error onto the coarse taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::Json(_) | Error::ChannelClosed => ErrorKind::Io,
            Error::Config { .. }
            | Error::ConfigNotFound { .. }
            | Error::ConfigInvalid { .. }
            | Error::DeviceNotAttached { .. }
            | Error::DeviceNotFound { .. }
            | Error::AmbiguousDevice { .. }
            | Error::ToolNotFound { .. } => ErrorKind::Configuration,
            Error::Bridge { .. } | Error::BridgeTimeout { .. } => ErrorKind::TransientDevice,
            Error::PortRoleLeased { .. } | Error::NoFreePort { .. } | Error::AlreadyRunning { .. } => {
                ErrorKind::ResourceBusy
            }
            Error::ProcessSpawn { .. }
            | Error::EarlyExit { .. }
            | Error::StopError { .. }
            | Error::AgentStartFailure { .. } => ErrorKind::ProcessLifecycle,
            Error::Protocol { .. }
            | Error::Rpc { .. }
            | Error::DuplicateSessionId { .. }
            | Error::UnknownSession { .. }
            | Error::DispatcherMissing { .. } => ErrorKind::ProtocolViolation,
            Error::AgentNotReady { .. }
            | Error::BootTimeout { .. }
            | Error::EventTimeout { .. }
            | Error::ConnectTimeout { .. } => ErrorKind::Timeout,
        }
    }

    /// Check if this is a recoverable error
    ///
    /// Recoverable errors are logged and absorbed at the call site.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Bridge { .. }
                | Error::BridgeTimeout { .. }
                | Error::StopError { .. }
                | Error::EventTimeout { .. }
                | Error::Rpc { .. }
        )
    }

    /// Check if this error should abort the surrounding lifecycle operation
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Configuration | ErrorKind::Timeout
        ) || matches!(
            self,
            Error::ProcessSpawn { .. }
                | Error::EarlyExit { .. }
                | Error::AgentStartFailure { .. }
                | Error::DuplicateSessionId { .. }
        )
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Context Extensions
// ─────────────────────────────────────────────────────────────────

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", context.into(), err);
            err
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", f(), err);
            err
        })
    }
}
