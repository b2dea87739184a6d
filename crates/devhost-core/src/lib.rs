//! # devhost-core - Core Domain Types
//!
//! Foundation crate for devhost. Provides domain types, error handling and
//! logging setup shared by the bridge and session crates.
//!
//! This crate has **zero internal dependencies** -- it only depends on external
//! crates (serde, thiserror, tracing).
//!
//! ## Public API
//!
//! ### Domain Types (`types`)
//! - [`PortRole`] - Purpose of a forwarded host port (command, callback, scripting)
//! - [`ProcessSlot`] - Named slot of a standing process (logcat, agent)
//! - [`AgentState`] - On-device agent lifecycle state
//! - [`SessionKey`] - Structured (device, session id) key for scripting sessions
//! - [`BulkOperationResult`] - Per-device outcome of a bulk operation
//!
//! ### Error Handling (`error`)
//! - [`Error`] - Custom error enum with `fatal` vs `recoverable` classification
//! - [`ErrorKind`] - Coarse taxonomy used by callers
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//!
//! ### Logging (`logging`)
//! - [`logging::init()`] - Host-wide rolling log file
//! - [`DeviceLog`] - Per-device log directory and span
//!
//! ## Prelude
//!
//! ```rust
//! use devhost_core::prelude::*;
//! ```

pub mod error;
pub mod logging;
pub mod prelude;
pub mod types;

pub use error::{Error, ErrorKind, Result, ResultExt};
pub use logging::DeviceLog;
pub use types::{
    ActiveServices, AgentState, Bitness, BulkOperationResult, ForwardDirection, PortRole,
    ProcessSlot, ScriptSessionId, SessionKey,
};
