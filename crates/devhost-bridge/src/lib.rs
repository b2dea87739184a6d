//! # devhost-bridge - Device Tool and Process Plumbing
//!
//! Wraps the external `adb` and `fastboot` executables, supervises
//! long-running child processes, leases host ports and speaks the scripting
//! service protocol.
//!
//! Depends on [`devhost_core`] for error handling and logging.
//!
//! ## Public API
//!
//! ### Bridge Capabilities
//! - [`CommandBridge`] - Shell, forwarding and enumeration for one device
//! - [`BootloaderBridge`] - Bootloader-mode operations
//! - [`AdbBridge`], [`FastbootBridge`] - Implementations over the real tools
//! - [`ToolPaths`] - Locate `adb` and `fastboot`
//!
//! ### Processes
//! - [`StandingProcess`] - Long-running child with health check and stop escalation
//! - [`ProcessSpec`] - Program, arguments and environment of a child
//!
//! ### Device Discovery and Properties
//! - [`list_adb_devices()`], [`list_fastboot_devices()`]
//! - [`properties`] - Parsers for shell output (memory, model, ABI, ...)
//!
//! ### Host Ports
//! - [`ports`] - Ephemeral port probing and the process-wide lease registry
//!
//! ### Scripting Service
//! - [`ScriptingConnector`], [`RpcConnection`] - Connection capabilities
//! - [`ScriptingClient`], [`TcpConnector`] - TCP implementation

pub mod adb;
pub mod bridge;
pub mod devices;
pub mod exec;
pub mod fastboot;
pub mod ports;
pub mod process;
pub mod properties;
pub mod scripting;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;
pub mod tools;

// Public API re-exports
pub use adb::AdbBridge;
pub use bridge::{BootloaderBridge, CommandBridge, LocalBootloaderBridge, LocalCommandBridge};
pub use devices::{list_adb_devices, list_fastboot_devices, parse_device_list};
pub use fastboot::FastbootBridge;
pub use process::{ProcessSpec, StandingProcess};
pub use scripting::{
    Handshake, RpcConnection, ScriptEvent, ScriptingClient, ScriptingConnector, TcpConnector,
};
pub use tools::ToolPaths;
