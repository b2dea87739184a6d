//! devhost-session - Device session orchestration
//!
//! This crate owns everything devhost runs for a device: port leases,
//! standing processes, the on-device agent, scripting sessions, and the
//! façade tying them together. Fleet helpers run operations across devices.

pub mod agent;
pub mod bugreport;
pub mod bulk;
pub mod config;
pub mod device;
pub mod fleet;
pub mod ports;
pub mod scripting;
pub mod supervisor;

// Re-export primary types
pub use agent::{AgentLifecycle, LaunchAttempt, LaunchOutcome};
pub use bulk::run_concurrently;
pub use config::{DeviceConfig, DeviceSelection, Settings, TimingSettings};
pub use device::{AgentEndpoints, DeviceSession};
pub use ports::{LeaseMode, PortLease, PortLeaseTracker};
pub use scripting::{EventDispatcher, RpcSession, SessionPool};
pub use supervisor::{ProcessInfo, ProcessSupervisor};

/// Session over the real `adb`, `fastboot` and scripting service
pub type AdbDeviceSession = DeviceSession<
    devhost_bridge::AdbBridge,
    devhost_bridge::FastbootBridge,
    devhost_bridge::TcpConnector,
>;
