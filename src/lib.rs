//! devhost - Host-side device session orchestrator
//!
//! The binary is a thin shell over [`devhost_session`]; the command
//! implementations live in [`cli`].

pub mod cli;

pub use cli::{run_bugreport, run_devices, run_reboot, run_start};
