//! Capabilities the orchestrator needs from the command and bootloader tools
//!
//! Session code is generic over these traits so tests can substitute the
//! fakes in [`crate::test_utils`] for real `adb`/`fastboot` invocations.
//! Implementors implement the `Send` variants ([`CommandBridge`],
//! [`BootloaderBridge`]); the `Local*` variants exist for single-threaded
//! callers.

use std::collections::BTreeSet;
use std::path::Path;

use devhost_core::prelude::*;

use crate::process::ProcessSpec;

/// Shell execution, port forwarding and device enumeration for one device
#[trait_variant::make(CommandBridge: Send)]
pub trait LocalCommandBridge {
    /// Serial of the device this bridge talks to
    fn serial(&self) -> &str;

    /// Run `command` in a device shell and return its stdout
    async fn run_shell(&self, command: &str) -> Result<Vec<u8>>;

    /// Forward `host_port` on the host to `device_port` on the device
    async fn forward(&self, host_port: u16, device_port: u16) -> Result<()>;

    /// Forward `device_port` on the device back to `host_port` on the host
    async fn reverse_forward(&self, device_port: u16, host_port: u16) -> Result<()>;

    async fn remove_forward(&self, host_port: u16) -> Result<()>;

    async fn remove_reverse(&self, device_port: u16) -> Result<()>;

    /// Serials of every device currently attached
    async fn list_device_ids(&self) -> Result<BTreeSet<String>>;

    /// Restart the device-side daemon with root privileges
    async fn root(&self) -> Result<()>;

    async fn remount(&self) -> Result<()>;

    async fn wait_for_device(&self) -> Result<()>;

    async fn reboot(&self) -> Result<()>;

    /// Write a full bug report to `dest`
    async fn bugreport(&self, dest: &Path) -> Result<()>;

    /// Standing process that streams the device log (`params` e.g. `-b all`)
    fn logcat_process(&self, params: &str) -> ProcessSpec;

    /// Standing process running `command` in a device shell
    fn shell_process(&self, command: &str) -> ProcessSpec;
}

/// Bootloader-mode operations for one device
#[trait_variant::make(BootloaderBridge: Send)]
pub trait LocalBootloaderBridge {
    /// Serials of devices currently in bootloader mode
    async fn list_device_ids(&self) -> Result<BTreeSet<String>>;

    /// Raw output of `getvar <name>`
    async fn get_var(&self, name: &str) -> Result<Vec<u8>>;

    async fn reboot(&self) -> Result<()>;
}
