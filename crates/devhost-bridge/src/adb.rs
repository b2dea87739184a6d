//! [`CommandBridge`] backed by the `adb` executable

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use devhost_core::prelude::*;

use crate::bridge::CommandBridge;
use crate::devices::list_adb_devices;
use crate::exec::run_tool;
use crate::process::ProcessSpec;

/// Default bound for a single adb invocation
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// `adb wait-for-device` can block through an entire reboot
const WAIT_FOR_DEVICE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Bug reports take minutes on most devices
const BUGREPORT_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Runs `adb -s <serial> ...` for one device
#[derive(Debug, Clone)]
pub struct AdbBridge {
    adb: PathBuf,
    serial: String,
    command_timeout: Duration,
}

impl AdbBridge {
    pub fn new(adb: impl Into<PathBuf>, serial: impl Into<String>) -> Self {
        Self {
            adb: adb.into(),
            serial: serial.into(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_command_timeout(mut self, limit: Duration) -> Self {
        self.command_timeout = limit;
        self
    }

    pub fn adb_path(&self) -> &Path {
        &self.adb
    }

    async fn exec(&self, args: &[&str], limit: Duration) -> Result<Vec<u8>> {
        let mut full = Vec::with_capacity(args.len() + 2);
        full.push("-s");
        full.push(self.serial.as_str());
        full.extend_from_slice(args);
        run_tool(&self.adb, &full, limit).await
    }

    fn base_spec(&self) -> ProcessSpec {
        ProcessSpec::new(&self.adb).args(["-s", self.serial.as_str()])
    }
}

fn tcp(port: u16) -> String {
    format!("tcp:{port}")
}

impl CommandBridge for AdbBridge {
    fn serial(&self) -> &str {
        &self.serial
    }

    async fn run_shell(&self, command: &str) -> Result<Vec<u8>> {
        self.exec(&["shell", command], self.command_timeout).await
    }

    async fn forward(&self, host_port: u16, device_port: u16) -> Result<()> {
        self.exec(
            &["forward", tcp(host_port).as_str(), tcp(device_port).as_str()],
            self.command_timeout,
        )
        .await?;
        debug!("forward tcp:{} -> device tcp:{}", host_port, device_port);
        Ok(())
    }

    async fn reverse_forward(&self, device_port: u16, host_port: u16) -> Result<()> {
        self.exec(
            &["reverse", tcp(device_port).as_str(), tcp(host_port).as_str()],
            self.command_timeout,
        )
        .await?;
        debug!("reverse device tcp:{} -> tcp:{}", device_port, host_port);
        Ok(())
    }

    async fn remove_forward(&self, host_port: u16) -> Result<()> {
        self.exec(&["forward", "--remove", tcp(host_port).as_str()], self.command_timeout)
            .await
            .map(|_| ())
    }

    async fn remove_reverse(&self, device_port: u16) -> Result<()> {
        self.exec(&["reverse", "--remove", tcp(device_port).as_str()], self.command_timeout)
            .await
            .map(|_| ())
    }

    async fn list_device_ids(&self) -> Result<BTreeSet<String>> {
        list_adb_devices(&self.adb).await
    }

    async fn root(&self) -> Result<()> {
        self.exec(&["root"], self.command_timeout).await.map(|_| ())
    }

    async fn remount(&self) -> Result<()> {
        self.exec(&["remount"], self.command_timeout).await.map(|_| ())
    }

    async fn wait_for_device(&self) -> Result<()> {
        self.exec(&["wait-for-device"], WAIT_FOR_DEVICE_TIMEOUT)
            .await
            .map(|_| ())
    }

    async fn reboot(&self) -> Result<()> {
        self.exec(&["reboot"], self.command_timeout).await.map(|_| ())
    }

    async fn bugreport(&self, dest: &Path) -> Result<()> {
        let report = self.exec(&["bugreport"], BUGREPORT_TIMEOUT).await?;
        tokio::fs::write(dest, report).await?;
        Ok(())
    }

    fn logcat_process(&self, params: &str) -> ProcessSpec {
        self.base_spec()
            .args(["logcat", "-v", "threadtime"])
            .args(params.split_whitespace())
    }

    fn shell_process(&self, command: &str) -> ProcessSpec {
        self.base_spec().args(["shell", command])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logcat_process_spec() {
        let bridge = AdbBridge::new("/sdk/adb", "HT01");
        let spec = bridge.logcat_process("-b all");
        assert_eq!(
            spec.command_line(),
            "/sdk/adb -s HT01 logcat -v threadtime -b all"
        );
    }

    #[test]
    fn test_shell_process_keeps_command_as_one_argument() {
        let bridge = AdbBridge::new("adb", "emulator-5554");
        let spec = bridge.shell_process("LD_LIBRARY_PATH=/a /a/agent");
        assert_eq!(
            spec.args,
            vec!["-s", "emulator-5554", "shell", "LD_LIBRARY_PATH=/a /a/agent"]
        );
    }

    #[tokio::test]
    async fn test_run_shell_through_stub_tool() {
        // `echo` stands in for adb and prints its own arguments
        let bridge = AdbBridge::new("echo", "SERIAL");
        let out = bridge.run_shell("getprop ro.product.name").await.unwrap();
        assert_eq!(
            String::from_utf8_lossy(&out).trim(),
            "-s SERIAL shell getprop ro.product.name"
        );
    }

    #[tokio::test]
    async fn test_failure_is_bridge_error() {
        let bridge = AdbBridge::new("false", "SERIAL");
        let err = bridge.root().await.unwrap_err();
        assert!(matches!(err, Error::Bridge { .. }));
        assert_eq!(err.kind(), ErrorKind::TransientDevice);
    }
}
