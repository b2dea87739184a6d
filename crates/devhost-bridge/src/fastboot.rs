//! [`BootloaderBridge`] backed by the `fastboot` executable

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use devhost_core::prelude::*;

use crate::bridge::BootloaderBridge;
use crate::devices::list_fastboot_devices;
use crate::exec::run_tool;

const FASTBOOT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct FastbootBridge {
    fastboot: PathBuf,
    serial: String,
}

impl FastbootBridge {
    pub fn new(fastboot: impl Into<PathBuf>, serial: impl Into<String>) -> Self {
        Self {
            fastboot: fastboot.into(),
            serial: serial.into(),
        }
    }
}

impl BootloaderBridge for FastbootBridge {
    async fn list_device_ids(&self) -> Result<BTreeSet<String>> {
        list_fastboot_devices(&self.fastboot).await
    }

    async fn get_var(&self, name: &str) -> Result<Vec<u8>> {
        // fastboot prints variables on stderr; merge it so callers see the value
        let mut command = tokio::process::Command::new(&self.fastboot);
        command
            .args(["-s", self.serial.as_str(), "getvar", name])
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);

        let line = format!("{} -s {} getvar {}", self.fastboot.display(), self.serial, name);
        let output = tokio::time::timeout(FASTBOOT_TIMEOUT, command.output())
            .await
            .map_err(|_| Error::BridgeTimeout {
                command: line.clone(),
                timeout: FASTBOOT_TIMEOUT,
            })?
            .map_err(|e| Error::process_spawn(&line, e.to_string()))?;

        if !output.status.success() {
            return Err(Error::bridge(
                line,
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }

        let mut merged = output.stderr;
        merged.extend_from_slice(&output.stdout);
        Ok(merged)
    }

    async fn reboot(&self) -> Result<()> {
        info!("fastboot reboot {}", self.serial);
        run_tool(
            &self.fastboot,
            &["-s", self.serial.as_str(), "reboot"],
            FASTBOOT_TIMEOUT,
        )
        .await
        .map(|_| ())
    }
}
