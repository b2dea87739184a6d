//! Device enumeration via `adb devices` and `fastboot devices`

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use devhost_core::prelude::*;

use crate::exec::run_tool;

/// Default timeout for device listing commands
const DEVICES_TIMEOUT: Duration = Duration::from_secs(30);

/// State token `adb devices` prints for a usable device
pub const ADB_DEVICE_STATE: &str = "device";

/// State token `fastboot devices` prints for a device in bootloader mode
pub const FASTBOOT_DEVICE_STATE: &str = "fastboot";

/// Parse the output of `adb devices` or `fastboot devices`.
///
/// Each device line is `<serial>\t<state>`; only lines whose state equals
/// `state` are kept. Headers ("List of devices attached"), offline and
/// unauthorized devices are skipped.
pub fn parse_device_list(output: &[u8], state: &str) -> BTreeSet<String> {
    String::from_utf8_lossy(output)
        .lines()
        .filter_map(|line| {
            let mut tokens = line.trim().split('\t');
            match (tokens.next(), tokens.next(), tokens.next()) {
                (Some(serial), Some(s), None) if s.trim() == state && !serial.is_empty() => {
                    Some(serial.to_string())
                }
                _ => None,
            }
        })
        .collect()
}

/// List serials of devices attached and usable through adb
pub async fn list_adb_devices(adb: &Path) -> Result<BTreeSet<String>> {
    let out = run_tool(adb, &["devices"], DEVICES_TIMEOUT).await?;
    let devices = parse_device_list(&out, ADB_DEVICE_STATE);
    debug!("adb devices: {:?}", devices);
    Ok(devices)
}

/// List serials of devices currently in bootloader (fastboot) mode
pub async fn list_fastboot_devices(fastboot: &Path) -> Result<BTreeSet<String>> {
    let out = run_tool(fastboot, &["devices"], DEVICES_TIMEOUT).await?;
    let devices = parse_device_list(&out, FASTBOOT_DEVICE_STATE);
    debug!("fastboot devices: {:?}", devices);
    Ok(devices)
}
