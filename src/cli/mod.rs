//! Command implementations for the `devhost` binary

pub mod signals;

use std::path::{Path, PathBuf};

use color_eyre::eyre::{eyre, Result};
use futures_util::future::join_all;
use tracing::{error, info, warn};

use devhost_bridge::{
    list_adb_devices, list_fastboot_devices, AdbBridge, FastbootBridge, TcpConnector, ToolPaths,
};
use devhost_core::BulkOperationResult;
use devhost_session::bugreport::logline_timestamp;
use devhost_session::config::load_settings;
use devhost_session::{fleet, AdbDeviceSession, DeviceConfig, DeviceSession, Settings};

/// Tools and settings shared by the device commands
struct Host {
    adb: PathBuf,
    fastboot: PathBuf,
    settings: Settings,
    log_dir: PathBuf,
}

impl Host {
    /// Install error reporting, load `config`, start logging and locate the tools
    fn load(config: &Path) -> Result<Self> {
        color_eyre::install()?;

        let settings = load_settings(config)?;
        let log_dir = devhost_core::logging::init(Some(&settings.log_dir()))?;

        let tools = ToolPaths::detect();
        if let Some(message) = tools.adb_unavailable_message() {
            return Err(eyre!(message));
        }
        let adb = tools.adb()?;
        // Without fastboot, bootloader detection reports a spawn failure
        let fastboot = tools.fastboot.unwrap_or_else(|| PathBuf::from("fastboot"));

        Ok(Self {
            adb,
            fastboot,
            settings,
            log_dir,
        })
    }

    fn session(&self, config: DeviceConfig) -> AdbDeviceSession {
        let serial = config.serial.clone();
        DeviceSession::new(
            config,
            AdbBridge::new(&self.adb, &serial),
            FastbootBridge::new(&self.fastboot, &serial),
            TcpConnector::default(),
            &self.log_dir,
            self.settings.timing.clone(),
        )
    }

    /// Resolve the configured devices against what adb reports and build
    /// their sessions.
    async fn create_devices(&self, start_services: bool) -> Result<Vec<AdbDeviceSession>> {
        let attached = list_adb_devices(&self.adb).await?;
        let configs = self.settings.resolve_devices(&attached)?;
        info!("Managing {} device(s)", configs.len());

        let devices = fleet::create(
            configs,
            |config| Ok(self.session(config)),
            start_services,
        )
        .await?;
        Ok(devices)
    }
}

/// `devhost devices`
pub async fn run_devices() -> Result<()> {
    color_eyre::install()?;

    let tools = ToolPaths::detect();
    let adb = tools.adb()?;
    for serial in list_adb_devices(&adb).await? {
        println!("{serial}\tdevice");
    }

    match tools.fastboot() {
        Ok(fastboot) => {
            for serial in list_fastboot_devices(&fastboot).await? {
                println!("{serial}\tbootloader");
            }
        }
        Err(e) => eprintln!("{e}"),
    }

    Ok(())
}

/// `devhost start`: hold services on every device until a shutdown signal
pub async fn run_start(config: &Path) -> Result<()> {
    let host = Host::load(config)?;
    let mut devices = host.create_devices(true).await?;

    for device in &devices {
        let services = device.active_services();
        info!(
            "{}: log capture={} agent={} scripting={}",
            device.serial(),
            services.log_capture,
            services.agent,
            services.scripting
        );
        if let Some(endpoints) = device.agent_endpoints() {
            info!(
                "{}: agent command port {} callback port {}",
                device.serial(),
                endpoints.host_command_port,
                endpoints.host_callback_port
            );
        }
    }
    eprintln!("Services running on {} device(s). Press Ctrl-C to stop.", devices.len());

    let waited = signals::wait_for_signal().await;
    info!("Shutting down");
    fleet::destroy(&mut devices).await;
    waited?;
    Ok(())
}

/// `devhost bugreport`: one report per device, taken concurrently
pub async fn run_bugreport(config: &Path, test_name: &str) -> Result<()> {
    let host = Host::load(config)?;
    let mut devices = host.create_devices(false).await?;

    let begin_time = logline_timestamp(chrono::Local::now());
    let results = fleet::take_bug_reports(&devices, test_name, &begin_time).await;
    fleet::destroy(&mut devices).await;

    report(&results, "bug report")
}

/// `devhost reboot`: reboot every device at once
pub async fn run_reboot(config: &Path, restart: bool) -> Result<()> {
    let host = Host::load(config)?;
    let mut devices = host.create_devices(restart).await?;

    let outcomes = join_all(devices.iter_mut().map(|device| async move {
        let serial = device.serial().to_string();
        match device.reboot(restart).await {
            Ok(()) => BulkOperationResult::success(serial),
            Err(e) => BulkOperationResult::failure(serial, e.to_string()),
        }
    }))
    .await;
    fleet::destroy(&mut devices).await;

    report(&outcomes, "reboot")
}

/// Print per-device outcomes; an error if any device failed
fn report(results: &[BulkOperationResult], operation: &str) -> Result<()> {
    let mut failed = 0;
    for result in results {
        match &result.error {
            None => println!("{}: {} ok", result.device_id, operation),
            Some(message) => {
                failed += 1;
                error!("{}: {} failed: {}", result.device_id, operation, message);
                println!("{}: {} failed: {}", result.device_id, operation, message);
            }
        }
    }

    if failed > 0 {
        warn!("{} of {} device(s) failed", failed, results.len());
        return Err(eyre!("{operation} failed on {failed} device(s)"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_all_succeeded() {
        let results = vec![
            BulkOperationResult::success("A"),
            BulkOperationResult::success("B"),
        ];
        assert!(report(&results, "reboot").is_ok());
    }

    #[test]
    fn test_report_counts_failures() {
        let results = vec![
            BulkOperationResult::success("A"),
            BulkOperationResult::failure("B", "device offline"),
        ];
        let err = report(&results, "bug report").unwrap_err();
        assert_eq!(err.to_string(), "bug report failed on 1 device(s)");
    }

    #[test]
    fn test_load_missing_config() {
        let temp = tempfile::tempdir().unwrap();
        let result = Host::load(&temp.path().join("devhost.toml"));
        assert!(result.is_err());
    }
}
