//! Operations over every managed device

use devhost_bridge::{BootloaderBridge, CommandBridge, ScriptingConnector};
use devhost_core::prelude::*;
use devhost_core::BulkOperationResult;

use crate::bugreport::normalize_logline_timestamp;
use crate::bulk::run_concurrently;
use crate::config::DeviceConfig;
use crate::device::DeviceSession;

/// Create one session per config, optionally starting services on each.
///
/// Starting is all-or-nothing: if any device fails, the devices started so
/// far are closed and the error is returned.
pub async fn create<B, F, C, M>(
    configs: Vec<DeviceConfig>,
    mut make_session: M,
    start_services: bool,
) -> Result<Vec<DeviceSession<B, F, C>>>
where
    B: CommandBridge + Clone + Sync + 'static,
    F: BootloaderBridge + Sync,
    C: ScriptingConnector + Clone,
    M: FnMut(DeviceConfig) -> Result<DeviceSession<B, F, C>>,
{
    let mut devices = Vec::with_capacity(configs.len());
    for config in configs {
        devices.push(make_session(config)?);
    }

    if start_services {
        for i in 0..devices.len() {
            if let Err(e) = devices[i].start_services().await {
                error!(
                    "Failed to start services on {}: {}",
                    devices[i].serial(),
                    e
                );
                destroy(&mut devices).await;
                return Err(e);
            }
        }
    }

    info!("Created {} device session(s)", devices.len());
    Ok(devices)
}

/// Close every session
pub async fn destroy<B, F, C>(devices: &mut [DeviceSession<B, F, C>])
where
    B: CommandBridge + Clone + Sync + 'static,
    F: BootloaderBridge + Sync,
    C: ScriptingConnector + Clone,
{
    for device in devices.iter_mut() {
        device.close().await;
    }
}

/// The single device matching `predicate`. `description` names the filter
/// in errors.
pub fn find_device<'a, B, F, C, P>(
    devices: &'a [DeviceSession<B, F, C>],
    description: &str,
    predicate: P,
) -> Result<&'a DeviceSession<B, F, C>>
where
    B: CommandBridge + Clone + Sync + 'static,
    F: BootloaderBridge + Sync,
    C: ScriptingConnector + Clone,
    P: Fn(&DeviceSession<B, F, C>) -> bool,
{
    let matches: Vec<&DeviceSession<B, F, C>> =
        devices.iter().filter(|d| predicate(*d)).collect();

    match matches.as_slice() {
        [device] => Ok(*device),
        [] => Err(Error::DeviceNotFound {
            filter: description.to_string(),
        }),
        many => Err(Error::AmbiguousDevice {
            serials: many.iter().map(|d| d.config().serial.clone()).collect(),
        }),
    }
}

/// Capture a bug report on every device at once.
///
/// `begin_time` is a log line timestamp; it is made file-name safe here.
pub async fn take_bug_reports<B, F, C>(
    devices: &[DeviceSession<B, F, C>],
    test_name: &str,
    begin_time: &str,
) -> Vec<BulkOperationResult>
where
    B: CommandBridge + Clone + Sync + 'static,
    F: BootloaderBridge + Sync,
    C: ScriptingConnector + Clone,
{
    let begin_time = normalize_logline_timestamp(begin_time);
    let mut results = Vec::new();
    let mut jobs = Vec::new();

    for device in devices {
        let serial = device.serial().to_string();
        match device.bug_report_job(test_name, &begin_time) {
            Ok(job) => jobs.push((serial, async move { job.await.map(|_| ()) })),
            Err(e) => {
                error!("{}: cannot prepare bug report: {}", serial, e);
                results.push(BulkOperationResult::failure(serial, e.to_string()));
            }
        }
    }

    results.extend(run_concurrently(jobs).await);
    results
}
