//! Device session
//!
//! [`DeviceSession`] is the single owner of everything devhost runs for one
//! device: port leases, standing processes, the agent and scripting
//! sessions. Services start in the order log capture → agent → agent
//! endpoints → scripting and stop in reverse.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::Instrument;

use devhost_bridge::properties::{
    self, is_boot_completed, is_root_uid, model_from_props, parse_cpu_abi,
    parse_fastboot_product, parse_total_memory, setprop_command, shell_text,
};
use devhost_bridge::scripting::SCRIPTING_DEVICE_PORT;
use devhost_bridge::{BootloaderBridge, CommandBridge, ScriptingConnector};
use devhost_core::prelude::*;
use devhost_core::{ActiveServices, AgentState, DeviceLog, PortRole, ProcessSlot};

use crate::agent::AgentLifecycle;
use crate::bugreport::{unique_bug_report_path, BUG_REPORT_DIR};
use crate::config::{DeviceConfig, TimingSettings, PRODUCT_TYPE_UNKNOWN};
use crate::ports::{LeaseMode, PortLeaseTracker};
use crate::scripting::{EventDispatcher, SessionPool};
use crate::supervisor::ProcessSupervisor;

const BOOT_COMPLETED_PROP: &str = "sys.boot_completed";
const VERITY_PROP: &str = "partition.system.verified";

/// Host-side ports through which the agent is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentEndpoints {
    /// Forwarded to the agent's command port
    pub host_command_port: u16,
    /// The agent's callback connections arrive here
    pub host_callback_port: u16,
    pub device_command_port: u16,
}

/// Name of the log capture file
pub fn logcat_file_name(model: &str, serial: &str) -> String {
    format!("adblog_{model}_{serial}.txt")
}

/// One managed device
pub struct DeviceSession<B, F, C: ScriptingConnector> {
    config: DeviceConfig,
    timing: TimingSettings,
    log: DeviceLog,
    bridge: B,
    bootloader: F,
    connector: C,
    ports: PortLeaseTracker,
    supervisor: ProcessSupervisor,
    agent: AgentLifecycle,
    endpoints: Option<AgentEndpoints>,
    pool: Option<SessionPool<C>>,
    active: ActiveServices,
}

impl<B, F, C> DeviceSession<B, F, C>
where
    B: CommandBridge + Clone + Sync + 'static,
    F: BootloaderBridge + Sync,
    C: ScriptingConnector + Clone,
{
    /// Create a session. Nothing runs on the device until
    /// [`start_services`](Self::start_services).
    pub fn new(
        config: DeviceConfig,
        bridge: B,
        bootloader: F,
        connector: C,
        log_dir: &Path,
        timing: TimingSettings,
    ) -> Self {
        let serial = config.serial.clone();
        if bridge.serial() != serial {
            warn!(
                "bridge serial {} does not match configured serial {}",
                bridge.serial(),
                serial
            );
        }
        Self {
            log: DeviceLog::new(log_dir, &serial),
            ports: PortLeaseTracker::new(&serial),
            supervisor: ProcessSupervisor::new(&serial, timing.stop_timeout()),
            agent: AgentLifecycle::new(),
            endpoints: None,
            pool: None,
            active: ActiveServices::default(),
            config,
            timing,
            bridge,
            bootloader,
            connector,
        }
    }

    // ─────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────

    pub fn serial(&self) -> &str {
        &self.config.serial
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn log(&self) -> &DeviceLog {
        &self.log
    }

    pub fn bridge(&self) -> &B {
        &self.bridge
    }

    pub fn ports(&self) -> &PortLeaseTracker {
        &self.ports
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn active_services(&self) -> ActiveServices {
        self.active
    }

    pub fn agent_state(&self) -> AgentState {
        self.agent.state()
    }

    pub fn agent(&self) -> &AgentLifecycle {
        &self.agent
    }

    pub fn agent_endpoints(&self) -> Option<AgentEndpoints> {
        self.endpoints
    }

    /// Scripting sessions, present only once the service answered a handshake
    pub fn scripting(&self) -> Option<&SessionPool<C>> {
        self.pool.as_ref()
    }

    pub fn scripting_mut(&mut self) -> Option<&mut SessionPool<C>> {
        self.pool.as_mut()
    }

    /// Event dispatcher of the default scripting session, if attached
    pub fn event_dispatcher(&self) -> Option<EventDispatcher> {
        let pool = self.pool.as_ref()?;
        pool.dispatcher(pool.default_session()?)
    }

    // ─────────────────────────────────────────────────────────
    // Device state and properties
    // ─────────────────────────────────────────────────────────

    /// The device is listed by fastboot
    pub async fn is_bootloader_mode(&self) -> Result<bool> {
        Ok(self
            .bootloader
            .list_device_ids()
            .await?
            .contains(self.serial()))
    }

    /// The device is listed by adb
    pub async fn is_adb_detectable(&self) -> Result<bool> {
        Ok(self.bridge.list_device_ids().await?.contains(self.serial()))
    }

    pub async fn get_prop(&self, name: &str) -> Result<String> {
        let out = self.bridge.run_shell(&format!("getprop {name}")).await?;
        Ok(shell_text(&out))
    }

    pub async fn set_prop(&self, name: &str, value: &str) -> Result<()> {
        let command = setprop_command(name, value)?;
        self.bridge.run_shell(&command).await?;
        Ok(())
    }

    /// Product model, from fastboot in bootloader mode
    pub async fn model(&self) -> Result<String> {
        if self.is_bootloader_mode().await? {
            let out = self.bootloader.get_var("product").await?;
            return Ok(parse_fastboot_product(&shell_text(&out))
                .unwrap_or_else(|| PRODUCT_TYPE_UNKNOWN.to_string()));
        }
        let build_product = self.get_prop("ro.build.product").await?;
        let product_name = self.get_prop("ro.product.name").await?;
        Ok(model_from_props(&build_product, &product_name))
    }

    pub async fn cpu_abi(&self) -> Result<String> {
        Ok(parse_cpu_abi(&self.get_prop("ro.product.cpu.abi").await?))
    }

    pub async fn is_64bit(&self) -> Result<bool> {
        let out = self.bridge.run_shell("uname -m").await?;
        Ok(properties::is_64bit_machine(&shell_text(&out)))
    }

    /// Total memory in bytes; `None` if `/proc/meminfo` is unparseable
    pub async fn total_memory(&self) -> Result<Option<u64>> {
        let out = self.bridge.run_shell("cat /proc/meminfo").await?;
        Ok(parse_total_memory(&shell_text(&out)))
    }

    pub async fn lib_paths(&self) -> Result<Vec<&'static str>> {
        Ok(properties::lib_paths(self.is_64bit().await?))
    }

    pub async fn is_root(&self) -> Result<bool> {
        let out = self.bridge.run_shell("id -u").await?;
        Ok(is_root_uid(&shell_text(&out)))
    }

    /// dm-verity state of the system partition; unreadable means disabled
    pub async fn verity_enabled(&self) -> bool {
        match self.get_prop(VERITY_PROP).await {
            Ok(value) => !value.is_empty(),
            Err(e) => {
                debug!("{}: cannot read {}: {}", self.serial(), VERITY_PROP, e);
                false
            }
        }
    }

    /// `sys.boot_completed` is set; probe failures count as not booted
    pub async fn has_booted(&self) -> bool {
        self.boot_state().await.is_ok_and(|v| is_boot_completed(&v))
    }

    async fn boot_state(&self) -> Result<String> {
        self.get_prop(BOOT_COMPLETED_PROP).await
    }

    /// Vendor interface manifest, if the device exposes one
    pub async fn vintf_manifest(&self) -> Option<String> {
        for command in ["lshal --init-vintf 2> /dev/null", "cat /vendor/manifest.xml"] {
            match self.bridge.run_shell(command).await {
                Ok(out) if !out.is_empty() => {
                    return Some(String::from_utf8_lossy(&out).into_owned());
                }
                Ok(_) => {}
                Err(e) => debug!("{}: `{}` failed: {}", self.serial(), command, e),
            }
        }
        None
    }

    /// Start the Android runtime and wait for it to finish booting
    pub async fn start_runtime(&self) -> Result<()> {
        self.bridge.run_shell("start").await?;
        self.wait_for_boot_completion().await
    }

    /// Stop the Android runtime
    pub async fn stop_runtime(&self) -> Result<()> {
        self.bridge.run_shell("stop").await?;
        self.set_prop(BOOT_COMPLETED_PROP, "0").await
    }

    /// Restart adbd as root and remount partitions writable.
    ///
    /// Early in boot these commands can fail; failures are logged.
    pub async fn root_adb(&self) {
        match self.is_root().await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => debug!("{}: cannot check root: {}", self.serial(), e),
        }

        info!("{}: restarting adbd as root", self.serial());
        if let Err(e) = self.bridge.root().await {
            error!("{}: adb root failed: {}", self.serial(), e);
        }
        if let Err(e) = self.bridge.wait_for_device().await {
            error!("{}: wait-for-device failed: {}", self.serial(), e);
        }
        if let Err(e) = self.bridge.remount().await {
            error!("{}: adb remount failed: {}", self.serial(), e);
        }
        if let Err(e) = self.bridge.wait_for_device().await {
            error!("{}: wait-for-device failed: {}", self.serial(), e);
        }
    }

    /// Poll `sys.boot_completed` until it is set or the boot timeout passes
    pub async fn wait_for_boot_completion(&self) -> Result<()> {
        let started = Instant::now();
        let limit = self.timing.boot_timeout();

        match tokio::time::timeout(limit, self.bridge.wait_for_device()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("{}: wait-for-device: {}", self.serial(), e),
            Err(_) => debug!("{}: wait-for-device timed out", self.serial()),
        }

        let mut last_state = String::from("unknown");
        loop {
            match self.boot_state().await {
                Ok(value) if is_boot_completed(&value) => {
                    info!(
                        "{}: boot completed after {:?}",
                        self.serial(),
                        started.elapsed()
                    );
                    return Ok(());
                }
                Ok(value) => {
                    last_state = format!("{BOOT_COMPLETED_PROP}={value:?}");
                }
                Err(e) => {
                    // adbd is often unreachable while the device boots
                    trace!("{}: boot probe failed: {}", self.serial(), e);
                    last_state = e.to_string();
                }
            }

            if started.elapsed() + self.timing.boot_poll() > limit {
                return Err(Error::BootTimeout {
                    serial: self.serial().to_string(),
                    elapsed: started.elapsed(),
                    last_state,
                });
            }
            tokio::time::sleep(self.timing.boot_poll()).await;
        }
    }

    // ─────────────────────────────────────────────────────────
    // Services
    // ─────────────────────────────────────────────────────────

    /// Start the services enabled in the device config.
    ///
    /// On failure everything already started is stopped again before the
    /// error is returned.
    pub async fn start_services(&mut self) -> Result<()> {
        let wanted = ActiveServices {
            log_capture: true,
            agent: self.config.enable_agent,
            scripting: self.config.enable_scripting,
        };
        let span = self.log.span().clone();
        self.start_selected(wanted, LeaseMode::Exclusive)
            .instrument(span)
            .await
    }

    async fn start_selected(&mut self, wanted: ActiveServices, scripting_mode: LeaseMode) -> Result<()> {
        let result = self.try_start(wanted, scripting_mode).await;
        if let Err(e) = &result {
            error!("{}: failed to start services: {}", self.serial(), e);
            self.stop_active(false).await;
        }
        result
    }

    async fn try_start(&mut self, wanted: ActiveServices, scripting_mode: LeaseMode) -> Result<()> {
        self.log.ensure_dir(None)?;

        if wanted.log_capture {
            self.start_log_capture().await?;
        }
        if wanted.agent {
            self.start_agent_services().await?;
        }
        if wanted.scripting {
            self.start_scripting(scripting_mode).await?;
        }
        Ok(())
    }

    async fn start_log_capture(&mut self) -> Result<()> {
        let model = match self.model().await {
            Ok(model) => model,
            Err(e) => {
                warn!("{}: cannot read model: {}", self.serial(), e);
                self.config.product_type.clone()
            }
        };
        let log_file = self.log.file(&logcat_file_name(&model, self.serial()));
        let spec = self.bridge.logcat_process(&self.config.logcat_param);

        self.supervisor
            .start_named(
                ProcessSlot::LogCapture,
                &spec,
                &log_file,
                self.timing.health_check(),
            )
            .await?;
        self.active.log_capture = true;
        Ok(())
    }

    async fn start_agent_services(&mut self) -> Result<()> {
        self.active.agent = true;
        let device_command_port = self
            .agent
            .start(&self.bridge, &mut self.supervisor, &self.log, &self.timing)
            .await?;

        let host_command_port = self
            .ports
            .lease(
                &self.bridge,
                PortRole::Command,
                device_command_port,
                LeaseMode::Exclusive,
            )
            .await?;
        let host_callback_port = self
            .ports
            .lease(
                &self.bridge,
                PortRole::Callback,
                self.config.device_callback_port,
                LeaseMode::Exclusive,
            )
            .await?;

        let endpoints = AgentEndpoints {
            host_command_port,
            host_callback_port,
            device_command_port,
        };
        info!("{}: agent endpoints {:?}", self.serial(), endpoints);
        self.endpoints = Some(endpoints);
        Ok(())
    }

    async fn start_scripting(&mut self, mode: LeaseMode) -> Result<()> {
        let host_port = self
            .ports
            .lease(&self.bridge, PortRole::Scripting, SCRIPTING_DEVICE_PORT, mode)
            .await?;

        let mut pool = SessionPool::new(
            self.serial(),
            self.connector.clone(),
            host_port,
            &self.timing,
        );

        let opened = match pool.open_session(&self.bridge).await {
            Ok(session_id) if self.config.enable_scripting_events => pool
                .attach_event_dispatcher(session_id)
                .await
                .map(|_| ()),
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = opened {
            pool.close_all(&self.bridge, &mut self.ports).await;
            return Err(e);
        }

        self.pool = Some(pool);
        self.active.scripting = true;
        Ok(())
    }

    /// Stop every running service in reverse start order. Failures are
    /// logged and do not stop the remaining steps.
    pub async fn stop_services(&mut self) {
        let span = self.log.span().clone();
        self.stop_active(false).instrument(span).await;
    }

    async fn stop_active(&mut self, keep_scripting_port: bool) {
        if let Some(mut pool) = self.pool.take() {
            if keep_scripting_port {
                for session_id in pool.session_ids() {
                    pool.close_session(session_id).await;
                }
            } else {
                pool.close_all(&self.bridge, &mut self.ports).await;
            }
        }
        self.active.scripting = false;
        if !keep_scripting_port {
            if let Err(e) = self.ports.release(&self.bridge, PortRole::Scripting).await {
                warn!("{}: failed to remove scripting forward: {}", self.serial(), e);
            }
        }

        self.endpoints = None;
        for role in [PortRole::Callback, PortRole::Command] {
            if let Err(e) = self.ports.release(&self.bridge, role).await {
                warn!("{}: failed to remove {} forward: {}", self.serial(), role, e);
            }
        }

        if self.active.agent || self.agent.state() != AgentState::NotStarted {
            if let Err(e) = self.agent.stop(&mut self.supervisor).await {
                error!("{}: failed to stop agent: {}", self.serial(), e);
            }
        }
        self.active.agent = false;

        if let Err(e) = self.supervisor.stop_named(ProcessSlot::LogCapture).await {
            error!("{}: failed to stop log capture: {}", self.serial(), e);
        }
        self.active.log_capture = false;
    }

    /// Reboot the device.
    ///
    /// In bootloader mode this only asks fastboot to reboot. Otherwise the
    /// running services are stopped, the device rebooted and waited for, and
    /// with `restart` the same services are started again.
    pub async fn reboot(&mut self, restart: bool) -> Result<()> {
        let span = self.log.span().clone();
        self.reboot_inner(restart).instrument(span).await
    }

    async fn reboot_inner(&mut self, restart: bool) -> Result<()> {
        if self.is_bootloader_mode().await? {
            info!("{}: rebooting from bootloader", self.serial());
            return self.bootloader.reboot().await;
        }

        let previous = self.active;
        let keep_scripting_port = restart && previous.scripting;
        self.stop_active(keep_scripting_port).await;

        info!("{}: rebooting", self.serial());
        let rebooted = match self.bridge.reboot().await {
            Ok(()) => self.wait_for_boot_completion().await,
            Err(e) => Err(e),
        };
        if let Err(e) = rebooted {
            self.stop_active(false).await;
            return Err(e);
        }

        self.root_adb().await;

        if restart && previous.any() {
            info!("{}: restarting {:?}", self.serial(), previous);
            self.start_selected(previous, LeaseMode::ReuseIfFree).await?;
        }
        Ok(())
    }

    /// Capture a bug report into the device log directory
    pub async fn take_bug_report(&self, test_name: &str, begin_time: &str) -> Result<PathBuf> {
        self.bug_report_job(test_name, begin_time)?.await
    }

    /// A detached bug report capture, for running several devices at once.
    ///
    /// The destination file is reserved before this returns.
    pub fn bug_report_job(
        &self,
        test_name: &str,
        begin_time: &str,
    ) -> Result<impl Future<Output = Result<PathBuf>> + Send + 'static> {
        let dir = self.log.ensure_dir(Some(BUG_REPORT_DIR))?;
        let path = unique_bug_report_path(&dir, test_name, begin_time, self.serial());
        std::fs::File::create(&path)?;

        let bridge = self.bridge.clone();
        let test_name = test_name.to_string();
        Ok(async move {
            info!(
                "Taking bugreport for {} on {}",
                test_name,
                bridge.serial()
            );
            if let Err(e) = bridge.bugreport(&path).await {
                // Drop the reserved placeholder
                if let Err(rm) = std::fs::remove_file(&path) {
                    debug!("could not remove {}: {}", path.display(), rm);
                }
                return Err(e);
            }
            info!("Bugreport for {} taken at {}", test_name, path.display());
            Ok(path)
        })
    }

    /// Stop all services and release every port. The session can be
    /// started again afterwards.
    pub async fn close(&mut self) {
        self.stop_services().await;
        self.ports.release_all(&self.bridge).await;
        self.supervisor.stop_all().await;
    }
}

impl<B, F, C: ScriptingConnector> Drop for DeviceSession<B, F, C> {
    fn drop(&mut self) {
        if self.active.any() || !self.ports.is_empty() {
            warn!(
                "DeviceSession {} dropped with services running; call close first",
                self.config.serial
            );
        }
    }
}

impl<B, F, C: ScriptingConnector> std::fmt::Debug for DeviceSession<B, F, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("serial", &self.config.serial)
            .field("active", &self.active)
            .field("agent", &self.agent.state())
            .finish()
    }
}
