//! Named standing processes for one device
//!
//! A [`ProcessSupervisor`] holds at most one [`StandingProcess`] per
//! [`ProcessSlot`]. A process that exited on its own is reaped the next time
//! its slot is touched.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};

use devhost_bridge::{ProcessSpec, StandingProcess};
use devhost_core::prelude::*;
use devhost_core::ProcessSlot;

/// Snapshot of a supervised process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub slot: ProcessSlot,
    pub command_line: String,
    pub pid: Option<u32>,
    pub log_file: PathBuf,
    pub started_at: DateTime<Local>,
}

impl ProcessInfo {
    fn of(slot: ProcessSlot, process: &StandingProcess) -> Self {
        Self {
            slot,
            command_line: process.command_line().to_string(),
            pid: process.pid(),
            log_file: process.log_file().to_path_buf(),
            started_at: process.started_at(),
        }
    }
}

pub struct ProcessSupervisor {
    serial: String,
    stop_timeout: Duration,
    slots: BTreeMap<ProcessSlot, StandingProcess>,
}

impl ProcessSupervisor {
    /// `stop_timeout` bounds each of the SIGTERM and kill waits in
    /// [`stop_named`](Self::stop_named).
    pub fn new(serial: impl Into<String>, stop_timeout: Duration) -> Self {
        Self {
            serial: serial.into(),
            stop_timeout,
            slots: BTreeMap::new(),
        }
    }

    /// Start `spec` in `slot`, appending its output to `log_file`.
    ///
    /// Fails with [`Error::AlreadyRunning`] if the slot holds a live process
    /// and with [`Error::EarlyExit`] if the new process dies within `grace`.
    pub async fn start_named(
        &mut self,
        slot: ProcessSlot,
        spec: &ProcessSpec,
        log_file: &Path,
        grace: Duration,
    ) -> Result<ProcessInfo> {
        self.reap(slot);
        if self.slots.contains_key(&slot) {
            return Err(Error::already_running(&self.serial, slot.to_string()));
        }

        let process = StandingProcess::start(spec, log_file, grace).await?;
        let info = ProcessInfo::of(slot, &process);
        info!(
            "{}: {} running (pid {:?}), logging to {}",
            self.serial,
            slot,
            info.pid,
            log_file.display()
        );
        self.slots.insert(slot, process);
        Ok(info)
    }

    /// Stop the process in `slot`. An empty slot is a no-op.
    ///
    /// The slot is cleared even when the process could not be confirmed
    /// dead, in which case [`Error::StopError`] is returned.
    pub async fn stop_named(&mut self, slot: ProcessSlot) -> Result<()> {
        let Some(mut process) = self.slots.remove(&slot) else {
            debug!("{}: no {} process to stop", self.serial, slot);
            return Ok(());
        };

        if process.has_exited() {
            debug!(
                "{}: {} had already exited with {:?}",
                self.serial,
                slot,
                process.exit_code()
            );
            return Ok(());
        }

        info!("{}: stopping {}", self.serial, slot);
        process.terminate(self.stop_timeout).await
    }

    /// Stop every slot, logging failures
    pub async fn stop_all(&mut self) {
        let slots: Vec<ProcessSlot> = self.slots.keys().copied().collect();
        for slot in slots {
            if let Err(e) = self.stop_named(slot).await {
                error!("{}: failed to stop {}: {}", self.serial, slot, e);
            }
        }
    }

    pub fn is_running(&self, slot: ProcessSlot) -> bool {
        self.slots.get(&slot).is_some_and(|p| p.is_running())
    }

    pub fn info(&self, slot: ProcessSlot) -> Option<ProcessInfo> {
        self.slots
            .get(&slot)
            .filter(|p| p.is_running())
            .map(|p| ProcessInfo::of(slot, p))
    }

    /// Output the process in `slot` has logged since it started
    pub fn captured_output(&self, slot: ProcessSlot) -> Option<String> {
        self.slots.get(&slot).map(|p| p.captured_output())
    }

    /// Slots with a live process
    pub fn running_slots(&self) -> Vec<ProcessSlot> {
        self.slots
            .iter()
            .filter(|(_, p)| p.is_running())
            .map(|(slot, _)| *slot)
            .collect()
    }

    fn reap(&mut self, slot: ProcessSlot) {
        if self.slots.get(&slot).is_some_and(|p| p.has_exited()) {
            if let Some(process) = self.slots.remove(&slot) {
                warn!(
                    "{}: {} exited unexpectedly with {:?}",
                    self.serial,
                    slot,
                    process.exit_code()
                );
            }
        }
    }
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("serial", &self.serial)
            .field("running", &self.running_slots())
            .finish()
    }
}
