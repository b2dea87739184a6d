//! On-device agent lifecycle
//!
//! The agent is a native binary pushed to `/data/local/tmp`. Starting it
//! means clearing leftovers of a previous run, launching the widest binary
//! the device supports (falling back to 32-bit), then waiting for the agent
//! to publish its TCP port in a well-known file.

use std::time::Instant;

use devhost_bridge::CommandBridge;
use devhost_core::prelude::*;
use devhost_core::{AgentState, Bitness, DeviceLog, ProcessSlot};

use crate::config::TimingSettings;
use crate::supervisor::ProcessSupervisor;

/// Staging directory of agent and driver binaries
pub const DEVICE_TMP_DIR: &str = "/data/local/tmp";

/// File the agent writes its command port to once it is listening
pub const PORT_FILE: &str = "/data/local/tmp/vts_tcp_server_port";

/// Binaries killed before a launch and made executable, without bitness suffix
const AGENT_BINARIES: [&str; 3] = ["vts_hal_agent", "vts_hal_driver", "vts_shell_driver"];

/// What happened to one launch strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    Running,
    EarlyExit { code: Option<i32>, output: String },
    SpawnFailed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchAttempt {
    pub bitness: Bitness,
    pub outcome: LaunchOutcome,
}

/// Binaries to try, widest first. `machine` is `uname -m` output.
pub fn launch_strategies(machine: &str) -> Vec<Bitness> {
    if machine.contains("64") {
        vec![Bitness::Bits64, Bitness::Bits32]
    } else {
        vec![Bitness::Bits32]
    }
}

/// Shell command that runs the agent binary for `bitness`
pub fn agent_command(bitness: Bitness) -> String {
    let b = bitness.suffix();
    format!(
        "LD_LIBRARY_PATH={DEVICE_TMP_DIR}/{b} {DEVICE_TMP_DIR}/{b}/vts_hal_agent{b} \
         {DEVICE_TMP_DIR}/32/vts_hal_driver32 {DEVICE_TMP_DIR}/64/vts_hal_driver64 \
         {DEVICE_TMP_DIR}/spec \
         {DEVICE_TMP_DIR}/32/vts_shell_driver32 {DEVICE_TMP_DIR}/64/vts_shell_driver64"
    )
}

/// Host log file name for the agent of `bitness`
pub fn agent_log_name(bitness: Bitness) -> String {
    format!("vts_agent_{}.log", bitness.suffix())
}

/// Commands that remove the state of a previous agent run
pub fn cleanup_commands() -> Vec<String> {
    let mut commands = vec![
        format!("rm -f {DEVICE_TMP_DIR}/vts_driver_*"),
        format!("rm -f {DEVICE_TMP_DIR}/vts_agent_callback*"),
        format!("rm -f {PORT_FILE}"),
    ];
    for name in AGENT_BINARIES {
        for b in ["32", "64"] {
            commands.push(format!("killall {name}{b}"));
        }
    }
    commands
}

pub fn chmod_commands() -> Vec<String> {
    let mut commands = Vec::new();
    for binary in AGENT_BINARIES {
        for b in ["32", "64"] {
            commands.push(format!("chmod 755 {DEVICE_TMP_DIR}/{b}/{binary}{b}"));
        }
    }
    commands
}

/// Port number in the agent's port file, if it has been written
pub fn parse_port_file(raw: &[u8]) -> Option<u16> {
    String::from_utf8_lossy(raw)
        .trim()
        .parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
}

/// Agent state for one device. The process itself lives in the
/// [`ProcessSupervisor`] `Agent` slot.
#[derive(Debug, Default)]
pub struct AgentLifecycle {
    state: AgentState,
    bitness: Option<Bitness>,
    device_command_port: Option<u16>,
    attempts: Vec<LaunchAttempt>,
}

impl AgentLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Bitness of the running agent
    pub fn bitness(&self) -> Option<Bitness> {
        self.bitness
    }

    /// Device-side command port reported by the agent
    pub fn device_command_port(&self) -> Option<u16> {
        self.device_command_port
    }

    /// Launch attempts of the most recent start
    pub fn attempts(&self) -> &[LaunchAttempt] {
        &self.attempts
    }

    /// Start the agent and wait until it is ready. Returns the device
    /// command port.
    pub async fn start<B: CommandBridge>(
        &mut self,
        bridge: &B,
        supervisor: &mut ProcessSupervisor,
        log: &DeviceLog,
        timing: &TimingSettings,
    ) -> Result<u16> {
        let serial = bridge.serial().to_string();
        self.state = AgentState::Starting;
        self.attempts.clear();
        self.bitness = None;
        self.device_command_port = None;

        for command in cleanup_commands().iter().chain(chmod_commands().iter()) {
            if let Err(e) = bridge.run_shell(command).await {
                // killall fails when nothing is running; chmod when a bitness is absent
                debug!("{}: `{}` failed: {}", serial, command, e);
            }
        }

        let machine = match bridge.run_shell("uname -m").await {
            Ok(out) => String::from_utf8_lossy(&out).trim().to_string(),
            Err(e) => {
                self.state = AgentState::Failed;
                return Err(e);
            }
        };

        let mut last_log = String::new();
        for bitness in launch_strategies(&machine) {
            let spec = bridge.shell_process(&agent_command(bitness));
            let log_file = log.file(&agent_log_name(bitness));

            info!("{}: launching {} agent", serial, bitness);
            let outcome = match supervisor
                .start_named(ProcessSlot::Agent, &spec, &log_file, timing.health_check())
                .await
            {
                Ok(_) => LaunchOutcome::Running,
                Err(Error::EarlyExit { code, output, .. }) => {
                    warn!(
                        "{}: {} agent exited with {:?}:\n{}",
                        serial, bitness, code, output
                    );
                    last_log = output.clone();
                    LaunchOutcome::EarlyExit { code, output }
                }
                Err(Error::ProcessSpawn { reason, .. }) => {
                    warn!("{}: could not launch {} agent: {}", serial, bitness, reason);
                    last_log = reason.clone();
                    LaunchOutcome::SpawnFailed { reason }
                }
                Err(e) => {
                    self.state = AgentState::Failed;
                    return Err(e);
                }
            };

            let running = outcome == LaunchOutcome::Running;
            self.attempts.push(LaunchAttempt { bitness, outcome });
            if running {
                self.bitness = Some(bitness);
                break;
            }
        }

        if self.bitness.is_none() {
            self.state = AgentState::Failed;
            return Err(Error::AgentStartFailure {
                serial,
                attempts: self.attempts.len(),
                log: last_log,
            });
        }

        match self.wait_ready(bridge, supervisor, timing).await {
            Ok(port) => {
                info!("{}: agent ready on device port {}", serial, port);
                self.device_command_port = Some(port);
                self.state = AgentState::Ready;
                Ok(port)
            }
            Err(e) => {
                if let Err(stop_err) = supervisor.stop_named(ProcessSlot::Agent).await {
                    warn!("{}: stopping unready agent: {}", serial, stop_err);
                }
                self.bitness = None;
                self.state = AgentState::Failed;
                Err(e)
            }
        }
    }

    async fn wait_ready<B: CommandBridge>(
        &self,
        bridge: &B,
        supervisor: &ProcessSupervisor,
        timing: &TimingSettings,
    ) -> Result<u16> {
        let started = Instant::now();
        let read_port = format!("cat {PORT_FILE}");

        for attempt in 1..=timing.agent_ready_attempts {
            match bridge.run_shell(&read_port).await {
                Ok(out) => {
                    if let Some(port) = parse_port_file(&out) {
                        return Ok(port);
                    }
                }
                Err(e) => trace!("port file not readable yet: {}", e),
            }

            if !supervisor.is_running(ProcessSlot::Agent) {
                warn!("{}: agent exited while starting", bridge.serial());
                return Err(Error::AgentNotReady {
                    serial: bridge.serial().to_string(),
                    attempts: attempt,
                    elapsed: started.elapsed(),
                });
            }

            if attempt < timing.agent_ready_attempts {
                tokio::time::sleep(timing.agent_ready_interval()).await;
            }
        }

        Err(Error::AgentNotReady {
            serial: bridge.serial().to_string(),
            attempts: timing.agent_ready_attempts,
            elapsed: started.elapsed(),
        })
    }

    /// Stop the agent. The state is `NotStarted` afterwards even on error.
    pub async fn stop(&mut self, supervisor: &mut ProcessSupervisor) -> Result<()> {
        let result = supervisor.stop_named(ProcessSlot::Agent).await;
        self.state = AgentState::NotStarted;
        self.bitness = None;
        self.device_command_port = None;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devhost_bridge::test_utils::{crashing_spec, FakeBridge, FakeReply};
    use std::time::Duration;
    use tempfile::tempdir;

    fn fast_timing() -> TimingSettings {
        TimingSettings {
            health_check_ms: 200,
            stop_timeout_ms: 2000,
            agent_ready_attempts: 3,
            agent_ready_interval_ms: 20,
            ..Default::default()
        }
    }

    fn supervisor() -> ProcessSupervisor {
        ProcessSupervisor::new("A", Duration::from_secs(2))
    }

    #[test]
    fn test_launch_strategies() {
        assert_eq!(
            launch_strategies("aarch64"),
            vec![Bitness::Bits64, Bitness::Bits32]
        );
        assert_eq!(launch_strategies("x86_64"), vec![Bitness::Bits64, Bitness::Bits32]);
        assert_eq!(launch_strategies("armv7l"), vec![Bitness::Bits32]);
    }

    #[test]
    fn test_agent_command() {
        let cmd = agent_command(Bitness::Bits32);
        assert!(cmd.starts_with(
            "LD_LIBRARY_PATH=/data/local/tmp/32 /data/local/tmp/32/vts_hal_agent32 "
        ));
        assert!(cmd.ends_with("/data/local/tmp/64/vts_shell_driver64"));
        assert!(cmd.contains(" /data/local/tmp/spec "));
        assert_eq!(agent_log_name(Bitness::Bits64), "vts_agent_64.log");
    }

    #[test]
    fn test_cleanup_and_chmod_commands() {
        let cleanup = cleanup_commands();
        assert!(cleanup.contains(&"rm -f /data/local/tmp/vts_driver_*".to_string()));
        assert!(cleanup.contains(&"killall vts_hal_agent64".to_string()));
        assert!(cleanup.contains(&"killall vts_shell_driver32".to_string()));

        let chmod = chmod_commands();
        assert_eq!(chmod.len(), 6);
        assert!(chmod.contains(&"chmod 755 /data/local/tmp/64/vts_hal_driver64".to_string()));
    }

    #[test]
    fn test_parse_port_file() {
        assert_eq!(parse_port_file(b"5001\n"), Some(5001));
        assert_eq!(parse_port_file(b""), None);
        assert_eq!(
            parse_port_file(b"cat: /data/local/tmp/vts_tcp_server_port: No such file"),
            None
        );
        assert_eq!(parse_port_file(b"0"), None);
    }

    #[tokio::test]
    async fn test_start_64bit_ready() {
        let temp = tempdir().unwrap();
        let log = DeviceLog::new(temp.path(), "A");
        let bridge = FakeBridge::new("A");
        bridge.on_shell("uname -m", "aarch64\n");
        bridge.on_shell("cat /data/local/tmp/vts_tcp_server_port", "5001\n");

        let mut sup = supervisor();
        let mut agent = AgentLifecycle::new();
        let port = agent
            .start(&bridge, &mut sup, &log, &fast_timing())
            .await
            .unwrap();

        assert_eq!(port, 5001);
        assert_eq!(agent.state(), AgentState::Ready);
        assert_eq!(agent.bitness(), Some(Bitness::Bits64));
        assert_eq!(agent.attempts().len(), 1);
        assert!(sup.is_running(ProcessSlot::Agent));
        // Cleanup ran before launch
        assert!(bridge.shell_calls_matching("killall vts_hal_agent64") >= 1);
        assert!(bridge.shell_calls_matching("chmod 755") >= 6);

        agent.stop(&mut sup).await.unwrap();
        assert_eq!(agent.state(), AgentState::NotStarted);
        assert!(!sup.is_running(ProcessSlot::Agent));
    }

    #[tokio::test]
    async fn test_64bit_failure_falls_back_to_32bit() {
        let temp = tempdir().unwrap();
        let log = DeviceLog::new(temp.path(), "A");
        let bridge = FakeBridge::new("A");
        bridge.on_shell("uname -m", "aarch64\n");
        bridge.on_shell("cat /data/local/tmp/vts_tcp_server_port", "5002\n");
        bridge.on_shell_process("vts_hal_agent64", crashing_spec("no 64-bit linker"));

        let mut sup = supervisor();
        let mut agent = AgentLifecycle::new();
        agent
            .start(&bridge, &mut sup, &log, &fast_timing())
            .await
            .unwrap();

        assert_eq!(agent.state(), AgentState::Ready);
        assert_eq!(agent.bitness(), Some(Bitness::Bits32));
        let attempts = agent.attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].bitness, Bitness::Bits64);
        assert!(matches!(
            &attempts[0].outcome,
            LaunchOutcome::EarlyExit { output, .. } if output.contains("no 64-bit linker")
        ));
        assert_eq!(attempts[1].outcome, LaunchOutcome::Running);
        assert!(log.file("vts_agent_64.log").exists());

        agent.stop(&mut sup).await.unwrap();
    }

    #[tokio::test]
    async fn test_all_strategies_fail() {
        let temp = tempdir().unwrap();
        let log = DeviceLog::new(temp.path(), "A");
        let bridge = FakeBridge::new("A");
        bridge.on_shell("uname -m", "armv7l\n");
        bridge.on_shell_process("vts_hal_agent32", crashing_spec("missing spec dir"));

        let mut sup = supervisor();
        let mut agent = AgentLifecycle::new();
        let err = agent
            .start(&bridge, &mut sup, &log, &fast_timing())
            .await
            .unwrap_err();

        match err {
            Error::AgentStartFailure { attempts, log, .. } => {
                assert_eq!(attempts, 1);
                assert!(log.contains("missing spec dir"));
            }
            other => panic!("expected AgentStartFailure, got {other:?}"),
        }
        assert_eq!(agent.state(), AgentState::Failed);
        assert!(!sup.is_running(ProcessSlot::Agent));
    }

    #[tokio::test]
    async fn test_not_ready_stops_agent() {
        let temp = tempdir().unwrap();
        let log = DeviceLog::new(temp.path(), "A");
        let bridge = FakeBridge::new("A");
        bridge.on_shell("uname -m", "aarch64\n");
        bridge.on_shell_seq(
            "cat /data/local/tmp/vts_tcp_server_port",
            vec![FakeReply::Fail("No such file or directory".into())],
        );

        let mut sup = supervisor();
        let mut agent = AgentLifecycle::new();
        let err = agent
            .start(&bridge, &mut sup, &log, &fast_timing())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::AgentNotReady { attempts: 3, .. }));
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(agent.state(), AgentState::Failed);
        assert!(!sup.is_running(ProcessSlot::Agent));
        assert_eq!(
            bridge.shell_calls_matching("cat /data/local/tmp/vts_tcp_server_port"),
            3
        );
    }

    #[tokio::test]
    async fn test_cleanup_failures_are_not_fatal() {
        let temp = tempdir().unwrap();
        let log = DeviceLog::new(temp.path(), "A");
        let bridge = FakeBridge::new("A");
        bridge.fail_shell("killall", "no process found");
        bridge.fail_shell("chmod", "No such file");
        bridge.on_shell("uname -m", "armv8l\n");
        bridge.on_shell_seq(
            "cat /data/local/tmp/vts_tcp_server_port",
            vec![
                FakeReply::Output(String::new()),
                FakeReply::Output("5003".into()),
            ],
        );

        let mut sup = supervisor();
        let mut agent = AgentLifecycle::new();
        let port = agent
            .start(&bridge, &mut sup, &log, &fast_timing())
            .await
            .unwrap();
        assert_eq!(port, 5003);
        agent.stop(&mut sup).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let mut sup = supervisor();
        let mut agent = AgentLifecycle::new();
        agent.stop(&mut sup).await.unwrap();
        assert_eq!(agent.state(), AgentState::NotStarted);
    }
}
