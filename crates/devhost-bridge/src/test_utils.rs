//! In-memory fakes for the bridge capabilities
//!
//! Available to this crate's tests and, through the `test-helpers` feature,
//! to the session crate and integration tests. Every fake is a cheap clone
//! over shared state, so a test can hand one copy to the code under test and
//! inspect the recorded calls through another.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;

use devhost_core::prelude::*;
use devhost_core::ScriptSessionId;

use crate::bridge::{BootloaderBridge, CommandBridge};
use crate::process::ProcessSpec;
use crate::scripting::{Handshake, RpcConnection, ScriptingConnector, EVENT_WAIT_METHOD};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A standing process that stays up until stopped
pub fn long_running_spec() -> ProcessSpec {
    ProcessSpec::new("sh").arg("-c").arg("sleep 30")
}

/// A standing process that fails immediately, printing `message`
pub fn crashing_spec(message: &str) -> ProcessSpec {
    ProcessSpec::new("sh")
        .arg("-c")
        .arg(format!("echo '{message}'; exit 1"))
}

/// Canned outcome of a fake shell command
#[derive(Debug, Clone)]
pub enum FakeReply {
    Output(String),
    Fail(String),
}

struct ShellRule {
    needle: String,
    replies: VecDeque<FakeReply>,
}

#[derive(Default)]
struct FakeBridgeState {
    rules: Vec<ShellRule>,
    process_rules: Vec<(String, ProcessSpec)>,
    logcat_spec: Option<ProcessSpec>,
    shell_calls: Vec<String>,
    process_commands: Vec<String>,
    forwards: BTreeMap<u16, u16>,
    reverses: BTreeMap<u16, u16>,
    fail_forward: bool,
    attached: BTreeSet<String>,
    reboots: usize,
    roots: usize,
    bugreport_delay: Duration,
    bugreport_failure: Option<String>,
}

/// Scriptable [`CommandBridge`]
#[derive(Clone)]
pub struct FakeBridge {
    serial: String,
    state: Arc<Mutex<FakeBridgeState>>,
}

impl FakeBridge {
    /// A fake for `serial`, which is reported as attached
    pub fn new(serial: &str) -> Self {
        let state = FakeBridgeState {
            attached: BTreeSet::from([serial.to_string()]),
            ..Default::default()
        };
        Self {
            serial: serial.to_string(),
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Reply `output` to every shell command containing `needle`
    pub fn on_shell(&self, needle: &str, output: &str) -> &Self {
        self.on_shell_seq(needle, vec![FakeReply::Output(output.to_string())])
    }

    /// Fail every shell command containing `needle`
    pub fn fail_shell(&self, needle: &str, stderr: &str) -> &Self {
        self.on_shell_seq(needle, vec![FakeReply::Fail(stderr.to_string())])
    }

    /// Reply with `replies` in order; the last one repeats.
    ///
    /// Later rules take precedence over earlier ones for the same command.
    pub fn on_shell_seq(&self, needle: &str, replies: Vec<FakeReply>) -> &Self {
        lock(&self.state).rules.push(ShellRule {
            needle: needle.to_string(),
            replies: replies.into(),
        });
        self
    }

    /// Standing shell processes whose command contains `needle` run `spec`
    pub fn on_shell_process(&self, needle: &str, spec: ProcessSpec) -> &Self {
        lock(&self.state)
            .process_rules
            .push((needle.to_string(), spec));
        self
    }

    pub fn set_logcat_process(&self, spec: ProcessSpec) -> &Self {
        lock(&self.state).logcat_spec = Some(spec);
        self
    }

    pub fn set_attached<I: IntoIterator<Item = String>>(&self, serials: I) -> &Self {
        lock(&self.state).attached = serials.into_iter().collect();
        self
    }

    pub fn set_fail_forward(&self, fail: bool) -> &Self {
        lock(&self.state).fail_forward = fail;
        self
    }

    pub fn set_bugreport_delay(&self, delay: Duration) -> &Self {
        lock(&self.state).bugreport_delay = delay;
        self
    }

    pub fn fail_bugreport(&self, stderr: &str) -> &Self {
        lock(&self.state).bugreport_failure = Some(stderr.to_string());
        self
    }

    /// Every shell command run so far, in order
    pub fn shell_calls(&self) -> Vec<String> {
        lock(&self.state).shell_calls.clone()
    }

    pub fn shell_calls_matching(&self, needle: &str) -> usize {
        lock(&self.state)
            .shell_calls
            .iter()
            .filter(|c| c.contains(needle))
            .count()
    }

    /// Commands passed to [`CommandBridge::shell_process`]
    pub fn process_commands(&self) -> Vec<String> {
        lock(&self.state).process_commands.clone()
    }

    /// Active forwards, host port → device port
    pub fn forwards(&self) -> BTreeMap<u16, u16> {
        lock(&self.state).forwards.clone()
    }

    /// Active reverse forwards, device port → host port
    pub fn reverses(&self) -> BTreeMap<u16, u16> {
        lock(&self.state).reverses.clone()
    }

    pub fn reboots(&self) -> usize {
        lock(&self.state).reboots
    }

    pub fn roots(&self) -> usize {
        lock(&self.state).roots
    }

    fn command_error(&self, command: &str, stderr: &str) -> Error {
        Error::bridge(format!("adb -s {} {}", self.serial, command), Some(1), stderr)
    }
}

impl CommandBridge for FakeBridge {
    fn serial(&self) -> &str {
        &self.serial
    }

    async fn run_shell(&self, command: &str) -> Result<Vec<u8>> {
        let reply = {
            let mut state = lock(&self.state);
            state.shell_calls.push(command.to_string());
            state
                .rules
                .iter_mut()
                .rev()
                .find(|rule| command.contains(&rule.needle))
                .and_then(|rule| {
                    if rule.replies.len() > 1 {
                        rule.replies.pop_front()
                    } else {
                        rule.replies.front().cloned()
                    }
                })
        };

        match reply {
            Some(FakeReply::Output(out)) => Ok(out.into_bytes()),
            Some(FakeReply::Fail(stderr)) => {
                Err(self.command_error(&format!("shell {command}"), &stderr))
            }
            None => Ok(Vec::new()),
        }
    }

    async fn forward(&self, host_port: u16, device_port: u16) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_forward {
            return Err(self.command_error("forward", "cannot bind listener"));
        }
        state.forwards.insert(host_port, device_port);
        Ok(())
    }

    async fn reverse_forward(&self, device_port: u16, host_port: u16) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_forward {
            return Err(self.command_error("reverse", "cannot bind listener"));
        }
        state.reverses.insert(device_port, host_port);
        Ok(())
    }

    async fn remove_forward(&self, host_port: u16) -> Result<()> {
        lock(&self.state).forwards.remove(&host_port);
        Ok(())
    }

    async fn remove_reverse(&self, device_port: u16) -> Result<()> {
        lock(&self.state).reverses.remove(&device_port);
        Ok(())
    }

    async fn list_device_ids(&self) -> Result<BTreeSet<String>> {
        Ok(lock(&self.state).attached.clone())
    }

    async fn root(&self) -> Result<()> {
        lock(&self.state).roots += 1;
        Ok(())
    }

    async fn remount(&self) -> Result<()> {
        Ok(())
    }

    async fn wait_for_device(&self) -> Result<()> {
        Ok(())
    }

    async fn reboot(&self) -> Result<()> {
        let mut state = lock(&self.state);
        state.reboots += 1;
        state.forwards.clear();
        state.reverses.clear();
        Ok(())
    }

    async fn bugreport(&self, dest: &Path) -> Result<()> {
        let (delay, failure) = {
            let state = lock(&self.state);
            (state.bugreport_delay, state.bugreport_failure.clone())
        };
        tokio::time::sleep(delay).await;

        if let Some(stderr) = failure {
            return Err(self.command_error("bugreport", &stderr));
        }
        tokio::fs::write(dest, format!("bugreport of {}\n", self.serial)).await?;
        Ok(())
    }

    fn logcat_process(&self, _params: &str) -> ProcessSpec {
        lock(&self.state)
            .logcat_spec
            .clone()
            .unwrap_or_else(long_running_spec)
    }

    fn shell_process(&self, command: &str) -> ProcessSpec {
        let mut state = lock(&self.state);
        state.process_commands.push(command.to_string());
        state
            .process_rules
            .iter()
            .rev()
            .find(|(needle, _)| command.contains(needle))
            .map(|(_, spec)| spec.clone())
            .unwrap_or_else(long_running_spec)
    }
}

#[derive(Default)]
struct FakeBootloaderState {
    devices: BTreeSet<String>,
    vars: HashMap<String, String>,
    reboots: usize,
}

/// Scriptable [`BootloaderBridge`]
#[derive(Clone, Default)]
pub struct FakeBootloader {
    state: Arc<Mutex<FakeBootloaderState>>,
}

impl FakeBootloader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `serial` as being in bootloader mode
    pub fn add_device(&self, serial: &str) -> &Self {
        lock(&self.state).devices.insert(serial.to_string());
        self
    }

    pub fn set_var(&self, name: &str, output: &str) -> &Self {
        lock(&self.state)
            .vars
            .insert(name.to_string(), output.to_string());
        self
    }

    pub fn reboots(&self) -> usize {
        lock(&self.state).reboots
    }
}

impl BootloaderBridge for FakeBootloader {
    async fn list_device_ids(&self) -> Result<BTreeSet<String>> {
        Ok(lock(&self.state).devices.clone())
    }

    async fn get_var(&self, name: &str) -> Result<Vec<u8>> {
        Ok(lock(&self.state)
            .vars
            .get(name)
            .cloned()
            .unwrap_or_default()
            .into_bytes())
    }

    async fn reboot(&self) -> Result<()> {
        lock(&self.state).reboots += 1;
        Ok(())
    }
}

#[derive(Default)]
struct FakeServiceState {
    next_uids: VecDeque<ScriptSessionId>,
    uid_counter: ScriptSessionId,
    refuse_connects: usize,
    handshakes: Vec<(u16, Handshake)>,
    calls: Vec<(ScriptSessionId, String)>,
    replies: HashMap<String, Value>,
    events: VecDeque<Value>,
    closed_connections: usize,
}

/// In-memory scripting service implementing [`ScriptingConnector`]
#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<FakeServiceState>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session ids to hand out for the next `initiate` handshakes
    pub fn queue_session_ids<I: IntoIterator<Item = ScriptSessionId>>(&self, ids: I) -> &Self {
        lock(&self.state).next_uids.extend(ids);
        self
    }

    /// Refuse the next `count` connection attempts
    pub fn refuse_connects(&self, count: usize) -> &Self {
        lock(&self.state).refuse_connects = count;
        self
    }

    pub fn on_call(&self, method: &str, result: Value) -> &Self {
        lock(&self.state)
            .replies
            .insert(method.to_string(), result);
        self
    }

    /// Deliver an event to the next `eventWait` call
    pub fn push_event(&self, name: &str, data: Value) -> &Self {
        lock(&self.state)
            .events
            .push_back(serde_json::json!({ "name": name, "time": 0, "data": data }));
        self
    }

    /// Successful and refused handshakes, in order
    pub fn handshakes(&self) -> Vec<(u16, Handshake)> {
        lock(&self.state).handshakes.clone()
    }

    pub fn continue_handshakes(&self) -> usize {
        lock(&self.state)
            .handshakes
            .iter()
            .filter(|(_, h)| matches!(h, Handshake::Continue(_)))
            .count()
    }

    pub fn calls(&self) -> Vec<(ScriptSessionId, String)> {
        lock(&self.state).calls.clone()
    }

    pub fn closed_connections(&self) -> usize {
        lock(&self.state).closed_connections
    }
}

impl ScriptingConnector for FakeConnector {
    type Connection = FakeConnection;

    async fn connect(&self, host_port: u16, handshake: Handshake) -> Result<FakeConnection> {
        let mut state = lock(&self.state);
        state.handshakes.push((host_port, handshake));

        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }

        let session_id = match handshake {
            Handshake::Continue(id) => id,
            Handshake::Initiate => match state.next_uids.pop_front() {
                Some(id) => id,
                None => {
                    state.uid_counter += 1;
                    state.uid_counter
                }
            },
        };

        Ok(FakeConnection {
            session_id,
            service: Arc::clone(&self.state),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// Connection handed out by [`FakeConnector`]
#[derive(Clone)]
pub struct FakeConnection {
    session_id: ScriptSessionId,
    service: Arc<Mutex<FakeServiceState>>,
    closed: Arc<AtomicBool>,
}

impl FakeConnection {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl RpcConnection for FakeConnection {
    fn session_id(&self) -> ScriptSessionId {
        self.session_id
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }

        let reply = {
            let mut state = lock(&self.service);
            state.calls.push((self.session_id, method.to_string()));
            if method == EVENT_WAIT_METHOD {
                state.events.pop_front()
            } else {
                Some(state.replies.get(method).cloned().unwrap_or(Value::Null))
            }
        };

        match reply {
            Some(value) => Ok(value),
            None => {
                // No event pending: block briefly like the real service
                let poll_ms = params.first().and_then(Value::as_u64).unwrap_or(10);
                tokio::time::sleep(Duration::from_millis(poll_ms.min(10))).await;
                Ok(Value::Null)
            }
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            lock(&self.service).closed_connections += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_bridge_rules() {
        let bridge = FakeBridge::new("A");
        bridge.on_shell("getprop", "x");
        bridge.on_shell_seq(
            "getprop sys.boot_completed",
            vec![FakeReply::Fail("closed".into()), FakeReply::Output("1".into())],
        );

        assert_eq!(bridge.run_shell("getprop ro.x").await.unwrap(), b"x");
        assert!(bridge.run_shell("getprop sys.boot_completed").await.is_err());
        assert_eq!(
            bridge.run_shell("getprop sys.boot_completed").await.unwrap(),
            b"1"
        );
        assert_eq!(
            bridge.run_shell("getprop sys.boot_completed").await.unwrap(),
            b"1"
        );
        assert!(bridge.run_shell("id -u").await.unwrap().is_empty());
        assert_eq!(bridge.shell_calls_matching("boot_completed"), 3);
    }

    #[tokio::test]
    async fn test_fake_connector_session_ids() {
        let connector = FakeConnector::new();
        connector.queue_session_ids([4, 4]);
        connector.refuse_connects(1);

        assert!(connector.connect(1, Handshake::Initiate).await.is_err());
        let a = connector.connect(1, Handshake::Initiate).await.unwrap();
        let b = connector.connect(1, Handshake::Initiate).await.unwrap();
        let c = connector.connect(1, Handshake::Initiate).await.unwrap();
        assert_eq!((a.session_id(), b.session_id()), (4, 4));
        assert_eq!(c.session_id(), 1);

        a.close().await;
        a.close().await;
        assert_eq!(connector.closed_connections(), 1);
        assert!(a.call("x", vec![]).await.is_err());
    }
}
