//! Core domain types for device sessions

use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical purpose of a forwarded host port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortRole {
    /// Host → agent command/response channel
    Command,
    /// Agent → host callback channel (reverse forward)
    Callback,
    /// Host → scripting service channel
    Scripting,
}

impl PortRole {
    /// Forwarding direction the bridge must set up for this role
    pub fn direction(&self) -> ForwardDirection {
        match self {
            PortRole::Callback => ForwardDirection::Reverse,
            PortRole::Command | PortRole::Scripting => ForwardDirection::Forward,
        }
    }
}

impl fmt::Display for PortRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortRole::Command => write!(f, "command"),
            PortRole::Callback => write!(f, "callback"),
            PortRole::Scripting => write!(f, "scripting"),
        }
    }
}

/// Direction of a port forwarding rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForwardDirection {
    /// host port → device port (`adb forward`)
    Forward,
    /// device port → host port (`adb reverse`)
    Reverse,
}

/// Named slot a standing process occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProcessSlot {
    LogCapture,
    Agent,
}

impl fmt::Display for ProcessSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessSlot::LogCapture => write!(f, "logcat"),
            ProcessSlot::Agent => write!(f, "agent"),
        }
    }
}

/// Lifecycle state of the on-device agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AgentState {
    #[default]
    NotStarted,
    Starting,
    Ready,
    Failed,
}

impl AgentState {
    pub fn is_ready(&self) -> bool {
        matches!(self, AgentState::Ready)
    }
}

/// Binary width of the agent executable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bitness {
    Bits64,
    Bits32,
}

impl Bitness {
    /// Suffix used in agent/driver binary names and directories
    pub fn suffix(&self) -> &'static str {
        match self {
            Bitness::Bits64 => "64",
            Bitness::Bits32 => "32",
        }
    }
}

impl fmt::Display for Bitness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-bit", self.suffix())
    }
}

/// Identifier the scripting service assigns to a session
pub type ScriptSessionId = u32;

/// Structured key for a scripting session: device plus service-assigned id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub serial: String,
    pub session_id: ScriptSessionId,
}

impl SessionKey {
    pub fn new(serial: impl Into<String>, session_id: ScriptSessionId) -> Self {
        Self {
            serial: serial.into(),
            session_id,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.serial, self.session_id)
    }
}

/// Which services are up on a device; used to restore them after reboot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActiveServices {
    pub log_capture: bool,
    pub agent: bool,
    pub scripting: bool,
}

impl ActiveServices {
    pub fn any(&self) -> bool {
        self.log_capture || self.agent || self.scripting
    }
}

/// Outcome of one device's share of a bulk operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkOperationResult {
    pub device_id: String,
    pub succeeded: bool,
    pub error: Option<String>,
}

impl BulkOperationResult {
    pub fn success(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            succeeded: true,
            error: None,
        }
    }

    pub fn failure(device_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            succeeded: false,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_role_direction() {
        assert_eq!(PortRole::Command.direction(), ForwardDirection::Forward);
        assert_eq!(PortRole::Scripting.direction(), ForwardDirection::Forward);
        assert_eq!(PortRole::Callback.direction(), ForwardDirection::Reverse);
    }

    #[test]
    fn test_session_key_ordering_is_structural() {
        // "ab" + 12 and "a" + 212 would collide as concatenated strings
        let a = SessionKey::new("ab", 12);
        let b = SessionKey::new("a", 212);
        assert_ne!(a, b);
        assert!(b < a);
    }

    #[test]
    fn test_bulk_result_constructors() {
        let ok = BulkOperationResult::success("abc");
        assert!(ok.succeeded);
        assert!(ok.error.is_none());

        let err = BulkOperationResult::failure("def", "adb died");
        assert!(!err.succeeded);
        assert_eq!(err.error.as_deref(), Some("adb died"));
    }

    #[test]
    fn test_active_services_any() {
        assert!(!ActiveServices::default().any());
        assert!(ActiveServices {
            agent: true,
            ..Default::default()
        }
        .any());
    }
}
