//! Configuration types for devhost
//!
//! Defines:
//! - `Settings` - Contents of `devhost.toml`
//! - `DeviceSelection` - Which devices to manage
//! - `DeviceConfig` - Per-device service options
//! - `TimingSettings` - Timeouts and retry policies

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Selects every attached adb device
pub const PICK_ALL_TOKEN: &str = "*";

/// Product type used when a device config does not name one
pub const PRODUCT_TYPE_UNKNOWN: &str = "unknown";

/// Application settings (`devhost.toml`)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Base directory for host and device logs
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    #[serde(default)]
    pub devices: DeviceSelection,

    #[serde(default)]
    pub timing: TimingSettings,
}

/// `devices = "*"`, `devices = ["A", "B"]` or `[[devices]]` tables
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum DeviceSelection {
    Token(String),
    Serials(Vec<String>),
    Configs(Vec<DeviceConfig>),
}

impl Default for DeviceSelection {
    fn default() -> Self {
        DeviceSelection::Serials(Vec::new())
    }
}

/// Options for one device.
///
/// Unknown keys are rejected at load time.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub serial: String,

    /// Product type (e.g., "bullhead")
    #[serde(default = "default_product_type")]
    pub product_type: String,

    /// Start the on-device agent and its command channel
    #[serde(default = "default_true")]
    pub enable_agent: bool,

    /// Open a session to the scripting service
    #[serde(default)]
    pub enable_scripting: bool,

    /// Attach an event dispatcher to the first scripting session
    #[serde(default)]
    pub enable_scripting_events: bool,

    /// Extra `logcat` arguments
    #[serde(default = "default_logcat_param")]
    pub logcat_param: String,

    /// Device port the agent connects back to
    #[serde(default = "default_callback_port")]
    pub device_callback_port: u16,
}

impl DeviceConfig {
    /// Defaults for `serial`
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            product_type: default_product_type(),
            enable_agent: true,
            enable_scripting: false,
            enable_scripting_events: false,
            logcat_param: default_logcat_param(),
            device_callback_port: default_callback_port(),
        }
    }
}

fn default_product_type() -> String {
    PRODUCT_TYPE_UNKNOWN.to_string()
}

fn default_true() -> bool {
    true
}

fn default_logcat_param() -> String {
    "-b all".to_string()
}

fn default_callback_port() -> u16 {
    5010
}

/// Timeouts and retry policies
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TimingSettings {
    /// Grace period a standing process must survive after launch
    #[serde(default = "default_health_check_ms")]
    pub health_check_ms: u64,

    /// Time a standing process gets to exit after SIGTERM (and again after kill)
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    #[serde(default = "default_agent_ready_attempts")]
    pub agent_ready_attempts: u32,

    #[serde(default = "default_agent_ready_interval_ms")]
    pub agent_ready_interval_ms: u64,

    /// Overall bound on waiting for `sys.boot_completed`
    #[serde(default = "default_boot_timeout_secs")]
    pub boot_timeout_secs: u64,

    #[serde(default = "default_boot_poll_ms")]
    pub boot_poll_ms: u64,

    /// Connection attempts after launching the scripting service
    #[serde(default = "default_scripting_connect_attempts")]
    pub scripting_connect_attempts: u32,

    #[serde(default = "default_scripting_connect_interval_ms")]
    pub scripting_connect_interval_ms: u64,

    /// Milliseconds each `eventWait` call blocks on the device
    #[serde(default = "default_event_poll_ms")]
    pub event_poll_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            health_check_ms: default_health_check_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            agent_ready_attempts: default_agent_ready_attempts(),
            agent_ready_interval_ms: default_agent_ready_interval_ms(),
            boot_timeout_secs: default_boot_timeout_secs(),
            boot_poll_ms: default_boot_poll_ms(),
            scripting_connect_attempts: default_scripting_connect_attempts(),
            scripting_connect_interval_ms: default_scripting_connect_interval_ms(),
            event_poll_ms: default_event_poll_ms(),
        }
    }
}

impl TimingSettings {
    pub fn health_check(&self) -> Duration {
        Duration::from_millis(self.health_check_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn agent_ready_interval(&self) -> Duration {
        Duration::from_millis(self.agent_ready_interval_ms)
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_secs)
    }

    pub fn boot_poll(&self) -> Duration {
        Duration::from_millis(self.boot_poll_ms)
    }

    pub fn scripting_connect_interval(&self) -> Duration {
        Duration::from_millis(self.scripting_connect_interval_ms)
    }
}

fn default_health_check_ms() -> u64 {
    1000
}

fn default_stop_timeout_ms() -> u64 {
    5000
}

fn default_agent_ready_attempts() -> u32 {
    10
}

fn default_agent_ready_interval_ms() -> u64 {
    1000
}

fn default_boot_timeout_secs() -> u64 {
    15 * 60
}

fn default_boot_poll_ms() -> u64 {
    5000
}

fn default_scripting_connect_attempts() -> u32 {
    5
}

fn default_scripting_connect_interval_ms() -> u64 {
    1000
}

fn default_event_poll_ms() -> u64 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_config_defaults() {
        let config: DeviceConfig = toml::from_str(r#"serial = "HT01""#).unwrap();
        assert_eq!(config, DeviceConfig::new("HT01"));
        assert!(config.enable_agent);
        assert!(!config.enable_scripting);
        assert_eq!(config.logcat_param, "-b all");
        assert_eq!(config.device_callback_port, 5010);
        assert_eq!(config.product_type, "unknown");
    }

    #[test]
    fn test_device_config_rejects_unknown_keys() {
        let result: Result<DeviceConfig, _> =
            toml::from_str("serial = \"HT01\"\nenable_sl4a = true\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_device_config_requires_serial() {
        let result: Result<DeviceConfig, _> = toml::from_str("enable_agent = false\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_timing_defaults() {
        let timing = TimingSettings::default();
        assert_eq!(timing.boot_timeout(), Duration::from_secs(900));
        assert_eq!(timing.boot_poll(), Duration::from_secs(5));
        assert_eq!(timing.agent_ready_attempts, 10);
        assert_eq!(timing.agent_ready_interval(), Duration::from_secs(1));
        assert_eq!(timing.health_check(), Duration::from_secs(1));
    }
}
