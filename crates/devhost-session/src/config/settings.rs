//! Settings parser for `devhost.toml`

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use devhost_core::logging::default_log_directory;
use devhost_core::prelude::*;

use super::types::{DeviceConfig, DeviceSelection, Settings, PICK_ALL_TOKEN};

/// Default config file name looked up in the working directory
pub const CONFIG_FILENAME: &str = "devhost.toml";

const EMPTY_CONFIG_MSG: &str = "Configuration is empty, abort!";

/// Load and parse the settings file at `path`.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Err(Error::ConfigNotFound {
            path: path.to_path_buf(),
        });
    }

    let content = std::fs::read_to_string(path)?;
    let settings = parse_settings(&content, path)?;
    debug!("Loaded settings from {:?}", path);
    Ok(settings)
}

/// Parse settings text; `path` is only used in error messages
pub fn parse_settings(content: &str, path: &Path) -> Result<Settings> {
    toml::from_str(content).map_err(|e| Error::ConfigInvalid {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

impl Settings {
    /// Log directory from the config, or the platform default
    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(default_log_directory)
    }

    /// Turn the device selection into one config per device.
    ///
    /// `attached` is the set of serials adb currently reports. Every selected
    /// serial must be attached.
    pub fn resolve_devices(&self, attached: &BTreeSet<String>) -> Result<Vec<DeviceConfig>> {
        let configs = match &self.devices {
            DeviceSelection::Token(token) if token == PICK_ALL_TOKEN => {
                return Ok(attached.iter().map(DeviceConfig::new).collect());
            }
            DeviceSelection::Token(token) => {
                return Err(Error::config(format!(
                    "devices must be \"{PICK_ALL_TOKEN}\" or a list, got {token:?}"
                )));
            }
            DeviceSelection::Serials(serials) => {
                serials.iter().map(DeviceConfig::new).collect::<Vec<_>>()
            }
            DeviceSelection::Configs(configs) => configs.clone(),
        };

        if configs.is_empty() {
            return Err(Error::config(EMPTY_CONFIG_MSG));
        }

        let mut seen = HashSet::new();
        for config in &configs {
            if config.serial.trim().is_empty() {
                return Err(Error::config("device serial must not be empty"));
            }
            if !seen.insert(config.serial.as_str()) {
                return Err(Error::config(format!(
                    "device {} is listed more than once",
                    config.serial
                )));
            }
            if !attached.contains(&config.serial) {
                return Err(Error::DeviceNotAttached {
                    serial: config.serial.clone(),
                });
            }
        }

        Ok(configs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn attached(serials: &[&str]) -> BTreeSet<String> {
        serials.iter().map(|s| s.to_string()).collect()
    }

    fn parse(content: &str) -> Result<Settings> {
        parse_settings(content, Path::new("devhost.toml"))
    }

    #[test]
    fn test_load_missing_file() {
        let temp = tempdir().unwrap();
        let result = load_settings(&temp.path().join("devhost.toml"));
        assert!(matches!(result, Err(Error::ConfigNotFound { .. })));
    }

    #[test]
    fn test_load_full_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("devhost.toml");
        std::fs::write(
            &path,
            r#"
log_dir = "/tmp/devhost-logs"

[[devices]]
serial = "HT01"
product_type = "bullhead"
enable_scripting = true
enable_scripting_events = true

[[devices]]
serial = "HT02"
enable_agent = false
logcat_param = "-b main"

[timing]
boot_timeout_secs = 60
"#,
        )
        .unwrap();

        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.log_dir(), PathBuf::from("/tmp/devhost-logs"));
        assert_eq!(settings.timing.boot_timeout_secs, 60);
        assert_eq!(settings.timing.agent_ready_attempts, 10);

        let configs = settings
            .resolve_devices(&attached(&["HT01", "HT02"]))
            .unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].product_type, "bullhead");
        assert!(configs[0].enable_scripting_events);
        assert!(!configs[1].enable_agent);
        assert_eq!(configs[1].logcat_param, "-b main");
    }

    #[test]
    fn test_pick_all_token() {
        let settings = parse(r#"devices = "*""#).unwrap();
        let configs = settings.resolve_devices(&attached(&["B", "A"])).unwrap();
        let serials: Vec<_> = configs.iter().map(|c| c.serial.as_str()).collect();
        assert_eq!(serials, vec!["A", "B"]);
    }

    #[test]
    fn test_serial_list() {
        let settings = parse(r#"devices = ["A"]"#).unwrap();
        let configs = settings.resolve_devices(&attached(&["A", "B"])).unwrap();
        assert_eq!(configs, vec![DeviceConfig::new("A")]);
    }

    #[test]
    fn test_empty_selection_is_error() {
        let settings = parse("").unwrap();
        let err = settings.resolve_devices(&attached(&["A"])).unwrap_err();
        assert!(err.to_string().contains("Configuration is empty"));

        let settings = parse("devices = []").unwrap();
        assert!(settings.resolve_devices(&attached(&["A"])).is_err());
    }

    #[test]
    fn test_unattached_device_is_error() {
        let settings = parse(r#"devices = ["A", "Z"]"#).unwrap();
        let err = settings.resolve_devices(&attached(&["A"])).unwrap_err();
        assert!(matches!(err, Error::DeviceNotAttached { ref serial } if serial == "Z"));
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_bad_token_and_duplicates() {
        let settings = parse(r#"devices = "all""#).unwrap();
        assert!(settings.resolve_devices(&attached(&["A"])).is_err());

        let settings = parse(r#"devices = ["A", "A"]"#).unwrap();
        assert!(settings.resolve_devices(&attached(&["A"])).is_err());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(matches!(
            parse("log_path = \"/tmp\""),
            Err(Error::ConfigInvalid { .. })
        ));
        assert!(parse("[timing]\nboot_timeout = 5\n").is_err());
        assert!(parse("[[devices]]\nserial = \"A\"\nlabel = \"x\"\n").is_err());
    }
}
