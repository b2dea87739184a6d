//! Tool availability checking for device management
//!
//! Locates the `adb` and `fastboot` executables from the Android SDK
//! platform-tools, either on `PATH` or under the SDK environment variables.

use std::path::PathBuf;

use devhost_core::prelude::*;

/// Resolved paths of the bridge executables
#[derive(Debug, Clone, Default)]
pub struct ToolPaths {
    /// Path to `adb` if found
    pub adb: Option<PathBuf>,

    /// Path to `fastboot` if found
    pub fastboot: Option<PathBuf>,
}

impl ToolPaths {
    /// Check tool availability (run once at startup)
    pub fn detect() -> Self {
        let adb = Self::locate("adb");
        let fastboot = Self::locate("fastboot");

        match &adb {
            Some(path) => debug!("adb found at {}", path.display()),
            None => warn!("adb not found on PATH or in the Android SDK"),
        }
        if fastboot.is_none() {
            debug!("fastboot not found; bootloader-mode detection disabled");
        }

        Self { adb, fastboot }
    }

    /// Path to `adb`, or [`Error::ToolNotFound`]
    pub fn adb(&self) -> Result<PathBuf> {
        self.adb
            .clone()
            .ok_or(Error::ToolNotFound { tool: "adb" })
    }

    /// Path to `fastboot`, or [`Error::ToolNotFound`]
    pub fn fastboot(&self) -> Result<PathBuf> {
        self.fastboot
            .clone()
            .ok_or(Error::ToolNotFound { tool: "fastboot" })
    }

    fn locate(tool: &str) -> Option<PathBuf> {
        if let Ok(path) = which::which(tool) {
            return Some(path);
        }

        Self::sdk_candidates(tool)
            .into_iter()
            .find(|candidate| candidate.is_file())
    }

    /// SDK locations to try when `tool` is not on PATH
    fn sdk_candidates(tool: &str) -> Vec<PathBuf> {
        let mut paths = Vec::new();

        for var in ["ANDROID_HOME", "ANDROID_SDK_ROOT"] {
            if let Ok(root) = std::env::var(var) {
                paths.push(PathBuf::from(root).join("platform-tools").join(tool));
            }
        }

        paths
    }

    /// Get user-friendly message for an unavailable adb
    pub fn adb_unavailable_message(&self) -> Option<&'static str> {
        if self.adb.is_some() {
            None
        } else {
            Some("adb not found. Install Android platform-tools or set ANDROID_HOME.")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_tool_paths_default() {
        let tools = ToolPaths::default();
        assert!(tools.adb.is_none());
        assert!(tools.fastboot.is_none());
        assert!(matches!(
            tools.adb(),
            Err(Error::ToolNotFound { tool: "adb" })
        ));
    }

    #[test]
    #[serial]
    fn test_sdk_candidates_include_android_home() {
        std::env::set_var("ANDROID_HOME", "/test/android");
        let paths = ToolPaths::sdk_candidates("adb");
        assert!(paths.contains(&PathBuf::from("/test/android/platform-tools/adb")));
        std::env::remove_var("ANDROID_HOME");
    }

    #[test]
    #[serial]
    fn test_sdk_candidates_include_sdk_root() {
        std::env::set_var("ANDROID_SDK_ROOT", "/test/sdk");
        let paths = ToolPaths::sdk_candidates("fastboot");
        assert!(paths.contains(&PathBuf::from("/test/sdk/platform-tools/fastboot")));
        std::env::remove_var("ANDROID_SDK_ROOT");
    }

    #[test]
    fn test_adb_unavailable_message() {
        let tools = ToolPaths::default();
        assert!(tools.adb_unavailable_message().is_some());

        let tools = ToolPaths {
            adb: Some(PathBuf::from("/usr/bin/adb")),
            fastboot: None,
        };
        assert!(tools.adb_unavailable_message().is_none());
    }
}
