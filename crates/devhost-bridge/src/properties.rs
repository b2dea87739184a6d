//! Parsers that turn raw shell output into typed device properties

use std::sync::LazyLock;

use regex::Regex;

use devhost_core::prelude::*;

/// `MemTotal:        3771952 kB`
static MEM_TOTAL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)MemTotal:\s*(\d+)\s*([a-z]+)").expect("valid regex"));

/// Build product name reported by the one device family whose
/// `ro.product.name` is not the code name
const SPROUT_PRODUCT: &str = "sprout";

const LIB_PATHS_32: [&str; 2] = ["/system/lib", "/vendor/lib"];
const LIB_PATHS_64: [&str; 2] = ["/system/lib64", "/vendor/lib64"];

/// Decode shell output as a trimmed UTF-8 string
pub fn shell_text(output: &[u8]) -> String {
    String::from_utf8_lossy(output).trim().to_string()
}

/// Parse the `MemTotal` line of `/proc/meminfo` into bytes.
///
/// Returns `None` (and logs) when the line or its unit is not recognized.
pub fn parse_total_memory(output: &str) -> Option<u64> {
    let Some(caps) = MEM_TOTAL_REGEX.captures(output) else {
        error!("Cannot get memory information: {:?}", output);
        return None;
    };

    let value: u64 = caps[1].parse().ok()?;
    let multiplier = match caps[2].to_lowercase().as_str() {
        "kb" => 1024,
        "mb" => 1024 * 1024,
        "b" => 1,
        unit => {
            error!("Unrecognized total memory unit: {}", unit);
            return None;
        }
    };

    value.checked_mul(multiplier)
}

/// Extract the product name from `fastboot getvar product` output.
///
/// fastboot prints `product: bullhead` followed by a timing line; the value
/// is the second whitespace token of the first line, lowercased.
pub fn parse_fastboot_product(output: &str) -> Option<String> {
    let first = output.trim().lines().next()?;
    first
        .split_whitespace()
        .nth(1)
        .map(|token| token.to_lowercase())
}

/// Choose the model name from the two build properties
pub fn model_from_props(build_product: &str, product_name: &str) -> String {
    let build_product = build_product.trim().to_lowercase();
    if build_product == SPROUT_PRODUCT {
        build_product
    } else {
        product_name.trim().to_lowercase()
    }
}

/// Normalize `ro.product.cpu.abi`; empty means "unknown"
pub fn parse_cpu_abi(value: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        "unknown".to_string()
    } else {
        value.to_lowercase()
    }
}

/// `uname -m` output names a 64-bit machine
pub fn is_64bit_machine(uname: &str) -> bool {
    uname.contains("64")
}

/// `sys.boot_completed` is set once the framework broadcast BOOT_COMPLETED
pub fn is_boot_completed(value: &str) -> bool {
    value.trim() == "1"
}

/// `id -u` output for a root shell
pub fn is_root_uid(id_output: &str) -> bool {
    let id = id_output.trim();
    id == "0" || id.contains("root")
}

/// Native library directories, 64-bit ones first when supported
pub fn lib_paths(is_64bit: bool) -> Vec<&'static str> {
    let mut paths = Vec::with_capacity(4);
    if is_64bit {
        paths.extend(LIB_PATHS_64);
    }
    paths.extend(LIB_PATHS_32);
    paths
}

/// Build a `setprop` command, refusing values that contain quotes
pub fn setprop_command(name: &str, value: &str) -> Result<String> {
    if value.contains('\'') || value.contains('"') {
        return Err(Error::config(format!(
            "quotes in the value of system property {name} are not supported"
        )));
    }
    Ok(format!("setprop {name} \"{value}\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_total_memory_units() {
        assert_eq!(
            parse_total_memory("MemTotal:        3771952 kB"),
            Some(3771952 * 1024)
        );
        assert_eq!(parse_total_memory("MemTotal: 2 mB"), Some(2 * 1024 * 1024));
        assert_eq!(parse_total_memory("MemTotal: 512 B"), Some(512));
    }

    #[test]
    fn test_parse_total_memory_rejects_garbage() {
        assert_eq!(parse_total_memory(""), None);
        assert_eq!(parse_total_memory("MemTotal: lots"), None);
        assert_eq!(parse_total_memory("MemTotal: 12 GB"), None);
    }

    #[test]
    fn test_parse_fastboot_product() {
        let out = "product: Bullhead\nfinished. total time: 0.001s\n";
        assert_eq!(parse_fastboot_product(out).as_deref(), Some("bullhead"));
        assert_eq!(parse_fastboot_product("product:"), None);
        assert_eq!(parse_fastboot_product(""), None);
    }

    #[test]
    fn test_model_sprout_special_case() {
        assert_eq!(model_from_props("Sprout", "ignored"), "sprout");
        assert_eq!(model_from_props("angler", "Angler_Prod"), "angler_prod");
    }

    #[test]
    fn test_cpu_abi() {
        assert_eq!(parse_cpu_abi("arm64-v8a\n"), "arm64-v8a");
        assert_eq!(parse_cpu_abi("  "), "unknown");
    }

    #[test]
    fn test_flags() {
        assert!(is_64bit_machine("aarch64"));
        assert!(!is_64bit_machine("armv7l"));
        assert!(is_boot_completed("1\n"));
        assert!(!is_boot_completed(""));
        assert!(is_root_uid("0\n"));
        assert!(!is_root_uid("2000"));
    }

    #[test]
    fn test_lib_paths() {
        assert_eq!(lib_paths(false), vec!["/system/lib", "/vendor/lib"]);
        assert_eq!(
            lib_paths(true),
            vec!["/system/lib64", "/vendor/lib64", "/system/lib", "/vendor/lib"]
        );
    }

    #[test]
    fn test_setprop_rejects_quotes() {
        assert_eq!(
            setprop_command("debug.x", "on").unwrap(),
            "setprop debug.x \"on\""
        );
        assert!(setprop_command("debug.x", "it's").is_err());
        assert!(setprop_command("debug.x", "\"q\"").is_err());
    }
}
