//! Bug report file naming
//!
//! Reports land in `<device log dir>/BugReports/` as
//! `<test name>,<begin time>,<serial>.txt`. The test name is truncated so
//! the whole file name fits in 255 bytes.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

/// Subdirectory of the device log directory holding bug reports
pub const BUG_REPORT_DIR: &str = "BugReports";

/// File name limit of common filesystems
pub const MAX_FILE_NAME_BYTES: usize = 255;

const REPORT_EXTENSION: &str = ".txt";

/// Used when the test name is empty or truncated away
const FALLBACK_TEST_NAME: &str = "bugreport";

/// Log line timestamp, e.g. `10-16 14:03:07.250`
pub fn logline_timestamp(time: DateTime<Local>) -> String {
    time.format("%m-%d %H:%M:%S%.3f").to_string()
}

/// Make a log line timestamp safe for file names
pub fn normalize_logline_timestamp(timestamp: &str) -> String {
    timestamp.replace(' ', "_").replace(':', "-")
}

/// Longest prefix of `s` that is at most `max` bytes and ends on a char boundary
fn truncate_to_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// File name for a report; `disambiguator` is appended to the test name
/// when an earlier report already took the plain name.
pub fn bug_report_file_name(
    test_name: &str,
    begin_time: &str,
    serial: &str,
    disambiguator: Option<u32>,
) -> String {
    let base = format!(",{begin_time},{serial}{REPORT_EXTENSION}");
    let suffix = disambiguator.map(|n| format!("-{n}")).unwrap_or_default();
    let budget = MAX_FILE_NAME_BYTES.saturating_sub(base.len() + suffix.len());

    let mut name = truncate_to_bytes(test_name.trim(), budget);
    if name.is_empty() {
        name = truncate_to_bytes(FALLBACK_TEST_NAME, budget);
    }
    let file_name = format!("{name}{suffix}{base}");
    if file_name.len() <= MAX_FILE_NAME_BYTES {
        return file_name;
    }

    // Begin time and serial alone overflow; clamp the stem, keep the extension
    let stem = &file_name[..file_name.len() - REPORT_EXTENSION.len()];
    format!(
        "{}{REPORT_EXTENSION}",
        truncate_to_bytes(stem, MAX_FILE_NAME_BYTES - REPORT_EXTENSION.len())
    )
}

/// First free report path in `dir`
pub fn unique_bug_report_path(dir: &Path, test_name: &str, begin_time: &str, serial: &str) -> PathBuf {
    let plain = dir.join(bug_report_file_name(test_name, begin_time, serial, None));
    if !plain.exists() {
        return plain;
    }
    let mut n = 1;
    loop {
        let candidate = dir.join(bug_report_file_name(test_name, begin_time, serial, Some(n)));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn test_plain_name() {
        assert_eq!(
            bug_report_file_name("testWifi", "10-16_14-03-07.250", "HT01", None),
            "testWifi,10-16_14-03-07.250,HT01.txt"
        );
    }

    #[test]
    fn test_long_name_truncated_to_limit() {
        let long = "x".repeat(400);
        let name = bug_report_file_name(&long, "10-16_14-03-07.250", "HT01", None);
        assert_eq!(name.len(), MAX_FILE_NAME_BYTES);
        assert!(name.ends_with(",10-16_14-03-07.250,HT01.txt"));

        let with_suffix = bug_report_file_name(&long, "10-16_14-03-07.250", "HT01", Some(12));
        assert_eq!(with_suffix.len(), MAX_FILE_NAME_BYTES);
        assert!(with_suffix.contains("x-12,"));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let long = "é".repeat(200);
        let name = bug_report_file_name(&long, "t", "S", None);
        assert!(name.len() <= MAX_FILE_NAME_BYTES);
        assert!(name.ends_with(",t,S.txt"));
    }

    #[test]
    fn test_empty_name_falls_back() {
        assert_eq!(
            bug_report_file_name("", "t", "S", None),
            "bugreport,t,S.txt"
        );
        assert_eq!(
            bug_report_file_name("   ", "t", "S", None),
            "bugreport,t,S.txt"
        );
    }

    #[test]
    fn test_oversized_serial_is_clamped() {
        let serial = "S".repeat(300);
        let name = bug_report_file_name("testWifi", "10-16_14-03-07.250", &serial, None);
        assert_eq!(name.len(), MAX_FILE_NAME_BYTES);
        assert!(name.starts_with(",10-16_14-03-07.250,SSS"));
        assert!(name.ends_with("S.txt"));

        let numbered = bug_report_file_name("testWifi", "10-16_14-03-07.250", &serial, Some(3));
        assert_eq!(numbered.len(), MAX_FILE_NAME_BYTES);
        assert!(numbered.starts_with("-3,"));
        assert_ne!(name, numbered);
    }

    #[test]
    fn test_collisions_get_numbered() {
        let temp = tempdir().unwrap();
        let first = unique_bug_report_path(temp.path(), "test", "t", "S");
        std::fs::write(&first, "a").unwrap();
        let second = unique_bug_report_path(temp.path(), "test", "t", "S");
        std::fs::write(&second, "b").unwrap();
        let third = unique_bug_report_path(temp.path(), "test", "t", "S");

        assert_eq!(first.file_name().unwrap(), "test,t,S.txt");
        assert_eq!(second.file_name().unwrap(), "test-1,t,S.txt");
        assert_eq!(third.file_name().unwrap(), "test-2,t,S.txt");
    }

    #[test]
    fn test_logline_timestamp() {
        let time = Local.with_ymd_and_hms(2026, 10, 16, 14, 3, 7).unwrap();
        let stamp = logline_timestamp(time);
        assert_eq!(stamp, "10-16 14:03:07.000");
        assert_eq!(normalize_logline_timestamp(&stamp), "10-16_14-03-07.000");
    }
}
