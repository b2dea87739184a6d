//! One-shot invocation of bridge tools (`adb`, `fastboot`) with a bounded timeout

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

use devhost_core::prelude::*;

/// Render a tool invocation for logs and error messages
pub fn command_line(program: &Path, args: &[&str]) -> String {
    let mut line = program.display().to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Run `program args...` to completion and return its stdout.
///
/// A non-zero exit status becomes [`Error::Bridge`] carrying the command line
/// and raw stderr; exceeding `limit` becomes [`Error::BridgeTimeout`] and the
/// child is killed.
pub async fn run_tool(program: &Path, args: &[&str], limit: Duration) -> Result<Vec<u8>> {
    let line = command_line(program, args);
    trace!("exec: {}", line);

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = timeout(limit, child)
        .await
        .map_err(|_| Error::BridgeTimeout {
            command: line.clone(),
            timeout: limit,
        })?
        .map_err(|e| Error::process_spawn(&line, e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        debug!("{} failed with {:?}: {}", line, output.status.code(), stderr);
        return Err(Error::bridge(line, output.status.code(), stderr));
    }

    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_rendering() {
        let line = command_line(Path::new("/opt/sdk/adb"), &["-s", "abc", "shell", "id -u"]);
        assert_eq!(line, "/opt/sdk/adb -s abc shell id -u");
    }

    #[tokio::test]
    async fn test_run_tool_returns_stdout() {
        let out = run_tool(Path::new("sh"), &["-c", "echo hello"], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&out).trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_tool_failure_carries_stderr() {
        let err = run_tool(
            Path::new("sh"),
            &["-c", "echo boom >&2; exit 3"],
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();

        match err {
            Error::Bridge { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("expected bridge error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_tool_timeout() {
        let err = run_tool(Path::new("sh"), &["-c", "sleep 5"], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BridgeTimeout { .. }));
    }
}
