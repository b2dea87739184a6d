//! Standing (long-running) child process management

use std::ffi::OsString;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Notify};
use tokio::time::timeout;

use devhost_core::prelude::*;

/// Upper bound on early-exit output attached to errors
const MAX_CAPTURED_OUTPUT: u64 = 64 * 1024;

/// Program, arguments and environment of a standing process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Render as a single shell-like line for logs
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// A background process whose stdout and stderr are appended to a log file.
///
/// Follows the same ownership split as any child we supervise: the `Child`
/// handle is moved into a `wait_for_exit` task, and the struct keeps a kill
/// channel, an `exited` flag for synchronous checks and a [`Notify`] for
/// awaiting exit without polling.
///
/// On unix the child leads its own process group, so [`terminate`] reaches
/// everything it spawned (`adb` forks a server helper on first use).
///
/// [`terminate`]: StandingProcess::terminate
pub struct StandingProcess {
    command_line: String,
    pid: Option<u32>,
    log_file: PathBuf,
    started_at: DateTime<Local>,
    kill_tx: Option<oneshot::Sender<()>>,
    exited: Arc<AtomicBool>,
    exit_code: Arc<OnceLock<Option<i32>>>,
    exit_notify: Arc<Notify>,
    /// Log file length before spawn; output after it belongs to this process
    log_offset: u64,
}

impl StandingProcess {
    /// Spawn `spec` without a health check
    pub fn spawn(spec: &ProcessSpec, log_file: &Path) -> Result<Self> {
        let command_line = spec.command_line();

        if let Some(parent) = log_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let stdout_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)?;
        let log_offset = stdout_file.metadata()?.len();
        let stderr_file = stdout_file.try_clone()?;

        info!("Spawning: {}", command_line);

        let mut command = Command::new(&spec.program);
        command
            .args(spec.args.iter().map(OsString::from))
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_file))
            .stderr(Stdio::from(stderr_file))
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let child = command
            .spawn()
            .map_err(|e| Error::process_spawn(&command_line, e.to_string()))?;

        let pid = child.id();
        debug!("{} started with PID {:?}", command_line, pid);

        let exited = Arc::new(AtomicBool::new(false));
        let exit_code = Arc::new(OnceLock::new());
        let exit_notify = Arc::new(Notify::new());
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(Self::wait_for_exit(
            child,
            kill_rx,
            command_line.clone(),
            Arc::clone(&exited),
            Arc::clone(&exit_code),
            Arc::clone(&exit_notify),
        ));

        Ok(Self {
            command_line,
            pid,
            log_file: log_file.to_path_buf(),
            started_at: Local::now(),
            kill_tx: Some(kill_tx),
            exited,
            exit_code,
            exit_notify,
            log_offset,
        })
    }

    /// Spawn `spec` and wait `grace`; an exit inside that window is
    /// [`Error::EarlyExit`] carrying the output the process wrote.
    pub async fn start(spec: &ProcessSpec, log_file: &Path, grace: Duration) -> Result<Self> {
        let process = Self::spawn(spec, log_file)?;

        if !process.wait_exit(grace).await {
            return Ok(process);
        }

        let output = process.captured_output();
        warn!(
            "{} exited during health check with {:?}",
            process.command_line,
            process.exit_code()
        );
        Err(Error::EarlyExit {
            command: process.command_line.clone(),
            code: process.exit_code(),
            output,
        })
    }

    /// Background task: owns `child` and records its exit.
    async fn wait_for_exit(
        mut child: Child,
        kill_rx: oneshot::Receiver<()>,
        command_line: String,
        exited: Arc<AtomicBool>,
        exit_code: Arc<OnceLock<Option<i32>>>,
        exit_notify: Arc<Notify>,
    ) {
        let code: Option<i32> = tokio::select! {
            result = child.wait() => {
                match result {
                    Ok(status) => {
                        debug!("{} exited with status: {:?}", command_line, status);
                        status.code()
                    }
                    Err(e) => {
                        error!("Error waiting for {}: {}", command_line, e);
                        None
                    }
                }
            }
            _ = kill_rx => {
                debug!("Kill signal received, force-killing {}", command_line);
                #[cfg(unix)]
                if let Some(pid) = child.id() {
                    signal_group(pid, libc::SIGKILL);
                }
                if let Err(e) = child.kill().await {
                    error!("Failed to kill {}: {}", command_line, e);
                }
                match child.wait().await {
                    Ok(status) => status.code(),
                    Err(e) => {
                        error!("Error waiting after kill: {}", e);
                        None
                    }
                }
            }
        };

        let _ = exit_code.set(code);
        exited.store(true, Ordering::Release);
        exit_notify.notify_waiters();
    }

    /// Wait up to `limit` for the process to exit. Returns `has_exited()`.
    pub async fn wait_exit(&self, limit: Duration) -> bool {
        // Create the future before checking the flag so a notification
        // between the check and the await is not lost.
        let notified = self.exit_notify.notified();
        if self.has_exited() {
            return true;
        }
        let _ = timeout(limit, notified).await;
        self.has_exited()
    }

    /// Stop the process: SIGTERM to its group, wait `limit`, then force-kill
    /// and wait `limit` again.
    ///
    /// Returns [`Error::StopError`] if exit could not be confirmed.
    pub async fn terminate(&mut self, limit: Duration) -> Result<()> {
        if self.has_exited() {
            debug!("{} already exited", self.command_line);
            return Ok(());
        }

        #[cfg(unix)]
        if let Some(pid) = self.pid {
            signal_group(pid, libc::SIGTERM);
        }

        if self.wait_exit(limit).await {
            info!("{} stopped", self.command_line);
            return Ok(());
        }

        warn!(
            "{} ignored SIGTERM for {:?}, force killing",
            self.command_line, limit
        );
        self.force_kill();

        if self.wait_exit(limit).await {
            Ok(())
        } else {
            Err(Error::StopError {
                command: self.command_line.clone(),
                message: format!("still running {:?} after kill", limit * 2),
            })
        }
    }

    fn force_kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            // The wait task may have already exited naturally
            let _ = tx.send(());
        }
    }

    /// Non-blocking check backed by the flag the wait task sets
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        !self.has_exited()
    }

    /// Exit code once the process has exited (`None` if killed by a signal)
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.get().copied().flatten()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    /// Output this process appended to its log file, capped in size
    pub fn captured_output(&self) -> String {
        read_log_from(&self.log_file, self.log_offset).unwrap_or_else(|e| {
            warn!("Could not read {}: {}", self.log_file.display(), e);
            String::new()
        })
    }
}

impl Drop for StandingProcess {
    fn drop(&mut self) {
        if !self.has_exited() {
            warn!(
                "StandingProcess `{}` dropped while still running; call stop first",
                self.command_line
            );
            self.force_kill();
        }
        // kill_on_drop(true) on the Child covers the window before the
        // wait task handles the kill.
    }
}

fn read_log_from(path: &Path, offset: u64) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();
    let start = offset.max(len.saturating_sub(MAX_CAPTURED_OUTPUT));
    file.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: negative pid targets the process group the child leads.
    let rc = unsafe { libc::kill(-pid, signal) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            debug!("kill(-{}, {}) failed: {}", pid, signal, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec::new("sh").arg("-c").arg(script)
    }

    #[test]
    fn test_spec_command_line() {
        let spec = ProcessSpec::new("/usr/bin/adb")
            .args(["-s", "X", "logcat"])
            .env("LD_LIBRARY_PATH", "/data/local/tmp/64");
        assert_eq!(spec.command_line(), "/usr/bin/adb -s X logcat");
        assert_eq!(spec.env.len(), 1);
    }

    #[tokio::test]
    async fn test_start_healthy_process() {
        let temp = tempdir().unwrap();
        let log = temp.path().join("proc.log");

        let mut process = StandingProcess::start(&sh("sleep 30"), &log, Duration::from_millis(100))
            .await
            .unwrap();

        assert!(process.is_running());
        assert!(process.pid().is_some());
        assert!(log.exists());

        process.terminate(Duration::from_secs(2)).await.unwrap();
        assert!(process.has_exited());
    }

    #[tokio::test]
    async fn test_early_exit_captures_output() {
        let temp = tempdir().unwrap();
        let log = temp.path().join("proc.log");
        std::fs::write(&log, "previous run\n").unwrap();

        let err = StandingProcess::start(
            &sh("echo cannot link executable; exit 7"),
            &log,
            Duration::from_secs(2),
        )
        .await
        .err()
        .unwrap();

        match err {
            Error::EarlyExit { code, output, .. } => {
                assert_eq!(code, Some(7));
                assert!(output.contains("cannot link executable"));
                assert!(!output.contains("previous run"));
            }
            other => panic!("expected EarlyExit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let temp = tempdir().unwrap();
        let result = StandingProcess::spawn(
            &ProcessSpec::new("/nonexistent/devhost-binary"),
            &temp.path().join("x.log"),
        );
        assert!(matches!(result, Err(Error::ProcessSpawn { .. })));
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let temp = tempdir().unwrap();
        let log = temp.path().join("stubborn.log");

        let mut process = StandingProcess::start(
            &sh("trap '' TERM; sleep 30"),
            &log,
            Duration::from_millis(100),
        )
        .await
        .unwrap();

        process
            .terminate(Duration::from_millis(300))
            .await
            .unwrap();
        assert!(process.has_exited());
        assert_eq!(process.exit_code(), None);
    }

    #[tokio::test]
    async fn test_terminate_after_exit_is_ok() {
        let temp = tempdir().unwrap();
        let mut process = StandingProcess::spawn(&sh("exit 0"), &temp.path().join("a.log")).unwrap();

        assert!(process.wait_exit(Duration::from_secs(2)).await);
        assert_eq!(process.exit_code(), Some(0));
        process.terminate(Duration::from_millis(50)).await.unwrap();
    }
}
