//! Helper process management.
//!
//! Spawning the helper with its inherited environment, watching for its exit,
//! and terminating it. The exit monitor is the authority on child liveness:
//! once it fires, the child is gone for good.

use crate::error::{LocalSyncError, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How the helper ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    /// Exit code for a normal exit.
    pub code: Option<i32>,
    /// Terminating signal, Unix only.
    pub signal: Option<i32>,
}

impl ChildExit {
    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    /// Exit status could not be determined.
    fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ChildExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "killed by signal {}", signal),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// A spawned helper process.
///
/// Dropping the handle does not kill the process; the exit monitor keeps
/// running and reaps it.
#[derive(Debug)]
pub struct ChildProcess {
    pid: u32,
    program: PathBuf,
    exit_rx: watch::Receiver<Option<ChildExit>>,
    monitor: JoinHandle<()>,
}

/// Spawn `program` with `env` added to the current environment.
///
/// Stdout and stderr are inherited so the helper's console output shows up
/// next to the parent's.
pub fn spawn_child(program: &Path, args: &[String], env: &BTreeMap<String, String>) -> Result<ChildProcess> {
    let mut command = Command::new(program);
    command
        .args(args)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(false);

    let mut child = command.spawn().map_err(|e| LocalSyncError::Spawn {
        program: program.to_path_buf(),
        message: e.to_string(),
    })?;

    let pid = child.id().ok_or_else(|| LocalSyncError::Spawn {
        program: program.to_path_buf(),
        message: "process exited before its pid was known".to_string(),
    })?;

    info!("Started helper {} with PID {}", program.display(), pid);

    let (exit_tx, exit_rx) = watch::channel(None);
    let monitor = tokio::spawn(async move {
        let exit = match child.wait().await {
            Ok(status) => ChildExit::from_status(status),
            Err(e) => {
                warn!("Failed to wait for helper PID {}: {}", pid, e);
                ChildExit::unknown()
            }
        };
        debug!("Helper PID {} terminated: {}", pid, exit);
        let _ = exit_tx.send(Some(exit));
    });

    Ok(ChildProcess {
        pid,
        program: program.to_path_buf(),
        exit_rx,
        monitor,
    })
}

impl ChildProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Exit status, if the process has terminated.
    pub fn exit_status(&self) -> Option<ChildExit> {
        *self.exit_rx.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_status().is_some()
    }

    /// Wait until the process has terminated. Cancel safe.
    pub async fn exited(&self) -> ChildExit {
        let mut rx = self.exit_rx.clone();
        let exit = match rx.wait_for(|exit| exit.is_some()).await {
            Ok(exit) => (*exit).unwrap_or_else(ChildExit::unknown),
            // Monitor gone without reporting: treat as exited.
            Err(_) => ChildExit::unknown(),
        };
        exit
    }

    /// Send SIGTERM. A process that is already gone is not an error.
    pub fn terminate(&self) -> Result<()> {
        if self.has_exited() {
            debug!("Helper PID {} already exited", self.pid);
            return Ok(());
        }
        terminate_process(self.pid)
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if self.has_exited() {
            self.monitor.abort();
        }
    }
}

/// Ask a process to terminate.
///
/// # Platform Behavior
/// - **Linux/macOS**: Sends SIGTERM; the helper keeps the default disposition
///   and dies immediately
/// - **Other**: Not supported
pub fn terminate_process(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        debug!("Sending SIGTERM to process {}", pid);
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => Ok(()),
            Err(nix::errno::Errno::ESRCH) => {
                debug!("Process {} is not running", pid);
                Ok(())
            }
            Err(e) => Err(LocalSyncError::Other(format!(
                "Failed to send SIGTERM to {}: {}",
                pid, e
            ))),
        }
    }

    #[cfg(not(unix))]
    {
        Err(LocalSyncError::Other(format!(
            "Process termination not implemented for this platform (PID {})",
            pid
        )))
    }
}
