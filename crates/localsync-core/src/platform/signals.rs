//! Signal policy of the two processes.
//!
//! The parent owns the interactive session: Ctrl-C there suspends, a second
//! Ctrl-C shortly after aborts. The helper ignores SIGINT (the terminal sends
//! it to the whole process group) and keeps the default SIGTERM disposition,
//! so a cancel from the parent kills it immediately. Neither handler runs
//! sync logic; they only flip [`SuspendFlags`].

#![allow(unsafe_code)]

use crate::config::ControlConfig;
use crate::error::{LocalSyncError, Result};
use crate::suspend::{SuspendFlags, SuspendState};
use std::sync::Mutex;
use std::time::Instant;
use tracing::{info, warn};

/// Install the helper's signal dispositions.
pub fn install_child_policy() -> Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{signal, SigHandler, Signal};

        // SAFETY: only SIG_IGN and SIG_DFL are installed; no handler code runs.
        unsafe {
            signal(Signal::SIGINT, SigHandler::SigIgn)?;
            signal(Signal::SIGTERM, SigHandler::SigDfl)?;
            signal(Signal::SIGPIPE, SigHandler::SigIgn)?;
        }
        tracing::debug!("Child signal policy installed: SIGINT ignored, SIGTERM default");
    }
    Ok(())
}

/// Decides what an interrupt means given the previous one.
#[derive(Debug, Default)]
pub struct InterruptTracker {
    last: Option<Instant>,
}

impl InterruptTracker {
    /// Record an interrupt at `now` and update `flags`.
    pub fn on_interrupt(&mut self, flags: &SuspendFlags, now: Instant) -> SuspendState {
        let repeated = self
            .last
            .map(|last| now.duration_since(last) < ControlConfig::ABORT_INTERVAL)
            .unwrap_or(false);
        self.last = Some(now);

        if repeated && flags.state() == SuspendState::Suspend {
            flags.abort();
        } else if flags.state() == SuspendState::Normal {
            flags.suspend();
        }
        flags.state()
    }
}

/// Route Ctrl-C in the parent process to `flags`.
///
/// May only be called once per process.
pub fn install_interactive_handler(flags: SuspendFlags) -> Result<()> {
    let tracker = Mutex::new(InterruptTracker::default());
    ctrlc::set_handler(move || {
        let mut tracker = tracker.lock().unwrap_or_else(|e| e.into_inner());
        match tracker.on_interrupt(&flags, Instant::now()) {
            SuspendState::Suspend => info!(
                "Asking to suspend. Press CTRL-C again quickly (within {}s) to stop immediately",
                ControlConfig::ABORT_INTERVAL.as_secs()
            ),
            SuspendState::Abort => warn!("Aborting immediately"),
            SuspendState::Normal => {}
        }
    })
    .map_err(|e| LocalSyncError::Other(format!("Failed to install Ctrl-C handler: {}", e)))
}
