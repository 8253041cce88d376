//! Process-wide suspend/abort indicator for cooperative cancellation.
//!
//! Every loop iteration of a transport agent checks these flags. Signals
//! never run sync logic themselves: they only flip the state here (see
//! [`platform::signals`](crate::platform::signals)).

use crate::error::{LocalSyncError, Result};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

/// State of a sync session as requested by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SuspendState {
    /// Keep running.
    Normal = 0,
    /// Suspend the session.
    Suspend = 1,
    /// Abort the session.
    Abort = 2,
}

impl SuspendState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SuspendState::Normal,
            1 => SuspendState::Suspend,
            _ => SuspendState::Abort,
        }
    }
}

/// Shared suspend/abort flags.
///
/// Clones share state. [`SuspendFlags::global`] returns the process-wide
/// instance; tests create private ones with [`SuspendFlags::new`].
///
/// # Example
///
/// ```
/// use localsync_core::suspend::{SuspendFlags, SuspendState};
///
/// let flags = SuspendFlags::new();
/// let seen_by_loop = flags.clone();
///
/// flags.abort();
/// assert_eq!(seen_by_loop.state(), SuspendState::Abort);
/// assert!(seen_by_loop.check_for_abort().is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct SuspendFlags {
    state: Arc<AtomicU8>,
}

static GLOBAL: OnceLock<SuspendFlags> = OnceLock::new();

impl SuspendFlags {
    /// Create new, independent flags in the normal state.
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(SuspendState::Normal as u8)),
        }
    }

    /// The process-wide flags.
    pub fn global() -> &'static SuspendFlags {
        GLOBAL.get_or_init(SuspendFlags::new)
    }

    /// Current state.
    pub fn state(&self) -> SuspendState {
        SuspendState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Request a suspend. Never downgrades an abort.
    pub fn suspend(&self) {
        let _ = self.state.fetch_max(SuspendState::Suspend as u8, Ordering::SeqCst);
    }

    /// Request an abort. Abort is final until [`reset`](Self::reset).
    pub fn abort(&self) {
        self.state.store(SuspendState::Abort as u8, Ordering::SeqCst);
    }

    /// Return to normal operation.
    ///
    /// Only meaningful for tests and after a suspend was lifted.
    pub fn reset(&self) {
        self.state.store(SuspendState::Normal as u8, Ordering::SeqCst);
    }

    /// Lift a suspend request; an abort stays.
    pub fn resume(&self) {
        let _ = self.state.compare_exchange(
            SuspendState::Suspend as u8,
            SuspendState::Normal as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn is_normal(&self) -> bool {
        self.state() == SuspendState::Normal
    }

    pub fn is_aborted(&self) -> bool {
        self.state() == SuspendState::Abort
    }

    /// Error out when the session must not continue.
    ///
    /// Suspend and abort are both treated as an abort request.
    pub fn check_for_normal(&self) -> Result<()> {
        if self.is_normal() {
            Ok(())
        } else {
            Err(LocalSyncError::Aborted)
        }
    }

    /// Error out only on abort; a suspended session may keep waiting.
    pub fn check_for_abort(&self) -> Result<()> {
        if self.is_aborted() {
            Err(LocalSyncError::Aborted)
        } else {
            Ok(())
        }
    }
}
