//! Platform abstraction layer.
//!
//! All `#[cfg]` blocks for OS-specific behavior live here rather than in the
//! agents.
//!
//! - `mmap` - File-backed shared memory regions
//! - `process` - Helper spawning, exit monitoring, termination
//! - `signals` - Signal dispositions and the interactive Ctrl-C handler
//!
//! # Supported Platforms
//!
//! - **Linux**: Full support
//! - **macOS**: Full support
//! - **Windows**: Not supported (no shared regions, no signals)

pub mod mmap;
pub mod process;
pub mod signals;

pub use process::{spawn_child, terminate_process, ChildExit, ChildProcess};
pub use signals::{install_child_policy, install_interactive_handler};
