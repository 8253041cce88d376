//! Error types for the local transport.
//!
//! Every failure a transport agent can report maps to one variant here. The
//! variants also know which sync status they stand for, so a failure that
//! ends a session can be recorded in the [`SyncReport`](crate::report::SyncReport)
//! and shipped to the parent as data.

use crate::report::SyncStatus;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the local transport.
#[derive(Debug, Error)]
pub enum LocalSyncError {
    // Configuration errors
    #[error("Shared buffer size mismatch: expected {expected} bytes, found {actual} bytes")]
    ConfigMismatch { expected: usize, actual: usize },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid local sync context '{context}': {message}")]
    InvalidContext { context: String, message: String },

    // Process errors
    #[error("Failed to start helper {program:?}: {message}")]
    Spawn { program: PathBuf, message: String },

    // Channel and transport errors
    #[error("Control channel lost: {reason}")]
    ChannelLost { reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport busy: previous message has not been answered yet")]
    TransportBusy,

    #[error("{message}")]
    Status { status: SyncStatus, message: String },

    #[error("Shared buffer contract violated: {0}")]
    BufferContract(String),

    #[error("Internal error: {0}")]
    ProtocolViolation(String),

    #[error("Aborting as requested by user")]
    Aborted,

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Validation errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for local transport operations.
pub type Result<T> = std::result::Result<T, LocalSyncError>;

impl From<std::io::Error> for LocalSyncError {
    fn from(err: std::io::Error) -> Self {
        LocalSyncError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for LocalSyncError {
    fn from(err: serde_json::Error) -> Self {
        LocalSyncError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

#[cfg(unix)]
impl From<nix::errno::Errno> for LocalSyncError {
    fn from(err: nix::errno::Errno) -> Self {
        LocalSyncError::Io {
            message: err.desc().to_string(),
            path: None,
            source: Some(std::io::Error::from(err)),
        }
    }
}

impl LocalSyncError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        LocalSyncError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a channel-lost error.
    pub fn channel_lost(reason: impl Into<String>) -> Self {
        LocalSyncError::ChannelLost {
            reason: reason.into(),
        }
    }

    /// Sync status recorded in a report when this error ends a session.
    pub fn status(&self) -> SyncStatus {
        match self {
            LocalSyncError::Status { status, .. } => *status,
            LocalSyncError::Aborted => SyncStatus::USER_ABORT,
            LocalSyncError::ChannelLost { .. }
            | LocalSyncError::Transport(_)
            | LocalSyncError::TransportBusy
            | LocalSyncError::Spawn { .. } => SyncStatus::TRANSPORT_FAILURE,
            LocalSyncError::Io { .. } => SyncStatus::DATASTORE_FAILURE,
            _ => SyncStatus::FATAL,
        }
    }

    /// Convert to a JSON-RPC error code for control channel replies.
    ///
    /// Standard codes are used for malformed traffic; application codes:
    /// - -32000: transport/channel error
    /// - -32004: aborted by user
    /// - -32005: validation or configuration error
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            LocalSyncError::ChannelLost { .. }
            | LocalSyncError::Transport(_)
            | LocalSyncError::TransportBusy => -32000,

            LocalSyncError::Aborted => -32004,

            LocalSyncError::Validation { .. }
            | LocalSyncError::Config { .. }
            | LocalSyncError::InvalidContext { .. }
            | LocalSyncError::ConfigMismatch { .. } => -32005,

            LocalSyncError::Json { .. } => -32602,

            _ => -32603,
        }
    }

    /// True for errors that mean the peer is unreachable.
    pub fn is_channel_loss(&self) -> bool {
        matches!(self, LocalSyncError::ChannelLost { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LocalSyncError::ConfigMismatch {
            expected: 2048,
            actual: 4096,
        };
        assert_eq!(
            err.to_string(),
            "Shared buffer size mismatch: expected 2048 bytes, found 4096 bytes"
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(LocalSyncError::Aborted.status(), SyncStatus::USER_ABORT);
        assert_eq!(
            LocalSyncError::channel_lost("gone").status(),
            SyncStatus::TRANSPORT_FAILURE
        );
        assert_eq!(
            LocalSyncError::Status {
                status: SyncStatus(22000),
                message: "slow sync".into()
            }
            .status(),
            SyncStatus(22000)
        );
        assert_eq!(
            LocalSyncError::Other("boom".into()).status(),
            SyncStatus::FATAL
        );
    }

    #[test]
    fn test_rpc_error_codes() {
        assert_eq!(LocalSyncError::Aborted.to_rpc_error_code(), -32004);
        assert_eq!(
            LocalSyncError::Validation {
                field: "offset".into(),
                message: "out of range".into()
            }
            .to_rpc_error_code(),
            -32005
        );
        assert_eq!(
            LocalSyncError::Other("x".into()).to_rpc_error_code(),
            -32603
        );
    }
}
