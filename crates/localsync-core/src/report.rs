//! Sync report: the outcome of one session, produced by the child.

use crate::error::{LocalSyncError, Result};
use crate::sources::SyncMode;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

/// Numeric session status as used by the sync engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncStatus(pub u32);

impl SyncStatus {
    /// No outcome recorded yet (session may have ended prematurely).
    pub const UNKNOWN: SyncStatus = SyncStatus(0);
    pub const OK: SyncStatus = SyncStatus(200);
    pub const FATAL: SyncStatus = SyncStatus(500);
    pub const DATASTORE_FAILURE: SyncStatus = SyncStatus(510);
    pub const USER_ABORT: SyncStatus = SyncStatus(20017);
    pub const TRANSPORT_FAILURE: SyncStatus = SyncStatus(20043);
    pub const DIED_PREMATURELY: SyncStatus = SyncStatus(22002);

    /// Locally generated variants of protocol statuses live at `10000 + code`.
    pub const LOCAL_STATUS_CODE: u32 = 10000;
    pub const LOCAL_STATUS_CODE_END: u32 = 10999;

    /// True for the two statuses that do not describe a specific failure.
    pub fn is_generic(self) -> bool {
        self == SyncStatus::UNKNOWN || self == SyncStatus::OK
    }

    /// Strip the local offset: 10xxx → xxx.
    pub fn without_local_offset(self) -> u32 {
        if (Self::LOCAL_STATUS_CODE..=Self::LOCAL_STATUS_CODE_END).contains(&self.0) {
            self.0 - Self::LOCAL_STATUS_CODE
        } else {
            self.0
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Item changes in one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemCounts {
    pub added: u64,
    pub updated: u64,
    pub removed: u64,
}

impl ItemCounts {
    pub fn total(&self) -> u64 {
        self.added + self.updated + self.removed
    }
}

/// Outcome for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceReport {
    pub mode: SyncMode,
    pub status: SyncStatus,
    /// Changes applied to the local data source.
    pub local: ItemCounts,
    /// Changes sent to the peer.
    pub remote: ItemCounts,
}

impl SourceReport {
    pub fn new(mode: SyncMode) -> Self {
        Self {
            mode,
            status: SyncStatus::OK,
            local: ItemCounts::default(),
            remote: ItemCounts::default(),
        }
    }
}

/// Outcome of a whole session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

static STATUS_EXPLANATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\((?:local|remote), status (\d+)\): (.*)").expect("status explanation regex must compile")
});

impl SyncReport {
    /// True if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.status == SyncStatus::UNKNOWN && self.error.is_none() && self.sources.is_empty()
    }

    pub fn is_success(&self) -> bool {
        self.status == SyncStatus::OK
    }

    /// Record a failure without overwriting an earlier, more specific one.
    pub fn record_failure(&mut self, status: SyncStatus, error: impl Into<String>) {
        if self.status.is_generic() {
            self.status = status;
        }
        let error = error.into();
        if self.error.is_none() && !error.is_empty() {
            self.error = Some(error);
        }
    }

    /// Sum of all local and remote item changes.
    pub fn total_changes(&self) -> u64 {
        self.sources
            .values()
            .map(|source| source.local.total() + source.remote.total())
            .sum()
    }

    /// Text form carried by the control channel.
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_text(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Describe a failure of the target side, if the report names one.
    ///
    /// Returns `None` for generic statuses. The explanation is extended with
    /// the client's own error text when that text carries the same status;
    /// 10xxx matches xxx and vice versa.
    pub fn target_failure(&self, client_context: &str) -> Option<LocalSyncError> {
        if self.status.is_generic() {
            return None;
        }
        let status = self.status.without_local_offset();
        let mut explanation = format!("failure on target side {} of local sync", client_context);

        if let Some(captures) = self.error.as_deref().and_then(|e| STATUS_EXPLANATION.captures(e)) {
            let client_status: Option<u32> = captures.get(1).and_then(|m| m.as_str().parse().ok());
            if let (Some(client_status), Some(text)) = (client_status, captures.get(2)) {
                if status == client_status
                    || client_status.checked_sub(SyncStatus::LOCAL_STATUS_CODE) == Some(status)
                {
                    explanation.push_str(": ");
                    explanation.push_str(text.as_str());
                }
            }
        }

        Some(LocalSyncError::Status {
            status: self.status,
            message: explanation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_roundtrip_keeps_counts() {
        let mut report = SyncReport {
            status: SyncStatus::OK,
            ..Default::default()
        };
        let mut source = SourceReport::new(SyncMode::TwoWay);
        source.local.added = 3;
        source.remote.removed = 1;
        report.sources.insert("addressbook".into(), source);

        let parsed = SyncReport::from_text(&report.to_text().unwrap()).unwrap();
        assert_eq!(parsed, report);
        assert_eq!(parsed.total_changes(), 4);
    }

    #[test]
    fn test_record_failure_keeps_first_error() {
        let mut report = SyncReport::default();
        report.record_failure(SyncStatus::DATASTORE_FAILURE, "disk full");
        report.record_failure(SyncStatus::FATAL, "later");
        assert_eq!(report.status, SyncStatus::DATASTORE_FAILURE);
        assert_eq!(report.error.as_deref(), Some("disk full"));
    }

    #[test]
    fn test_generic_status_is_no_target_failure() {
        let report = SyncReport {
            status: SyncStatus::OK,
            ..Default::default()
        };
        assert!(report.target_failure("@backup").is_none());
        assert!(SyncReport::default().target_failure("@backup").is_none());
    }

    #[test]
    fn test_target_failure_extracts_matching_explanation() {
        let report = SyncReport {
            status: SyncStatus(10500),
            error: Some("addressbook (local, status 10500): database locked".into()),
            ..Default::default()
        };
        match report.target_failure("@backup") {
            Some(LocalSyncError::Status { status, message }) => {
                assert_eq!(status, SyncStatus(10500));
                assert_eq!(
                    message,
                    "failure on target side @backup of local sync: database locked"
                );
            }
            other => panic!("Expected Status error, got: {:?}", other),
        }
    }

    #[test]
    fn test_target_failure_fuzzy_matches_local_offset() {
        let report = SyncReport {
            status: SyncStatus(500),
            error: Some("(remote, status 10500): peer said no".into()),
            ..Default::default()
        };
        let err = report.target_failure("@backup").unwrap();
        assert!(err.to_string().ends_with(": peer said no"));
    }

    #[test]
    fn test_target_failure_ignores_other_status_text() {
        let report = SyncReport {
            status: SyncStatus(22000),
            error: Some("(local, status 403): forbidden".into()),
            ..Default::default()
        };
        let err = report.target_failure("@backup").unwrap();
        assert_eq!(err.to_string(), "failure on target side @backup of local sync");
    }
}
