//! Typed payloads of the control channel methods.

use crate::config::Credentials;
use crate::engine::PasswordKey;
use crate::sources::ActiveSourceMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Method names.
pub mod methods {
    /// Child → parent, first frame on a new connection.
    pub const HELLO: &str = "hello";
    /// Parent → child, once per session.
    pub const START_SYNC: &str = "startSync";
    /// Parent → child, one per protocol message.
    pub const SEND_MSG: &str = "sendMsg";
    /// Parent → child.
    pub const SET_FREEZE: &str = "setFreeze";
    /// Child → parent.
    pub const ASK_PASSWORD: &str = "askPassword";
    /// Child → parent, once at the end of the session.
    pub const STORE_SYNC_REPORT: &str = "storeSyncReport";
    /// Child → parent notification.
    pub const LOG_OUTPUT: &str = "logOutput";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub token: String,
    pub pid: u32,
}

/// Everything the child needs to run its half of the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartParams {
    /// Context the child runs in, normalized.
    pub client_context: String,
    /// Name of the parent configuration.
    pub parent_config: String,
    /// Root below which each context keeps its data.
    pub root: PathBuf,
    pub log_dir: PathBuf,
    /// Whether the parent writes its own session log.
    pub do_logging: bool,
    pub credentials: Credentials,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    pub sources: ActiveSourceMap,
}

/// A message handed over in a shared region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub content_type: String,
    pub offset: usize,
    pub length: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreezeParams {
    pub freeze: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordRequest {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub key: PasswordKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordReply {
    pub password: String,
}

/// The child's sync report in text form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportParams {
    pub report: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogOutput {
    pub level: String,
    pub target: String,
    pub message: String,
}
