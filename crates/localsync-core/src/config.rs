//! Centralized configuration for the local transport.
//!
//! Constants for buffer sizing, the control channel and the environment
//! contract between parent and helper, plus the parent-side session
//! configuration handed to [`ParentAgent`](crate::agent::ParentAgent).

use crate::error::{LocalSyncError, Result};
use crate::sources::SyncMode;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Shared message buffer sizing.
pub struct TransportConfig;

impl TransportConfig {
    /// Default cap for one protocol message.
    pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 150 * 1024;
    /// Each region holds this many maximum-size messages.
    pub const REGION_FACTOR: usize = 2;
    /// Content type of the sentinel reply sent by a shutting-down child.
    pub const SHUTDOWN_CONTENT_TYPE: &'static str = "shutdown-message";
    /// Default helper program name, resolved next to the current executable.
    pub const HELPER_PROGRAM: &'static str = "localsync-helper";
}

/// Control channel configuration.
pub struct ControlConfig;

impl ControlConfig {
    /// Control frames only carry metadata; anything larger is a bug.
    pub const MAX_FRAME_SIZE: usize = 1_048_576; // 1MB
    /// Interval of the cooperative suspend/abort check in every loop.
    pub const LOOP_TICK: Duration = Duration::from_millis(100);
    /// How long the parent waits for the spawned helper's hello frame.
    pub const HELLO_TIMEOUT: Duration = Duration::from_secs(10);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    /// Upper bound for the single acknowledgement wait after a failed session.
    pub const FAILURE_ACK_WAIT: Duration = Duration::from_secs(2);
    /// Two interrupts within this interval abort instead of suspend.
    pub const ABORT_INTERVAL: Duration = Duration::from_secs(2);
}

/// Environment variables forming the parent → helper contract.
pub struct EnvVars;

impl EnvVars {
    pub const CONTROL_ADDR: &'static str = "LOCALSYNC_CONTROL_ADDR";
    pub const CONTROL_TOKEN: &'static str = "LOCALSYNC_CONTROL_TOKEN";
    pub const MESSAGE_SIZE: &'static str = "LOCALSYNC_MESSAGE_SIZE";
    pub const SHM_PARENT_TO_CHILD: &'static str = "LOCALSYNC_SHM_PARENT_TO_CHILD";
    pub const SHM_CHILD_TO_PARENT: &'static str = "LOCALSYNC_SHM_CHILD_TO_PARENT";
    /// Seconds to sleep before the helper connects (debugging aid).
    pub const CHILD_DELAY: &'static str = "LOCALSYNC_CHILD_DELAY";
    /// Any value raises helper logging to debug.
    pub const DEBUG: &'static str = "LOCALSYNC_DEBUG";
}

/// Normalize a context reference: lowercase, leading `@`, `default` if empty.
///
/// `peer@ctx` keeps its peer part so that callers can reject it.
pub fn normalize_context(context: &str) -> String {
    let trimmed = context.trim().to_lowercase();
    let (peer, ctx) = split_config_string(&trimmed);
    let ctx = if ctx.is_empty() { "default" } else { ctx };
    format!("{}@{}", peer, ctx)
}

/// Split `peer@context` into its parts; a missing context is empty.
pub fn split_config_string(config: &str) -> (&str, &str) {
    match config.find('@') {
        Some(pos) => (&config[..pos], &config[pos + 1..]),
        None => (config, ""),
    }
}

/// Per-source configuration on the parent side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    pub name: String,
    /// Name of the corresponding source in the second context; empty = same name.
    pub uri: String,
    pub mode: SyncMode,
}

impl SourceConfig {
    pub fn new(name: impl Into<String>, uri: impl Into<String>, mode: SyncMode) -> Self {
        Self {
            name: name.into(),
            uri: uri.into(),
            mode,
        }
    }

    /// Target name, falling back to the source's own name.
    pub fn uri_non_empty(&self) -> &str {
        if self.uri.is_empty() {
            &self.name
        } else {
            &self.uri
        }
    }
}

/// Credentials of the parent configuration, forwarded to the child.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Parent-side configuration of one local sync.
#[derive(Debug, Clone)]
pub struct ParentConfig {
    /// Name of the parent configuration (used in messages only).
    pub config_name: String,
    /// Context of the parent configuration, e.g. `@default`.
    pub context: String,
    /// Context the helper synchronizes against, e.g. `@backup`.
    pub client_context: String,
    /// Root under which each context keeps its data directory.
    pub root: PathBuf,
    /// Parent log directory.
    pub log_dir: PathBuf,
    /// Whether the parent writes its own session log.
    pub do_logging: bool,
    pub credentials: Credentials,
    /// Sync-relevant properties copied into the child's session.
    pub properties: BTreeMap<String, String>,
    pub sources: Vec<SourceConfig>,
    pub max_message_size: usize,
    /// Helper program to spawn.
    pub helper: PathBuf,
    /// Extra environment for the helper.
    pub env_vars: BTreeMap<String, String>,
}

impl ParentConfig {
    /// Create a config with sensible defaults.
    pub fn new(
        config_name: impl Into<String>,
        client_context: impl Into<String>,
        root: impl AsRef<Path>,
    ) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            config_name: config_name.into(),
            context: "@default".to_string(),
            client_context: client_context.into(),
            log_dir: root.join("logs"),
            root,
            do_logging: false,
            credentials: Credentials::default(),
            properties: BTreeMap::new(),
            sources: Vec::new(),
            max_message_size: TransportConfig::DEFAULT_MAX_MESSAGE_SIZE,
            helper: default_helper_path(),
            env_vars: BTreeMap::new(),
        }
    }

    /// Set the parent's own context.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    /// Add a source.
    pub fn with_source(mut self, source: SourceConfig) -> Self {
        self.sources.push(source);
        self
    }

    /// Set the credentials.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Credentials {
            username: username.into(),
            password: password.into(),
        };
        self
    }

    /// Add a sync property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Set the maximum message size.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the helper program.
    pub fn with_helper(mut self, helper: impl AsRef<Path>) -> Self {
        self.helper = helper.as_ref().to_path_buf();
        self
    }

    /// Set the log directory.
    pub fn with_log_dir(mut self, log_dir: impl AsRef<Path>, do_logging: bool) -> Self {
        self.log_dir = log_dir.as_ref().to_path_buf();
        self.do_logging = do_logging;
        self
    }

    /// Add an environment variable for the helper.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    /// Reject client contexts that cannot work.
    ///
    /// A `peer@context` reference is almost certainly a mistake for
    /// `@context`, and syncing a context with itself would sync the same
    /// databases against each other.
    pub fn validate_client_context(&self) -> Result<String> {
        let client = normalize_context(&self.client_context);
        let (peer, context) = split_config_string(&client);
        if !peer.is_empty() {
            return Err(LocalSyncError::InvalidContext {
                context: client.clone(),
                message: format!(
                    "references a peer config, should point to a context like @{} instead",
                    context
                ),
            });
        }
        if client == normalize_context(&self.context) {
            return Err(LocalSyncError::InvalidContext {
                context: client.clone(),
                message: "need second context with different databases".to_string(),
            });
        }
        if self.max_message_size == 0 {
            return Err(LocalSyncError::Config {
                message: "max_message_size must be positive".to_string(),
            });
        }
        Ok(client)
    }
}

/// Helper binary expected next to the current executable.
pub fn default_helper_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(TransportConfig::HELPER_PROGRAM)))
        .unwrap_or_else(|| PathBuf::from(TransportConfig::HELPER_PROGRAM))
}

/// Data directory of a context below `root`: `@backup` → `root/backup`.
pub fn context_data_dir(root: &Path, context: &str) -> PathBuf {
    let normalized = normalize_context(context);
    let (_, name) = split_config_string(&normalized);
    root.join(name)
}
