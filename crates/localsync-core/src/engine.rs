//! Contracts of the collaborators around the transport.
//!
//! The sync engine itself, the data sources and the interactive UI are
//! outside this crate. The child agent only needs to create a session,
//! run it against a transport and relay password prompts.

use crate::config::Credentials;
use crate::error::Result;
use crate::report::SyncReport;
use crate::sources::ChildSource;
use crate::suspend::SuspendFlags;
use crate::transport::TransportAgent;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Identifies a stored password.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordKey {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub protocol: String,
}

/// Interactive source of passwords.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn ask_password(&self, name: &str, description: &str, key: &PasswordKey) -> Result<String>;
}

/// Item store behind one source.
pub trait DataSource: Send {
    fn open(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    /// All items: id → revision.
    fn enumerate(&self) -> Result<BTreeMap<String, String>>;

    fn read(&self, id: &str) -> Result<Vec<u8>>;

    /// Store an item; `None` creates a new one. Returns `(id, revision)`.
    fn write(&mut self, id: Option<&str>, item: &[u8]) -> Result<(String, String)>;

    fn remove(&mut self, id: &str) -> Result<()>;
}

/// Everything the child knows about its half of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSetup {
    /// Normalized child context, e.g. `@backup`.
    pub context: String,
    /// Name of the parent configuration.
    pub parent_config: String,
    /// Directory holding one subdirectory per child source.
    pub data_dir: PathBuf,
    pub sources: Vec<ChildSource>,
    pub credentials: Credentials,
    pub properties: BTreeMap<String, String>,
    /// Where the child writes its session log, if anywhere.
    pub log_dir: Option<PathBuf>,
}

/// What a running session may use besides the transport.
pub struct SessionContext<'a> {
    pub credentials: &'a dyn CredentialProvider,
    pub flags: &'a SuspendFlags,
}

/// One sync session, driven to completion over a transport.
#[async_trait]
pub trait SyncSession: Send {
    async fn run(
        &mut self,
        transport: &mut dyn TransportAgent,
        context: SessionContext<'_>,
    ) -> Result<SyncReport>;
}

/// Creates the child's session once the start parameters are known.
pub trait SessionFactory: Send + Sync {
    fn create(&self, setup: &SessionSetup) -> Result<Box<dyn SyncSession>>;
}
