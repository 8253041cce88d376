//! Localsync Core - Local transport for the sync engine.
//!
//! A sync session normally talks to a remote server. With the local transport
//! the server half runs in a helper process on the same machine instead,
//! against a second set of local data sources. Both processes use the same
//! [`TransportAgent`] contract: messages travel through a shared memory
//! buffer, and a framed JSON-RPC control channel over loopback TCP carries
//! the calls that hand them over.
//!
//! # Example
//!
//! ```rust,ignore
//! use localsync_core::{ParentAgent, ParentConfig, SourceConfig, SyncMode, TransportAgent};
//!
//! async fn sync() -> localsync_core::Result<()> {
//!     let config = ParentConfig::new("server", "@backup", "/var/lib/localsync")
//!         .with_source(SourceConfig::new("contacts", "addressbook", SyncMode::TwoWay));
//!     let mut agent = ParentAgent::new(config)?;
//!     agent.start().await?;
//!
//!     let mut message = agent.allocate_for_send(5)?;
//!     message.copy_from_slice(b"HELLO");
//!     agent.send(&message).await?;
//!     agent.wait(false).await?;
//!     println!("{} bytes back", agent.get_reply()?.data.len());
//!
//!     agent.shutdown().await
//! }
//! ```

pub mod agent;
pub mod config;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod platform;
pub mod report;
pub mod shm;
pub mod sources;
pub mod suspend;
pub mod transport;

// Re-export commonly used types
pub use agent::{ChildAgent, ChildEnvironment, ParentAgent, ParentCredentials};
pub use config::{ControlConfig, Credentials, EnvVars, ParentConfig, SourceConfig, TransportConfig};
pub use engine::{
    CredentialProvider, DataSource, PasswordKey, SessionContext, SessionFactory, SessionSetup,
    SyncSession,
};
pub use error::{LocalSyncError, Result};
pub use logging::{forwarding_layer, ForwardingLayer, LogForwarder};
pub use report::{ItemCounts, SourceReport, SyncReport, SyncStatus};
pub use shm::{OutgoingMessage, SharedMessageBuffer};
pub use sources::{ActiveSourceMap, ChildSource, SyncMode};
pub use suspend::{SuspendFlags, SuspendState};
pub use transport::{Reply, TransportAgent, TransportStatus};
