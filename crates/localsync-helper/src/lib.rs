//! Localsync Helper - child program of the local transport.
//!
//! The binary connects to the parent named in its environment and runs an
//! [`ItemExchangeSession`] over [`DirectorySource`]s of the child context.
//! The library half exists so the session can be tested without a process.

pub mod session;
pub mod source;

pub use session::{
    ItemBatch, ItemExchangeFactory, ItemExchangeSession, SourceChanges, ITEMS_CONTENT_TYPE,
    PASSWORD_PROMPT_PROPERTY, SESSION_LOG_FILE,
};
pub use source::{revision, DirectorySource};
