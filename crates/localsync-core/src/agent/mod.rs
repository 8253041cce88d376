//! The two halves of the local transport.
//!
//! - `parent` - Spawns the helper and exchanges messages with it
//! - `child` - Runs inside the helper, serving the other half of the session
//! - `environment` - What the parent passes to the helper on spawn

mod child;
mod environment;
mod parent;

pub use child::{ChildAgent, ParentCredentials};
pub use environment::ChildEnvironment;
pub use parent::ParentAgent;
