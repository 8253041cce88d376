//! Environment contract between the parent and the helper it spawns.
//!
//! Its presence is how a process learns that it runs as a local sync child.

use crate::config::EnvVars;
use crate::error::{LocalSyncError, Result};
use crate::shm::RegionHandles;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;

/// What the helper inherits from its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildEnvironment {
    pub control_addr: SocketAddr,
    /// One-time token presented in the hello frame.
    pub token: String,
    pub max_message_size: usize,
    pub regions: RegionHandles,
}

impl ChildEnvironment {
    /// Read the contract from the process environment.
    ///
    /// Returns `Ok(None)` if this process was not started as a child.
    pub fn from_env() -> Result<Option<Self>> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the contract through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<Self>> {
        let Some(addr) = lookup(EnvVars::CONTROL_ADDR) else {
            return Ok(None);
        };
        let required = |key: &str| {
            lookup(key).ok_or_else(|| LocalSyncError::Config {
                message: format!("{} is not set", key),
            })
        };

        let control_addr = addr.parse().map_err(|e| LocalSyncError::Config {
            message: format!("invalid {} '{}': {}", EnvVars::CONTROL_ADDR, addr, e),
        })?;
        let size = required(EnvVars::MESSAGE_SIZE)?;
        let max_message_size = size.parse().map_err(|e| LocalSyncError::Config {
            message: format!("invalid {} '{}': {}", EnvVars::MESSAGE_SIZE, size, e),
        })?;

        Ok(Some(Self {
            control_addr,
            token: required(EnvVars::CONTROL_TOKEN)?,
            max_message_size,
            regions: RegionHandles {
                parent_to_child: PathBuf::from(required(EnvVars::SHM_PARENT_TO_CHILD)?),
                child_to_parent: PathBuf::from(required(EnvVars::SHM_CHILD_TO_PARENT)?),
            },
        }))
    }

    /// Environment variables the helper gets.
    pub fn to_env_vars(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert(EnvVars::CONTROL_ADDR.to_string(), self.control_addr.to_string());
        vars.insert(EnvVars::CONTROL_TOKEN.to_string(), self.token.clone());
        vars.insert(EnvVars::MESSAGE_SIZE.to_string(), self.max_message_size.to_string());
        vars.insert(
            EnvVars::SHM_PARENT_TO_CHILD.to_string(),
            self.regions.parent_to_child.display().to_string(),
        );
        vars.insert(
            EnvVars::SHM_CHILD_TO_PARENT.to_string(),
            self.regions.child_to_parent.display().to_string(),
        );
        vars
    }
}
