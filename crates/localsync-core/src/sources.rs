//! Sync modes and the active source map sent from parent to child.

use crate::config::SourceConfig;
use crate::error::{LocalSyncError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Data direction of one source, seen from the side that owns the setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    Disabled,
    TwoWay,
    Slow,
    OneWayFromLocal,
    OneWayFromRemote,
    RefreshFromLocal,
    RefreshFromRemote,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Disabled => "disabled",
            SyncMode::TwoWay => "two-way",
            SyncMode::Slow => "slow",
            SyncMode::OneWayFromLocal => "one-way-from-local",
            SyncMode::OneWayFromRemote => "one-way-from-remote",
            SyncMode::RefreshFromLocal => "refresh-from-local",
            SyncMode::RefreshFromRemote => "refresh-from-remote",
        }
    }

    /// The same mode seen from the peer: local and remote swap.
    pub fn inverted(self) -> Self {
        match self {
            SyncMode::RefreshFromLocal => SyncMode::RefreshFromRemote,
            SyncMode::RefreshFromRemote => SyncMode::RefreshFromLocal,
            SyncMode::OneWayFromLocal => SyncMode::OneWayFromRemote,
            SyncMode::OneWayFromRemote => SyncMode::OneWayFromLocal,
            other => other,
        }
    }

    /// True if local items travel to the peer.
    pub fn sends_local_data(self) -> bool {
        matches!(
            self,
            SyncMode::TwoWay | SyncMode::Slow | SyncMode::OneWayFromLocal | SyncMode::RefreshFromLocal
        )
    }

    /// True if items from the peer are stored locally.
    pub fn receives_remote_data(self) -> bool {
        matches!(
            self,
            SyncMode::TwoWay
                | SyncMode::Slow
                | SyncMode::OneWayFromRemote
                | SyncMode::RefreshFromRemote
        )
    }
}

impl FromStr for SyncMode {
    type Err = LocalSyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "disabled" | "none" => Ok(SyncMode::Disabled),
            "two-way" => Ok(SyncMode::TwoWay),
            "slow" => Ok(SyncMode::Slow),
            "one-way-from-local" => Ok(SyncMode::OneWayFromLocal),
            "one-way-from-remote" => Ok(SyncMode::OneWayFromRemote),
            "refresh-from-local" => Ok(SyncMode::RefreshFromLocal),
            "refresh-from-remote" => Ok(SyncMode::RefreshFromRemote),
            other => Err(LocalSyncError::Validation {
                field: "sync mode".to_string(),
                message: format!("unknown sync mode '{}'", other),
            }),
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a parent source goes in the second context, and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTarget {
    pub target: String,
    pub mode: SyncMode,
}

/// Parent source name → target in the child context.
///
/// Modes are stored as configured on the parent side; the child inverts
/// them when it applies the map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActiveSourceMap(BTreeMap<String, SourceTarget>);

/// One source as the child runs it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildSource {
    /// Source name inside the child's context.
    pub name: String,
    /// Name of the parent source it syncs with.
    pub remote: String,
    /// Mode from the child's point of view.
    pub mode: SyncMode,
}

impl ActiveSourceMap {
    /// Build the map from the parent configuration, skipping disabled sources.
    pub fn from_sources(sources: &[SourceConfig]) -> Self {
        let map = sources
            .iter()
            .filter(|source| source.mode != SyncMode::Disabled)
            .map(|source| {
                (
                    source.name.clone(),
                    SourceTarget {
                        target: source.uri_non_empty().to_string(),
                        mode: source.mode,
                    },
                )
            })
            .collect();
        Self(map)
    }

    pub fn insert(&mut self, source: impl Into<String>, target: impl Into<String>, mode: SyncMode) {
        self.0.insert(
            source.into(),
            SourceTarget {
                target: target.into(),
                mode,
            },
        );
    }

    pub fn get(&self, source: &str) -> Option<&SourceTarget> {
        self.0.get(source)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SourceTarget)> {
        self.0.iter()
    }

    /// Apply the map on the child side.
    ///
    /// `available` lists the sources configured in the child context. Every
    /// target must exist and may be targeted only once; directions are
    /// inverted.
    pub fn apply_to_child(
        &self,
        client_context: &str,
        parent_config: &str,
        available: &BTreeSet<String>,
    ) -> Result<Vec<ChildSource>> {
        let mut claimed = BTreeSet::new();
        let mut sources = Vec::with_capacity(self.0.len());

        for (source_name, target) in &self.0 {
            if target.mode == SyncMode::Disabled {
                continue;
            }
            let full_target_name = format!("{}/{}", client_context, target.target);
            if target.target.is_empty() {
                return Err(LocalSyncError::Config {
                    message: "missing URI for one of the sources".to_string(),
                });
            }
            if !available.contains(&target.target) {
                return Err(LocalSyncError::Config {
                    message: format!("{}: source not configured", full_target_name),
                });
            }
            if !claimed.insert(target.target.clone()) {
                return Err(LocalSyncError::Config {
                    message: format!(
                        "{}: source targeted twice by {}",
                        full_target_name, parent_config
                    ),
                });
            }
            sources.push(ChildSource {
                name: target.target.clone(),
                remote: source_name.clone(),
                mode: target.mode.inverted(),
            });
        }

        Ok(sources)
    }
}
