//! Wire-level values exchanged with a search cluster.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthColor {
    Green,
    Yellow,
    Red,
}

impl HealthColor {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "green" => Some(HealthColor::Green),
            "yellow" => Some(HealthColor::Yellow),
            "red" => Some(HealthColor::Red),
            _ => None,
        }
    }
}

impl fmt::Display for HealthColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthColor::Green => "green",
            HealthColor::Yellow => "yellow",
            HealthColor::Red => "red",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexHealth {
    pub status: HealthColor,
    pub number_of_shards: u32,
    pub number_of_replicas: u32,
    pub active_shards: u32,
    pub unassigned_shards: u32,
}

/// `cluster.health` at `level=indices`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterHealth {
    pub status: HealthColor,
    pub indices: BTreeMap<String, IndexHealth>,
}

impl ClusterHealth {
    /// Every listed index is green and at least one is listed.
    pub fn all_green(&self) -> bool {
        !self.indices.is_empty() && self.indices.values().all(|h| h.status == HealthColor::Green)
    }
}

/// Primary-shard stats of one index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub size_in_bytes: u64,
    pub doc_count: u64,
}

/// One entry of an atomic `_aliases` request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AliasAction {
    Add { index: String, alias: String },
    Remove { index: String, alias: String },
}

impl AliasAction {
    pub fn add(index: impl Into<String>, alias: impl Into<String>) -> Self {
        AliasAction::Add {
            index: index.into(),
            alias: alias.into(),
        }
    }

    pub fn remove(index: impl Into<String>, alias: impl Into<String>) -> Self {
        AliasAction::Remove {
            index: index.into(),
            alias: alias.into(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            AliasAction::Add { index, alias } => json!({"add": {"index": index, "alias": alias}}),
            AliasAction::Remove { index, alias } => {
                json!({"remove": {"index": index, "alias": alias}})
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnapshotState {
    InProgress,
    Success,
    Failed,
    Partial,
    Incompatible,
}

impl SnapshotState {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "IN_PROGRESS" => Some(SnapshotState::InProgress),
            "SUCCESS" => Some(SnapshotState::Success),
            "FAILED" => Some(SnapshotState::Failed),
            "PARTIAL" => Some(SnapshotState::Partial),
            "INCOMPATIBLE" => Some(SnapshotState::Incompatible),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub snapshot: String,
    pub state: SnapshotState,
    pub indices: Vec<String>,
    pub start_time_in_millis: Option<i64>,
}

/// Summary of one index as reported by stats + health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub index: String,
    pub size_gb: f64,
    pub doc_count: u64,
    pub health: Option<HealthColor>,
    pub number_of_shards: u32,
    pub number_of_replicas: u32,
}

pub const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;
