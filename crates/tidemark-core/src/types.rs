//! Shared domain types: clusters, logical tables, storage history and
//! snapshot bookkeeping.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::bucket::{self, DEFAULT_DATE_FORMAT};
use crate::error::{CoreError, CoreResult};
use crate::naming;

// ── Clusters ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterType {
    Elasticsearch,
    Kafka,
    Redis,
    Influxdb,
    Doris,
}

impl ClusterType {
    pub fn is_search_index(self) -> bool {
        self == ClusterType::Elasticsearch
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClusterType::Elasticsearch => "elasticsearch",
            ClusterType::Kafka => "kafka",
            ClusterType::Redis => "redis",
            ClusterType::Influxdb => "influxdb",
            ClusterType::Doris => "doris",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSettings {
    /// Verify the server certificate chain.
    #[serde(default = "default_true")]
    pub verify: bool,
    /// Extra PEM-encoded CA certificates trusted for this cluster.
    #[serde(default)]
    pub ca_cert_pem: Option<String>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            verify: true,
            ca_cert_pem: None,
        }
    }
}

/// A storage cluster known to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageCluster {
    pub cluster_id: u32,
    pub name: String,
    pub cluster_type: ClusterType,
    pub domain_name: String,
    pub port: u16,
    /// `http` or `https`.
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub is_auth: bool,
    #[serde(default)]
    pub is_default_cluster: bool,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub tls: TlsSettings,
}

impl StorageCluster {
    pub fn table_key(&self) -> String {
        self.cluster_id.to_string()
    }

    /// `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.domain_name, self.port)
    }

    pub fn uses_tls(&self) -> bool {
        self.schema.eq_ignore_ascii_case("https")
    }

    /// Basic-auth credentials, when both halves are present.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() => Some((user, pass)),
            _ => None,
        }
    }

    /// Leading number of `version`, e.g. `7` for `7.10.2`.
    pub fn major_version(&self) -> Option<u32> {
        self.version
            .as_deref()
            .and_then(|v| v.split('.').next())
            .and_then(|major| major.trim().parse().ok())
    }
}

// ── Logical tables ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationType {
    Include,
    Exclude,
    Require,
}

impl AllocationType {
    pub fn as_str(self) -> &'static str {
        match self {
            AllocationType::Include => "include",
            AllocationType::Exclude => "exclude",
            AllocationType::Require => "require",
        }
    }
}

/// Where aging indices are moved once they leave the hot window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmPhaseSettings {
    pub allocation_attr_name: String,
    pub allocation_attr_value: String,
    pub allocation_type: AllocationType,
}

impl WarmPhaseSettings {
    /// Flat index setting key, e.g. `index.routing.allocation.require.box_type`.
    pub fn setting_key(&self) -> String {
        format!(
            "index.routing.allocation.{}.{}",
            self.allocation_type.as_str(),
            self.allocation_attr_name
        )
    }

    fn check(&self) -> CoreResult<()> {
        if self.allocation_attr_name.trim().is_empty() {
            return Err(CoreError::InvalidWarmPhase(
                "allocation_attr_name is empty".to_string(),
            ));
        }
        if self.allocation_attr_value.trim().is_empty() {
            return Err(CoreError::InvalidWarmPhase(
                "allocation_attr_value is empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// A logical result table and its rotation configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalTable {
    pub table_id: String,
    pub storage_cluster_id: u32,
    #[serde(default = "default_date_format")]
    pub date_format: String,
    /// Rotation threshold in GB.
    #[serde(default = "default_slice_size")]
    pub slice_size: u64,
    /// Minutes between alias checkpoints.
    #[serde(default = "default_slice_gap")]
    pub slice_gap: i64,
    /// Days.
    #[serde(default = "default_retention")]
    pub retention: i64,
    #[serde(default)]
    pub warm_phase_days: i64,
    #[serde(default)]
    pub warm_phase_settings: Option<WarmPhaseSettings>,
    #[serde(default)]
    pub archive_index_days: i64,
    /// Hours east of UTC.
    #[serde(default)]
    pub time_zone: i32,
    #[serde(default)]
    pub index_settings: Map<String, Value>,
    #[serde(default)]
    pub mapping_settings: Map<String, Value>,
    /// Declared field properties, including `{"type": "alias", "path": ..}`
    /// entries.
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub long_term_storage_indices: Vec<String>,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    #[serde(default)]
    pub is_deleted: bool,
}

impl LogicalTable {
    /// A table with stock rotation settings.
    pub fn new(table_id: impl Into<String>, storage_cluster_id: u32) -> Self {
        Self {
            table_id: table_id.into(),
            storage_cluster_id,
            date_format: default_date_format(),
            slice_size: default_slice_size(),
            slice_gap: default_slice_gap(),
            retention: default_retention(),
            warm_phase_days: 0,
            warm_phase_settings: None,
            archive_index_days: 0,
            time_zone: 0,
            index_settings: Map::new(),
            mapping_settings: Map::new(),
            properties: Map::new(),
            long_term_storage_indices: Vec::new(),
            is_enabled: true,
            is_deleted: false,
        }
    }

    pub fn table_key(&self) -> &str {
        &self.table_id
    }

    /// Base used in index and alias names.
    pub fn index_base(&self) -> String {
        naming::base_name(&self.table_id)
    }

    /// Lifecycle work only runs for enabled, undeleted tables.
    pub fn is_index_enable(&self) -> bool {
        self.is_enabled && !self.is_deleted
    }

    pub fn local_now(&self, utc: DateTime<Utc>) -> NaiveDateTime {
        bucket::local_now(utc, self.time_zone)
    }

    /// Body sent when creating a physical index.
    pub fn index_body(&self) -> Value {
        let mut mappings = self.mapping_settings.clone();
        mappings.insert("properties".to_string(), Value::Object(self.properties.clone()));
        json!({
            "settings": Value::Object(self.index_settings.clone()),
            "mappings": Value::Object(mappings),
        })
    }

    /// Declared properties of type `alias`.
    pub fn alias_properties(&self) -> Map<String, Value> {
        self.properties
            .iter()
            .filter(|(_, v)| v.get("type").and_then(Value::as_str) == Some("alias"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn warm_phase(&self) -> Option<&WarmPhaseSettings> {
        if self.warm_phase_days > 0 {
            self.warm_phase_settings.as_ref()
        } else {
            None
        }
    }

    /// Validate rotation settings that would otherwise fail later, at
    /// naming or reallocation time.
    pub fn validate(&self) -> CoreResult<()> {
        if self.table_id.trim().is_empty() {
            return Err(CoreError::EmptyTableId);
        }
        // A retention below one day puts the live bucket inside the expiry window.
        if self.retention < 1 {
            return Err(CoreError::InvalidRetention(self.retention));
        }
        if self.slice_size == 0 {
            return Err(CoreError::InvalidSliceSize);
        }
        if self.slice_gap <= 0 {
            return Err(CoreError::InvalidSliceGap(self.slice_gap));
        }
        bucket::check_date_format(&self.date_format)?;
        bucket::check_time_zone(self.time_zone)?;
        if self.warm_phase_days > 0 {
            match &self.warm_phase_settings {
                Some(settings) => settings.check()?,
                None => {
                    return Err(CoreError::InvalidWarmPhase(
                        "warm_phase_days > 0 requires warm_phase_settings".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

// ── Storage history ────────────────────────────────────────────────

/// Which cluster served a table, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageClusterRecord {
    pub table_id: String,
    pub cluster_id: u32,
    pub is_current: bool,
    /// No index on this cluster holds data for the table any more.
    pub is_deleted: bool,
    pub create_time: DateTime<Utc>,
    pub enable_time: Option<DateTime<Utc>>,
    pub disable_time: Option<DateTime<Utc>>,
    pub delete_time: Option<DateTime<Utc>>,
}

impl StorageClusterRecord {
    pub fn current(table_id: &str, cluster_id: u32, now: DateTime<Utc>) -> Self {
        Self {
            table_id: table_id.to_string(),
            cluster_id,
            is_current: true,
            is_deleted: false,
            create_time: now,
            enable_time: Some(now),
            disable_time: None,
            delete_time: None,
        }
    }

    /// `{table_id}:{create_micros}:{cluster_id}`, so a prefix scan yields a
    /// table's history in creation order.
    pub fn table_key(&self) -> String {
        format!(
            "{}:{:020}:{}",
            self.table_id,
            self.create_time.timestamp_micros().max(0),
            self.cluster_id
        )
    }
}

// ── Snapshots ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotPolicyStatus {
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPolicy {
    pub table_id: String,
    pub target_repository: String,
    /// How long snapshots are kept; `0` keeps them forever.
    pub snapshot_days: i64,
    pub status: SnapshotPolicyStatus,
}

impl SnapshotPolicy {
    pub fn is_permanent(&self) -> bool {
        self.snapshot_days == 0
    }

    pub fn is_stopped(&self) -> bool {
        self.status == SnapshotPolicyStatus::Stopped
    }
}

/// One archived index inside a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotIndice {
    pub table_id: String,
    pub snapshot_name: String,
    pub index_name: String,
    pub cluster_id: u32,
    pub repository_name: String,
    pub doc_count: u64,
    pub store_size: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl SnapshotIndice {
    pub fn table_key(&self) -> String {
        format!("{}/{}/{}", self.table_id, self.snapshot_name, self.index_name)
    }
}

fn default_true() -> bool {
    true
}

fn default_schema() -> String {
    "http".to_string()
}

fn default_date_format() -> String {
    DEFAULT_DATE_FORMAT.to_string()
}

fn default_slice_size() -> u64 {
    500
}

fn default_slice_gap() -> i64 {
    120
}

fn default_retention() -> i64 {
    30
}
