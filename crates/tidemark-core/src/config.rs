//! tidemark.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;
use crate::types::{LogicalTable, StorageCluster};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TidemarkConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub lifecycle: LifecycleSettings,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub routing: RoutingSettings,
    /// Clusters registered on startup (upserted by id).
    #[serde(default)]
    pub clusters: Vec<StorageCluster>,
    /// Tables provisioned on startup: created when missing, settings
    /// refreshed otherwise.
    #[serde(default)]
    pub tables: Vec<LogicalTable>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Seconds between lifecycle cycles.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Tables processed in parallel.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            interval_secs: default_interval_secs(),
            concurrency: default_concurrency(),
            json_logs: false,
        }
    }
}

/// Knobs shared by every lifecycle stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleSettings {
    /// Minutes of future buckets that get aliases ahead of time.
    #[serde(default = "default_ahead_time")]
    pub ahead_time: i64,
    /// Extra days an alias survives past retention, so queries spanning
    /// midnight still resolve.
    #[serde(default = "default_alias_delay_days")]
    pub alias_expired_delay_days: i64,
    /// Aliases whose bucket cannot be read are kept (true) or expired.
    #[serde(default = "default_true")]
    pub retain_invalid_alias: bool,
    #[serde(default)]
    pub retry: RetryPolicies,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            ahead_time: default_ahead_time(),
            alias_expired_delay_days: default_alias_delay_days(),
            retain_invalid_alias: true,
            retry: RetryPolicies::default(),
        }
    }
}

/// One retry policy per cluster call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicies {
    pub current_index: RetryPolicy,
    pub index_ready: RetryPolicy,
    pub update_aliases: RetryPolicy,
    pub create_index: RetryPolicy,
    pub cluster_health: RetryPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            current_index: RetryPolicy::fixed(3, Duration::from_secs(2)),
            index_ready: RetryPolicy::exponential(3, Duration::from_secs(1), Duration::from_secs(10)),
            update_aliases: RetryPolicy::exponential(
                4,
                Duration::from_secs(1),
                Duration::from_secs(10),
            ),
            create_index: RetryPolicy::fixed(3, Duration::from_secs(3)),
            cluster_health: RetryPolicy::fixed(3, Duration::from_secs(1)),
        }
    }
}

impl RetryPolicies {
    /// Same attempt counts, no pauses.
    pub fn immediate() -> Self {
        let d = Self::default();
        Self {
            current_index: RetryPolicy::immediate(d.current_index.max_attempts),
            index_ready: RetryPolicy::immediate(d.index_ready.max_attempts),
            update_aliases: RetryPolicy::immediate(d.update_aliases.max_attempts),
            create_index: RetryPolicy::immediate(d.create_index.max_attempts),
            cluster_health: RetryPolicy::immediate(d.cluster_health.max_attempts),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingSettings {
    /// Key prefix under which per-table routing documents are published.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Key bumped after every publish so readers know to reload.
    #[serde(default = "default_version_key")]
    pub version_key: String,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            version_key: default_version_key(),
        }
    }
}

impl TidemarkConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TidemarkConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/tidemark")
}

fn default_interval_secs() -> u64 {
    600
}

fn default_concurrency() -> usize {
    8
}

fn default_ahead_time() -> i64 {
    1440
}

fn default_alias_delay_days() -> i64 {
    1
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_key_prefix() -> String {
    "tidemark/data/es/info".to_string()
}

fn default_version_key() -> String {
    "tidemark/version/es/info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Backoff;
    use crate::types::ClusterType;

    #[test]
    fn empty_config_uses_defaults() {
        let config: TidemarkConfig = toml::from_str("").unwrap();
        assert_eq!(config.daemon.interval_secs, 600);
        assert_eq!(config.lifecycle.ahead_time, 1440);
        assert_eq!(config.lifecycle.alias_expired_delay_days, 1);
        assert!(config.lifecycle.retain_invalid_alias);
        assert_eq!(config.lifecycle.retry.update_aliases.max_attempts, 4);
        assert_eq!(config.client.timeout(), Duration::from_secs(30));
        assert!(config.clusters.is_empty());
        assert!(config.tables.is_empty());
    }

    #[test]
    fn parse_full() {
        let toml_str = r#"
[daemon]
data_dir = "/tmp/tidemark"
interval_secs = 60
concurrency = 2
json_logs = true

[lifecycle]
ahead_time = 720
retain_invalid_alias = false

[lifecycle.retry]
current_index = { max_attempts = 1, backoff = { kind = "fixed", delay_ms = 0 } }
index_ready = { max_attempts = 5, backoff = { kind = "exponential", min_ms = 500, max_ms = 4000 } }
update_aliases = { max_attempts = 4, backoff = { kind = "exponential", min_ms = 1000, max_ms = 10000 } }
create_index = { max_attempts = 3, backoff = { kind = "fixed", delay_ms = 3000 } }
cluster_health = { max_attempts = 3, backoff = { kind = "fixed", delay_ms = 1000 } }

[routing]
key_prefix = "custom/prefix"

[[clusters]]
cluster_id = 1
name = "es-default"
cluster_type = "elasticsearch"
domain_name = "127.0.0.1"
port = 9200
is_default_cluster = true

[[tables]]
table_id = "2_bklog.nginx"
storage_cluster_id = 1
retention = 7

[tables.properties]
log = { type = "text" }
"#;
        let config: TidemarkConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.daemon.data_dir, PathBuf::from("/tmp/tidemark"));
        assert!(config.daemon.json_logs);
        assert_eq!(config.lifecycle.ahead_time, 720);
        assert!(!config.lifecycle.retain_invalid_alias);
        assert_eq!(
            config.lifecycle.retry.index_ready.backoff,
            Backoff::Exponential {
                min_ms: 500,
                max_ms: 4000
            }
        );
        assert_eq!(config.routing.key_prefix, "custom/prefix");
        assert_eq!(config.clusters.len(), 1);
        assert_eq!(config.clusters[0].cluster_type, ClusterType::Elasticsearch);
        assert_eq!(config.clusters[0].schema, "http");
        assert_eq!(config.tables.len(), 1);
        let table = &config.tables[0];
        assert_eq!(table.retention, 7);
        assert_eq!(table.slice_gap, 120);
        assert_eq!(table.properties["log"]["type"], "text");
    }

    #[test]
    fn round_trips_through_toml() {
        let config = TidemarkConfig::default();
        let text = config.to_toml_string().unwrap();
        let back: TidemarkConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.lifecycle, config.lifecycle);
    }
}
