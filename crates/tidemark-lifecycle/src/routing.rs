//! Routing documents read by query routers.
//!
//! Every enabled table gets one document under `{key_prefix}/{table_id}`
//! naming its current cluster, the read alias scheme and the cluster
//! history. After a publish the version key is bumped and readers are
//! notified.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use tidemark_core::{LogicalTable, RoutingSettings, StorageClusterRecord};
use tidemark_state::StateStore;

use crate::error::{LifecycleError, LifecycleResult};

/// Read alias template understood by routers.
pub const ALIAS_FORMAT: &str = "{index}_{time}_read";

/// Day layout routers use to render `{time}`.
pub const ROUTER_DATE_FORMAT: &str = "20060102";

/// Key/value store routing documents are pushed to.
#[async_trait]
pub trait RoutingPublisher: Send + Sync {
    async fn put(&self, key: &str, value: &Value) -> LifecycleResult<()>;

    async fn get(&self, key: &str) -> LifecycleResult<Option<Value>>;

    async fn delete(&self, key: &str) -> LifecycleResult<()>;

    /// Tell readers that `key` changed.
    async fn notify(&self, key: &str) -> LifecycleResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRecordEntry {
    pub storage_id: u32,
    /// Unix seconds, 0 when never enabled.
    pub enable_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingEntry {
    pub storage_id: u32,
    pub alias_format: String,
    pub date_format: String,
    pub date_step: i64,
    pub storage_cluster_records: Vec<ClusterRecordEntry>,
}

/// Live storage history, newest first.
pub fn compose_cluster_records(records: &[StorageClusterRecord]) -> Vec<ClusterRecordEntry> {
    let mut live: Vec<&StorageClusterRecord> = records.iter().filter(|r| !r.is_deleted).collect();
    live.sort_by(|a, b| b.create_time.cmp(&a.create_time));
    live.into_iter()
        .map(|r| ClusterRecordEntry {
            storage_id: r.cluster_id,
            enable_time: r.enable_time.map_or(0, |t| t.timestamp()),
        })
        .collect()
}

pub fn routing_entry(table: &LogicalTable, records: &[StorageClusterRecord]) -> RoutingEntry {
    RoutingEntry {
        storage_id: table.storage_cluster_id,
        alias_format: ALIAS_FORMAT.to_string(),
        date_format: ROUTER_DATE_FORMAT.to_string(),
        date_step: table.slice_gap,
        storage_cluster_records: compose_cluster_records(records),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingSummary {
    pub published: Vec<String>,
    pub removed: Vec<String>,
    pub failed: Vec<String>,
}

/// Publish routing documents for `tables` and bump the version key.
pub async fn publish_routing(
    publisher: &dyn RoutingPublisher,
    settings: &RoutingSettings,
    store: &StateStore,
    tables: &[LogicalTable],
    now: DateTime<Utc>,
) -> LifecycleResult<RoutingSummary> {
    let mut summary = RoutingSummary::default();
    for table in tables {
        let key = format!("{}/{}", settings.key_prefix, table.table_id);
        let result = if table.is_index_enable() {
            publish_one(publisher, store, table, &key).await
        } else {
            unpublish_one(publisher, &key).await
        };
        match result {
            Ok(true) if table.is_index_enable() => summary.published.push(table.table_id.clone()),
            Ok(true) => summary.removed.push(table.table_id.clone()),
            Ok(false) => {}
            Err(e) => {
                warn!(table_id = %table.table_id, %key, error = %e, "routing publish failed");
                summary.failed.push(table.table_id.clone());
            }
        }
    }

    publisher
        .put(&settings.version_key, &json!({ "time": now.timestamp() }))
        .await?;
    publisher.notify(&settings.version_key).await?;
    info!(
        published = summary.published.len(),
        removed = summary.removed.len(),
        failed = summary.failed.len(),
        "routing refreshed"
    );
    Ok(summary)
}

async fn publish_one(
    publisher: &dyn RoutingPublisher,
    store: &StateStore,
    table: &LogicalTable,
    key: &str,
) -> LifecycleResult<bool> {
    let records = store.list_cluster_records(&table.table_id)?;
    let entry = routing_entry(table, &records);
    let value = serde_json::to_value(&entry).map_err(|e| LifecycleError::Routing(e.to_string()))?;
    publisher.put(key, &value).await?;
    debug!(table_id = %table.table_id, %key, "routing published");
    Ok(true)
}

async fn unpublish_one(publisher: &dyn RoutingPublisher, key: &str) -> LifecycleResult<bool> {
    if publisher.get(key).await?.is_none() {
        return Ok(false);
    }
    publisher.delete(key).await?;
    info!(%key, "routing removed for disabled table");
    Ok(true)
}

// ── State store publisher ──────────────────────────────────────────

/// Keeps routing documents in the local state store. Each notification
/// bumps a version readers can watch.
pub struct StoreRoutingPublisher {
    store: StateStore,
    version: watch::Sender<u64>,
}

impl StoreRoutingPublisher {
    pub fn new(store: StateStore) -> Self {
        let (version, _) = watch::channel(0);
        Self { store, version }
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}

#[async_trait]
impl RoutingPublisher for StoreRoutingPublisher {
    async fn put(&self, key: &str, value: &Value) -> LifecycleResult<()> {
        Ok(self.store.put_routing(key, value)?)
    }

    async fn get(&self, key: &str) -> LifecycleResult<Option<Value>> {
        Ok(self.store.get_routing(key)?)
    }

    async fn delete(&self, key: &str) -> LifecycleResult<()> {
        self.store.delete_routing(key)?;
        Ok(())
    }

    async fn notify(&self, key: &str) -> LifecycleResult<()> {
        self.version.send_modify(|v| *v += 1);
        debug!(%key, version = *self.version.borrow(), "routing version bumped");
        Ok(())
    }
}

// ── In-memory publisher ────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryRoutingPublisher {
    docs: Mutex<BTreeMap<String, Value>>,
    notified: Mutex<Vec<String>>,
    failing: AtomicBool,
}

impl MemoryRoutingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every `put` from now on.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn docs(&self) -> BTreeMap<String, Value> {
        self.docs.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn notifications(&self) -> Vec<String> {
        self.notified
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl RoutingPublisher for MemoryRoutingPublisher {
    async fn put(&self, key: &str, value: &Value) -> LifecycleResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(LifecycleError::Routing(format!("put {key} refused")));
        }
        self.docs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn get(&self, key: &str) -> LifecycleResult<Option<Value>> {
        Ok(self
            .docs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    async fn delete(&self, key: &str) -> LifecycleResult<()> {
        self.docs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    async fn notify(&self, key: &str) -> LifecycleResult<()> {
        self.notified
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(key.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fixture, fixed_now};
    use chrono::TimeDelta;

    fn record(cluster_id: u32, created_hours_ago: i64, deleted: bool) -> StorageClusterRecord {
        let at = fixed_now() - TimeDelta::hours(created_hours_ago);
        let mut record = StorageClusterRecord::current("t", cluster_id, at);
        record.is_deleted = deleted;
        record
    }

    #[test]
    fn records_newest_first_without_deleted() {
        let mut never_enabled = record(4, 1, false);
        never_enabled.enable_time = None;
        let records = vec![
            record(1, 48, false),
            record(2, 24, true),
            record(3, 12, false),
            never_enabled,
        ];
        let composed = compose_cluster_records(&records);
        assert_eq!(
            composed,
            vec![
                ClusterRecordEntry { storage_id: 4, enable_time: 0 },
                ClusterRecordEntry {
                    storage_id: 3,
                    enable_time: (fixed_now() - TimeDelta::hours(12)).timestamp()
                },
                ClusterRecordEntry {
                    storage_id: 1,
                    enable_time: (fixed_now() - TimeDelta::hours(48)).timestamp()
                },
            ]
        );
    }

    #[tokio::test]
    async fn publishes_enabled_and_removes_disabled() {
        let fx = Fixture::new();
        let settings = RoutingSettings::default();
        let publisher = MemoryRoutingPublisher::new();
        let key = format!("{}/{}", settings.key_prefix, fx.table_id());

        let summary = publish_routing(&publisher, &settings, &fx.store, &[fx.table.clone()], fx.now)
            .await
            .unwrap();
        assert_eq!(summary.published, vec![fx.table_id().to_string()]);

        let docs = publisher.docs();
        let entry: RoutingEntry = serde_json::from_value(docs[&key].clone()).unwrap();
        assert_eq!(entry.storage_id, 1);
        assert_eq!(entry.alias_format, "{index}_{time}_read");
        assert_eq!(entry.date_format, "20060102");
        assert_eq!(entry.date_step, 120);
        assert_eq!(entry.storage_cluster_records.len(), 1);
        assert_eq!(docs[&settings.version_key], json!({"time": fx.now.timestamp()}));
        assert_eq!(publisher.notifications(), vec![settings.version_key.clone()]);

        let mut disabled = fx.table.clone();
        disabled.is_enabled = false;
        let summary = publish_routing(&publisher, &settings, &fx.store, &[disabled], fx.now)
            .await
            .unwrap();
        assert_eq!(summary.removed, vec![fx.table_id().to_string()]);
        assert!(!publisher.docs().contains_key(&key));
    }

    #[tokio::test]
    async fn version_put_failure_is_an_error() {
        let fx = Fixture::new();
        let settings = RoutingSettings::default();
        let publisher = MemoryRoutingPublisher::new();
        publisher.set_failing(true);

        let result =
            publish_routing(&publisher, &settings, &fx.store, &[fx.table.clone()], fx.now).await;
        assert!(matches!(result, Err(LifecycleError::Routing(_))));
    }

    #[tokio::test]
    async fn store_publisher_persists_and_bumps_version() {
        let fx = Fixture::new();
        let settings = RoutingSettings::default();
        let publisher = StoreRoutingPublisher::new(fx.store.clone());
        let mut version = publisher.subscribe();

        publish_routing(&publisher, &settings, &fx.store, &[fx.table.clone()], fx.now)
            .await
            .unwrap();
        assert!(version.has_changed().unwrap());
        assert_eq!(*version.borrow_and_update(), 1);

        let docs = fx.store.list_routing(&settings.key_prefix).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].0, format!("{}/{}", settings.key_prefix, fx.table_id()));
    }
}
