//! Per-run view of one table on one cluster.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{debug, warn};

use tidemark_client::retry::{poll_until, retry};
use tidemark_client::{BYTES_PER_GB, ClientError, HealthColor, IndexInfo, SearchClient};
use tidemark_core::bucket;
use tidemark_core::naming::is_restore_index;
use tidemark_core::{IndexNaming, LifecycleSettings, LogicalTable, StorageCluster};
use tidemark_state::StateStore;

use crate::error::LifecycleResult;
use crate::expiry::{AliasGroup, ExpiryWindow, group_expired_alias};
use crate::metrics::LifecycleMetrics;

/// Everything one lifecycle stage needs to act on a table.
///
/// Built fresh for every run so the table and cluster records are current.
/// `now` is fixed at construction; every stage of a run sees the same clock.
pub struct IndexLifecycle {
    pub(crate) table: LogicalTable,
    pub(crate) cluster: StorageCluster,
    pub(crate) client: Arc<dyn SearchClient>,
    pub(crate) naming: IndexNaming,
    pub(crate) settings: LifecycleSettings,
    pub(crate) store: StateStore,
    pub(crate) metrics: Arc<LifecycleMetrics>,
    pub(crate) now: DateTime<Utc>,
}

impl IndexLifecycle {
    pub fn new(
        table: LogicalTable,
        cluster: StorageCluster,
        client: Arc<dyn SearchClient>,
        settings: LifecycleSettings,
        store: StateStore,
        metrics: Arc<LifecycleMetrics>,
        now: DateTime<Utc>,
    ) -> LifecycleResult<Self> {
        let naming = IndexNaming::new(&table.table_id)?;
        Ok(Self {
            table,
            cluster,
            client,
            naming,
            settings,
            store,
            metrics,
            now,
        })
    }

    pub fn table(&self) -> &LogicalTable {
        &self.table
    }

    pub fn cluster(&self) -> &StorageCluster {
        &self.cluster
    }

    pub fn naming(&self) -> &IndexNaming {
        &self.naming
    }

    pub fn table_id(&self) -> &str {
        &self.table.table_id
    }

    pub fn cluster_id(&self) -> u32 {
        self.cluster.cluster_id
    }

    /// Wall-clock time in the table's time zone.
    pub fn local_now(&self) -> NaiveDateTime {
        self.table.local_now(self.now)
    }

    pub fn format_bucket(&self, at: NaiveDateTime) -> LifecycleResult<String> {
        Ok(bucket::format_bucket(at, &self.table.date_format)?)
    }

    pub fn now_bucket(&self) -> LifecycleResult<String> {
        self.format_bucket(self.local_now())
    }

    /// `index -> aliases` for every index that may belong to the table.
    pub async fn alias_list(&self) -> LifecycleResult<BTreeMap<String, Vec<String>>> {
        Ok(self
            .client
            .get_alias(&self.naming.alias_lookup_pattern(), None)
            .await?)
    }

    /// Group aliases by expiry. `with_delay` adds the configured alias delay.
    pub fn group_aliases(
        &self,
        aliases: &BTreeMap<String, Vec<String>>,
        days: i64,
        with_delay: bool,
    ) -> BTreeMap<String, AliasGroup> {
        let days = if with_delay {
            days + self.settings.alias_expired_delay_days
        } else {
            days
        };
        let window = ExpiryWindow {
            naming: &self.naming,
            date_format: &self.table.date_format,
            now: self.local_now(),
            days,
            retain_invalid: self.settings.retain_invalid_alias,
        };
        group_expired_alias(aliases, &window)
    }

    /// `index -> aliases` restricted to the table's own indices.
    ///
    /// The lookup pattern also matches restore copies and tables whose
    /// base name ends with ours; both are dropped here.
    pub async fn own_alias_list(&self) -> LifecycleResult<BTreeMap<String, Vec<String>>> {
        let mut aliases = self.alias_list().await?;
        aliases.retain(|index, _| !is_restore_index(index) && self.naming.parse_index(index).is_ok());
        Ok(aliases)
    }

    /// Alias groups of the table's own indices at retention.
    pub async fn retention_groups(&self) -> LifecycleResult<BTreeMap<String, AliasGroup>> {
        let aliases = self.own_alias_list().await?;
        Ok(self.group_aliases(&aliases, self.table.retention, true))
    }

    /// The same table seen through another cluster, sharing clock and state.
    pub fn on_cluster(&self, cluster: StorageCluster, client: Arc<dyn SearchClient>) -> Self {
        Self {
            table: self.table.clone(),
            cluster,
            client,
            naming: self.naming.clone(),
            settings: self.settings.clone(),
            store: self.store.clone(),
            metrics: Arc::clone(&self.metrics),
            now: self.now,
        }
    }

    /// Whether `index` is exempt from alias pruning and deletion.
    pub fn is_exempt(&self, index: &str, now_bucket: &str) -> bool {
        is_restore_index(index)
            || self.table.long_term_storage_indices.iter().any(|i| i == index)
            || index.contains(now_bucket)
    }

    /// Single health probe: every shard of `index` is green.
    pub async fn is_index_green(&self, index: &str) -> bool {
        match self.client.cluster_health(Some(index)).await {
            Ok(health) => health.all_green(),
            Err(e) => {
                warn!(table_id = %self.table.table_id, %index, error = %e, "index health check failed");
                false
            }
        }
    }

    /// Poll until `index` is green, within the readiness retry policy.
    pub async fn is_index_ready(&self, index: &str) -> bool {
        let ready = poll_until(self.settings.retry.index_ready, "index_ready", || {
            self.is_index_green(index)
        })
        .await;
        debug!(table_id = %self.table.table_id, %index, ready, "index readiness");
        ready
    }

    /// Whole-cluster health is red, or the cluster cannot be asked.
    pub async fn is_red(&self) -> bool {
        let health = retry(
            self.settings.retry.cluster_health,
            "cluster_health",
            |_: &ClientError| true,
            || self.client.cluster_health(None),
        )
        .await;
        match health {
            Ok(health) => health.status == HealthColor::Red,
            Err(e) => {
                warn!(cluster_id = self.cluster.cluster_id, error = %e, "cluster health unavailable, treating as red");
                true
            }
        }
    }

    /// Size, doc count, health and shard layout of one index.
    pub async fn index_info(&self, index: &str) -> LifecycleResult<IndexInfo> {
        let stats = self.client.indices_stats(index).await?;
        let stat = stats.get(index).copied().unwrap_or_default();
        let health = self.client.cluster_health(Some(index)).await?;
        let index_health = health.indices.get(index);
        Ok(IndexInfo {
            index: index.to_string(),
            size_gb: stat.size_in_bytes as f64 / BYTES_PER_GB as f64,
            doc_count: stat.doc_count,
            health: index_health.map(|h| h.status),
            number_of_shards: index_health.map_or(0, |h| h.number_of_shards),
            number_of_replicas: index_health.map_or(0, |h| h.number_of_replicas),
        })
    }
}
