//! Scheduled lifecycle runs across every table.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{Value, json};
use tokio::sync::{Semaphore, watch};
use tracing::{debug, error, info, warn};

use tidemark_client::ClientPool;
use tidemark_core::{LifecycleSettings, LogicalTable, RoutingSettings};
use tidemark_state::{ClusterRegistry, StateStore};

use crate::alias::{AliasReport, MOVING_CLUSTER_LOOKBACK_MINUTES};
use crate::cleanup::{CleanupReport, HistoryCleanup};
use crate::context::IndexLifecycle;
use crate::error::{LifecycleError, LifecycleResult};
use crate::metrics::LifecycleMetrics;
use crate::rotation::RotationOutcome;
use crate::routing::{RoutingPublisher, RoutingSummary, publish_routing};
use crate::snapshot::SnapshotOutcome;

/// Pattern kept out of the cluster's index auto-creation so a write to an
/// unbound write alias fails instead of creating a stray index.
pub const DISABLE_WRITE_AUTO_CREATE: &str = "-write_*";

/// What the scheduler asks of one table run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LifecycleTrigger {
    /// Minutes of future buckets to bind.
    pub ahead_time: i64,
    pub force_rotate: bool,
    /// The table changed cluster recently.
    pub is_moving_cluster: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleStage {
    Health,
    FieldAlias,
    Rotation,
    Alias,
    Snapshot,
    Cleanup,
    Reallocate,
    SnapshotPurge,
    History,
}

impl LifecycleStage {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleStage::Health => "health",
            LifecycleStage::FieldAlias => "field_alias",
            LifecycleStage::Rotation => "rotation",
            LifecycleStage::Alias => "alias",
            LifecycleStage::Snapshot => "snapshot",
            LifecycleStage::Cleanup => "cleanup",
            LifecycleStage::Reallocate => "reallocate",
            LifecycleStage::SnapshotPurge => "snapshot_purge",
            LifecycleStage::History => "history",
        }
    }
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one table run. A failed stage is recorded and the run moves on.
#[derive(Debug, Clone, Default)]
pub struct TableReport {
    pub table_id: String,
    pub cluster_id: u32,
    /// The table is disabled and no stage ran.
    pub disabled: bool,
    pub field_aliases: Vec<String>,
    pub rotation: Option<RotationOutcome>,
    pub aliases: Option<AliasReport>,
    pub snapshot: Option<SnapshotOutcome>,
    pub cleanup: Option<CleanupReport>,
    pub reallocated: Vec<String>,
    pub snapshots_deleted: Vec<String>,
    pub history: Vec<HistoryCleanup>,
    pub errors: Vec<(LifecycleStage, String)>,
}

impl TableReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn failed_stages(&self) -> Vec<LifecycleStage> {
        self.errors.iter().map(|(stage, _)| *stage).collect()
    }

    fn stage_failed(&mut self, stage: LifecycleStage, e: LifecycleError) {
        if e.is_transient() {
            warn!(table_id = %self.table_id, %stage, error = %e, "stage deferred to next cycle");
        } else {
            error!(table_id = %self.table_id, %stage, error = %e, "stage failed");
        }
        self.errors.push((stage, e.to_string()));
    }
}

/// Drives every stage for every table.
///
/// Cheap to clone; clones share the client pool and metrics.
#[derive(Clone)]
pub struct LifecycleEngine {
    store: StateStore,
    pool: Arc<ClientPool>,
    settings: LifecycleSettings,
    metrics: Arc<LifecycleMetrics>,
    concurrency: usize,
    routing: Option<(Arc<dyn RoutingPublisher>, RoutingSettings)>,
}

impl LifecycleEngine {
    pub fn new(store: StateStore, pool: Arc<ClientPool>, settings: LifecycleSettings) -> Self {
        Self {
            store,
            pool,
            settings,
            metrics: Arc::new(LifecycleMetrics::new()),
            concurrency: 4,
            routing: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<LifecycleMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_routing(
        mut self,
        publisher: Arc<dyn RoutingPublisher>,
        settings: RoutingSettings,
    ) -> Self {
        self.routing = Some((publisher, settings));
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn pool(&self) -> &Arc<ClientPool> {
        &self.pool
    }

    pub fn metrics(&self) -> &Arc<LifecycleMetrics> {
        &self.metrics
    }

    /// A lifecycle view of `table_id` on its current cluster.
    pub fn lifecycle_for(
        &self,
        table_id: &str,
        now: DateTime<Utc>,
    ) -> LifecycleResult<IndexLifecycle> {
        let table = self
            .store
            .get_table(table_id)?
            .ok_or_else(|| LifecycleError::TableNotFound(table_id.to_string()))?;
        let cluster = self.store.resolve(table.storage_cluster_id)?;
        let client = self.pool.get(&cluster)?;
        IndexLifecycle::new(
            table,
            cluster,
            client,
            self.settings.clone(),
            self.store.clone(),
            Arc::clone(&self.metrics),
            now,
        )
    }

    /// The scheduled trigger for a table. A cluster record closed within
    /// the last day marks the table as moving.
    pub fn trigger_for(&self, table_id: &str, now: DateTime<Utc>) -> LifecycleResult<LifecycleTrigger> {
        let since = now - TimeDelta::minutes(MOVING_CLUSTER_LOOKBACK_MINUTES);
        let is_moving_cluster = self
            .store
            .history_records(table_id)?
            .iter()
            .any(|r| r.disable_time.is_some_and(|t| t >= since));
        Ok(LifecycleTrigger {
            ahead_time: self.settings.ahead_time,
            force_rotate: false,
            is_moving_cluster,
        })
    }

    /// Run every stage for one table, then publish its routing.
    pub async fn run_table(
        &self,
        table_id: &str,
        trigger: LifecycleTrigger,
        now: DateTime<Utc>,
    ) -> LifecycleResult<TableReport> {
        let report = self.run_table_at(table_id, trigger, now).await?;
        if let Some(table) = self.store.get_table(table_id)? {
            self.publish(&[table], now).await;
        }
        Ok(report)
    }

    /// Run every stage for one table without publishing routing.
    ///
    /// Only failing to build the table's view is an error; stage failures
    /// land in the report.
    pub async fn run_table_at(
        &self,
        table_id: &str,
        trigger: LifecycleTrigger,
        now: DateTime<Utc>,
    ) -> LifecycleResult<TableReport> {
        let lifecycle = self.lifecycle_for(table_id, now)?;
        let mut report = TableReport {
            table_id: table_id.to_string(),
            cluster_id: lifecycle.cluster_id(),
            ..TableReport::default()
        };
        if !lifecycle.table().is_index_enable() {
            debug!(%table_id, "table disabled, lifecycle skipped");
            report.disabled = true;
            return Ok(report);
        }

        match lifecycle.sync_field_aliases().await {
            Ok(indices) => report.field_aliases = indices,
            Err(e) => report.stage_failed(LifecycleStage::FieldAlias, e),
        }
        // No new index on a red cluster; it would never turn green.
        if lifecycle.is_red().await {
            report.stage_failed(
                LifecycleStage::Health,
                LifecycleError::NotReady(format!("cluster {} is red", report.cluster_id)),
            );
        } else {
            match lifecycle.update_index(trigger.force_rotate).await {
                Ok(outcome) => report.rotation = Some(outcome),
                Err(e) => report.stage_failed(LifecycleStage::Rotation, e),
            }
        }
        match lifecycle
            .create_or_update_aliases(
                trigger.ahead_time,
                trigger.force_rotate,
                trigger.is_moving_cluster,
            )
            .await
        {
            Ok(aliases) => report.aliases = Some(aliases),
            Err(e) => report.stage_failed(LifecycleStage::Alias, e),
        }
        // Archive before anything is deleted.
        match lifecycle.create_snapshot().await {
            Ok(outcome) => report.snapshot = Some(outcome),
            Err(e) => report.stage_failed(LifecycleStage::Snapshot, e),
        }
        match lifecycle.clean_index().await {
            Ok(cleanup) => report.cleanup = Some(cleanup),
            Err(e) => report.stage_failed(LifecycleStage::Cleanup, e),
        }
        match lifecycle.reallocate_index().await {
            Ok(moved) => report.reallocated = moved,
            Err(e) => report.stage_failed(LifecycleStage::Reallocate, e),
        }
        match lifecycle.clean_snapshot().await {
            Ok(deleted) => report.snapshots_deleted = deleted,
            Err(e) => report.stage_failed(LifecycleStage::SnapshotPurge, e),
        }
        match lifecycle.clean_history_indices(&self.pool).await {
            Ok(history) => report.history = history,
            Err(e) => report.stage_failed(LifecycleStage::History, e),
        }

        info!(
            %table_id,
            cluster_id = report.cluster_id,
            failed = report.errors.len(),
            "table lifecycle finished"
        );
        Ok(report)
    }

    /// One cycle over every live table, `concurrency` at a time, followed
    /// by a single routing publish.
    pub async fn run_all(&self, now: DateTime<Utc>) -> LifecycleResult<Vec<TableReport>> {
        let tables: Vec<LogicalTable> = self
            .store
            .list_tables()?
            .into_iter()
            .filter(|t| !t.is_deleted)
            .collect();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));

        let mut handles = Vec::with_capacity(tables.len());
        for table in &tables {
            let engine = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let table_id = table.table_id.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let trigger = engine.trigger_for(&table_id, now)?;
                engine.run_table_at(&table_id, trigger, now).await
            }));
        }

        let mut reports = Vec::with_capacity(handles.len());
        for (table, handle) in tables.iter().zip(handles) {
            match handle.await {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(e)) => {
                    error!(table_id = %table.table_id, error = %e, "table lifecycle aborted");
                }
                Err(e) => {
                    error!(table_id = %table.table_id, error = %e, "table lifecycle task panicked");
                }
            }
        }

        self.publish(&tables, now).await;
        info!(tables = tables.len(), completed = reports.len(), "lifecycle cycle finished");
        Ok(reports)
    }

    async fn publish(&self, tables: &[LogicalTable], now: DateTime<Utc>) -> Option<RoutingSummary> {
        let (publisher, settings) = self.routing.as_ref()?;
        match publish_routing(publisher.as_ref(), settings, &self.store, tables, now).await {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!(error = %e, "routing publication failed");
                None
            }
        }
    }

    /// Keep write aliases from auto-creating indices on every search-index
    /// cluster. Returns the clusters whose settings were changed.
    pub async fn cluster_init(&self) -> LifecycleResult<Vec<u32>> {
        let mut updated = Vec::new();
        for cluster in self.store.list_clusters()? {
            if !cluster.cluster_type.is_search_index() {
                continue;
            }
            let cluster_id = cluster.cluster_id;
            let client = match self.pool.get(&cluster) {
                Ok(client) => client,
                Err(e) => {
                    warn!(cluster_id, error = %e, "cluster unreachable, init skipped");
                    continue;
                }
            };
            let current = match client.get_cluster_settings().await {
                Ok(settings) => settings,
                Err(e) => {
                    warn!(cluster_id, error = %e, "cluster settings unavailable");
                    continue;
                }
            };
            let Some(value) = auto_create_with_write_disabled(&current) else {
                continue;
            };
            let body = json!({ "persistent": { "action": { "auto_create_index": value } } });
            match client.put_cluster_settings(&body).await {
                Ok(()) => {
                    info!(cluster_id, auto_create_index = %value, "write alias auto-creation disabled");
                    updated.push(cluster_id);
                }
                Err(e) => error!(cluster_id, error = %e, "cluster settings update failed"),
            }
        }
        Ok(updated)
    }

    /// Cycle every `interval` until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = interval.as_secs(),
            concurrency = self.concurrency,
            "lifecycle engine started"
        );

        loop {
            if let Err(e) = self.run_all(Utc::now()).await {
                error!(error = %e, "lifecycle cycle failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    info!("lifecycle engine shutting down");
                    break;
                }
            }
        }
    }
}

/// The new `action.auto_create_index` value, or `None` when no change is
/// needed. Auto-creation switched off entirely is left alone.
fn auto_create_with_write_disabled(persistent: &Value) -> Option<String> {
    let current = persistent
        .pointer("/action/auto_create_index")
        .or_else(|| persistent.get("action.auto_create_index"))
        .and_then(Value::as_str)
        .unwrap_or("*");
    let current = match current {
        "false" => return None,
        "true" => "*",
        other => other,
    };
    if current.split(',').any(|p| p.trim() == DISABLE_WRITE_AUTO_CREATE) {
        return None;
    }
    Some(format!("{DISABLE_WRITE_AUTO_CREATE},{current}"))
}
