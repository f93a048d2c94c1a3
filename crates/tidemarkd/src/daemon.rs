//! Daemon assembly and the one-shot commands.
//!
//! 1. Opens the state store under the data directory
//! 2. Upserts the clusters listed in the config
//! 3. Provisions the tables listed in the config
//! 4. Builds the client pool, routing publisher and lifecycle engine
//! 5. Runs the scheduled loop or a single command

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use tidemark_client::{ClientPool, HttpClientFactory};
use tidemark_core::TidemarkConfig;
use tidemark_lifecycle::{LifecycleEngine, StoreRoutingPublisher, TableReport};
use tidemark_state::StateStore;

pub struct Daemon {
    pub config: TidemarkConfig,
    pub store: StateStore,
    pub engine: LifecycleEngine,
}

impl Daemon {
    pub fn open(config: TidemarkConfig) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.daemon.data_dir)?;
        let db_path = config.daemon.data_dir.join("tidemark.redb");
        let store = StateStore::open(&db_path)?;
        info!(path = ?db_path, "state store opened");

        for cluster in &config.clusters {
            store.put_cluster(cluster)?;
            info!(
                cluster_id = cluster.cluster_id,
                name = %cluster.name,
                address = %cluster.address(),
                "cluster registered"
            );
        }

        let sync = store.provision_tables(&config.tables, Utc::now())?;
        info!(
            declared = config.tables.len(),
            created = ?sync.created,
            updated = ?sync.updated,
            "tables provisioned"
        );

        let pool = Arc::new(ClientPool::new(Arc::new(HttpClientFactory::new(
            config.client.timeout(),
        ))));
        let publisher = Arc::new(StoreRoutingPublisher::new(store.clone()));
        let engine = LifecycleEngine::new(store.clone(), pool, config.lifecycle.clone())
            .with_concurrency(config.daemon.concurrency)
            .with_routing(publisher, config.routing.clone());

        Ok(Self {
            config,
            store,
            engine,
        })
    }

    /// Scheduled loop until Ctrl-C.
    pub async fn run(&self, interval: Duration) -> anyhow::Result<()> {
        let updated = self.engine.cluster_init().await?;
        info!(clusters = ?updated, "cluster settings initialised");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let engine = self.engine.clone();
        let handle = tokio::spawn(async move {
            engine.run(interval, shutdown_rx).await;
        });

        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received");
        if shutdown_tx.send(true).is_err() {
            warn!("lifecycle loop already gone");
        }
        join_worker(handle).await;

        info!("tidemark daemon stopped");
        Ok(())
    }

    /// Run one table now, optionally forcing a new index.
    pub async fn rotate(&self, table_id: &str, force: bool) -> anyhow::Result<TableReport> {
        let now = Utc::now();
        let mut trigger = self.engine.trigger_for(table_id, now)?;
        trigger.force_rotate = force;
        Ok(self.engine.run_table(table_id, trigger, now).await?)
    }

    /// Clean retired clusters of one table, or of every table.
    pub async fn clean_history(&self, table_id: Option<&str>) -> anyhow::Result<Vec<String>> {
        let now = Utc::now();
        let tables = match table_id {
            Some(id) => vec![id.to_string()],
            None => self
                .store
                .list_tables()?
                .into_iter()
                .filter(|t| !t.is_deleted)
                .map(|t| t.table_id)
                .collect(),
        };

        let mut lines = Vec::new();
        for table_id in tables {
            let lifecycle = self.engine.lifecycle_for(&table_id, now)?;
            match lifecycle.clean_history_indices(self.engine.pool()).await {
                Ok(results) => {
                    for result in results {
                        lines.push(format!(
                            "{table_id} cluster={} deleted={} retired={}",
                            result.cluster_id,
                            result.report.deleted.len(),
                            result.retired
                        ));
                    }
                }
                Err(e) => warn!(%table_id, error = %e, "history cleanup failed"),
            }
        }
        Ok(lines)
    }

    /// Move a table to another cluster and run it there straight away.
    pub async fn migrate(&self, table_id: &str, cluster_id: u32) -> anyhow::Result<TableReport> {
        let now = Utc::now();
        if !self.store.migrate_cluster(table_id, cluster_id, now)? {
            info!(%table_id, cluster_id, "table already on cluster");
        }
        let trigger = self.engine.trigger_for(table_id, now)?;
        Ok(self.engine.run_table(table_id, trigger, now).await?)
    }

    /// Size, docs and health of the table's current index.
    pub async fn info(&self, table_id: &str) -> anyhow::Result<String> {
        let lifecycle = self.engine.lifecycle_for(table_id, Utc::now())?;
        let Some(current) = lifecycle.current_index_info().await? else {
            return Ok(format!("{table_id} has no index"));
        };
        let info = lifecycle.index_info(&current.name).await?;
        let health = info.health.map_or_else(|| "unknown".to_string(), |h| format!("{h:?}"));
        Ok(format!(
            "{table_id} index={} docs={} size_gb={:.2} health={health} shards={} replicas={}",
            info.index, info.doc_count, info.size_gb, info.number_of_shards, info.number_of_replicas,
        ))
    }

    /// One full cycle, then the counters it produced.
    pub async fn render_metrics(&self) -> anyhow::Result<String> {
        self.engine.run_all(Utc::now()).await?;
        Ok(self.engine.metrics().render_prometheus())
    }
}

/// Wait for the lifecycle loop. A panic or cancellation is logged, not raised.
async fn join_worker(handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, panicked = e.is_panic(), "lifecycle loop did not stop cleanly");
            false
        }
    }
}

/// One line per table run.
pub fn summarize(report: &TableReport) -> String {
    if report.disabled {
        return format!("{} disabled", report.table_id);
    }
    let rotation = report
        .rotation
        .as_ref()
        .map_or_else(|| "-".to_string(), |r| format!("{r:?}"));
    let mut line = format!(
        "{} cluster={} rotation={rotation} aliases={} deleted={} reallocated={}",
        report.table_id,
        report.cluster_id,
        report.aliases.as_ref().map_or(0, |a| a.bound.len()),
        report.cleanup.as_ref().map_or(0, |c| c.deleted.len()),
        report.reallocated.len(),
    );
    for (stage, error) in &report.errors {
        line.push_str(&format!("\n  {stage} failed: {error}"));
    }
    line
}
