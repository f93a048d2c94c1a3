//! Storage backends a logical table can be written to.
//!
//! Every backend can provision a table, extend its schema and describe its
//! routing. Only the search-index backend carries an index lifecycle.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};

use tidemark_core::{ClusterType, LogicalTable, StorageClusterRecord};

use crate::engine::LifecycleEngine;
use crate::error::{LifecycleError, LifecycleResult};
use crate::routing::routing_entry;

#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn cluster_type(&self) -> ClusterType;

    /// Provision `table` and prepare its storage.
    async fn create(&self, table: LogicalTable, now: DateTime<Utc>) -> LifecycleResult<LogicalTable>;

    /// Declare a new field on an existing table.
    async fn add_field(
        &self,
        table_id: &str,
        field: &str,
        config: Value,
        now: DateTime<Utc>,
    ) -> LifecycleResult<LogicalTable>;

    /// The routing document published for `table`.
    fn routing_config(
        &self,
        table: &LogicalTable,
        records: &[StorageClusterRecord],
    ) -> LifecycleResult<Value>;
}

/// Search-index storage managed by the lifecycle engine.
#[derive(Clone)]
pub struct SearchIndexBackend {
    engine: LifecycleEngine,
}

impl SearchIndexBackend {
    pub fn new(engine: LifecycleEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl StorageBackend for SearchIndexBackend {
    fn cluster_type(&self) -> ClusterType {
        ClusterType::Elasticsearch
    }

    async fn create(&self, table: LogicalTable, now: DateTime<Utc>) -> LifecycleResult<LogicalTable> {
        let table = self.engine.store().create_table(table, now)?;
        let lifecycle = self.engine.lifecycle_for(&table.table_id, now)?;
        match lifecycle.update_index(false).await {
            Ok(outcome) => info!(table_id = %table.table_id, ?outcome, "table storage prepared"),
            Err(e) => {
                warn!(table_id = %table.table_id, error = %e, "first index deferred to next cycle")
            }
        }
        Ok(table)
    }

    async fn add_field(
        &self,
        table_id: &str,
        field: &str,
        config: Value,
        now: DateTime<Utc>,
    ) -> LifecycleResult<LogicalTable> {
        let store = self.engine.store();
        let mut table = store
            .get_table(table_id)?
            .ok_or_else(|| LifecycleError::TableNotFound(table_id.to_string()))?;
        let is_alias = config.get("type").and_then(Value::as_str) == Some("alias");
        table.properties.insert(field.to_string(), config);
        store.put_table(&table)?;
        info!(%table_id, %field, "field declared");

        // Alias fields can be pushed to live indices; any other field waits
        // for the mapping-driven rotation.
        if is_alias {
            let lifecycle = self.engine.lifecycle_for(table_id, now)?;
            lifecycle.sync_field_aliases().await?;
        } else {
            let trigger = self.engine.trigger_for(table_id, now)?;
            self.engine.run_table(table_id, trigger, now).await?;
        }
        Ok(table)
    }

    fn routing_config(
        &self,
        table: &LogicalTable,
        records: &[StorageClusterRecord],
    ) -> LifecycleResult<Value> {
        serde_json::to_value(routing_entry(table, records))
            .map_err(|e| LifecycleError::Routing(e.to_string()))
    }
}
