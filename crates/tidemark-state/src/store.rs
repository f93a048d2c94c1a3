//! StateStore — redb-backed persistence for Tidemark.
//!
//! Provides typed operations over clusters, logical tables, storage cluster
//! history and snapshot bookkeeping. Values are JSON in `&[u8]` columns.
//! Operations that must stay consistent across tables (table provisioning,
//! cluster migration, snapshot rows) run inside a single write transaction.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use tidemark_core::{
    ClusterType, LogicalTable, SnapshotIndice, SnapshotPolicy, StorageCluster,
    StorageClusterRecord,
};

use crate::error::{StateError, StateResult};
use crate::registry::ClusterRegistry;
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Collect `(key, value)` pairs whose key starts with `prefix`.
fn scan<T, R>(table: &R, prefix: &str) -> StateResult<Vec<(String, T)>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if key.value().starts_with(prefix) {
            results.push((key.value().to_string(), decode(value.value())?));
        }
    }
    Ok(results)
}

fn lookup<T, R>(table: &R, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

/// Outcome of [`StateStore::provision_tables`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSync {
    pub created: Vec<String>,
    pub updated: Vec<String>,
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for def in [
            CLUSTERS,
            TABLES,
            CLUSTER_RECORDS,
            SNAPSHOT_POLICIES,
            SNAPSHOT_INDICES,
            ROUTING,
        ] {
            txn.open_table(def).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn put_json<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = encode(value)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        lookup(&table, key)
    }

    fn scan_json<T: DeserializeOwned>(&self, def: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        Ok(scan(&table, prefix)?.into_iter().map(|(_, v)| v).collect())
    }

    fn remove_json(&self, def: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Clusters ───────────────────────────────────────────────────

    /// Insert or update a cluster. Marking it default clears the flag on
    /// every other cluster of the same type.
    pub fn put_cluster(&self, cluster: &StorageCluster) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            if cluster.is_default_cluster {
                let previous: Vec<(String, StorageCluster)> = scan(&table, "")?;
                for (key, mut other) in previous {
                    if other.cluster_id != cluster.cluster_id
                        && other.cluster_type == cluster.cluster_type
                        && other.is_default_cluster
                    {
                        other.is_default_cluster = false;
                        table
                            .insert(key.as_str(), encode(&other)?.as_slice())
                            .map_err(map_err!(Write))?;
                        debug!(cluster_id = other.cluster_id, "default flag cleared");
                    }
                }
            }
            table
                .insert(cluster.table_key().as_str(), encode(cluster)?.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(cluster_id = cluster.cluster_id, name = %cluster.name, "cluster stored");
        Ok(())
    }

    pub fn get_cluster(&self, cluster_id: u32) -> StateResult<Option<StorageCluster>> {
        self.get_json(CLUSTERS, &cluster_id.to_string())
    }

    pub fn list_clusters(&self) -> StateResult<Vec<StorageCluster>> {
        self.scan_json(CLUSTERS, "")
    }

    /// Delete a cluster by id. Returns true if it existed.
    pub fn delete_cluster(&self, cluster_id: u32) -> StateResult<bool> {
        self.remove_json(CLUSTERS, &cluster_id.to_string())
    }

    // ── Logical tables ─────────────────────────────────────────────

    /// Provision a logical table.
    ///
    /// Falls back to the default search-index cluster when the requested
    /// cluster is unknown or is not a search-index cluster. The table and
    /// its first (current) storage record are written together.
    pub fn create_table(
        &self,
        mut table: LogicalTable,
        now: DateTime<Utc>,
    ) -> StateResult<LogicalTable> {
        table.validate()?;

        let cluster = match self.get_cluster(table.storage_cluster_id)? {
            Some(cluster) if cluster.cluster_type.is_search_index() => cluster,
            _ => {
                let fallback = self
                    .list_default(ClusterType::Elasticsearch)
                    .map_err(|_| {
                        StateError::Config(format!(
                            "cluster {} is not a search-index cluster and no default exists",
                            table.storage_cluster_id
                        ))
                    })?;
                warn!(
                    table_id = %table.table_id,
                    requested = table.storage_cluster_id,
                    fallback = fallback.cluster_id,
                    "requested cluster unusable, falling back to default"
                );
                fallback
            }
        };
        table.storage_cluster_id = cluster.cluster_id;
        let record = StorageClusterRecord::current(&table.table_id, cluster.cluster_id, now);

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut tables = txn.open_table(TABLES).map_err(map_err!(Table))?;
            if tables
                .get(table.table_id.as_str())
                .map_err(map_err!(Read))?
                .is_some()
            {
                return Err(StateError::AlreadyExists(format!("table {}", table.table_id)));
            }
            tables
                .insert(table.table_id.as_str(), encode(&table)?.as_slice())
                .map_err(map_err!(Write))?;

            let mut records = txn.open_table(CLUSTER_RECORDS).map_err(map_err!(Table))?;
            records
                .insert(record.table_key().as_str(), encode(&record)?.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(table_id = %table.table_id, cluster_id = cluster.cluster_id, "table created");
        Ok(table)
    }

    /// Update an existing table's settings.
    pub fn put_table(&self, table: &LogicalTable) -> StateResult<()> {
        table.validate()?;
        if self.get_table(&table.table_id)?.is_none() {
            return Err(StateError::NotFound(format!("table {}", table.table_id)));
        }
        self.put_json(TABLES, table.table_key(), table)
    }

    /// Bring the store in line with a declared table list.
    ///
    /// Missing tables are created. Existing ones take the declared
    /// settings but keep their cluster, deleted flag and history; moving
    /// a table goes through [`StateStore::migrate_cluster`].
    pub fn provision_tables(
        &self,
        tables: &[LogicalTable],
        now: DateTime<Utc>,
    ) -> StateResult<TableSync> {
        let mut sync = TableSync::default();
        for declared in tables {
            match self.get_table(&declared.table_id)? {
                None => {
                    self.create_table(declared.clone(), now)?;
                    sync.created.push(declared.table_id.clone());
                }
                Some(existing) => {
                    let table = LogicalTable {
                        storage_cluster_id: existing.storage_cluster_id,
                        is_deleted: existing.is_deleted,
                        ..declared.clone()
                    };
                    if table == existing {
                        continue;
                    }
                    if table.storage_cluster_id != declared.storage_cluster_id {
                        warn!(
                            table_id = %table.table_id,
                            declared = declared.storage_cluster_id,
                            current = table.storage_cluster_id,
                            "declared cluster ignored, use migrate to move the table"
                        );
                    }
                    self.put_table(&table)?;
                    debug!(table_id = %table.table_id, "table settings refreshed");
                    sync.updated.push(table.table_id);
                }
            }
        }
        Ok(sync)
    }

    pub fn get_table(&self, table_id: &str) -> StateResult<Option<LogicalTable>> {
        self.get_json(TABLES, table_id)
    }

    pub fn list_tables(&self) -> StateResult<Vec<LogicalTable>> {
        self.scan_json(TABLES, "")
    }

    pub fn set_table_enabled(&self, table_id: &str, enabled: bool) -> StateResult<()> {
        let mut table = self
            .get_table(table_id)?
            .ok_or_else(|| StateError::NotFound(format!("table {table_id}")))?;
        table.is_enabled = enabled;
        self.put_json(TABLES, table_id, &table)
    }

    /// Move a table to another cluster.
    ///
    /// Closes every current storage record (`disable_time = now`) and opens a
    /// new current one in the same transaction. Returns false when the table
    /// already lives on `cluster_id`.
    pub fn migrate_cluster(
        &self,
        table_id: &str,
        cluster_id: u32,
        now: DateTime<Utc>,
    ) -> StateResult<bool> {
        let cluster = self.resolve(cluster_id)?;
        if !cluster.cluster_type.is_search_index() {
            return Err(StateError::Config(format!(
                "cluster {cluster_id} is {}, not a search-index cluster",
                cluster.cluster_type.as_str()
            )));
        }

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let previous;
        {
            let mut tables = txn.open_table(TABLES).map_err(map_err!(Table))?;
            let mut table: LogicalTable = lookup(&tables, table_id)?
                .ok_or_else(|| StateError::NotFound(format!("table {table_id}")))?;
            if table.storage_cluster_id == cluster_id {
                return Ok(false);
            }
            previous = table.storage_cluster_id;
            table.storage_cluster_id = cluster_id;
            tables
                .insert(table_id, encode(&table)?.as_slice())
                .map_err(map_err!(Write))?;

            let mut records = txn.open_table(CLUSTER_RECORDS).map_err(map_err!(Table))?;
            let history: Vec<(String, StorageClusterRecord)> =
                scan(&records, &format!("{table_id}:"))?;
            for (key, mut record) in history {
                if record.is_current {
                    record.is_current = false;
                    record.disable_time = Some(now);
                    records
                        .insert(key.as_str(), encode(&record)?.as_slice())
                        .map_err(map_err!(Write))?;
                }
            }
            let record = StorageClusterRecord::current(table_id, cluster_id, now);
            records
                .insert(record.table_key().as_str(), encode(&record)?.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(%table_id, from = previous, to = cluster_id, "table migrated to new cluster");
        Ok(true)
    }

    // ── Storage cluster records ────────────────────────────────────

    /// A table's storage history, oldest first.
    pub fn list_cluster_records(&self, table_id: &str) -> StateResult<Vec<StorageClusterRecord>> {
        let records: Vec<StorageClusterRecord> =
            self.scan_json(CLUSTER_RECORDS, &format!("{table_id}:"))?;
        // Guard against ids that share a `:`-terminated prefix.
        Ok(records
            .into_iter()
            .filter(|r| r.table_id == table_id)
            .collect())
    }

    /// Retired clusters that may still hold data for the table.
    pub fn history_records(&self, table_id: &str) -> StateResult<Vec<StorageClusterRecord>> {
        Ok(self
            .list_cluster_records(table_id)?
            .into_iter()
            .filter(|r| !r.is_current && !r.is_deleted)
            .collect())
    }

    pub fn put_cluster_record(&self, record: &StorageClusterRecord) -> StateResult<()> {
        self.put_json(CLUSTER_RECORDS, &record.table_key(), record)
    }

    // ── Snapshot policies ──────────────────────────────────────────

    pub fn put_snapshot_policy(&self, policy: &SnapshotPolicy) -> StateResult<()> {
        self.put_json(SNAPSHOT_POLICIES, &policy.table_id, policy)
    }

    pub fn get_snapshot_policy(&self, table_id: &str) -> StateResult<Option<SnapshotPolicy>> {
        self.get_json(SNAPSHOT_POLICIES, table_id)
    }

    pub fn delete_snapshot_policy(&self, table_id: &str) -> StateResult<bool> {
        self.remove_json(SNAPSHOT_POLICIES, table_id)
    }

    // ── Snapshot indices ───────────────────────────────────────────

    /// Insert all rows of one snapshot in a single transaction.
    pub fn put_snapshot_indices(&self, rows: &[SnapshotIndice]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SNAPSHOT_INDICES).map_err(map_err!(Table))?;
            for row in rows {
                table
                    .insert(row.table_key().as_str(), encode(row)?.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub fn list_snapshot_indices(
        &self,
        table_id: &str,
        snapshot_name: &str,
    ) -> StateResult<Vec<SnapshotIndice>> {
        self.scan_json(SNAPSHOT_INDICES, &format!("{table_id}/{snapshot_name}/"))
    }

    /// Remove every row of a snapshot. Returns the number removed.
    pub fn delete_snapshot_indices(&self, table_id: &str, snapshot_name: &str) -> StateResult<u32> {
        let prefix = format!("{table_id}/{snapshot_name}/");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count;
        {
            let mut table = txn.open_table(SNAPSHOT_INDICES).map_err(map_err!(Table))?;
            let keys: Vec<String> = scan::<SnapshotIndice, _>(&table, &prefix)?
                .into_iter()
                .map(|(k, _)| k)
                .collect();
            count = keys.len() as u32;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }

    // ── Routing documents ──────────────────────────────────────────

    pub fn put_routing(&self, key: &str, value: &Value) -> StateResult<()> {
        self.put_json(ROUTING, key, value)
    }

    pub fn get_routing(&self, key: &str) -> StateResult<Option<Value>> {
        self.get_json(ROUTING, key)
    }

    pub fn delete_routing(&self, key: &str) -> StateResult<bool> {
        self.remove_json(ROUTING, key)
    }

    /// Routing documents whose key starts with `prefix`, in key order.
    pub fn list_routing(&self, prefix: &str) -> StateResult<Vec<(String, Value)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROUTING).map_err(map_err!(Table))?;
        scan(&table, prefix)
    }
}
