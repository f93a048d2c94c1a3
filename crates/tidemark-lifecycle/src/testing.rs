//! Shared fixtures for unit tests.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};

use tidemark_client::{ClientPool, MemoryCluster, MemoryFleet};
use tidemark_core::bucket::format_bucket;
use tidemark_core::{
    ClusterType, IndexNaming, IndexVersion, LifecycleSettings, LogicalTable, RetryPolicies,
    StorageCluster, TlsSettings,
};
use tidemark_state::StateStore;

use crate::context::IndexLifecycle;
use crate::metrics::LifecycleMetrics;

pub const TABLE_ID: &str = "2_bklog.demo";

/// 2024-03-31 12:30 UTC.
pub fn fixed_now() -> DateTime<Utc> {
    DateTime::from_timestamp(1_711_888_200, 0).unwrap()
}

pub fn es_cluster(cluster_id: u32) -> StorageCluster {
    StorageCluster {
        cluster_id,
        name: format!("es-{cluster_id}"),
        cluster_type: ClusterType::Elasticsearch,
        domain_name: format!("es-{cluster_id}.local"),
        port: 9200,
        schema: "http".to_string(),
        username: None,
        password: None,
        is_auth: false,
        is_default_cluster: cluster_id == 1,
        version: Some("7.10.2".to_string()),
        tls: TlsSettings::default(),
    }
}

pub fn test_settings() -> LifecycleSettings {
    LifecycleSettings {
        retry: RetryPolicies::immediate(),
        ..LifecycleSettings::default()
    }
}

/// One table on cluster 1, backed by an in-memory cluster and store.
pub struct Fixture {
    pub fleet: Arc<MemoryFleet>,
    /// Cluster 1 of the fleet.
    pub cluster: MemoryCluster,
    pub store: StateStore,
    pub metrics: Arc<LifecycleMetrics>,
    pub table: LogicalTable,
    pub naming: IndexNaming,
    pub now: DateTime<Utc>,
}

impl Fixture {
    pub fn new() -> Self {
        let store = StateStore::open_in_memory().unwrap();
        store.put_cluster(&es_cluster(1)).unwrap();
        store.put_cluster(&es_cluster(2)).unwrap();
        let table = store.create_table(LogicalTable::new(TABLE_ID, 1), fixed_now()).unwrap();
        let fleet = Arc::new(MemoryFleet::new());
        Self {
            cluster: fleet.cluster(1),
            fleet,
            store,
            metrics: Arc::new(LifecycleMetrics::new()),
            naming: IndexNaming::new(TABLE_ID).unwrap(),
            table,
            now: fixed_now(),
        }
    }

    pub fn pool(&self) -> ClientPool {
        ClientPool::new(self.fleet.clone())
    }

    pub fn table_id(&self) -> &str {
        &self.table.table_id
    }

    pub fn lifecycle(&self) -> IndexLifecycle {
        self.lifecycle_with(self.table.clone())
    }

    pub fn lifecycle_with(&self, table: LogicalTable) -> IndexLifecycle {
        self.lifecycle_on(table, 1)
    }

    pub fn lifecycle_on(&self, table: LogicalTable, cluster_id: u32) -> IndexLifecycle {
        IndexLifecycle::new(
            table,
            es_cluster(cluster_id),
            Arc::new(self.fleet.cluster(cluster_id)),
            test_settings(),
            self.store.clone(),
            Arc::clone(&self.metrics),
            self.now,
        )
        .unwrap()
    }

    /// Bucket `minutes_back` minutes before now. Negative is the future.
    pub fn bucket(&self, minutes_back: i64) -> String {
        let at = self.table.local_now(self.now) - TimeDelta::minutes(minutes_back);
        format_bucket(at, &self.table.date_format).unwrap()
    }

    pub fn index(&self, minutes_back: i64, seq: u32) -> String {
        self.naming
            .index_name(&self.bucket(minutes_back), seq, IndexVersion::V2)
    }

    pub fn write_alias(&self, minutes_back: i64) -> String {
        self.naming.write_alias(&self.bucket(minutes_back))
    }

    pub fn read_alias(&self, minutes_back: i64) -> String {
        self.naming.read_alias(&self.bucket(minutes_back))
    }

    /// An index in the bucket `days` ago holding that bucket's aliases.
    pub fn aged_index(&self, days: i64, docs: u64) -> String {
        let index = self.index(days * 1440, 0);
        self.cluster.add_index(&index, docs, docs * 100);
        self.cluster.add_alias(&index, &self.write_alias(days * 1440));
        self.cluster.add_alias(&index, &self.read_alias(days * 1440));
        index
    }
}
