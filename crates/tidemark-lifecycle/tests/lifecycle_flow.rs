//! Multi-day lifecycle of one table against an in-memory cluster.
//!
//! Day 0 creates the first index, day 4 rotates it out, archives it and
//! deletes it, day 7 purges the archive.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};

use tidemark_client::{ClientPool, MemoryFleet, SnapshotState};
use tidemark_core::{
    ClusterType, IndexNaming, IndexVersion, LifecycleSettings, LogicalTable, RetryPolicies,
    SnapshotPolicy, SnapshotPolicyStatus, StorageCluster, TlsSettings,
};
use tidemark_lifecycle::{
    LifecycleEngine, LifecycleMetrics, RotationOutcome, RotationReason, SnapshotOutcome,
};
use tidemark_state::StateStore;

const TABLE_ID: &str = "2_bklog.flow";
const REPO: &str = "archive";

/// 2024-03-31 12:30 UTC.
fn day(n: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_711_888_200, 0).unwrap() + TimeDelta::days(n)
}

fn cluster() -> StorageCluster {
    StorageCluster {
        cluster_id: 1,
        name: "es-hot".to_string(),
        cluster_type: ClusterType::Elasticsearch,
        domain_name: "es-hot.local".to_string(),
        port: 9200,
        schema: "http".to_string(),
        username: None,
        password: None,
        is_auth: false,
        is_default_cluster: true,
        version: Some("7.10.2".to_string()),
        tls: TlsSettings::default(),
    }
}

struct Flow {
    fleet: Arc<MemoryFleet>,
    store: StateStore,
    metrics: Arc<LifecycleMetrics>,
    engine: LifecycleEngine,
    naming: IndexNaming,
    table: LogicalTable,
}

impl Flow {
    fn new() -> Self {
        let store = StateStore::open_in_memory().unwrap();
        store.put_cluster(&cluster()).unwrap();
        let mut table = LogicalTable::new(TABLE_ID, 1);
        table.retention = 2;
        let table = store.create_table(table, day(0)).unwrap();
        store
            .put_snapshot_policy(&SnapshotPolicy {
                table_id: TABLE_ID.to_string(),
                target_repository: REPO.to_string(),
                snapshot_days: 2,
                status: SnapshotPolicyStatus::Running,
            })
            .unwrap();

        let fleet = Arc::new(MemoryFleet::new());
        let metrics = Arc::new(LifecycleMetrics::new());
        let settings = LifecycleSettings {
            ahead_time: 240,
            retry: RetryPolicies::immediate(),
            ..LifecycleSettings::default()
        };
        let engine = LifecycleEngine::new(
            store.clone(),
            Arc::new(ClientPool::new(fleet.clone())),
            settings,
        )
        .with_metrics(Arc::clone(&metrics));

        Self {
            fleet,
            store,
            metrics,
            engine,
            naming: IndexNaming::new(TABLE_ID).unwrap(),
            table,
        }
    }

    fn index_of_day(&self, n: i64) -> String {
        let bucket = tidemark_core::bucket::format_bucket(
            self.table.local_now(day(n)),
            &self.table.date_format,
        )
        .unwrap();
        self.naming.index_name(&bucket, 0, IndexVersion::V2)
    }
}

#[tokio::test]
async fn index_is_archived_before_deletion_and_archive_expires() {
    let flow = Flow::new();
    let es = flow.fleet.cluster(1);

    // Day 0: first index.
    let reports = flow.engine.run_all(day(0)).await.unwrap();
    let first = flow.index_of_day(0);
    assert_eq!(
        reports[0].rotation,
        Some(RotationOutcome::Created {
            index: first.clone(),
            reason: None
        })
    );
    es.set_docs(&first, 1_000, 0.5);

    // Day 4: the first index is past retention plus alias delay.
    let reports = flow.engine.run_all(day(4)).await.unwrap();
    let report = &reports[0];
    assert!(report.is_clean(), "{:?}", report.errors);
    let second = flow.index_of_day(4);
    assert_eq!(
        report.rotation,
        Some(RotationOutcome::Created {
            index: second.clone(),
            reason: Some(RotationReason::Expired)
        })
    );
    let snapshot = flow.naming.snapshot_name(flow.table.local_now(day(4)).date());
    assert_eq!(
        report.snapshot,
        Some(SnapshotOutcome::Created {
            snapshot: snapshot.clone(),
            indices: vec![first.clone()]
        })
    );
    assert_eq!(report.cleanup.as_ref().unwrap().deleted, vec![first.clone()]);
    assert!(!es.has_index(&first));
    assert!(es.has_index(&second));

    let rows = flow.store.list_snapshot_indices(TABLE_ID, &snapshot).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].index_name, first);
    assert_eq!(rows[0].doc_count, 1_000);

    // Day 7: the archive is older than snapshot_days.
    let reports = flow.engine.run_all(day(7)).await.unwrap();
    assert_eq!(reports[0].snapshots_deleted, vec![snapshot.clone()]);
    assert!(es.snapshot_names(REPO).is_empty());
    assert!(flow.store.list_snapshot_indices(TABLE_ID, &snapshot).unwrap().is_empty());

    let counters = flow.metrics.counters(TABLE_ID, 1);
    assert_eq!(counters.snapshots_created, 1);
    assert_eq!(counters.snapshots_deleted, 1);
    assert_eq!(counters.indices_deleted, 1);
    assert_eq!(counters.rotation_reasons.get(&RotationReason::Expired), Some(&2));
}

#[tokio::test]
async fn running_snapshot_holds_back_deletion() {
    let flow = Flow::new();
    let es = flow.fleet.cluster(1);
    flow.engine.run_all(day(0)).await.unwrap();
    let first = flow.index_of_day(0);
    es.set_docs(&first, 1_000, 0.5);
    es.set_snapshot_state(SnapshotState::InProgress);

    let reports = flow.engine.run_all(day(4)).await.unwrap();
    let cleanup = reports[0].cleanup.as_ref().unwrap();
    assert!(cleanup.deleted.is_empty());
    assert_eq!(cleanup.refused, vec![first.clone()]);
    assert!(es.has_index(&first));
}
