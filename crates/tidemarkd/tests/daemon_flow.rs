//! Daemon flow tests.
//!
//! Loads a config file, opens an on-disk store, registers the configured
//! clusters and runs full cycles against in-memory clusters.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tempfile::TempDir;

use tidemark_client::{ClientPool, MemoryFleet};
use tidemark_core::bucket::format_bucket;
use tidemark_core::{IndexNaming, IndexVersion, LogicalTable, TidemarkConfig};
use tidemark_lifecycle::{LifecycleEngine, RotationOutcome, StoreRoutingPublisher};
use tidemark_state::StateStore;

const TABLE_ID: &str = "2_bklog.gateway";

/// 2024-03-31 12:30 UTC.
fn now() -> DateTime<Utc> {
    DateTime::from_timestamp(1_711_888_200, 0).unwrap()
}

fn write_config(dir: &Path, extra: &str) -> TidemarkConfig {
    let text = format!(
        r#"
[daemon]
data_dir = "{}"
interval_secs = 120
concurrency = 2

[lifecycle]
ahead_time = 240

[[clusters]]
cluster_id = 1
name = "es-hot"
cluster_type = "elasticsearch"
domain_name = "es-hot.local"
port = 9200
is_default_cluster = true

[[clusters]]
cluster_id = 2
name = "es-new"
cluster_type = "elasticsearch"
domain_name = "es-new.local"
port = 9200
{extra}
"#,
        dir.display()
    );
    let path = dir.join("tidemark.toml");
    std::fs::write(&path, text).unwrap();
    TidemarkConfig::from_file(&path).unwrap()
}

fn open_store(config: &TidemarkConfig) -> StateStore {
    let store = StateStore::open(&config.daemon.data_dir.join("tidemark.redb")).unwrap();
    for cluster in &config.clusters {
        store.put_cluster(cluster).unwrap();
    }
    store
}

fn engine(config: &TidemarkConfig, store: &StateStore, fleet: &Arc<MemoryFleet>) -> LifecycleEngine {
    LifecycleEngine::new(
        store.clone(),
        Arc::new(ClientPool::new(fleet.clone())),
        config.lifecycle.clone(),
    )
    .with_concurrency(config.daemon.concurrency)
    .with_routing(
        Arc::new(StoreRoutingPublisher::new(store.clone())),
        config.routing.clone(),
    )
}

fn bucket_minutes_back(table: &LogicalTable, minutes: i64) -> String {
    format_bucket(table.local_now(now()) - TimeDelta::minutes(minutes), &table.date_format).unwrap()
}

#[test]
fn config_file_is_loaded() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "");
    assert_eq!(config.daemon.interval_secs, 120);
    assert_eq!(config.daemon.concurrency, 2);
    assert_eq!(config.lifecycle.ahead_time, 240);
    assert_eq!(config.lifecycle.alias_expired_delay_days, 1);
    assert_eq!(config.clusters.len(), 2);
    assert_eq!(config.clusters[1].schema, "http");
    assert_eq!(config.routing.key_prefix, "tidemark/data/es/info");
    assert!(config.tables.is_empty());
}

const DECLARED_TABLES: &str = r#"
[[tables]]
table_id = "2_bklog.gateway"
storage_cluster_id = 1
retention = 7

[[tables]]
table_id = "2_bklog.audit"
storage_cluster_id = 9
"#;

#[tokio::test(start_paused = true)]
async fn declared_tables_are_provisioned_and_rotated() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), DECLARED_TABLES);
    assert_eq!(config.tables.len(), 2);
    let fleet = Arc::new(MemoryFleet::new());

    {
        let store = open_store(&config);
        let sync = store.provision_tables(&config.tables, now()).unwrap();
        assert_eq!(sync.created.len(), 2);
        // Unknown clusters fall back to the default one.
        let audit = store.get_table("2_bklog.audit").unwrap().unwrap();
        assert_eq!(audit.storage_cluster_id, 1);

        let reports = engine(&config, &store, &fleet).run_all(now()).await.unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.is_clean()), "{reports:?}");
        for table in &config.tables {
            let naming = IndexNaming::new(&table.table_id).unwrap();
            let index = naming.index_name(&bucket_minutes_back(table, 0), 0, IndexVersion::V2);
            assert!(fleet.cluster(1).has_index(&index));
        }
    }

    // A restart with the same file changes nothing.
    let store = open_store(&config);
    let sync = store.provision_tables(&config.tables, now()).unwrap();
    assert!(sync.created.is_empty() && sync.updated.is_empty());
    assert_eq!(store.get_table(TABLE_ID).unwrap().unwrap().retention, 7);
}

#[test]
fn invalid_declared_table_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = write_config(
        dir.path(),
        "[[tables]]\ntable_id = \"2_bklog.bad\"\nstorage_cluster_id = 1\nretention = -3\n",
    );
    let store = open_store(&config);
    assert!(store.provision_tables(&config.tables, now()).is_err());
    assert!(store.list_tables().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cycle_survives_store_reopen() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "");
    let fleet = Arc::new(MemoryFleet::new());
    let naming = IndexNaming::new(TABLE_ID).unwrap();

    {
        let store = open_store(&config);
        let table = store.create_table(LogicalTable::new(TABLE_ID, 1), now()).unwrap();
        let reports = engine(&config, &store, &fleet).run_all(now()).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].is_clean(), "{:?}", reports[0].errors);

        let index = naming.index_name(&bucket_minutes_back(&table, 0), 0, IndexVersion::V2);
        assert!(fleet.cluster(1).has_index(&index));
        // Buckets up to four hours ahead point at the new index.
        for minutes in [0, -120, -240] {
            let write = naming.write_alias(&bucket_minutes_back(&table, minutes));
            assert_eq!(fleet.cluster(1).indices_with_alias(&write), vec![index.clone()]);
        }
    }

    let store = open_store(&config);
    assert!(store.get_table(TABLE_ID).unwrap().is_some());
    let routing = store.list_routing(&config.routing.key_prefix).unwrap();
    assert_eq!(routing.len(), 1);
    assert_eq!(routing[0].1["storage_id"], 1);
    assert!(store.get_routing(&config.routing.version_key).unwrap().is_some());

    // A second cycle in the same bucket leaves the index alone.
    let reports = engine(&config, &store, &fleet).run_all(now()).await.unwrap();
    assert_eq!(reports[0].rotation, Some(RotationOutcome::Unchanged));
    assert_eq!(fleet.cluster(1).index_names().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn migrated_table_is_served_by_new_cluster() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "");
    let fleet = Arc::new(MemoryFleet::new());
    let naming = IndexNaming::new(TABLE_ID).unwrap();
    let store = open_store(&config);
    let table = store.create_table(LogicalTable::new(TABLE_ID, 1), now()).unwrap();
    let engine = engine(&config, &store, &fleet);

    engine.run_all(now() - TimeDelta::days(1)).await.unwrap();
    assert!(store.migrate_cluster(TABLE_ID, 2, now() - TimeDelta::hours(1)).unwrap());

    let reports = engine.run_all(now()).await.unwrap();
    assert_eq!(reports[0].cluster_id, 2);
    let index = naming.index_name(&bucket_minutes_back(&table, 0), 0, IndexVersion::V2);
    assert!(fleet.cluster(2).has_index(&index));

    // The bucket a day back is readable and writable on the new cluster.
    let previous = bucket_minutes_back(&table, 1440);
    assert_eq!(
        fleet.cluster(2).indices_with_alias(&naming.write_alias(&previous)),
        vec![index.clone()]
    );
    assert_eq!(
        fleet.cluster(2).indices_with_alias(&naming.read_alias(&previous)),
        vec![index]
    );

    // The old cluster still holds live data, so it stays in history.
    assert_eq!(reports[0].history.len(), 1);
    assert!(!reports[0].history[0].retired);
    assert_eq!(store.history_records(TABLE_ID).unwrap().len(), 1);

    let routing = store
        .get_routing(&format!("{}/{}", config.routing.key_prefix, TABLE_ID))
        .unwrap()
        .unwrap();
    assert_eq!(routing["storage_id"], 2);
    assert_eq!(routing["storage_cluster_records"].as_array().unwrap().len(), 2);
}
