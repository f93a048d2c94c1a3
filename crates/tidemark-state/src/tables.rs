//! redb table definitions for the Tidemark state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Storage clusters keyed by `{cluster_id}`.
pub const CLUSTERS: JsonTable = TableDefinition::new("clusters");

/// Logical tables keyed by `{table_id}`.
pub const TABLES: JsonTable = TableDefinition::new("tables");

/// Storage cluster history keyed by `{table_id}:{create_micros}:{cluster_id}`.
pub const CLUSTER_RECORDS: JsonTable = TableDefinition::new("cluster_records");

/// Snapshot policies keyed by `{table_id}`.
pub const SNAPSHOT_POLICIES: JsonTable = TableDefinition::new("snapshot_policies");

/// Archived index rows keyed by `{table_id}/{snapshot_name}/{index_name}`.
pub const SNAPSHOT_INDICES: JsonTable = TableDefinition::new("snapshot_indices");

/// Published routing documents keyed by their full routing key.
pub const ROUTING: JsonTable = TableDefinition::new("routing");
