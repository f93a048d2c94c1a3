//! The cluster operations lifecycle engines rely on.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::ClientResult;
use crate::types::{AliasAction, ClusterHealth, IndexStats, SnapshotInfo};

/// A handle on one search-index cluster.
///
/// Patterns accept comma-separated lists and `*` wildcards. Lookups that
/// match nothing return empty collections rather than `NotFound`.
#[async_trait]
pub trait SearchClient: Send + Sync {
    /// Cluster health at index level, optionally restricted to `index`.
    async fn cluster_health(&self, index: Option<&str>) -> ClientResult<ClusterHealth>;

    /// Persistent cluster settings (nested form).
    async fn get_cluster_settings(&self) -> ClientResult<Value>;

    async fn put_cluster_settings(&self, body: &Value) -> ClientResult<()>;

    /// Fails with `AlreadyExists` when the index is already there.
    async fn create_index(&self, index: &str, body: &Value) -> ClientResult<()>;

    async fn index_exists(&self, index: &str) -> ClientResult<bool>;

    async fn delete_index(&self, index: &str) -> ClientResult<()>;

    /// Primary store size and doc count per matching index.
    async fn indices_stats(&self, pattern: &str) -> ClientResult<BTreeMap<String, IndexStats>>;

    /// `index -> aliases` for matching indices. With `alias` set, only
    /// indices holding a matching alias are listed.
    async fn get_alias(
        &self,
        index_pattern: &str,
        alias: Option<&str>,
    ) -> ClientResult<BTreeMap<String, Vec<String>>>;

    /// Apply all actions atomically.
    async fn update_aliases(&self, actions: &[AliasAction]) -> ClientResult<()>;

    async fn delete_alias(&self, index: &str, aliases: &[String]) -> ClientResult<()>;

    /// The `mappings` object of one index, `None` if the index is missing.
    async fn get_mapping(&self, index: &str) -> ClientResult<Option<Value>>;

    async fn put_mapping(&self, indices: &[String], body: &Value) -> ClientResult<()>;

    /// Flat settings (`index.routing.allocation...`) per matching index.
    async fn get_settings(
        &self,
        index_pattern: &str,
    ) -> ClientResult<BTreeMap<String, Map<String, Value>>>;

    async fn put_settings(&self, indices: &[String], body: &Value) -> ClientResult<()>;

    async fn count(&self, index: &str) -> ClientResult<u64>;

    /// Epoch-millis value of `field` on the oldest (or newest) document.
    async fn edge_document_time(
        &self,
        index: &str,
        field: &str,
        newest: bool,
    ) -> ClientResult<Option<i64>>;

    async fn create_snapshot(
        &self,
        repository: &str,
        snapshot: &str,
        indices: &[String],
    ) -> ClientResult<()>;

    async fn get_snapshots(&self, repository: &str, pattern: &str) -> ClientResult<Vec<SnapshotInfo>>;

    async fn delete_snapshot(&self, repository: &str, snapshot: &str) -> ClientResult<()>;
}
