//! In-memory search cluster.
//!
//! Behaves like a single-node cluster for the operations in
//! [`SearchClient`], with fault injection for the failure paths the
//! lifecycle engines must survive. Every mutating call is appended to an
//! operations log.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tidemark_core::StorageCluster;

use crate::client::SearchClient;
use crate::error::{ClientError, ClientResult};
use crate::pool::ClientFactory;
use crate::types::{
    AliasAction, BYTES_PER_GB, ClusterHealth, HealthColor, IndexHealth, IndexStats, SnapshotInfo,
    SnapshotState,
};

#[derive(Debug, Clone)]
struct MemoryIndex {
    aliases: BTreeSet<String>,
    doc_count: u64,
    size_bytes: u64,
    health: HealthColor,
    settings: Map<String, Value>,
    mapping: Value,
    first_time: Option<i64>,
    last_time: Option<i64>,
}

#[derive(Debug)]
struct MemState {
    indices: BTreeMap<String, MemoryIndex>,
    snapshots: BTreeMap<String, BTreeMap<String, SnapshotInfo>>,
    cluster_settings: Map<String, Value>,
    new_index_health: HealthColor,
    snapshot_state: SnapshotState,
    unavailable: bool,
    fail_update_aliases: u32,
    fail_create_index: u32,
    failing_deletes: HashSet<String>,
    fail_put_settings: bool,
    fail_snapshot_create: bool,
    ops: Vec<String>,
}

impl Default for MemState {
    fn default() -> Self {
        Self {
            indices: BTreeMap::new(),
            snapshots: BTreeMap::new(),
            cluster_settings: Map::new(),
            new_index_health: HealthColor::Green,
            snapshot_state: SnapshotState::Success,
            unavailable: false,
            fail_update_aliases: 0,
            fail_create_index: 0,
            failing_deletes: HashSet::new(),
            fail_put_settings: false,
            fail_snapshot_create: false,
            ops: Vec::new(),
        }
    }
}

/// A shared handle on one in-memory cluster. Clones see the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryCluster {
    state: Arc<Mutex<MemState>>,
}

/// `*` wildcard match against one name.
fn glob(pattern: &str, name: &str) -> bool {
    let p = pattern.as_bytes();
    let n = name.as_bytes();
    let (mut pi, mut ni) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while ni < n.len() {
        if pi < p.len() && p[pi] == b'*' {
            star = Some((pi, ni));
            pi += 1;
        } else if pi < p.len() && p[pi] == n[ni] {
            pi += 1;
            ni += 1;
        } else if let Some((sp, sn)) = star {
            pi = sp + 1;
            ni = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == b'*')
}

/// Comma-separated list of globs.
fn matches(patterns: &str, name: &str) -> bool {
    patterns
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .any(|p| glob(p, name))
}

fn flatten(prefix: &str, value: &Value, out: &mut Map<String, Value>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten(&path, child, out);
            }
        }
        leaf => {
            let key = if prefix.starts_with("index.") {
                prefix.to_string()
            } else {
                format!("index.{prefix}")
            };
            out.insert(key, leaf.clone());
        }
    }
}

fn unavailable() -> ClientError {
    ClientError::Unavailable("memory cluster marked unavailable".to_string())
}

fn injected(method: &str, path: &str) -> ClientError {
    ClientError::Status {
        method: method.to_string(),
        path: path.to_string(),
        status: 503,
        body: "injected failure".to_string(),
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock for a cluster call, failing when marked unavailable.
    fn call(&self) -> ClientResult<MutexGuard<'_, MemState>> {
        let state = self.lock();
        if state.unavailable {
            return Err(unavailable());
        }
        Ok(state)
    }

    // ── Setup ──────────────────────────────────────────────────────

    /// Add an index with the given doc count and primary store size.
    pub fn add_index(&self, name: &str, doc_count: u64, size_bytes: u64) {
        let mut state = self.lock();
        let health = state.new_index_health;
        state.indices.insert(
            name.to_string(),
            MemoryIndex {
                aliases: BTreeSet::new(),
                doc_count,
                size_bytes,
                health,
                settings: Map::new(),
                mapping: json!({"properties": {}}),
                first_time: None,
                last_time: None,
            },
        );
    }

    pub fn set_docs(&self, name: &str, doc_count: u64, size_gb: f64) {
        if let Some(index) = self.lock().indices.get_mut(name) {
            index.doc_count = doc_count;
            index.size_bytes = (size_gb * BYTES_PER_GB as f64) as u64;
        }
    }

    pub fn set_mapping(&self, name: &str, mapping: Value) {
        if let Some(index) = self.lock().indices.get_mut(name) {
            index.mapping = mapping;
        }
    }

    pub fn set_health(&self, name: &str, health: HealthColor) {
        if let Some(index) = self.lock().indices.get_mut(name) {
            index.health = health;
        }
    }

    /// Health given to indices created from now on.
    pub fn set_new_index_health(&self, health: HealthColor) {
        self.lock().new_index_health = health;
    }

    pub fn set_doc_times(&self, name: &str, first: Option<i64>, last: Option<i64>) {
        if let Some(index) = self.lock().indices.get_mut(name) {
            index.first_time = first;
            index.last_time = last;
        }
    }

    pub fn set_index_setting(&self, name: &str, key: &str, value: Value) {
        if let Some(index) = self.lock().indices.get_mut(name) {
            index.settings.insert(key.to_string(), value);
        }
    }

    pub fn add_alias(&self, index: &str, alias: &str) {
        if let Some(entry) = self.lock().indices.get_mut(index) {
            entry.aliases.insert(alias.to_string());
        }
    }

    pub fn add_snapshot(&self, repository: &str, name: &str, indices: &[&str], state: SnapshotState) {
        self.lock()
            .snapshots
            .entry(repository.to_string())
            .or_default()
            .insert(
                name.to_string(),
                SnapshotInfo {
                    snapshot: name.to_string(),
                    state,
                    indices: indices.iter().map(|i| i.to_string()).collect(),
                    start_time_in_millis: None,
                },
            );
    }

    // ── Fault injection ────────────────────────────────────────────

    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Fail the next `n` `update_aliases` calls.
    pub fn fail_next_update_aliases(&self, n: u32) {
        self.lock().fail_update_aliases = n;
    }

    /// Fail the next `n` `create_index` calls.
    pub fn fail_next_create_index(&self, n: u32) {
        self.lock().fail_create_index = n;
    }

    pub fn fail_delete(&self, index: &str) {
        self.lock().failing_deletes.insert(index.to_string());
    }

    pub fn fail_put_settings(&self, fail: bool) {
        self.lock().fail_put_settings = fail;
    }

    pub fn fail_snapshot_create(&self, fail: bool) {
        self.lock().fail_snapshot_create = fail;
    }

    /// State reported for snapshots created from now on.
    pub fn set_snapshot_state(&self, state: SnapshotState) {
        self.lock().snapshot_state = state;
    }

    // ── Inspection ─────────────────────────────────────────────────

    pub fn index_names(&self) -> Vec<String> {
        self.lock().indices.keys().cloned().collect()
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.lock().indices.contains_key(name)
    }

    pub fn aliases_of(&self, index: &str) -> Vec<String> {
        self.lock()
            .indices
            .get(index)
            .map(|i| i.aliases.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Indices currently holding `alias`.
    pub fn indices_with_alias(&self, alias: &str) -> Vec<String> {
        self.lock()
            .indices
            .iter()
            .filter(|(_, i)| i.aliases.contains(alias))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn settings_of(&self, index: &str) -> Map<String, Value> {
        self.lock()
            .indices
            .get(index)
            .map(|i| i.settings.clone())
            .unwrap_or_default()
    }

    pub fn mapping_of(&self, index: &str) -> Option<Value> {
        self.lock().indices.get(index).map(|i| i.mapping.clone())
    }

    pub fn snapshot_names(&self, repository: &str) -> Vec<String> {
        self.lock()
            .snapshots
            .get(repository)
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn cluster_settings(&self) -> Map<String, Value> {
        self.lock().cluster_settings.clone()
    }

    /// Mutating calls in order, e.g. `create_index v2_t_2024030900_0`.
    pub fn operations(&self) -> Vec<String> {
        self.lock().ops.clone()
    }
}

#[async_trait]
impl SearchClient for MemoryCluster {
    async fn cluster_health(&self, index: Option<&str>) -> ClientResult<ClusterHealth> {
        let state = self.call()?;
        let indices: BTreeMap<String, IndexHealth> = state
            .indices
            .iter()
            .filter(|(name, _)| index.is_none_or(|p| matches(p, name)))
            .map(|(name, i)| {
                (
                    name.clone(),
                    IndexHealth {
                        status: i.health,
                        number_of_shards: 1,
                        number_of_replicas: 0,
                        active_shards: u32::from(i.health != HealthColor::Red),
                        unassigned_shards: u32::from(i.health == HealthColor::Red),
                    },
                )
            })
            .collect();
        let status = if index.is_some() && indices.is_empty() {
            HealthColor::Red
        } else {
            indices
                .values()
                .map(|h| h.status)
                .max()
                .unwrap_or(HealthColor::Green)
        };
        Ok(ClusterHealth { status, indices })
    }

    async fn get_cluster_settings(&self) -> ClientResult<Value> {
        Ok(Value::Object(self.call()?.cluster_settings.clone()))
    }

    async fn put_cluster_settings(&self, body: &Value) -> ClientResult<()> {
        let mut state = self.call()?;
        if let Some(persistent) = body.get("persistent").and_then(Value::as_object) {
            for (key, value) in persistent {
                state.cluster_settings.insert(key.clone(), value.clone());
            }
        }
        state.ops.push("put_cluster_settings".to_string());
        Ok(())
    }

    async fn create_index(&self, index: &str, body: &Value) -> ClientResult<()> {
        let mut state = self.call()?;
        if state.fail_create_index > 0 {
            state.fail_create_index -= 1;
            return Err(injected("PUT", &format!("/{index}")));
        }
        if state.indices.contains_key(index) {
            return Err(ClientError::AlreadyExists(index.to_string()));
        }
        let mut settings = Map::new();
        if let Some(s) = body.get("settings") {
            flatten("", s, &mut settings);
        }
        let mapping = body
            .get("mappings")
            .cloned()
            .unwrap_or_else(|| json!({"properties": {}}));
        let health = state.new_index_health;
        state.indices.insert(
            index.to_string(),
            MemoryIndex {
                aliases: BTreeSet::new(),
                doc_count: 0,
                size_bytes: 0,
                health,
                settings,
                mapping,
                first_time: None,
                last_time: None,
            },
        );
        state.ops.push(format!("create_index {index}"));
        Ok(())
    }

    async fn index_exists(&self, index: &str) -> ClientResult<bool> {
        Ok(self.call()?.indices.contains_key(index))
    }

    async fn delete_index(&self, index: &str) -> ClientResult<()> {
        let mut state = self.call()?;
        if state.failing_deletes.contains(index) {
            return Err(injected("DELETE", &format!("/{index}")));
        }
        if state.indices.remove(index).is_none() {
            return Err(ClientError::NotFound(index.to_string()));
        }
        state.ops.push(format!("delete_index {index}"));
        Ok(())
    }

    async fn indices_stats(&self, pattern: &str) -> ClientResult<BTreeMap<String, IndexStats>> {
        let state = self.call()?;
        Ok(state
            .indices
            .iter()
            .filter(|(name, _)| matches(pattern, name))
            .map(|(name, i)| {
                (
                    name.clone(),
                    IndexStats {
                        size_in_bytes: i.size_bytes,
                        doc_count: i.doc_count,
                    },
                )
            })
            .collect())
    }

    async fn get_alias(
        &self,
        index_pattern: &str,
        alias: Option<&str>,
    ) -> ClientResult<BTreeMap<String, Vec<String>>> {
        let state = self.call()?;
        let mut out = BTreeMap::new();
        for (name, index) in &state.indices {
            if !matches(index_pattern, name) {
                continue;
            }
            let aliases: Vec<String> = index
                .aliases
                .iter()
                .filter(|a| alias.is_none_or(|p| matches(p, a)))
                .cloned()
                .collect();
            if alias.is_some() && aliases.is_empty() {
                continue;
            }
            out.insert(name.clone(), aliases);
        }
        Ok(out)
    }

    async fn update_aliases(&self, actions: &[AliasAction]) -> ClientResult<()> {
        let mut state = self.call()?;
        if state.fail_update_aliases > 0 {
            state.fail_update_aliases -= 1;
            return Err(injected("POST", "/_aliases"));
        }
        // All or nothing.
        for action in actions {
            match action {
                AliasAction::Add { index, .. } => {
                    if !state.indices.contains_key(index) {
                        return Err(ClientError::NotFound(index.clone()));
                    }
                }
                AliasAction::Remove { index, alias } => {
                    let present = state
                        .indices
                        .get(index)
                        .is_some_and(|i| i.aliases.contains(alias));
                    if !present {
                        return Err(ClientError::NotFound(format!("{index}/{alias}")));
                    }
                }
            }
        }
        for action in actions {
            match action {
                AliasAction::Add { index, alias } => {
                    if let Some(i) = state.indices.get_mut(index) {
                        i.aliases.insert(alias.clone());
                    }
                    state.ops.push(format!("add_alias {index} {alias}"));
                }
                AliasAction::Remove { index, alias } => {
                    if let Some(i) = state.indices.get_mut(index) {
                        i.aliases.remove(alias);
                    }
                    state.ops.push(format!("remove_alias {index} {alias}"));
                }
            }
        }
        Ok(())
    }

    async fn delete_alias(&self, index: &str, aliases: &[String]) -> ClientResult<()> {
        let mut state = self.call()?;
        let entry = state
            .indices
            .get_mut(index)
            .ok_or_else(|| ClientError::NotFound(index.to_string()))?;
        for alias in aliases {
            entry.aliases.remove(alias);
        }
        state
            .ops
            .push(format!("delete_alias {index} {}", aliases.join(",")));
        Ok(())
    }

    async fn get_mapping(&self, index: &str) -> ClientResult<Option<Value>> {
        Ok(self.call()?.indices.get(index).map(|i| i.mapping.clone()))
    }

    async fn put_mapping(&self, indices: &[String], body: &Value) -> ClientResult<()> {
        let mut state = self.call()?;
        if let Some(missing) = indices.iter().find(|i| !state.indices.contains_key(*i)) {
            return Err(ClientError::NotFound(missing.clone()));
        }
        let added = body
            .get("properties")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        for name in indices {
            if let Some(index) = state.indices.get_mut(name) {
                if !index.mapping.get("properties").is_some_and(Value::is_object) {
                    index.mapping["properties"] = json!({});
                }
                if let Some(props) = index.mapping["properties"].as_object_mut() {
                    for (field, value) in &added {
                        props.insert(field.clone(), value.clone());
                    }
                }
            }
        }
        state.ops.push(format!("put_mapping {}", indices.join(",")));
        Ok(())
    }

    async fn get_settings(
        &self,
        index_pattern: &str,
    ) -> ClientResult<BTreeMap<String, Map<String, Value>>> {
        let state = self.call()?;
        Ok(state
            .indices
            .iter()
            .filter(|(name, _)| matches(index_pattern, name))
            .map(|(name, i)| (name.clone(), i.settings.clone()))
            .collect())
    }

    async fn put_settings(&self, indices: &[String], body: &Value) -> ClientResult<()> {
        let mut state = self.call()?;
        if state.fail_put_settings {
            return Err(injected("PUT", &format!("/{}/_settings", indices.join(","))));
        }
        let mut flat = Map::new();
        flatten("", body, &mut flat);
        for name in indices {
            let index = state
                .indices
                .get_mut(name)
                .ok_or_else(|| ClientError::NotFound(name.clone()))?;
            for (key, value) in &flat {
                index.settings.insert(key.clone(), value.clone());
            }
        }
        state.ops.push(format!("put_settings {}", indices.join(",")));
        Ok(())
    }

    async fn count(&self, index: &str) -> ClientResult<u64> {
        self.call()?
            .indices
            .get(index)
            .map(|i| i.doc_count)
            .ok_or_else(|| ClientError::NotFound(index.to_string()))
    }

    async fn edge_document_time(
        &self,
        index: &str,
        _field: &str,
        newest: bool,
    ) -> ClientResult<Option<i64>> {
        let state = self.call()?;
        let entry = state
            .indices
            .get(index)
            .ok_or_else(|| ClientError::NotFound(index.to_string()))?;
        Ok(if newest {
            entry.last_time
        } else {
            entry.first_time
        })
    }

    async fn create_snapshot(
        &self,
        repository: &str,
        snapshot: &str,
        indices: &[String],
    ) -> ClientResult<()> {
        let mut state = self.call()?;
        if state.fail_snapshot_create {
            return Err(injected("PUT", &format!("/_snapshot/{repository}/{snapshot}")));
        }
        if let Some(missing) = indices.iter().find(|i| !state.indices.contains_key(*i)) {
            return Err(ClientError::NotFound(missing.clone()));
        }
        let snapshot_state = state.snapshot_state;
        let repo = state.snapshots.entry(repository.to_string()).or_default();
        if repo.contains_key(snapshot) {
            return Err(ClientError::Status {
                method: "PUT".to_string(),
                path: format!("/_snapshot/{repository}/{snapshot}"),
                status: 400,
                body: "invalid_snapshot_name_exception".to_string(),
            });
        }
        repo.insert(
            snapshot.to_string(),
            SnapshotInfo {
                snapshot: snapshot.to_string(),
                state: snapshot_state,
                indices: indices.to_vec(),
                start_time_in_millis: None,
            },
        );
        state.ops.push(format!("create_snapshot {repository}/{snapshot}"));
        Ok(())
    }

    async fn get_snapshots(&self, repository: &str, pattern: &str) -> ClientResult<Vec<SnapshotInfo>> {
        let state = self.call()?;
        Ok(state
            .snapshots
            .get(repository)
            .map(|repo| {
                repo.values()
                    .filter(|s| matches(pattern, &s.snapshot))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_snapshot(&self, repository: &str, snapshot: &str) -> ClientResult<()> {
        let mut state = self.call()?;
        let removed = state
            .snapshots
            .get_mut(repository)
            .and_then(|repo| repo.remove(snapshot));
        if removed.is_none() {
            return Err(ClientError::NotFound(format!("{repository}/{snapshot}")));
        }
        state.ops.push(format!("delete_snapshot {repository}/{snapshot}"));
        Ok(())
    }
}

/// A set of in-memory clusters keyed by cluster id.
#[derive(Debug, Default)]
pub struct MemoryFleet {
    clusters: Mutex<HashMap<u32, MemoryCluster>>,
    unreachable: Mutex<HashSet<u32>>,
}

impl MemoryFleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cluster behind `cluster_id`, created empty on first use.
    pub fn cluster(&self, cluster_id: u32) -> MemoryCluster {
        self.clusters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(cluster_id)
            .or_default()
            .clone()
    }

    /// Make `connect` fail for `cluster_id`.
    pub fn set_unreachable(&self, cluster_id: u32, unreachable: bool) {
        let mut set = self.unreachable.lock().unwrap_or_else(PoisonError::into_inner);
        if unreachable {
            set.insert(cluster_id);
        } else {
            set.remove(&cluster_id);
        }
    }
}

impl ClientFactory for MemoryFleet {
    fn connect(&self, cluster: &StorageCluster) -> ClientResult<Arc<dyn SearchClient>> {
        let unreachable = self
            .unreachable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&cluster.cluster_id);
        if unreachable {
            return Err(ClientError::Connect {
                address: cluster.address(),
                message: "unreachable".to_string(),
            });
        }
        Ok(Arc::new(self.cluster(cluster.cluster_id)))
    }
}
