//! Cluster registry lookups.

use tidemark_core::{ClusterType, StorageCluster};

use crate::error::{StateError, StateResult};
use crate::store::StateStore;

/// Read side of the cluster catalog, used by every lifecycle component.
pub trait ClusterRegistry: Send + Sync {
    /// Look a cluster up by id; an unknown id is a configuration error.
    fn resolve(&self, cluster_id: u32) -> StateResult<StorageCluster>;

    /// The default cluster of a type.
    fn list_default(&self, cluster_type: ClusterType) -> StateResult<StorageCluster>;
}

impl ClusterRegistry for StateStore {
    fn resolve(&self, cluster_id: u32) -> StateResult<StorageCluster> {
        self.get_cluster(cluster_id)?
            .ok_or_else(|| StateError::NotFound(format!("cluster {cluster_id}")))
    }

    fn list_default(&self, cluster_type: ClusterType) -> StateResult<StorageCluster> {
        self.list_clusters()?
            .into_iter()
            .find(|c| c.cluster_type == cluster_type && c.is_default_cluster)
            .ok_or_else(|| {
                StateError::NotFound(format!("default {} cluster", cluster_type.as_str()))
            })
    }
}
