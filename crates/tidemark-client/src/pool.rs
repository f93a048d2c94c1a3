//! Client construction and per-cluster caching.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tidemark_core::StorageCluster;
use tracing::debug;

use crate::client::SearchClient;
use crate::error::ClientResult;
use crate::transport::HttpSearchClient;

/// Builds a client for a cluster record.
pub trait ClientFactory: Send + Sync {
    fn connect(&self, cluster: &StorageCluster) -> ClientResult<Arc<dyn SearchClient>>;
}

/// Real HTTP clients.
#[derive(Debug, Clone)]
pub struct HttpClientFactory {
    timeout: Duration,
}

impl HttpClientFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ClientFactory for HttpClientFactory {
    fn connect(&self, cluster: &StorageCluster) -> ClientResult<Arc<dyn SearchClient>> {
        Ok(Arc::new(HttpSearchClient::new(cluster, self.timeout)?))
    }
}

/// Caches one client per cluster id for the lifetime of the pool.
///
/// A cluster whose record changed (new address, credentials) gets a fresh
/// client on the next lookup.
pub struct ClientPool {
    factory: Arc<dyn ClientFactory>,
    clients: Mutex<HashMap<u32, (StorageCluster, Arc<dyn SearchClient>)>>,
}

impl ClientPool {
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            factory,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, cluster: &StorageCluster) -> ClientResult<Arc<dyn SearchClient>> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((known, client)) = clients.get(&cluster.cluster_id) {
            if known == cluster {
                return Ok(Arc::clone(client));
            }
        }
        debug!(cluster_id = cluster.cluster_id, address = %cluster.address(), "connecting cluster client");
        let client = self.factory.connect(cluster)?;
        clients.insert(cluster.cluster_id, (cluster.clone(), Arc::clone(&client)));
        Ok(client)
    }

    pub fn len(&self) -> usize {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryFleet;
    use tidemark_core::{ClusterType, TlsSettings};

    fn cluster(id: u32, host: &str) -> StorageCluster {
        StorageCluster {
            cluster_id: id,
            name: format!("es-{id}"),
            cluster_type: ClusterType::Elasticsearch,
            domain_name: host.to_string(),
            port: 9200,
            schema: "http".to_string(),
            username: None,
            password: None,
            is_auth: false,
            is_default_cluster: false,
            version: None,
            tls: TlsSettings::default(),
        }
    }

    #[test]
    fn caches_per_cluster_and_refreshes_on_change() {
        let fleet = Arc::new(MemoryFleet::new());
        let pool = ClientPool::new(fleet.clone());

        let a = pool.get(&cluster(1, "es-a")).unwrap();
        let again = pool.get(&cluster(1, "es-a")).unwrap();
        assert!(Arc::ptr_eq(&a, &again));

        pool.get(&cluster(2, "es-b")).unwrap();
        assert_eq!(pool.len(), 2);

        let moved = pool.get(&cluster(1, "es-c")).unwrap();
        assert!(!Arc::ptr_eq(&a, &moved));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn http_factory_builds_clients() {
        let pool = ClientPool::new(Arc::new(HttpClientFactory::new(Duration::from_secs(1))));
        assert!(pool.is_empty());
        pool.get(&cluster(7, "localhost")).unwrap();
        assert_eq!(pool.len(), 1);
    }
}
