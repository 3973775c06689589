//! Round-robin service discovery over the topology.
//!
//! Providers are the members advertising an exact `(service, version)` pair,
//! ordered by node id. Each pair has its own counter, so P consecutive
//! selections hit each of P providers once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use node_crypto::TransportIdentity;
use node_proto::mesh::{NodeDescriptor, ServiceRef};
use tracing::debug;

use crate::client::MeshClient;
use crate::config::NetworkConfig;
use crate::error::{MeshError, Result};
use crate::tcp_transport::TlsConnection;
use crate::topology::Topology;

struct Cached {
    conn: Arc<TlsConnection>,
    last_used: Instant,
}

pub struct ClientPool {
    topology: Arc<Topology>,
    identity: Option<Arc<TransportIdentity>>,
    network: NetworkConfig,
    counters: Mutex<HashMap<ServiceRef, Arc<AtomicUsize>>>,
    connections: tokio::sync::Mutex<HashMap<String, Cached>>,
}

/// A ready connection to one provider of one service.
#[derive(Debug, Clone)]
pub struct ServiceConn {
    pub provider: NodeDescriptor,
    pub service: ServiceRef,
    pub client: MeshClient,
}

impl ServiceConn {
    pub async fn call(&self, method: &str, payload: Vec<u8>) -> Result<Vec<u8>> {
        self.client
            .call_service(&self.service.name, &self.service.version, method, payload)
            .await
    }
}

impl ClientPool {
    pub fn new(
        topology: Arc<Topology>,
        identity: Option<Arc<TransportIdentity>>,
        network: NetworkConfig,
    ) -> Self {
        Self {
            topology,
            identity,
            network,
            counters: Mutex::new(HashMap::new()),
            connections: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    fn counter(&self, key: &ServiceRef) -> Arc<AtomicUsize> {
        self.counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Next provider in rotation, without dialling it.
    pub fn select_provider(&self, service: &str, version: &str) -> Result<NodeDescriptor> {
        let mut providers = self.topology.get_service_providers(service, version);
        if providers.is_empty() {
            return Err(MeshError::NoProviders {
                service: service.to_string(),
                version: version.to_string(),
            });
        }
        let n = self
            .counter(&ServiceRef::new(service, version))
            .fetch_add(1, Ordering::Relaxed);
        Ok(providers.swap_remove(n % providers.len()))
    }

    /// Select a provider and return a connection to it, reusing a cached one.
    pub async fn get_conn(&self, service: &str, version: &str) -> Result<ServiceConn> {
        let provider = self.select_provider(service, version)?;
        let conn = self.connection_to(&provider).await?;
        Ok(ServiceConn {
            service: ServiceRef::new(service, version),
            client: MeshClient::new(conn, self.network.request_timeout()),
            provider,
        })
    }

    async fn connection_to(&self, provider: &NodeDescriptor) -> Result<Arc<TlsConnection>> {
        {
            let mut cache = self.connections.lock().await;
            if let Some(cached) = cache.get_mut(&provider.id) {
                if cached.conn.address() == provider.address {
                    cached.last_used = Instant::now();
                    return Ok(cached.conn.clone());
                }
                debug!("{} moved to {}; dropping cached connection", provider.id, provider.address);
                cache.remove(&provider.id);
            }
        }

        let identity = self.identity.clone().ok_or(MeshError::NoTransportIdentity)?;
        let conn = Arc::new(
            TlsConnection::connect(
                identity,
                &provider.id,
                &provider.address,
                self.network.dial_timeout(),
            )
            .await?,
        );

        let mut cache = self.connections.lock().await;
        if let Some(existing) = cache.get(&provider.id) {
            if existing.conn.address() == provider.address {
                return Ok(existing.conn.clone());
            }
        }
        if cache.len() >= self.network.pool_size {
            evict_one(&mut cache);
        }
        cache.insert(
            provider.id.clone(),
            Cached {
                conn: conn.clone(),
                last_used: Instant::now(),
            },
        );
        Ok(conn)
    }

    pub async fn cached_connections(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn close(&self) -> Result<()> {
        let cached: Vec<_> = self.connections.lock().await.drain().collect();
        let mut failures = Vec::new();
        for (id, entry) in cached {
            if let Err(e) = entry.conn.close().await {
                failures.push(format!("{id}: {e}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(MeshError::Close(failures))
        }
    }
}

/// Drop a broken connection if there is one, otherwise the least recently used.
fn evict_one(cache: &mut HashMap<String, Cached>) {
    let victim = cache
        .iter()
        .min_by_key(|(_, c)| (c.conn.is_connected(), c.last_used))
        .map(|(id, _)| id.clone());
    if let Some(id) = victim {
        debug!("evicting pooled connection to {id}");
        cache.remove(&id);
    }
}

/// Typed access to one service: each `stub()` picks the next provider and
/// wraps the connection with `make_stub`.
pub struct ServiceClient<T> {
    pool: Arc<ClientPool>,
    service: String,
    version: String,
    make_stub: Arc<dyn Fn(ServiceConn) -> T + Send + Sync>,
}

impl<T> Clone for ServiceClient<T> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            service: self.service.clone(),
            version: self.version.clone(),
            make_stub: self.make_stub.clone(),
        }
    }
}

impl<T> ServiceClient<T> {
    pub fn new(
        pool: Arc<ClientPool>,
        service: impl Into<String>,
        version: impl Into<String>,
        make_stub: impl Fn(ServiceConn) -> T + Send + Sync + 'static,
    ) -> Self {
        Self {
            pool,
            service: service.into(),
            version: version.into(),
            make_stub: Arc::new(make_stub),
        }
    }

    pub async fn stub(&self) -> Result<T> {
        let conn = self.pool.get_conn(&self.service, &self.version).await?;
        Ok((self.make_stub)(conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(providers: &[(&str, &str)]) -> ClientPool {
        let topology = Arc::new(Topology::new());
        for (id, version) in providers {
            topology
                .add_node(
                    NodeDescriptor::new(*id, *id, "node", "127.0.0.1:1").with_service("kv", *version),
                )
                .unwrap();
        }
        ClientPool::new(topology, None, NetworkConfig::default())
    }

    #[test]
    fn each_provider_once_per_cycle() {
        let pool = pool_with(&[("c", "v1"), ("a", "v1"), ("b", "v1"), ("d", "v2")]);
        let picks: Vec<_> = (0..6)
            .map(|_| pool.select_provider("kv", "v1").unwrap().id)
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn counters_are_per_service_version() {
        let pool = pool_with(&[("a", "v1"), ("b", "v1"), ("c", "v2")]);
        assert_eq!(pool.select_provider("kv", "v1").unwrap().id, "a");
        assert_eq!(pool.select_provider("kv", "v2").unwrap().id, "c");
        assert_eq!(pool.select_provider("kv", "v1").unwrap().id, "b");
    }

    #[test]
    fn concurrent_selection_stays_balanced() {
        let pool = pool_with(&[("a", "v1"), ("b", "v1"), ("c", "v1"), ("d", "v1")]);
        let counts = Mutex::new(HashMap::<String, usize>::new());
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        let id = pool.select_provider("kv", "v1").unwrap().id;
                        *counts.lock().unwrap().entry(id).or_default() += 1;
                    }
                });
            }
        });
        let counts = counts.into_inner().unwrap();
        assert_eq!(counts.len(), 4);
        assert!(counts.values().all(|&n| n == 100));
    }

    #[tokio::test]
    async fn missing_service_has_no_providers() {
        let pool = pool_with(&[("a", "v1")]);
        assert!(matches!(
            pool.get_conn("kv", "v9").await,
            Err(MeshError::NoProviders { .. })
        ));
        assert!(matches!(
            pool.select_provider("search", "v1"),
            Err(MeshError::NoProviders { .. })
        ));
    }

    #[tokio::test]
    async fn dialling_requires_identity() {
        let pool = pool_with(&[("a", "v1")]);
        assert!(matches!(
            pool.get_conn("kv", "v1").await,
            Err(MeshError::NoTransportIdentity)
        ));
        assert_eq!(pool.cached_connections().await, 0);
    }
}
