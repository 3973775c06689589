//! Connected peers: one pooled mTLS connection per peer id.

use std::collections::HashMap;
use std::sync::Arc;

use node_crypto::TransportIdentity;
use node_proto::mesh::{HealthReport, JoinRequest, NodeDescriptor, NodeInfo, Pong, SyncTopologyResponse, Vote};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::client::MeshClient;
use crate::config::NetworkConfig;
use crate::error::{MeshError, Result};
use crate::tcp_transport::TlsConnection;

#[derive(Debug, Clone)]
pub struct Peer {
    pub descriptor: NodeDescriptor,
    pub client: MeshClient,
}

impl Peer {
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }
}

pub struct PeerManager {
    local_id: String,
    identity: Option<Arc<TransportIdentity>>,
    network: NetworkConfig,
    peers: RwLock<HashMap<String, Peer>>,
}

impl PeerManager {
    pub fn new(
        local_id: impl Into<String>,
        identity: Option<Arc<TransportIdentity>>,
        network: NetworkConfig,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            identity,
            network,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Dial `descriptor` and keep the connection. The dial happens outside
    /// the map lock; a concurrent add of the same id loses with `AlreadyExists`.
    pub async fn add_peer(&self, descriptor: NodeDescriptor) -> Result<Peer> {
        let identity = self.identity.clone().ok_or(MeshError::NoTransportIdentity)?;
        if descriptor.id == self.local_id {
            return Err(MeshError::InvalidDescriptor(format!(
                "refusing to add self ({}) as a peer",
                descriptor.id
            )));
        }
        if self.peers.read().await.contains_key(&descriptor.id) {
            return Err(MeshError::AlreadyExists(format!("peer {}", descriptor.id)));
        }

        let conn = TlsConnection::connect(
            identity,
            &descriptor.id,
            &descriptor.address,
            self.network.dial_timeout(),
        )
        .await?;
        let peer = Peer {
            client: MeshClient::new(Arc::new(conn), self.network.request_timeout()),
            descriptor,
        };

        let mut peers = self.peers.write().await;
        if peers.contains_key(peer.id()) {
            drop(peers);
            let _ = peer.client.close().await;
            return Err(MeshError::AlreadyExists(format!("peer {}", peer.descriptor.id)));
        }
        peers.insert(peer.descriptor.id.clone(), peer.clone());
        info!("peer {} added at {}", peer.descriptor.id, peer.descriptor.address);
        Ok(peer)
    }

    pub async fn remove_peer(&self, peer_id: &str) -> Result<()> {
        let peer = self
            .peers
            .write()
            .await
            .remove(peer_id)
            .ok_or_else(|| MeshError::PeerNotFound(peer_id.to_string()))?;
        if let Err(e) = peer.client.close().await {
            debug!("closing {peer_id}: {e}");
        }
        info!("peer {peer_id} removed");
        Ok(())
    }

    pub async fn get_peer(&self, peer_id: &str) -> Result<Peer> {
        self.peers
            .read()
            .await
            .get(peer_id)
            .cloned()
            .ok_or_else(|| MeshError::PeerNotFound(peer_id.to_string()))
    }

    pub async fn get_all_peers(&self) -> Vec<Peer> {
        let mut peers: Vec<_> = self.peers.read().await.values().cloned().collect();
        peers.sort_by(|a, b| a.descriptor.id.cmp(&b.descriptor.id));
        peers
    }

    pub async fn get_peers_by_type(&self, node_type: &str) -> Vec<Peer> {
        self.get_all_peers()
            .await
            .into_iter()
            .filter(|p| p.descriptor.node_type == node_type)
            .collect()
    }

    pub async fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.peers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn contains(&self, peer_id: &str) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    /// Refresh the stored descriptor without touching the connection.
    pub async fn update_descriptor(&self, descriptor: NodeDescriptor) -> Result<()> {
        let mut peers = self.peers.write().await;
        let peer = peers
            .get_mut(&descriptor.id)
            .ok_or_else(|| MeshError::PeerNotFound(descriptor.id.clone()))?;
        peer.descriptor = descriptor;
        Ok(())
    }

    pub async fn is_connected(&self, peer_id: &str) -> bool {
        self.peers
            .read()
            .await
            .get(peer_id)
            .is_some_and(|p| p.client.is_connected())
    }

    async fn client(&self, peer_id: &str) -> Result<MeshClient> {
        Ok(self.get_peer(peer_id).await?.client)
    }

    pub async fn ping_peer(&self, peer_id: &str, nonce: u64) -> Result<Pong> {
        self.client(peer_id).await?.ping(nonce).await
    }

    pub async fn get_peer_health(&self, peer_id: &str) -> Result<HealthReport> {
        self.client(peer_id).await?.get_health().await
    }

    pub async fn get_peer_node_info(&self, peer_id: &str) -> Result<NodeInfo> {
        self.client(peer_id).await?.get_node_info().await
    }

    pub async fn sync_topology(&self, peer_id: &str, known_version: u64) -> Result<SyncTopologyResponse> {
        self.client(peer_id).await?.sync_topology(known_version).await
    }

    pub async fn request_vote(&self, peer_id: &str, request: JoinRequest) -> Result<Vote> {
        self.client(peer_id).await?.request_vote(request).await
    }

    /// Close every connection and empty the map. Every peer is attempted;
    /// failures are reported together.
    pub async fn close(&self) -> Result<()> {
        let peers: Vec<_> = self.peers.write().await.drain().collect();
        let mut failures = Vec::new();
        for (id, peer) in peers {
            if let Err(e) = peer.client.close().await {
                warn!("closing peer {id}: {e}");
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
