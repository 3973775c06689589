//! One mesh node: topology, consensus, peers, server, discovery and health
//! wired together around a single configuration value.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use node_crypto::{load_external, load_or_generate, ExternalMaterial, ProvisionOptions, TransportIdentity};
use node_proto::mesh::{JoinRequest, NodeDescriptor};
use node_proto::now_ms;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::MeshClient;
use crate::config::{IdentitySource, MeshConfig};
use crate::consensus::{admit_into, ConsensusManager};
use crate::discovery::ClientPool;
use crate::error::{MeshError, Result};
use crate::health::{HealthCheck, HealthMonitor, HealthState, PeerHealthMonitor};
use crate::peers::PeerManager;
use crate::server::{MeshServer, MeshService, ServiceHandler, ServiceRegistry};
use crate::tcp_transport::TlsConnection;
use crate::topology::Topology;

pub struct MeshNode {
    config: MeshConfig,
    identity: Option<Arc<TransportIdentity>>,
    topology: Arc<Topology>,
    consensus: Arc<ConsensusManager>,
    peers: Arc<PeerManager>,
    health: Arc<HealthState>,
    peer_health: Arc<PeerHealthMonitor>,
    services: Arc<ServiceRegistry>,
    server: Arc<MeshServer>,
    pool: Arc<ClientPool>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MeshNode {
    /// Load the identity named by `config.identity`.
    pub fn provision(config: &MeshConfig) -> Result<Arc<TransportIdentity>> {
        let options = ProvisionOptions {
            required_sans: config.required_sans.clone(),
        };
        let identity = match &config.identity {
            IdentitySource::DevCa { cert_dir } => load_or_generate(&config.node.id, cert_dir, &options),
            IdentitySource::Files { cert, key, ca_cert } => {
                ExternalMaterial::from_files(cert, key, ca_cert)
                    .and_then(|material| load_external(&material, &options))
            }
            IdentitySource::Pem {
                cert_pem,
                key_pem,
                ca_cert_pem,
            } => load_external(
                &ExternalMaterial {
                    cert_pem: cert_pem.clone(),
                    key_pem: key_pem.clone(),
                    ca_cert_pem: ca_cert_pem.clone(),
                },
                &options,
            ),
        }
        .map_err(MeshError::Identity)?;
        Ok(Arc::new(identity))
    }

    /// Provision the identity and build the node.
    pub fn from_config(config: MeshConfig) -> Result<Self> {
        config.validate()?;
        let identity = Self::provision(&config)?;
        Self::new(config, Some(identity))
    }

    /// Without an identity the node can still vote locally, but `start`,
    /// `join` and every outbound call fail with `NoTransportIdentity`.
    pub fn new(config: MeshConfig, identity: Option<Arc<TransportIdentity>>) -> Result<Self> {
        config.validate()?;
        if let Some(identity) = &identity {
            if identity.node_id() != config.node.id {
                return Err(MeshError::Config(format!(
                    "certificate subject {} does not match node.id {}",
                    identity.node_id(),
                    config.node.id
                )));
            }
        }
        let local_id = config.node.id.clone();

        let topology = Arc::new(Topology::new());
        let consensus = Arc::new(ConsensusManager::new(
            local_id.clone(),
            topology.clone(),
            config.consensus.clone(),
        ));
        consensus.set_decision_callback(admit_into(topology.clone()));

        let peers = Arc::new(PeerManager::new(
            local_id,
            identity.clone(),
            config.network.clone(),
        ));
        let health = Arc::new(HealthState::new(&config.health));
        let peer_health = Arc::new(PeerHealthMonitor::new(peers.clone(), config.health.clone()));
        let services = Arc::new(ServiceRegistry::new());
        let service = Arc::new(MeshService::new(
            config.descriptor(),
            topology.clone(),
            consensus.clone(),
            peers.clone(),
            health.clone(),
            services.clone(),
        ));
        let server = Arc::new(MeshServer::new(identity.clone(), service));
        let pool = Arc::new(ClientPool::new(
            topology.clone(),
            identity.clone(),
            config.network.clone(),
        ));
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            identity,
            topology,
            consensus,
            peers,
            health,
            peer_health,
            services,
            server,
            pool,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.config.node.id
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// The descriptor this node advertises, with the bound address once started.
    pub fn descriptor(&self) -> NodeDescriptor {
        self.server.service().descriptor()
    }

    pub fn identity(&self) -> Option<&Arc<TransportIdentity>> {
        self.identity.as_ref()
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn consensus(&self) -> &Arc<ConsensusManager> {
        &self.consensus
    }

    pub fn peers(&self) -> &Arc<PeerManager> {
        &self.peers
    }

    pub fn health(&self) -> &Arc<HealthState> {
        &self.health
    }

    pub fn peer_health(&self) -> &Arc<PeerHealthMonitor> {
        &self.peer_health
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    pub fn pool(&self) -> &Arc<ClientPool> {
        &self.pool
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr().await
    }

    /// Register a local handler. Advertising it to the mesh is done through
    /// `node.services` in the config.
    pub fn register_service(
        &self,
        name: &str,
        version: &str,
        handler: Arc<dyn ServiceHandler>,
    ) -> Result<()> {
        self.services.register(name, version, handler)
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Start serving and run the health loops. With a `:0` port the bound
    /// port replaces it in the advertised address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let bound = self.server.start(&self.config.node.address).await?;
        if let Some((host, "0")) = self.config.node.address.rsplit_once(':') {
            self.server
                .service()
                .set_address(format!("{host}:{}", bound.port()));
        }

        let check = Arc::new(ServingCheck {
            server: self.server.clone(),
            topology: self.topology.clone(),
            local_id: self.id().to_string(),
        });
        self.track(HealthMonitor::spawn(
            self.health.clone(),
            check,
            self.config.health.clone(),
            self.shutdown.subscribe(),
        ));
        self.track(self.peer_health.clone().spawn(self.shutdown.subscribe()));
        info!("node {} started on {bound}", self.id());
        Ok(bound)
    }

    /// Admit this node into its own empty topology.
    pub async fn bootstrap(&self) -> Result<u64> {
        if self.topology.node_count() > 0 {
            return Err(MeshError::AlreadyExists(format!(
                "mesh already has {} member(s)",
                self.topology.node_count()
            )));
        }
        let ticket = self.consensus.initiate_join_request(self.descriptor())?;
        ticket.decision().await?.outcome.into_result()?;
        let version = self.topology.version();
        info!("node {} bootstrapped the mesh (v{version})", self.id());
        Ok(version)
    }

    /// Ask `entry_id` at `entry_addr` to admit this node, then adopt the
    /// returned topology and connect to every member.
    pub async fn join(&self, entry_id: &str, entry_addr: &str) -> Result<u64> {
        let identity = self.identity.clone().ok_or(MeshError::NoTransportIdentity)?;
        let conn = TlsConnection::connect(
            identity,
            entry_id,
            entry_addr,
            self.config.network.dial_timeout(),
        )
        .await?;
        // the entry node holds the request open for the whole vote
        let deadline = self.config.consensus.vote_timeout() + self.config.network.request_timeout();
        let client = MeshClient::new(Arc::new(conn), deadline);

        let request = JoinRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            candidate: Some(self.descriptor()),
            timestamp_ms: now_ms(),
        };
        info!("node {} joining via {entry_id} at {entry_addr}", self.id());
        let response = client.join(request).await;
        if let Err(e) = client.close().await {
            debug!("closing entry connection: {e}");
        }
        let response = response?;

        if !response.approved {
            return Err(if response.timed_out {
                MeshError::JoinTimedOut {
                    received: response.votes_received as usize,
                    total: response.votes_expected as usize,
                }
            } else {
                MeshError::JoinRejected {
                    voter_id: response.veto_node_id,
                    reason: response.reason,
                }
            });
        }
        let snapshot = response
            .snapshot
            .ok_or_else(|| MeshError::UnexpectedResponse("approved join carried no topology".into()))?;
        self.topology.merge_snapshot(snapshot);
        self.connect_members().await;
        let version = self.topology.version();
        info!("node {} joined the mesh (v{version})", self.id());
        Ok(version)
    }

    /// Make the peer set match the topology: dial new members, refresh
    /// changed descriptors and drop peers that are no longer members.
    pub async fn connect_members(&self) {
        let members = self.topology.get_all_nodes();
        for member in &members {
            if member.id == self.id() {
                continue;
            }
            match self.peers.get_peer(&member.id).await {
                Ok(peer) if peer.descriptor.address != member.address => {
                    let _ = self.peers.remove_peer(&member.id).await;
                    if let Err(e) = self.peers.add_peer(member.clone()).await {
                        warn!("reconnecting to {} at {}: {e}", member.id, member.address);
                    }
                }
                Ok(peer) => {
                    if peer.descriptor != *member {
                        let _ = self.peers.update_descriptor(member.clone()).await;
                    }
                }
                Err(_) => match self.peers.add_peer(member.clone()).await {
                    Ok(_) | Err(MeshError::AlreadyExists(_)) => {}
                    Err(e) => warn!("connecting to {} at {}: {e}", member.id, member.address),
                },
            }
        }
        for peer_id in self.peers.peer_ids().await {
            if !members.iter().any(|m| m.id == peer_id) {
                let _ = self.peers.remove_peer(&peer_id).await;
            }
        }
    }

    /// Pull topology from every peer once, adopting any newer snapshot.
    /// Returns whether the local topology changed.
    pub async fn sync_once(&self) -> bool {
        let mut changed = false;
        for peer_id in self.peers.peer_ids().await {
            match self.peers.sync_topology(&peer_id, self.topology.version()).await {
                Ok(response) if response.changed => {
                    if let Some(snapshot) = response.snapshot {
                        if self.topology.merge_snapshot(snapshot) {
                            debug!("adopted topology v{} from {peer_id}", response.version);
                            changed = true;
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => debug!("sync with {peer_id} failed: {e}"),
            }
        }
        if changed {
            self.connect_members().await;
        }
        changed
    }

    pub fn spawn_sync_loop(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.config.sync_interval();
        let mut shutdown = self.shutdown.subscribe();
        self.track(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                let stop = tokio::select! {
                    _ = ticker.tick() => false,
                    _ = shutdown.wait_for(|stop| *stop) => true,
                };
                if stop {
                    break;
                }
                let Some(node) = weak.upgrade() else { break };
                node.sync_once().await;
            }
            debug!("sync loop stopped");
        }));
    }

    /// Stop background loops and the server, then close every connection.
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let mut failures = Vec::new();
        if let Err(e) = self.server.stop().await {
            failures.push(format!("server: {e}"));
        }
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
        for closed in [self.peers.close().await, self.pool.close().await] {
            match closed {
                Ok(()) => {}
                Err(MeshError::Close(errors)) => failures.extend(errors),
                Err(e) => failures.push(e.to_string()),
            }
        }
        info!("node {} shut down", self.id());
        if failures.is_empty() {
            Ok(())
        } else {
            Err(MeshError::Close(failures))
        }
    }
}

/// Healthy while the server is up; the message reports the membership view.
struct ServingCheck {
    server: Arc<MeshServer>,
    topology: Arc<Topology>,
    local_id: String,
}

#[async_trait::async_trait]
impl HealthCheck for ServingCheck {
    async fn check(&self) -> std::result::Result<String, String> {
        if !self.server.is_running().await {
            return Err("mesh server is not running".into());
        }
        let member = if self.topology.contains(&self.local_id) {
            "member"
        } else {
            "not a member"
        };
        Ok(format!(
            "serving; {member}; {} node(s) at v{}",
            self.topology.node_count(),
            self.topology.version()
        ))
    }
}
