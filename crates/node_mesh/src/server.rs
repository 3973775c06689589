//! The remote surface every node serves over mTLS.
//!
//! Handlers receive the caller's node id from the verified client certificate
//! and only decide authorization; authentication already happened in rustls.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use node_crypto::TransportIdentity;
use node_proto::mesh::envelope::Body;
use node_proto::mesh::*;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::consensus::{ConsensusManager, JoinOutcome};
use crate::error::{MeshError, Result};
use crate::health::HealthState;
use crate::peers::PeerManager;
use crate::tcp_transport::{EnvelopeHandler, TcpServer};
use crate::topology::Topology;

/// Application logic behind one `(service, version)` pair.
#[async_trait::async_trait]
pub trait ServiceHandler: Send + Sync + 'static {
    async fn call(&self, caller: &str, method: &str, payload: Vec<u8>) -> Result<Vec<u8>>;
}

#[derive(Default)]
pub struct ServiceRegistry {
    handlers: RwLock<HashMap<ServiceRef, Arc<dyn ServiceHandler>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        version: impl Into<String>,
        handler: Arc<dyn ServiceHandler>,
    ) -> Result<()> {
        let key = ServiceRef::new(name, version);
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        if handlers.contains_key(&key) {
            return Err(MeshError::AlreadyExists(format!(
                "service {} {}",
                key.name, key.version
            )));
        }
        handlers.insert(key, handler);
        Ok(())
    }

    pub fn unregister(&self, name: &str, version: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&ServiceRef::new(name, version))
            .is_some()
    }

    pub fn get(&self, name: &str, version: &str) -> Option<Arc<dyn ServiceHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&ServiceRef::new(name, version))
            .cloned()
    }

    pub fn services(&self) -> Vec<ServiceRef> {
        let mut refs: Vec<_> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        refs.sort_by(|a, b| (&a.name, &a.version).cmp(&(&b.name, &b.version)));
        refs
    }
}

/// Request dispatch for one node.
pub struct MeshService {
    descriptor: RwLock<NodeDescriptor>,
    topology: Arc<Topology>,
    consensus: Arc<ConsensusManager>,
    peers: Arc<PeerManager>,
    health: Arc<HealthState>,
    services: Arc<ServiceRegistry>,
}

impl MeshService {
    pub fn new(
        descriptor: NodeDescriptor,
        topology: Arc<Topology>,
        consensus: Arc<ConsensusManager>,
        peers: Arc<PeerManager>,
        health: Arc<HealthState>,
        services: Arc<ServiceRegistry>,
    ) -> Self {
        Self {
            descriptor: RwLock::new(descriptor),
            topology,
            consensus,
            peers,
            health,
            services,
        }
    }

    pub fn descriptor(&self) -> NodeDescriptor {
        self.descriptor
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_address(&self, address: String) {
        self.descriptor
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .address = address;
    }

    fn local_id(&self) -> &str {
        self.consensus.local_id()
    }

    fn require_member(&self, caller: &str) -> Result<()> {
        if self.topology.contains(caller) {
            Ok(())
        } else {
            Err(MeshError::Unauthorized(format!("{caller} is not a mesh member")))
        }
    }

    async fn dispatch(&self, caller: &str, body: Body) -> Result<Body> {
        match body {
            Body::Ping(ping) => Ok(Body::Pong(Pong {
                nonce: ping.nonce,
                node_id: self.local_id().to_string(),
            })),
            Body::HealthRequest(_) => Ok(Body::HealthReport(self.health.snapshot().to_report())),
            Body::NodeInfoRequest(_) => Ok(Body::NodeInfo(NodeInfo {
                descriptor: Some(self.descriptor()),
                health: Some(self.health.snapshot().to_report()),
            })),
            Body::SyncTopology(request) => Ok(Body::SyncTopologyResponse(
                self.sync_topology(request.known_version),
            )),
            Body::TopologyRequest(_) => Ok(Body::Topology(self.topology.snapshot())),
            Body::JoinRequest(request) => self.handle_join(caller, request).await.map(Body::JoinResponse),
            Body::VoteRequest(request) => self.handle_vote_request(caller, request).map(Body::Vote),
            Body::SubmitVote(vote) => self.handle_submit_vote(caller, vote).map(Body::VoteAck),
            Body::ServiceCall(call) => self.handle_service_call(caller, call).await.map(Body::ServiceReply),
            other => Err(MeshError::UnexpectedResponse(format!(
                "{} is not a request",
                other.kind()
            ))),
        }
    }

    fn sync_topology(&self, known_version: u64) -> SyncTopologyResponse {
        let snapshot = self.topology.snapshot();
        if snapshot.version > known_version {
            SyncTopologyResponse {
                changed: true,
                version: snapshot.version,
                snapshot: Some(snapshot),
            }
        } else {
            SyncTopologyResponse {
                changed: false,
                version: snapshot.version,
                snapshot: None,
            }
        }
    }

    async fn handle_join(&self, caller: &str, request: JoinRequest) -> Result<JoinResponse> {
        let candidate = request
            .candidate
            .clone()
            .ok_or_else(|| MeshError::InvalidDescriptor("join request has no candidate".into()))?;
        if candidate.id != caller {
            return Err(MeshError::Unauthorized(format!(
                "{caller} cannot request admission for {}",
                candidate.id
            )));
        }
        info!("join request {} from {caller}", request.request_id);

        // a member cannot vote on itself, so the tracker could never fill
        if self.topology.contains(&candidate.id) {
            let reason = MeshError::AlreadyExists(format!("node {}", candidate.id)).to_string();
            info!("rejecting join from {caller}: {reason}");
            return Ok(JoinResponse {
                request_id: request.request_id,
                approved: false,
                reason,
                veto_node_id: self.local_id().to_string(),
                votes_received: 1,
                votes_expected: self.topology.node_count() as u32,
                ..Default::default()
            });
        }

        let ticket = self.consensus.initiate(request.clone())?;
        let request_id = ticket.request_id.clone();

        if self.topology.contains(self.local_id()) {
            match self.consensus.cast_local_vote(&request) {
                Ok(vote) if !vote.approve => debug!("voted against {caller}: {}", vote.reason),
                Ok(_) => {}
                // already decided, e.g. by a short-circuit veto
                Err(MeshError::RequestNotFound(_)) => {}
                Err(e) => warn!("local vote on {request_id}: {e}"),
            }
        }

        for member in self.topology.get_all_nodes() {
            if member.id == self.local_id() || member.id == candidate.id {
                continue;
            }
            let peers = self.peers.clone();
            let consensus = self.consensus.clone();
            let request = request.clone();
            tokio::spawn(async move {
                if let Err(e) = collect_vote(&peers, &consensus, member, request).await {
                    warn!("vote collection: {e}");
                }
            });
        }

        let decision = ticket.decision().await?;
        let mut response = JoinResponse {
            request_id: request_id.clone(),
            approved: decision.outcome.is_approved(),
            reason: decision.outcome.reason(),
            votes_received: decision.votes_received as u32,
            votes_expected: decision.votes_expected as u32,
            ..Default::default()
        };
        match decision.outcome {
            JoinOutcome::Approved => response.snapshot = Some(self.topology.snapshot()),
            JoinOutcome::Rejected { voter_id, .. } => response.veto_node_id = voter_id,
            JoinOutcome::TimedOut { .. } => response.timed_out = true,
        }
        Ok(response)
    }

    fn handle_vote_request(&self, caller: &str, request: VoteRequest) -> Result<Vote> {
        self.require_member(caller)?;
        let join_request = request
            .join_request
            .ok_or_else(|| MeshError::InvalidDescriptor("vote request has no join request".into()))?;
        let vote = self.consensus.vote_on(&join_request);
        debug!(
            "vote on {} for {caller}: {}",
            join_request.request_id,
            if vote.approve { "approve" } else { "reject" }
        );
        Ok(vote)
    }

    fn handle_submit_vote(&self, caller: &str, vote: Vote) -> Result<VoteAck> {
        if vote.voter_id != caller {
            return Err(MeshError::Unauthorized(format!(
                "{caller} cannot vote as {}",
                vote.voter_id
            )));
        }
        self.require_member(caller)?;
        self.consensus.submit_vote(vote)?;
        Ok(VoteAck { accepted: true })
    }

    async fn handle_service_call(&self, caller: &str, call: ServiceCall) -> Result<ServiceReply> {
        let handler = self
            .services
            .get(&call.service, &call.version)
            .ok_or_else(|| MeshError::NoProviders {
                service: call.service.clone(),
                version: call.version.clone(),
            })?;
        let payload = handler.call(caller, &call.method, call.payload).await?;
        Ok(ServiceReply { payload })
    }
}

/// Ask `member` for its vote and feed a well-formed reply into consensus.
async fn collect_vote(
    peers: &PeerManager,
    consensus: &ConsensusManager,
    member: NodeDescriptor,
    request: JoinRequest,
) -> Result<()> {
    if !peers.contains(&member.id).await {
        match peers.add_peer(member.clone()).await {
            Ok(_) | Err(MeshError::AlreadyExists(_)) => {}
            Err(e) => return Err(e),
        }
    }
    let vote = peers.request_vote(&member.id, request.clone()).await?;
    if vote.voter_id != member.id || vote.request_id != request.request_id {
        return Err(MeshError::UnexpectedResponse(format!(
            "{} answered as {} for request {}",
            member.id, vote.voter_id, vote.request_id
        )));
    }
    match consensus.submit_vote(vote) {
        Ok(()) | Err(MeshError::RequestNotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

#[async_trait::async_trait]
impl EnvelopeHandler for MeshService {
    async fn handle(&self, caller: &str, envelope: Envelope) -> Envelope {
        let Some(body) = envelope.body.clone() else {
            return envelope.error_reply(ErrorCode::InvalidRequest, "empty envelope");
        };
        let kind = body.kind();
        match self.dispatch(caller, body).await {
            Ok(reply) => envelope.reply(reply),
            Err(e) => {
                debug!("{kind} from {caller} failed: {e}");
                envelope.reply(Body::Error(e.to_rpc()))
            }
        }
    }
}

struct Running {
    addr: SocketAddr,
    stop: watch::Sender<bool>,
    task: JoinHandle<anyhow::Result<()>>,
}

/// Owns the listener lifecycle for a [`MeshService`].
pub struct MeshServer {
    identity: Option<Arc<TransportIdentity>>,
    service: Arc<MeshService>,
    running: Mutex<Option<Running>>,
}

impl MeshServer {
    pub fn new(identity: Option<Arc<TransportIdentity>>, service: Arc<MeshService>) -> Self {
        Self {
            identity,
            service,
            running: Mutex::new(None),
        }
    }

    pub fn service(&self) -> &Arc<MeshService> {
        &self.service
    }

    /// Bind `addr` and serve in the background. Returns the bound address.
    pub async fn start(&self, addr: &str) -> Result<SocketAddr> {
        let identity = self.identity.as_ref().ok_or(MeshError::NoTransportIdentity)?;
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(MeshError::AlreadyExists("mesh server".into()));
        }
        let server = TcpServer::bind(identity, addr).await?;
        let bound = server.local_addr()?;
        let (stop, rx) = watch::channel(false);
        let handler: Arc<dyn EnvelopeHandler> = self.service.clone();
        let task = tokio::spawn(server.serve(handler, rx));
        info!("mesh server for {} listening on {bound}", identity.node_id());
        *running = Some(Running {
            addr: bound,
            stop,
            task,
        });
        Ok(bound)
    }

    /// Stop accepting and wait for in-flight exchanges to finish.
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        let _ = running.stop.send(true);
        match running.task.await {
            Ok(result) => result?,
            Err(e) => return Err(anyhow::anyhow!("server task failed: {e}").into()),
        }
        info!("mesh server on {} stopped", running.addr);
        Ok(())
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.addr)
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::{ConsensusConfig, HealthConfig, NetworkConfig};
    use crate::consensus::admit_into;

    struct Echo;

    #[async_trait::async_trait]
    impl ServiceHandler for Echo {
        async fn call(&self, caller: &str, method: &str, payload: Vec<u8>) -> Result<Vec<u8>> {
            let mut out = format!("{caller}:{method}:").into_bytes();
            out.extend(payload);
            Ok(out)
        }
    }

    fn node(id: &str) -> NodeDescriptor {
        NodeDescriptor::new(id, id, "node", "127.0.0.1:9000")
    }

    fn service(local: &str, members: &[&str]) -> MeshService {
        let topology = Arc::new(Topology::new());
        for id in members {
            topology.add_node(node(id)).unwrap();
        }
        let consensus = Arc::new(ConsensusManager::new(
            local,
            topology.clone(),
            ConsensusConfig::default(),
        ));
        consensus.set_decision_callback(admit_into(topology.clone()));
        let peers = Arc::new(PeerManager::new(local, None, NetworkConfig::default()));
        MeshService::new(
            node(local),
            topology,
            consensus,
            peers,
            Arc::new(HealthState::new(&HealthConfig::default())),
            Arc::new(ServiceRegistry::new()),
        )
    }

    fn request(body: Body) -> Envelope {
        Envelope::new("m1", body)
    }

    fn error_code(reply: &Envelope) -> Option<ErrorCode> {
        match &reply.body {
            Some(Body::Error(err)) => Some(err.code()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn ping_answers_with_local_id() {
        let svc = service("a", &["a"]);
        let reply = svc.handle("b", request(Body::Ping(Ping { nonce: 5 }))).await;
        assert_eq!(reply.msg_id, "m1");
        match reply.body {
            Some(Body::Pong(pong)) => {
                assert_eq!(pong.nonce, 5);
                assert_eq!(pong.node_id, "a");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn sync_topology_only_sends_newer_snapshots() {
        let svc = service("a", &["a", "b"]);
        let stale = svc.sync_topology(1);
        assert!(stale.changed);
        assert_eq!(stale.snapshot.map(|s| s.nodes.len()), Some(2));

        let current = svc.sync_topology(2);
        assert!(!current.changed);
        assert_eq!(current.version, 2);
        assert!(current.snapshot.is_none());
    }

    #[tokio::test]
    async fn join_for_someone_else_is_unauthorized() {
        let svc = service("a", &["a"]);
        let join = JoinRequest {
            request_id: "r1".into(),
            candidate: Some(node("c")),
            timestamp_ms: 0,
        };
        let reply = svc.handle("b", request(Body::JoinRequest(join))).await;
        assert_eq!(error_code(&reply), Some(ErrorCode::Unauthorized));
        assert!(svc.consensus.pending_requests().is_empty());
    }

    #[tokio::test]
    async fn single_member_join_is_decided_by_local_vote() {
        let svc = service("a", &["a"]);
        let join = JoinRequest {
            request_id: "r1".into(),
            candidate: Some(node("b")),
            timestamp_ms: 0,
        };
        let reply = svc.handle("b", request(Body::JoinRequest(join))).await;
        match reply.body {
            Some(Body::JoinResponse(response)) => {
                assert!(response.approved, "{}", response.reason);
                assert_eq!(response.votes_expected, 1);
                let snapshot = response.snapshot.unwrap();
                assert_eq!(snapshot.version, 2);
                assert_eq!(snapshot.nodes.len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn member_rejoin_is_rejected_without_a_vote() {
        let svc = service("a", &["a", "b"]);
        let join = JoinRequest {
            request_id: "r1".into(),
            candidate: Some(node("b")),
            timestamp_ms: 0,
        };
        let started = tokio::time::Instant::now();
        let reply = svc.handle("b", request(Body::JoinRequest(join))).await;
        assert_eq!(started.elapsed(), Duration::ZERO);
        match reply.body {
            Some(Body::JoinResponse(response)) => {
                assert!(!response.approved);
                assert!(!response.timed_out);
                assert_eq!(response.veto_node_id, "a");
                assert!(response.reason.contains("node b"), "{}", response.reason);
                assert!(response.snapshot.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(svc.consensus.pending_requests().is_empty());
        assert_eq!(svc.topology.version(), 2);
    }

    #[tokio::test]
    async fn get_topology_returns_the_snapshot() {
        let svc = service("a", &["a", "b"]);
        let reply = svc
            .handle("b", request(Body::TopologyRequest(TopologyRequest {})))
            .await;
        match reply.body {
            Some(Body::Topology(snapshot)) => {
                assert_eq!(snapshot.version, 2);
                let ids: Vec<_> = snapshot.nodes.iter().map(|n| n.id.as_str()).collect();
                assert_eq!(ids, vec!["a", "b"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn vote_endpoints_check_the_caller() {
        let svc = service("a", &["a", "b"]);
        let join = JoinRequest {
            request_id: "r1".into(),
            candidate: Some(node("c")),
            timestamp_ms: 0,
        };

        let outsider = svc
            .handle(
                "x",
                request(Body::VoteRequest(VoteRequest {
                    join_request: Some(join.clone()),
                })),
            )
            .await;
        assert_eq!(error_code(&outsider), Some(ErrorCode::Unauthorized));

        let member = svc
            .handle(
                "b",
                request(Body::VoteRequest(VoteRequest {
                    join_request: Some(join),
                })),
            )
            .await;
        match member.body {
            Some(Body::Vote(vote)) => {
                assert_eq!(vote.voter_id, "a");
                assert!(vote.approve);
            }
            other => panic!("unexpected {other:?}"),
        }

        let forged = Vote {
            voter_id: "a".into(),
            request_id: "r1".into(),
            approve: false,
            ..Default::default()
        };
        let reply = svc.handle("b", request(Body::SubmitVote(forged))).await;
        assert_eq!(error_code(&reply), Some(ErrorCode::Unauthorized));

        let unknown = Vote {
            voter_id: "b".into(),
            request_id: "nope".into(),
            approve: true,
            ..Default::default()
        };
        let reply = svc.handle("b", request(Body::SubmitVote(unknown))).await;
        assert_eq!(error_code(&reply), Some(ErrorCode::NotFound));
    }

    #[tokio::test]
    async fn service_calls_dispatch_through_registry() {
        let svc = service("a", &["a"]);
        svc.services.register("echo", "v1", Arc::new(Echo)).unwrap();
        assert!(matches!(
            svc.services.register("echo", "v1", Arc::new(Echo)),
            Err(MeshError::AlreadyExists(_))
        ));

        let call = ServiceCall {
            service: "echo".into(),
            version: "v1".into(),
            method: "say".into(),
            payload: b"hi".to_vec(),
        };
        let reply = svc.handle("b", request(Body::ServiceCall(call.clone()))).await;
        match reply.body {
            Some(Body::ServiceReply(out)) => assert_eq!(out.payload, b"b:say:hi"),
            other => panic!("unexpected {other:?}"),
        }

        let missing = ServiceCall {
            version: "v2".into(),
            ..call
        };
        let reply = svc.handle("b", request(Body::ServiceCall(missing))).await;
        assert_eq!(error_code(&reply), Some(ErrorCode::NotFound));
    }

    #[tokio::test]
    async fn start_without_identity_fails() {
        let server = MeshServer::new(None, Arc::new(service("a", &[])));
        assert!(matches!(
            server.start("127.0.0.1:0").await,
            Err(MeshError::NoTransportIdentity)
        ));
        assert!(!server.is_running().await);
    }
}
