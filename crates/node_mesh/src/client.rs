//! Typed request/response calls over one [`TlsConnection`].

use std::sync::Arc;
use std::time::Duration;

use node_proto::mesh::envelope::Body;
use node_proto::mesh::*;

use crate::error::{MeshError, Result};
use crate::tcp_transport::TlsConnection;

#[derive(Debug, Clone)]
pub struct MeshClient {
    conn: Arc<TlsConnection>,
    timeout: Duration,
}

/// Unwrap the expected body variant or turn the reply into an error.
macro_rules! expect_body {
    ($envelope:expr, $variant:ident) => {
        match $envelope.body {
            Some(Body::$variant(inner)) => Ok(inner),
            Some(Body::Error(err)) => Err(MeshError::from_rpc(err)),
            other => Err(MeshError::UnexpectedResponse(format!(
                "expected {}, got {}",
                stringify!($variant),
                other.as_ref().map(Body::kind).unwrap_or("empty")
            ))),
        }
    };
}

impl MeshClient {
    pub fn new(conn: Arc<TlsConnection>, timeout: Duration) -> Self {
        Self { conn, timeout }
    }

    pub fn connection(&self) -> &Arc<TlsConnection> {
        &self.conn
    }

    pub fn peer_id(&self) -> &str {
        self.conn.peer_id()
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    async fn call(&self, body: Body) -> Result<Envelope> {
        let request = Envelope::new(uuid::Uuid::new_v4().to_string(), body);
        Ok(self.conn.request(&request, self.timeout).await?)
    }

    pub async fn ping(&self, nonce: u64) -> Result<Pong> {
        let reply = self.call(Body::Ping(Ping { nonce })).await?;
        let pong = expect_body!(reply, Pong)?;
        if pong.nonce != nonce {
            return Err(MeshError::UnexpectedResponse(format!(
                "pong nonce {} does not match {nonce}",
                pong.nonce
            )));
        }
        Ok(pong)
    }

    pub async fn get_health(&self) -> Result<HealthReport> {
        let reply = self.call(Body::HealthRequest(HealthRequest {})).await?;
        expect_body!(reply, HealthReport)
    }

    pub async fn get_node_info(&self) -> Result<NodeInfo> {
        let reply = self.call(Body::NodeInfoRequest(NodeInfoRequest {})).await?;
        expect_body!(reply, NodeInfo)
    }

    pub async fn sync_topology(&self, known_version: u64) -> Result<SyncTopologyResponse> {
        let reply = self
            .call(Body::SyncTopology(SyncTopologyRequest { known_version }))
            .await?;
        expect_body!(reply, SyncTopologyResponse)
    }

    pub async fn get_topology(&self) -> Result<TopologySnapshot> {
        let reply = self.call(Body::TopologyRequest(TopologyRequest {})).await?;
        expect_body!(reply, Topology)
    }

    pub async fn join(&self, request: JoinRequest) -> Result<JoinResponse> {
        let reply = self.call(Body::JoinRequest(request)).await?;
        expect_body!(reply, JoinResponse)
    }

    /// Ask a member to evaluate a join request; its vote comes back directly.
    pub async fn request_vote(&self, join_request: JoinRequest) -> Result<Vote> {
        let reply = self
            .call(Body::VoteRequest(VoteRequest {
                join_request: Some(join_request),
            }))
            .await?;
        expect_body!(reply, Vote)
    }

    /// Push a vote to the node coordinating the request.
    pub async fn submit_vote(&self, vote: Vote) -> Result<VoteAck> {
        let reply = self.call(Body::SubmitVote(vote)).await?;
        expect_body!(reply, VoteAck)
    }

    pub async fn call_service(
        &self,
        service: &str,
        version: &str,
        method: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let reply = self
            .call(Body::ServiceCall(ServiceCall {
                service: service.to_string(),
                version: version.to_string(),
                method: method.to_string(),
                payload,
            }))
            .await?;
        Ok(expect_body!(reply, ServiceReply)?.payload)
    }

    pub async fn close(&self) -> Result<()> {
        Ok(self.conn.close().await?)
    }
}
