//! Protobuf wire records for the node mesh.

pub mod mesh;

use std::time::{SystemTime, UNIX_EPOCH};

use mesh::envelope::Body;
use mesh::{Envelope, ErrorCode, NodeDescriptor, RpcError, ServiceRef};

/// Milliseconds since the unix epoch; every timestamp on the wire uses this unit.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

impl ServiceRef {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl NodeDescriptor {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        node_type: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            node_type: node_type.into(),
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn with_service(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.services.push(ServiceRef::new(name, version));
        self
    }

    /// Id, name and address are all present.
    pub fn is_complete(&self) -> bool {
        !self.id.is_empty() && !self.name.is_empty() && !self.address.is_empty()
    }

    pub fn provides(&self, service: &str, version: &str) -> bool {
        self.services
            .iter()
            .any(|s| s.name == service && s.version == version)
    }

    pub fn provides_service(&self, service: &str) -> bool {
        self.services.iter().any(|s| s.name == service)
    }
}

impl Envelope {
    pub fn new(msg_id: impl Into<String>, body: Body) -> Self {
        Self {
            msg_id: msg_id.into(),
            body: Some(body),
        }
    }

    /// Build a response carrying the same `msg_id`.
    pub fn reply(&self, body: Body) -> Self {
        Self {
            msg_id: self.msg_id.clone(),
            body: Some(body),
        }
    }

    pub fn error_reply(&self, code: ErrorCode, message: impl Into<String>) -> Self {
        self.reply(Body::Error(RpcError {
            code: code as i32,
            message: message.into(),
        }))
    }

    /// Short name of the body variant, for logs.
    pub fn kind(&self) -> &'static str {
        match &self.body {
            None => "empty",
            Some(body) => body.kind(),
        }
    }
}

impl Body {
    pub fn kind(&self) -> &'static str {
        match self {
            Body::Ping(_) => "ping",
            Body::Pong(_) => "pong",
            Body::HealthRequest(_) => "health_request",
            Body::HealthReport(_) => "health_report",
            Body::NodeInfoRequest(_) => "node_info_request",
            Body::NodeInfo(_) => "node_info",
            Body::SyncTopology(_) => "sync_topology",
            Body::SyncTopologyResponse(_) => "sync_topology_response",
            Body::TopologyRequest(_) => "topology_request",
            Body::Topology(_) => "topology",
            Body::JoinRequest(_) => "join_request",
            Body::JoinResponse(_) => "join_response",
            Body::VoteRequest(_) => "vote_request",
            Body::Vote(_) => "vote",
            Body::VoteAck(_) => "vote_ack",
            Body::ServiceCall(_) => "service_call",
            Body::ServiceReply(_) => "service_reply",
            Body::Error(_) => "error",
            Body::SubmitVote(_) => "submit_vote",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mesh::*;
    use super::*;
    use prost::Message;

    fn roundtrip<M: Message + Default + PartialEq + std::fmt::Debug>(msg: &M) -> M {
        let encoded = msg.encode_to_vec();
        M::decode(encoded.as_slice()).expect("decode should succeed")
    }

    #[test]
    fn join_request_envelope_roundtrip() {
        let candidate = NodeDescriptor::new("node-b", "Beta", "worker", "127.0.0.1:9902")
            .with_service("search", "v1");
        let env = Envelope::new(
            "msg-1",
            Body::JoinRequest(JoinRequest {
                request_id: "req-1".into(),
                candidate: Some(candidate.clone()),
                timestamp_ms: 1_700_000_000_000,
            }),
        );

        let decoded = roundtrip(&env);
        assert_eq!(decoded, env);
        match decoded.body {
            Some(Body::JoinRequest(req)) => assert_eq!(req.candidate, Some(candidate)),
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn vote_and_submit_vote_are_distinct_on_the_wire() {
        let vote = Vote {
            voter_id: "node-a".into(),
            request_id: "req-1".into(),
            approve: true,
            ..Default::default()
        };
        let reply = roundtrip(&Envelope::new("m", Body::Vote(vote.clone())));
        let push = roundtrip(&Envelope::new("m", Body::SubmitVote(vote)));
        assert_eq!(reply.kind(), "vote");
        assert_eq!(push.kind(), "submit_vote");
    }

    #[test]
    fn health_status_accessor() {
        let mut report = HealthReport::default();
        assert_eq!(report.status(), HealthStatus::Unknown);
        report.set_status(HealthStatus::Unhealthy);
        assert_eq!(roundtrip(&report).status(), HealthStatus::Unhealthy);
    }

    #[test]
    fn descriptor_service_matching() {
        let node = NodeDescriptor::new("n1", "One", "worker", "127.0.0.1:1")
            .with_service("kv", "v1")
            .with_service("kv", "v2");
        assert!(node.provides("kv", "v2"));
        assert!(!node.provides("kv", "v3"));
        assert!(node.provides_service("kv"));
        assert!(!node.provides_service("search"));
        assert!(node.is_complete());
        assert!(!NodeDescriptor::default().is_complete());
    }

    #[test]
    fn error_reply_keeps_msg_id() {
        let req = Envelope::new("abc", Body::Ping(Ping { nonce: 7 }));
        let resp = req.error_reply(ErrorCode::Unauthorized, "nope");
        assert_eq!(resp.msg_id, "abc");
        match resp.body {
            Some(Body::Error(err)) => {
                assert_eq!(err.code(), ErrorCode::Unauthorized);
                assert_eq!(err.message, "nope");
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }
}
