//! Mesh wire records (protobuf package `nodemesh.mesh`).
//!
//! Messages are declared with the `prost` derives directly rather than
//! generated from `.proto` files, so the crate builds without `protoc`.
//! Tags are stable; never renumber a field.

/// A `(service name, service version)` pair advertised by a node.
#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct ServiceRef {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub version: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeDescriptor {
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub name: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub node_type: ::prost::alloc::string::String,
    /// `host:port` the node's mesh server listens on.
    #[prost(string, tag = "4")]
    pub address: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "5")]
    pub services: ::prost::alloc::vec::Vec<ServiceRef>,
    #[prost(uint64, tag = "6")]
    pub joined_at_ms: u64,
    #[prost(uint64, tag = "7")]
    pub updated_at_ms: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TopologySnapshot {
    #[prost(message, repeated, tag = "1")]
    pub nodes: ::prost::alloc::vec::Vec<NodeDescriptor>,
    #[prost(uint64, tag = "2")]
    pub version: u64,
    #[prost(uint64, tag = "3")]
    pub updated_at_ms: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JoinRequest {
    #[prost(string, tag = "1")]
    pub request_id: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub candidate: ::core::option::Option<NodeDescriptor>,
    #[prost(uint64, tag = "3")]
    pub timestamp_ms: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JoinResponse {
    #[prost(string, tag = "1")]
    pub request_id: ::prost::alloc::string::String,
    #[prost(bool, tag = "2")]
    pub approved: bool,
    #[prost(string, tag = "3")]
    pub reason: ::prost::alloc::string::String,
    /// Set when a member vetoed the request.
    #[prost(string, tag = "4")]
    pub veto_node_id: ::prost::alloc::string::String,
    #[prost(uint32, tag = "5")]
    pub votes_received: u32,
    #[prost(uint32, tag = "6")]
    pub votes_expected: u32,
    #[prost(bool, tag = "7")]
    pub timed_out: bool,
    #[prost(message, optional, tag = "8")]
    pub snapshot: ::core::option::Option<TopologySnapshot>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Vote {
    #[prost(string, tag = "1")]
    pub voter_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub request_id: ::prost::alloc::string::String,
    #[prost(bool, tag = "3")]
    pub approve: bool,
    #[prost(string, tag = "4")]
    pub reason: ::prost::alloc::string::String,
    #[prost(uint64, tag = "5")]
    pub timestamp_ms: u64,
}

/// Ask a member to evaluate a join request and answer with its vote.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VoteRequest {
    #[prost(message, optional, tag = "1")]
    pub join_request: ::core::option::Option<JoinRequest>,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct VoteAck {
    #[prost(bool, tag = "1")]
    pub accepted: bool,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Ping {
    #[prost(uint64, tag = "1")]
    pub nonce: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Pong {
    #[prost(uint64, tag = "1")]
    pub nonce: u64,
    #[prost(string, tag = "2")]
    pub node_id: ::prost::alloc::string::String,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct HealthRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HealthReport {
    #[prost(enumeration = "HealthStatus", tag = "1")]
    pub status: i32,
    #[prost(string, tag = "2")]
    pub message: ::prost::alloc::string::String,
    #[prost(uint64, tag = "3")]
    pub last_checked_ms: u64,
    #[prost(string, tag = "4")]
    pub last_error: ::prost::alloc::string::String,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct NodeInfoRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeInfo {
    #[prost(message, optional, tag = "1")]
    pub descriptor: ::core::option::Option<NodeDescriptor>,
    #[prost(message, optional, tag = "2")]
    pub health: ::core::option::Option<HealthReport>,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct SyncTopologyRequest {
    #[prost(uint64, tag = "1")]
    pub known_version: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SyncTopologyResponse {
    /// True when the responder holds a newer version than `known_version`.
    #[prost(bool, tag = "1")]
    pub changed: bool,
    #[prost(uint64, tag = "2")]
    pub version: u64,
    #[prost(message, optional, tag = "3")]
    pub snapshot: ::core::option::Option<TopologySnapshot>,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct TopologyRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServiceCall {
    #[prost(string, tag = "1")]
    pub service: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub version: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub method: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "4")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServiceReply {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcError {
    #[prost(enumeration = "ErrorCode", tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    #[prost(string, tag = "1")]
    pub msg_id: ::prost::alloc::string::String,
    #[prost(
        oneof = "envelope::Body",
        tags = "10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28"
    )]
    pub body: ::core::option::Option<envelope::Body>,
}

pub mod envelope {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "10")]
        Ping(super::Ping),
        #[prost(message, tag = "11")]
        Pong(super::Pong),
        #[prost(message, tag = "12")]
        HealthRequest(super::HealthRequest),
        #[prost(message, tag = "13")]
        HealthReport(super::HealthReport),
        #[prost(message, tag = "14")]
        NodeInfoRequest(super::NodeInfoRequest),
        #[prost(message, tag = "15")]
        NodeInfo(super::NodeInfo),
        #[prost(message, tag = "16")]
        SyncTopology(super::SyncTopologyRequest),
        #[prost(message, tag = "17")]
        SyncTopologyResponse(super::SyncTopologyResponse),
        #[prost(message, tag = "18")]
        TopologyRequest(super::TopologyRequest),
        #[prost(message, tag = "19")]
        Topology(super::TopologySnapshot),
        #[prost(message, tag = "20")]
        JoinRequest(super::JoinRequest),
        #[prost(message, tag = "21")]
        JoinResponse(super::JoinResponse),
        #[prost(message, tag = "22")]
        VoteRequest(super::VoteRequest),
        #[prost(message, tag = "23")]
        Vote(super::Vote),
        #[prost(message, tag = "24")]
        VoteAck(super::VoteAck),
        #[prost(message, tag = "25")]
        ServiceCall(super::ServiceCall),
        #[prost(message, tag = "26")]
        ServiceReply(super::ServiceReply),
        #[prost(message, tag = "27")]
        Error(super::RpcError),
        /// A vote pushed to the initiating node (as opposed to a `Vote` reply).
        #[prost(message, tag = "28")]
        SubmitVote(super::Vote),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum HealthStatus {
    Unknown = 0,
    Healthy = 1,
    Unhealthy = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    Unspecified = 0,
    Unauthorized = 1,
    NotFound = 2,
    AlreadyExists = 3,
    Rejected = 4,
    TimedOut = 5,
    InvalidRequest = 6,
    Unavailable = 7,
    Internal = 8,
}
