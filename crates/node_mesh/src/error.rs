//! Error type shared by every mesh component.

use node_proto::mesh::{ErrorCode, RpcError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("no providers for service {service} version {version}")]
    NoProviders { service: String, version: String },
    #[error("no transport identity configured; mTLS is required")]
    NoTransportIdentity,
    #[error("peer {0} not found")]
    PeerNotFound(String),
    #[error("node {0} not found")]
    NodeNotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("mesh is at capacity ({0} nodes)")]
    MeshAtCapacity(usize),
    #[error("join rejected by {voter_id}: {reason}")]
    JoinRejected { voter_id: String, reason: String },
    #[error("join rejected: timeout: {received}/{total} votes received")]
    JoinTimedOut { received: usize, total: usize },
    #[error("duplicate vote from {voter_id} on request {request_id}")]
    DuplicateVote { voter_id: String, request_id: String },
    #[error("join request {0} not found")]
    RequestNotFound(String),
    #[error("admission denied: {0}")]
    AdmissionDenied(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("invalid node descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("service call failed: {0}")]
    Service(String),
    #[error("remote error ({code:?}): {message}")]
    Remote { code: ErrorCode, message: String },
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("identity error: {0:#}")]
    Identity(anyhow::Error),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
    #[error("{} connection(s) failed to close: {}", .0.len(), .0.join("; "))]
    Close(Vec<String>),
}

pub type Result<T> = std::result::Result<T, MeshError>;

impl MeshError {
    /// Wire code used when this error is returned to a remote caller.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NoProviders { .. }
            | Self::PeerNotFound(_)
            | Self::NodeNotFound(_)
            | Self::RequestNotFound(_) => ErrorCode::NotFound,
            Self::AlreadyExists(_) | Self::DuplicateVote { .. } => ErrorCode::AlreadyExists,
            Self::Unauthorized(_) => ErrorCode::Unauthorized,
            Self::MeshAtCapacity(_) | Self::JoinRejected { .. } | Self::AdmissionDenied(_) => {
                ErrorCode::Rejected
            }
            Self::JoinTimedOut { .. } => ErrorCode::TimedOut,
            Self::InvalidDescriptor(_) | Self::Config(_) => ErrorCode::InvalidRequest,
            Self::NoTransportIdentity => ErrorCode::Unavailable,
            Self::Remote { code, .. } => *code,
            _ => ErrorCode::Internal,
        }
    }

    pub fn to_rpc(&self) -> RpcError {
        RpcError {
            code: self.code() as i32,
            message: self.to_string(),
        }
    }

    pub fn from_rpc(err: RpcError) -> Self {
        Self::Remote {
            code: err.code(),
            message: err.message,
        }
    }
}
