//! Authenticated node mesh: versioned membership, admission by vote, pooled
//! mTLS peer connections and round-robin service discovery.

pub mod client;
pub mod config;
pub mod consensus;
pub mod discovery;
pub mod error;
pub mod health;
pub mod node;
pub mod peers;
pub mod server;
pub mod tcp_transport;
pub mod topology;

pub use client::MeshClient;
pub use config::{ConsensusConfig, HealthConfig, IdentitySource, MeshConfig, NetworkConfig, NodeConfig, ServiceConfig};
pub use consensus::{AdmissionRule, ConsensusManager, DenyList, JoinDecision, JoinOutcome, JoinTicket};
pub use discovery::{ClientPool, ServiceClient, ServiceConn};
pub use error::{MeshError, Result};
pub use health::{HealthCheck, HealthInfo, HealthMonitor, HealthState, HealthStatus, PeerHealthMonitor};
pub use node::MeshNode;
pub use peers::{Peer, PeerManager};
pub use server::{MeshServer, MeshService, ServiceHandler, ServiceRegistry};
pub use topology::Topology;
