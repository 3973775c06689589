//! Validated configuration value consumed by the mesh.
//!
//! Parsing files or the environment is the embedding application's job; this
//! module only defines the shape (with serde defaults) and `validate()`.

use std::path::PathBuf;
use std::time::Duration;

use node_proto::mesh::NodeDescriptor;
use serde::Deserialize;

use crate::error::{MeshError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct MeshConfig {
    pub node: NodeConfig,
    #[serde(default)]
    pub identity: IdentitySource,
    /// SANs every node certificate must carry. Empty disables the check.
    #[serde(default)]
    pub required_sans: Vec<String>,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_node_type")]
    pub node_type: String,
    /// `host:port` to listen on; also advertised to peers.
    pub address: String,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ServiceConfig {
    pub name: String,
    pub version: String,
}

/// Where the node's mTLS material comes from.
///
/// `DevCa` may create a CA; `Files` and `Pem` only ever load what they are given.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum IdentitySource {
    DevCa {
        cert_dir: PathBuf,
    },
    Files {
        cert: PathBuf,
        key: PathBuf,
        ca_cert: PathBuf,
    },
    Pem {
        cert_pem: String,
        key_pem: String,
        ca_cert_pem: String,
    },
}

impl Default for IdentitySource {
    fn default() -> Self {
        Self::DevCa {
            cert_dir: default_cert_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    /// Used by callers above the mesh layer; the mesh itself never retries.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Maximum cached provider connections in the client pool.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsensusConfig {
    #[serde(default = "default_vote_timeout_ms")]
    pub vote_timeout_ms: u64,
    #[serde(default = "default_max_nodes")]
    pub max_nodes: usize,
    /// Finalize on the first rejection instead of waiting for every vote.
    #[serde(default)]
    pub short_circuit_veto: bool,
    /// Node ids this node always votes against.
    #[serde(default)]
    pub deny_list: Vec<String>,
}

fn default_cert_dir() -> PathBuf {
    PathBuf::from("./certs")
}
fn default_node_type() -> String {
    "node".into()
}
fn default_sync_interval_ms() -> u64 {
    15_000
}
fn default_request_timeout_ms() -> u64 {
    5_000
}
fn default_dial_timeout_ms() -> u64 {
    3_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_pool_size() -> usize {
    16
}
fn default_health_interval_ms() -> u64 {
    10_000
}
fn default_health_timeout_ms() -> u64 {
    2_000
}
fn default_healthy_threshold() -> u32 {
    1
}
fn default_unhealthy_threshold() -> u32 {
    3
}
fn default_vote_timeout_ms() -> u64 {
    30_000
}
fn default_max_nodes() -> usize {
    64
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            dial_timeout_ms: default_dial_timeout_ms(),
            max_retries: default_max_retries(),
            pool_size: default_pool_size(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval_ms(),
            timeout_ms: default_health_timeout_ms(),
            healthy_threshold: default_healthy_threshold(),
            unhealthy_threshold: default_unhealthy_threshold(),
        }
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            vote_timeout_ms: default_vote_timeout_ms(),
            max_nodes: default_max_nodes(),
            short_circuit_veto: false,
            deny_list: vec![],
        }
    }
}

impl NetworkConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl ConsensusConfig {
    pub fn vote_timeout(&self) -> Duration {
        Duration::from_millis(self.vote_timeout_ms)
    }
}

impl MeshConfig {
    /// Config with every optional section at its default.
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            node: NodeConfig {
                id: id.into(),
                name: String::new(),
                node_type: default_node_type(),
                address: address.into(),
                services: vec![],
            },
            identity: IdentitySource::default(),
            required_sans: vec![],
            network: NetworkConfig::default(),
            health: HealthConfig::default(),
            consensus: ConsensusConfig::default(),
            sync_interval_ms: default_sync_interval_ms(),
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.id.trim().is_empty() {
            return Err(MeshError::Config("node.id must not be empty".into()));
        }
        validate_address(&self.node.address)?;
        for service in &self.node.services {
            if service.name.is_empty() || service.version.is_empty() {
                return Err(MeshError::Config(format!(
                    "service entries need a name and version (got {service:?})"
                )));
            }
        }
        let positive = [
            ("network.request_timeout_ms", self.network.request_timeout_ms),
            ("network.dial_timeout_ms", self.network.dial_timeout_ms),
            ("health.interval_ms", self.health.interval_ms),
            ("health.timeout_ms", self.health.timeout_ms),
            ("consensus.vote_timeout_ms", self.consensus.vote_timeout_ms),
            ("sync_interval_ms", self.sync_interval_ms),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(MeshError::Config(format!("{field} must be greater than zero")));
        }
        if self.network.pool_size == 0 {
            return Err(MeshError::Config("network.pool_size must be at least 1".into()));
        }
        if self.consensus.max_nodes == 0 {
            return Err(MeshError::Config("consensus.max_nodes must be at least 1".into()));
        }
        if self.health.healthy_threshold == 0 || self.health.unhealthy_threshold == 0 {
            return Err(MeshError::Config("health thresholds must be at least 1".into()));
        }
        Ok(())
    }

    /// Descriptor this node advertises; the name falls back to the id.
    pub fn descriptor(&self) -> NodeDescriptor {
        let name = if self.node.name.is_empty() {
            self.node.id.clone()
        } else {
            self.node.name.clone()
        };
        let mut descriptor = NodeDescriptor::new(
            self.node.id.clone(),
            name,
            self.node.node_type.clone(),
            self.node.address.clone(),
        );
        for service in &self.node.services {
            descriptor = descriptor.with_service(service.name.clone(), service.version.clone());
        }
        descriptor
    }
}

fn validate_address(address: &str) -> Result<()> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| MeshError::Config(format!("address {address:?} must be host:port")))?;
    if host.is_empty() {
        return Err(MeshError::Config(format!("address {address:?} has no host")));
    }
    port.parse::<u16>()
        .map_err(|_| MeshError::Config(format!("address {address:?} has an invalid port")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = MeshConfig::new("node-a", "127.0.0.1:9901");
        config.validate().unwrap();
        assert_eq!(config.consensus.vote_timeout(), Duration::from_secs(30));
        assert_eq!(config.descriptor().name, "node-a");
    }

    #[test]
    fn rejects_bad_addresses() {
        for address in ["", "localhost", ":9000", "host:port", "host:70000"] {
            let config = MeshConfig::new("node-a", address);
            assert!(
                matches!(config.validate(), Err(MeshError::Config(_))),
                "{address:?} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_zero_timeouts() {
        let mut config = MeshConfig::new("node-a", "127.0.0.1:0");
        config.consensus.vote_timeout_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("consensus.vote_timeout_ms"));
    }

    #[test]
    fn descriptor_carries_services() {
        let mut config = MeshConfig::new("node-a", "127.0.0.1:0");
        config.node.name = "Alpha".into();
        config.node.services.push(ServiceConfig {
            name: "search".into(),
            version: "v1".into(),
        });
        let descriptor = config.descriptor();
        assert_eq!(descriptor.name, "Alpha");
        assert!(descriptor.provides("search", "v1"));
    }
}
