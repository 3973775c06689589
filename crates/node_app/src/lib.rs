//! Node wiring: configuration file, environment identity, startup sequence.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use node_mesh::{IdentitySource, MeshConfig, MeshError, MeshNode};
use serde::Deserialize;
use tracing::{info, warn};

pub const CERT_PEM_VAR: &str = "MESH_CERT_PEM";
pub const KEY_PEM_VAR: &str = "MESH_KEY_PEM";
pub const CA_PEM_VAR: &str = "MESH_CA_PEM";

/// A node to contact when joining.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Seed {
    pub id: String,
    pub address: String,
}

#[derive(Debug, Default, Deserialize)]
struct SeedList {
    #[serde(default)]
    seeds: Vec<Seed>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mesh: MeshConfig,
    pub seeds: Vec<Seed>,
}

impl AppConfig {
    /// Parse the daemon config: the mesh config at the top level plus an
    /// optional `[[seeds]]` list.
    pub fn parse(text: &str) -> Result<Self> {
        let mesh: MeshConfig = toml::from_str(text).context("parse mesh config")?;
        let SeedList { seeds } = toml::from_str(text).context("parse seeds")?;
        Ok(Self { mesh, seeds })
    }

    /// Single-node defaults used when no config file exists.
    pub fn standalone() -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            mesh: MeshConfig::new(format!("node-{}", &suffix[..8]), "127.0.0.1:9901"),
            seeds: vec![],
        }
    }
}

pub fn load_config(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        AppConfig::parse(&text).with_context(|| format!("load {}", path.display()))
    } else {
        info!("{} not found; running standalone", path.display());
        Ok(AppConfig::standalone())
    }
}

/// Replace the identity source with PEM text from the environment when all
/// three variables are set. Setting only some of them is an error.
pub fn apply_env_identity(
    config: &mut MeshConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<bool> {
    let cert = lookup(CERT_PEM_VAR);
    let key = lookup(KEY_PEM_VAR);
    let ca = lookup(CA_PEM_VAR);
    match (cert, key, ca) {
        (Some(cert_pem), Some(key_pem), Some(ca_cert_pem)) => {
            config.identity = IdentitySource::Pem {
                cert_pem,
                key_pem,
                ca_cert_pem,
            };
            Ok(true)
        }
        (None, None, None) => Ok(false),
        _ => anyhow::bail!("{CERT_PEM_VAR}, {KEY_PEM_VAR} and {CA_PEM_VAR} must be set together"),
    }
}

/// Bootstrap when there are no other seeds, otherwise join through them.
pub async fn join_or_bootstrap(node: &Arc<MeshNode>, seeds: &[Seed]) -> Result<u64> {
    let seeds: Vec<_> = seeds.iter().filter(|s| s.id != node.id()).collect();
    if seeds.is_empty() {
        return node.bootstrap().await.context("bootstrap mesh");
    }

    let attempts = node.config().network.max_retries.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        for seed in &seeds {
            match node.join(&seed.id, &seed.address).await {
                Ok(version) => return Ok(version),
                Err(e @ MeshError::JoinRejected { .. }) => {
                    return Err(e).with_context(|| format!("join via {}", seed.id));
                }
                Err(e) => {
                    warn!("join via {} ({}) failed, attempt {attempt}/{attempts}: {e}", seed.id, seed.address);
                    last_error = Some(e);
                }
            }
        }
        if attempt < attempts {
            tokio::time::sleep(Duration::from_millis(500 * u64::from(attempt))).await;
        }
    }
    match last_error {
        Some(e) => Err(e).context("no seed admitted this node"),
        None => anyhow::bail!("no seed admitted this node"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const FULL: &str = r#"
sync_interval_ms = 2000
required_sans = ["localhost"]

[node]
id = "node-a"
name = "Alpha"
address = "10.0.0.1:9901"
services = [{ name = "search", version = "v1" }]

[identity]
source = "files"
cert = "/etc/mesh/node-a-cert.pem"
key = "/etc/mesh/node-a-key.pem"
ca_cert = "/etc/mesh/ca-cert.pem"

[consensus]
vote_timeout_ms = 10000
short_circuit_veto = true

[[seeds]]
id = "node-b"
address = "10.0.0.2:9901"
"#;

    #[test]
    fn parses_full_config() {
        let config = AppConfig::parse(FULL).unwrap();
        config.mesh.validate().unwrap();
        assert_eq!(config.mesh.node.name, "Alpha");
        assert_eq!(config.mesh.node.node_type, "node");
        assert_eq!(config.mesh.sync_interval_ms, 2000);
        assert_eq!(config.mesh.required_sans, vec!["localhost"]);
        assert!(config.mesh.consensus.short_circuit_veto);
        assert_eq!(config.mesh.consensus.max_nodes, 64);
        assert_eq!(config.mesh.network.request_timeout_ms, 5000);
        assert!(matches!(config.mesh.identity, IdentitySource::Files { .. }));
        assert_eq!(
            config.seeds,
            vec![Seed {
                id: "node-b".into(),
                address: "10.0.0.2:9901".into()
            }]
        );
    }

    #[test]
    fn minimal_config_uses_dev_ca() {
        let config = AppConfig::parse(
            r#"
[node]
id = "solo"
address = "127.0.0.1:0"
"#,
        )
        .unwrap();
        assert!(config.seeds.is_empty());
        match config.mesh.identity {
            IdentitySource::DevCa { cert_dir } => assert_eq!(cert_dir, Path::new("./certs")),
            other => panic!("unexpected identity source {other:?}"),
        }
    }

    #[test]
    fn unknown_identity_source_is_rejected() {
        let err = AppConfig::parse(
            r#"
[node]
id = "solo"
address = "127.0.0.1:0"

[identity]
source = "vault"
"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("vault"));
    }

    #[test]
    fn env_identity_requires_all_three() {
        let mut config = MeshConfig::new("a", "127.0.0.1:0");
        let env: HashMap<&str, String> = HashMap::new();
        assert!(!apply_env_identity(&mut config, |k| env.get(k).cloned()).unwrap());

        let env = HashMap::from([(CERT_PEM_VAR, "cert".to_string())]);
        assert!(apply_env_identity(&mut config, |k| env.get(k).cloned()).is_err());

        let env = HashMap::from([
            (CERT_PEM_VAR, "cert".to_string()),
            (KEY_PEM_VAR, "key".to_string()),
            (CA_PEM_VAR, "ca".to_string()),
        ]);
        assert!(apply_env_identity(&mut config, |k| env.get(k).cloned()).unwrap());
        assert!(matches!(config.identity, IdentitySource::Pem { ref key_pem, .. } if key_pem == "key"));
    }

    #[test]
    fn missing_file_runs_standalone() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("mesh.toml")).unwrap();
        assert!(config.mesh.node.id.starts_with("node-"));
        assert!(config.seeds.is_empty());
        config.mesh.validate().unwrap();
    }
}
