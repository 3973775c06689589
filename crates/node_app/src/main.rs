use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use node_app::{apply_env_identity, join_or_bootstrap, load_config};
use node_mesh::MeshNode;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("mesh.toml"));
    let mut config = load_config(&config_path)?;
    if apply_env_identity(&mut config.mesh, |name| std::env::var(name).ok())? {
        info!("using PEM identity from the environment");
    }

    let node = Arc::new(MeshNode::from_config(config.mesh.clone()).context("build node")?);
    let addr = node.start().await.context("start mesh server")?;
    info!("node {} listening on {addr}", node.id());

    let version = match join_or_bootstrap(&node, &config.seeds).await {
        Ok(version) => version,
        Err(e) => {
            error!("{e:#}");
            let _ = node.shutdown().await;
            return Err(e);
        }
    };
    info!(
        "node {} is a member ({} node(s), topology v{version})",
        node.id(),
        node.topology().node_count()
    );
    node.spawn_sync_loop();

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutting down");
    node.shutdown().await?;
    Ok(())
}
