// Pneuma node: moderator or guardian daemon on the local mesh.

mod config;
mod cortex;
mod mesh;
mod node;

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use config::NodeRole;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("pneuma-node {}", VERSION);
            return Ok(());
        }
    }

    let cfg = config::load().context("loading configuration")?;
    init_tracing(&cfg);

    let envelope = pneuma_core::Envelope::new(&cfg.network_key()?)?;
    tracing::info!(
        node_id = %cfg.node_id,
        role = ?cfg.role,
        key_bits = envelope.key_bits(),
        "starting pneuma-node"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        tokio::select! {
            result = run(cfg, envelope) => result,
            result = shutdown_signal() => {
                tracing::info!("shutting down");
                result
            }
        }
    })
}

async fn run(cfg: config::Config, envelope: pneuma_core::Envelope) -> anyhow::Result<()> {
    let mesh = mesh::Mesh::bind(cfg.mesh_port, cfg.backbone_addr)
        .await
        .with_context(|| format!("binding mesh port {}", cfg.mesh_port))?;

    match cfg.role {
        NodeRole::Moderator => {
            let moderator = pneuma_core::Moderator::new(cfg.node_id, envelope, cfg.discovery);
            node::run_moderator(moderator, mesh).await
        }
        NodeRole::Guardian => {
            let profile = cfg
                .guardian
                .context("guardian role without [guardian] profile")?;
            let url = cfg
                .cortex_url
                .context("guardian role without cortex_url")?;
            let cortex = Arc::new(cortex::HttpCortex::new(url, cfg.cortex_model)?);
            let guardian = pneuma_core::Guardian::new(profile);
            node::run_guardian(guardian, envelope, mesh, cortex).await
        }
    }
}

fn init_tracing(cfg: &config::Config) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries debate output; logs go to stderr.
    if cfg.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
