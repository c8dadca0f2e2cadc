use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use sandpool::config::PoolConfig;
use sandpool::labels::ContainerType;
use sandpool::leader::{BackfillOnLead, LeaderElector};
use sandpool::pool::PoolEngine;
use sandpool::reconcile;

#[derive(Parser)]
#[command(name = "sandpool")]
#[command(about = "Warm pools of VM-isolated sandboxes and MCP servers on Kubernetes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control-plane loops (monitor, cleanup, leader-gated backfill)
    Serve {
        /// Path to sandpool.toml
        #[arg(short, long, default_value = "sandpool.toml")]
        config: PathBuf,
    },
    /// Print pool statistics
    Status {
        /// Path to sandpool.toml
        #[arg(short, long, default_value = "sandpool.toml")]
        config: PathBuf,
        /// Pool to inspect (sandbox, mcp-server)
        #[arg(short = 't', long, default_value = "sandbox")]
        container_type: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config } => serve(&config).await,
        Commands::Status {
            config,
            container_type,
        } => status(&config, &container_type).await,
    }
}

async fn serve(config_path: &Path) -> Result<()> {
    let config = Arc::new(PoolConfig::from_file(config_path)?);
    let client = config.connect().await?;
    let engine = PoolEngine::new(client.clone(), config.clone());

    info!(
        namespace = %config.namespace,
        manager_id = %engine.manager_id(),
        "sandpool starting"
    );

    let root = CancellationToken::new();

    let monitor = tokio::spawn(reconcile::run_monitor(engine.clone(), root.child_token()));
    let cleanup = tokio::spawn(reconcile::run_cleanup(engine.clone(), root.child_token()));

    let elector = LeaderElector::new(client, config.clone());
    let election = {
        let hooks = BackfillOnLead::new(engine.clone());
        let token = root.child_token();
        tokio::spawn(async move { elector.run(&hooks, token).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received, stopping loops");
    root.cancel();

    let _ = tokio::join!(monitor, cleanup, election);
    Ok(())
}

async fn status(config_path: &Path, container_type: &str) -> Result<()> {
    let container_type: ContainerType = container_type
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    let config = Arc::new(PoolConfig::from_file(config_path)?);
    let client = config.connect().await?;
    let engine = PoolEngine::new(client, config);

    let stats = engine.statistics(container_type).await;
    println!("{} pool: {}", container_type, stats);
    Ok(())
}
