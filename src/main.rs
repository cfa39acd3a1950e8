//! Orchestrator entrypoint: the brain of Forge.
//!
//! Connects to the bus, subscribes to every pipeline event, and serves the
//! REST + WebSocket API for the frontend. See `orchestrator` for the state
//! machine itself.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use forge_orchestrator::bus::{Broker, EventPublisher};
use forge_orchestrator::config::Config;
use forge_orchestrator::hub::Hub;
use forge_orchestrator::orchestrator::Orchestrator;
use forge_orchestrator::store::Store;

#[derive(Parser)]
#[command(name = "forge-orchestrator")]
#[command(version, about = "Forge pipeline orchestrator — design files in, working UI code out")]
struct Cli {
    /// Override API_PORT for the HTTP ingress.
    #[arg(short, long)]
    port: Option<u16>,

    /// Log at debug level (same as DEBUG=1).
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let debug = cli.verbose || std::env::var("DEBUG").as_deref() == Ok("1");
    let default_level = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let mut cfg = Config::from_env().context("load configuration")?;
    if let Some(port) = cli.port {
        cfg.api_port = port;
    }

    info!("Forge Orchestrator v{}", env!("CARGO_PKG_VERSION"));
    info!(
        amqp = %cfg.amqp_url,
        api_port = cfg.api_port,
        max_iterations = cfg.max_iterations,
        similarity_target = cfg.default_threshold,
        persistence = !cfg.supabase_url.is_empty(),
        "orchestrator online"
    );

    // Bus unreachable after the retry budget is fatal; the non-zero exit
    // lets the supervisor restart us.
    let broker = Arc::new(
        Broker::connect(&cfg.amqp_url)
            .await
            .context("connect to message bus")?,
    );
    let publisher: Arc<dyn EventPublisher> = Arc::clone(&broker) as Arc<dyn EventPublisher>;
    let store = Store::new(&cfg.supabase_url, &cfg.supabase_key);
    let orchestrator = Arc::new(Orchestrator::new(cfg, publisher, Hub::new(), store));

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal — stopping orchestrator");
        signal_token.cancel();
    });

    orchestrator.run(&broker, shutdown).await?;
    broker.close().await;
    info!("orchestrator stopped");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
