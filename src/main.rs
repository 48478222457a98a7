//! Arrakis Orchestrator - shard orchestrator for Arrakis gateway nodes
//!
//! This process:
//! - Accepts gateway node connections on the control channel
//! - Keeps every shard running somewhere and migrates shards on request
//! - Exposes the operator API plus health/ready endpoints for Kubernetes
//! - Exports Prometheus metrics and publishes the node roster to NATS

use anyhow::{anyhow, Result};
use arrakis_orchestrator::api::{self, AppState};
use arrakis_orchestrator::config::OrchestratorConfig;
use arrakis_orchestrator::nats::RosterPublisher;
use arrakis_orchestrator::orchestrator::{
    CommandVersionUpdater, DiscordShardCountProvider, Orchestrator, ProcessNodeLauncher,
};
use arrakis_orchestrator::telemetry::OrchestratorMetrics;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first to get log level
    let config = OrchestratorConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("arrakis_orchestrator={}", config.log_level).parse()?)
                .add_directive("async_nats=warn".parse()?),
        )
        .json()
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen_addr = %config.listen_addr,
        fixed_total_shards = ?config.fixed_total_shards,
        ensure_all_shards_running = config.monitor.ensure_all_shards_running,
        "Starting Arrakis Orchestrator"
    );

    let metrics = OrchestratorMetrics::install()?;
    info!("Prometheus metrics initialized");

    let mut builder = Orchestrator::builder(config.clone());
    match config.launcher.clone() {
        Some(launcher) => {
            info!(cmd = %launcher.cmd, "Node launcher enabled");
            builder = builder.node_launcher(Arc::new(ProcessNodeLauncher::new(launcher)));
        }
        None => info!("No NODE_LAUNCH_CMD configured - nodes must be started externally"),
    }
    if let Some(updater) = config.updater.clone() {
        info!(cmd = %updater.cmd, "Version updater enabled");
        builder = builder.version_updater(Arc::new(CommandVersionUpdater::new(updater)));
    }
    match config.discord_token.clone() {
        Some(token) => {
            builder = builder.shard_count_provider(Arc::new(DiscordShardCountProvider::new(token)));
        }
        None if config.fixed_total_shards.is_none() => {
            warn!("Neither a fixed shard count nor a bot token configured - relying on nodes to report one")
        }
        None => {}
    }
    let orchestrator = builder.build();
    let mut halt = orchestrator.subscribe_halt();

    orchestrator.start().await?;

    let nats = if let Some(ref url) = config.nats_url {
        match RosterPublisher::connect(url).await {
            Ok(publisher) => {
                tokio::spawn(publisher.clone().run(orchestrator.clone()));
                Some(publisher)
            }
            Err(e) => {
                error!(error = %e, "Failed to connect to NATS - roster publication disabled");
                None
            }
        }
    } else {
        info!("No NATS_URL configured - roster publication disabled");
        None
    };

    let app_state = AppState {
        orchestrator: orchestrator.clone(),
        metrics: Some(metrics),
        nats: nats.clone(),
    };

    let router = api::router(app_state);
    let addr: SocketAddr = ([0, 0, 0, 0], config.http_port).into();

    info!(port = config.http_port, "Starting HTTP server");

    let http_server = axum::serve(tokio::net::TcpListener::bind(addr).await?, router);

    let mut outcome = Ok(());
    tokio::select! {
        result = http_server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        reason = halt.wait_for(|r| r.is_some()) => {
            let reason = reason
                .ok()
                .and_then(|r| r.clone())
                .unwrap_or_default();
            error!(%reason, "Orchestrator halted");
            outcome = Err(anyhow!("orchestrator halted: {reason}"));
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    info!("Shutting down orchestrator...");

    orchestrator.stop().await;
    if let Some(ref nats) = nats {
        nats.close().await;
    }

    info!("Orchestrator shutdown complete");
    outcome
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
