//! # Substation Balancer - Main Entry Point
//!
//! Loads configuration, registers the configured substations, starts the
//! health monitor and serves the HTTP API until SIGTERM or SIGINT.

use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use substation_balancer::core::error::BalancerResult;
use substation_balancer::gateway::{BalancerServer, ServerState};
use substation_balancer::observability::{init_logging, HealthMonitor, MetricsExporter};
use substation_balancer::{BalancerConfig, ChargeBalancer};

#[tokio::main]
async fn main() -> BalancerResult<()> {
    let config_path = std::env::var("BALANCER_CONFIG_PATH")
        .unwrap_or_else(|_| "config/balancer.yaml".to_string());

    let config = BalancerConfig::load_or_default(&config_path).await?;
    init_logging(&config.observability.logging);

    info!("🚀 Starting substation balancer");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("📋 Configuration loaded from {} (defaults if missing)", config_path);

    let shutdown = CancellationToken::new();

    match run(config, shutdown.clone()).await {
        Ok(()) => info!("✅ Substation balancer shutdown complete"),
        Err(e) => {
            error!("Failed to run substation balancer: {}", e);
            std::process::exit(1);
        }
    }
    Ok(())
}

async fn run(config: BalancerConfig, shutdown: CancellationToken) -> BalancerResult<()> {
    let balancer = ChargeBalancer::from_config(&config)?;
    info!("⚡ Registered {} substations", balancer.registry().len());

    let mut state = ServerState::new(balancer.clone());
    if config.observability.metrics.enabled {
        match MetricsExporter::install(&config.observability.metrics) {
            Ok(exporter) => {
                info!("📊 Metrics exporter installed at {}", config.observability.metrics.endpoint_path);
                state = state.with_metrics(exporter);
            }
            Err(e) => warn!("Metrics exporter unavailable: {}", e),
        }
    }

    let monitor = Arc::new(HealthMonitor::http(balancer.registry().clone(), config.health)?);
    let monitor_handle = monitor.spawn(shutdown.clone());
    let reconciler_handle = balancer.clone().spawn_reconciler(shutdown.clone());

    let server = BalancerServer::new(&config.server, &config.observability.metrics, state)?;
    let server_shutdown = shutdown.clone();
    let mut server_handle = tokio::spawn(async move { server.start(server_shutdown).await });

    tokio::select! {
        _ = shutdown_signal() => {
            info!("🛑 Shutdown signal received, beginning graceful shutdown...");
            shutdown.cancel();
            match (&mut server_handle).await {
                Ok(Ok(())) => info!("✅ Server stopped gracefully"),
                Ok(Err(e)) => error!("Server error during shutdown: {}", e),
                Err(e) => error!("🚨 Server task failed: {}", e),
            }
        }
        result = &mut server_handle => {
            shutdown.cancel();
            match result {
                Ok(Ok(())) => info!("🏁 Server task completed"),
                Ok(Err(e)) => return Err(e),
                Err(e) => error!("🚨 Server task failed: {}", e),
            }
        }
    }

    if let Err(e) = monitor_handle.await {
        warn!("Health monitor task ended abnormally: {}", e);
    }
    if let Err(e) = reconciler_handle.await {
        warn!("Request reconciler task ended abnormally: {}", e);
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("📡 Received SIGINT (Ctrl+C)"),
        _ = terminate => info!("📡 Received SIGTERM"),
    }
}
