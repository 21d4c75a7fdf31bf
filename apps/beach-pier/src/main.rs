use anyhow::{Context, Result};
use beach_pier::{
    cli::{Cli, Commands, ServeArgs},
    config::Config,
    handlers::{build_router, AppState},
    hub::RelayHub,
    probe,
    telemetry::Telemetry,
};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Probe(args)) => {
            Telemetry::init_logging()?;
            probe::run_probe(args).await
        }
        Some(Commands::Serve(args)) => serve(args).await,
        None => serve(cli.serve).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let telemetry = Telemetry::init()?;
    let config = Config::try_from(args)?;
    info!(
        listen_addr = %config.listen_addr,
        mode = ?config.mode,
        pairing_code_ttl_secs = config.pairing_code_ttl.as_secs(),
        nack_unroutable = config.nack_unroutable,
        "starting beach-pier relay"
    );
    run(config, telemetry.metrics_handle()).await
}

async fn run(config: Config, metrics: PrometheusHandle) -> Result<()> {
    let hub = RelayHub::new(config.hub_config());
    let sweeper = hub.spawn_sweeper();
    let router = build_router(Arc::new(AppState {
        hub,
        metrics: Some(metrics),
    }));

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!("beach-pier listening on {}", config.listen_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    sweeper.abort();
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
