//! plfm-vt TCP Proxy
//!
//! Fronts a single upstream (typically the cluster API endpoint) with a
//! plain TCP listener.
//!
//! This service:
//! - Accepts TCP connections on the local address
//! - Dials the upstream per connection, optionally unwrapping TLS
//! - Pipes bytes in both directions until either side closes
//! - Exposes connection and byte metrics over HTTP

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use prometheus_client::registry::Registry;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use plfm_tcp_proxy::config::Args;
use plfm_tcp_proxy::{Listener, MetricsRecorder, MetricsServer, ProxyMetrics};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing (prefer RUST_LOG, fallback to --log-level)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| args.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting plfm-vt tcp proxy");

    let config = args.resolve().await?;
    info!(
        local_addr = %config.local_addr,
        remote_addr = %config.remote_addr,
        remote_target = %config.remote_target,
        metrics_addr = %config.metrics_addr,
        unwrap_tls = config.unwrap_tls,
        output_hex = config.output_hex,
        "Configuration loaded"
    );

    let mut registry = Registry::default();
    let metrics = Arc::new(ProxyMetrics::new(&mut registry));
    info!(instance_id = %metrics.instance_id(), "Metrics registered");

    let dialer = Arc::new(config.outbound_dialer()?);

    let listener = match Listener::bind(
        config.listener_config(),
        dialer,
        Arc::clone(&metrics) as Arc<dyn MetricsRecorder>,
    )
    .await
    {
        Ok(listener) => Arc::new(listener),
        Err(e) => {
            error!(bind_addr = %config.local_addr, error = %e, "Failed to bind listener");
            return Err(e.into());
        }
    };

    let metrics_server = MetricsServer::bind(config.metrics_addr, Arc::new(registry)).await?;

    // Create shutdown channel for the metrics server
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics_handle = tokio::spawn(metrics_server.run(async move {
        let mut shutdown_rx = shutdown_rx;
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }
    }));

    let listener_handle = tokio::spawn(listener.run());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = listener_handle => {
            match result {
                Ok(Ok(())) => info!("Listener exited"),
                Ok(Err(e)) => error!(error = %e, "Listener error"),
                Err(e) => error!(error = %e, "Listener task panicked"),
            }
        }
    }

    // Established connections are abandoned; only the metrics server drains.
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(std::time::Duration::from_secs(5), metrics_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!(error = %e, "Metrics server error"),
        Ok(Err(e)) => warn!(error = %e, "Metrics server task panicked"),
        Err(_) => warn!("Metrics server did not shut down in time"),
    }

    info!("TCP proxy shutdown complete");
    Ok(())
}
