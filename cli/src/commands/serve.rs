// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Key broker HTTP server

use anyhow::{Context, Result};
use clap::Args;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

use kbs_core::application::KeyBrokerService;
use kbs_core::domain::broker_config::BrokerConfigManifest;
use kbs_core::presentation::api;

#[derive(Args, Debug, Clone, Default)]
pub struct ServeArgs {
    /// Bind address (overrides spec.server.bind_address)
    #[arg(long, env = "KBS_HOST")]
    pub host: Option<String>,

    /// HTTP API port (overrides spec.server.port)
    #[arg(long)]
    pub port: Option<u16>,
}

impl ServeArgs {
    /// Command-line flags take precedence over file and environment.
    pub fn apply(&self, config: &mut BrokerConfigManifest) {
        if let Some(host) = &self.host {
            config.spec.server.bind_address = host.clone();
        }
        if let Some(port) = self.port {
            config.spec.server.port = port;
        }
    }
}

pub fn load_config(config_path: Option<PathBuf>) -> Result<BrokerConfigManifest> {
    BrokerConfigManifest::load_or_default(config_path).context("Failed to load configuration")
}

pub async fn run(config: BrokerConfigManifest) -> Result<()> {
    config
        .validate()
        .context("Configuration validation failed")?;

    info!(
        name = %config.metadata.name,
        port = config.spec.server.port,
        "Key broker starting (PID: {})",
        std::process::id()
    );

    let metrics = &config.spec.observability.metrics;
    if metrics.enabled {
        install_metrics_exporter(metrics.port)?;
    }

    let service = Arc::new(KeyBrokerService::from_config(&config).context("Failed to initialise key broker")?);
    let reaper = service.spawn_session_reaper(config.spec.session.reaper_interval);
    let app = api::router(service, config.spec.server.max_body_bytes);

    let addr = format!("{}:{}", config.spec.server.bind_address, config.spec.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Key broker listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    reaper.abort();
    info!("Key broker shutting down");

    Ok(())
}

fn install_metrics_exporter(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;
    info!("Prometheus metrics exposed on {}", addr);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
