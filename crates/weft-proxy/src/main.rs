// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Weft proxy - workflow proxy for client libraries.
//!
//! Serves client sessions over QUIC and runs executions on the in-memory
//! engine. Stops on Ctrl-C or when a client sends `Terminate`.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use weft_proxy::config::ProxyConfig;
use weft_proxy::engine::{MemoryEngine, MemoryEngineConfig};
use weft_proxy::server;
use weft_proxy::state::ProxyState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("weft_proxy=info".parse()?)
                .add_directive("weft_protocol=info".parse()?),
        )
        .init();

    info!("Starting Weft Proxy");

    // Load configuration
    let config = ProxyConfig::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        addr = %config.bind_addr,
        request_timeout_ms = config.request_timeout.as_millis() as u64,
        terminate_grace_ms = config.terminate_grace.as_millis() as u64,
        worker_wait_ms = config.worker_wait.as_millis() as u64,
        "Configuration loaded"
    );

    let engine = MemoryEngine::with_config(MemoryEngineConfig {
        worker_wait: config.worker_wait,
        ..Default::default()
    });
    let state = Arc::new(ProxyState::new(Arc::new(engine), config));

    let server_state = state.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server::run_proxy_server(server_state).await {
            error!("Proxy QUIC server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutting down...");
        }
        _ = state.shutdown.cancelled() => {
            info!("Terminate requested by a client, shutting down...");
        }
    }

    server_handle.abort();
    info!("Shutdown complete");

    Ok(())
}
