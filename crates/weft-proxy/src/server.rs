// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC server for weft-proxy.
//!
//! Accepts connections from client libraries. Every bidirectional stream a
//! client opens carries one session.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, instrument, warn};
use weft_protocol::{ConnectionHandler, SessionStream, WeftServer, WeftServerConfig};

use crate::session::serve_session;
use crate::state::ProxyState;

/// Run the proxy QUIC server on `state.config.bind_addr`.
#[instrument(skip(state), fields(addr = %state.config.bind_addr))]
pub async fn run_proxy_server(state: Arc<ProxyState>) -> Result<()> {
    let bind_addr = state.config.bind_addr;
    let server = WeftServer::localhost_with_config(bind_addr, WeftServerConfig::from_env())?;

    info!(addr = %bind_addr, "Proxy QUIC server starting");

    server
        .run(move |conn: ConnectionHandler| {
            let state = state.clone();
            async move {
                handle_connection(conn, state).await;
            }
        })
        .await?;

    Ok(())
}

/// Serve every session stream of a single connection.
#[instrument(skip(conn, state), fields(remote = %conn.remote_address()))]
pub async fn handle_connection(conn: ConnectionHandler, state: Arc<ProxyState>) {
    info!("New client connection accepted");

    conn.run(move |stream: SessionStream| {
        let state = state.clone();
        async move {
            let remote = stream.remote_address();
            let (reader, writer) = stream.into_parts();
            match serve_session(reader, writer, state).await {
                Ok(()) => debug!(%remote, "session ended"),
                Err(e) => warn!(%remote, error = %e, "session ended with a protocol error"),
            }
        }
    })
    .await;

    debug!("Client connection closed");
}
