// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Session management handlers (initialize, connect, liveness, terminate).

use tracing::{info, instrument, warn};
use weft_protocol::messages::{
    ConnectReply, ConnectRequest, HeartbeatReply, HeartbeatRequest, InitializeReply,
    InitializeRequest, PingReply, PingRequest, TerminateReply, TerminateRequest,
};

use crate::error::Result;
use crate::session::Session;

/// Handle the session handshake.
///
/// Assigns the client ID. A repeated `Initialize` on the same session
/// returns the ID already assigned.
#[instrument(skip(session, request), fields(library_address = %request.library_address, library_port = request.library_port))]
pub async fn handle_initialize(
    session: &Session,
    request: InitializeRequest,
) -> Result<InitializeReply> {
    let client_id = session.initialize();
    if let Some(identity) = request.identity {
        session.update_defaults(|defaults| {
            defaults.identity.get_or_insert(identity);
        });
    }
    info!(client_id, "client initialized");

    Ok(InitializeReply {
        client_id,
        error: None,
    })
}

/// Pin the session's default namespace and identity.
///
/// A default namespace must already be registered.
#[instrument(skip(session, request), fields(namespace = ?request.namespace))]
pub async fn handle_connect(session: &Session, request: ConnectRequest) -> Result<ConnectReply> {
    if let Some(namespace) = &request.namespace {
        session.state.engine.describe_namespace(namespace).await?;
    }

    session.update_defaults(|defaults| {
        if request.namespace.is_some() {
            defaults.namespace = request.namespace;
        }
        if request.identity.is_some() {
            defaults.identity = request.identity;
        }
    });
    info!("session defaults updated");

    Ok(ConnectReply::default())
}

pub async fn handle_heartbeat(
    _session: &Session,
    _request: HeartbeatRequest,
) -> Result<HeartbeatReply> {
    Ok(HeartbeatReply::default())
}

pub async fn handle_ping(_session: &Session, _request: PingRequest) -> Result<PingReply> {
    Ok(PingReply::default())
}

/// Drain the session and ask the proxy process to exit.
///
/// New non-session requests are refused from here on. The reply is sent once
/// in-flight requests finish or the grace period elapses; the shutdown token
/// fires after the client disconnects or the grace period elapses again.
#[instrument(skip(session, _request))]
pub async fn handle_terminate(
    session: &Session,
    _request: TerminateRequest,
) -> Result<TerminateReply> {
    session.begin_terminate();
    let grace = session.state.config.terminate_grace;

    // This request is one of the in-flight requests
    if tokio::time::timeout(grace, session.connection.wait_idle(1))
        .await
        .is_err()
    {
        warn!(
            in_flight = session.connection.in_flight(),
            "terminate grace period elapsed with requests still in flight"
        );
    }

    let connection = session.connection.clone();
    let shutdown = session.state.shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = connection.closed() => {}
            _ = tokio::time::sleep(grace) => {}
        }
        shutdown.cancel();
    });
    info!("terminate requested, proxy shutting down");

    Ok(TerminateReply::default())
}
