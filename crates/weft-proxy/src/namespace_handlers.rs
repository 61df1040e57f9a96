// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Namespace administration handlers.

use tracing::{info, instrument};
use weft_protocol::Json;
use weft_protocol::messages::{
    NamespaceDescribeReply, NamespaceDescribeRequest, NamespaceListReply, NamespaceListRequest,
    NamespaceRegisterReply, NamespaceRegisterRequest, NamespaceUpdateReply,
    NamespaceUpdateRequest,
};

use crate::engine::{NamespaceSpec, NamespaceUpdate};
use crate::error::{HandlerError, Result};
use crate::session::Session;

fn require_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(HandlerError::validation("name", "namespace name is required"));
    }
    Ok(())
}

#[instrument(skip(session, request), fields(namespace = %request.name))]
pub async fn handle_namespace_register(
    session: &Session,
    request: NamespaceRegisterRequest,
) -> Result<NamespaceRegisterReply> {
    require_name(&request.name)?;

    session
        .state
        .engine
        .register_namespace(NamespaceSpec {
            name: request.name,
            description: request.description.unwrap_or_default(),
            owner_email: request.owner_email.unwrap_or_default(),
            retention_days: request.retention_days,
        })
        .await?;
    info!(retention_days = request.retention_days, "namespace registered");

    Ok(NamespaceRegisterReply::default())
}

#[instrument(skip(session, request), fields(namespace = %request.name))]
pub async fn handle_namespace_describe(
    session: &Session,
    request: NamespaceDescribeRequest,
) -> Result<NamespaceDescribeReply> {
    require_name(&request.name)?;
    let info = session.state.engine.describe_namespace(&request.name).await?;

    Ok(NamespaceDescribeReply {
        name: info.name,
        description: info.description,
        owner_email: info.owner_email,
        status: info.status,
        retention_days: info.retention_days,
        error: None,
    })
}

#[instrument(skip(session, request), fields(namespace = %request.name))]
pub async fn handle_namespace_update(
    session: &Session,
    request: NamespaceUpdateRequest,
) -> Result<NamespaceUpdateReply> {
    require_name(&request.name)?;

    session
        .state
        .engine
        .update_namespace(
            &request.name,
            NamespaceUpdate {
                description: request.description,
                owner_email: request.owner_email,
                retention_days: request.retention_days,
            },
        )
        .await?;
    info!("namespace updated");

    Ok(NamespaceUpdateReply::default())
}

pub async fn handle_namespace_list(
    session: &Session,
    _request: NamespaceListRequest,
) -> Result<NamespaceListReply> {
    let namespaces = session.state.engine.list_namespaces().await?;
    Ok(NamespaceListReply {
        namespaces: Json(namespaces),
        error: None,
    })
}
