// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Activity heartbeat and external completion handlers.

use tracing::{info, instrument};
use weft_protocol::messages::{
    ActivityCompleteReply, ActivityCompleteRequest, ActivityRecordHeartbeatReply,
    ActivityRecordHeartbeatRequest,
};

use crate::error::{HandlerError, Result};
use crate::session::Session;

/// Record a heartbeat; the reply tells the activity whether to stop.
#[instrument(skip(session, request), fields(task_token = %request.task_token))]
pub async fn handle_activity_heartbeat(
    session: &Session,
    request: ActivityRecordHeartbeatRequest,
) -> Result<ActivityRecordHeartbeatReply> {
    if request.task_token.is_empty() {
        return Err(HandlerError::validation("task_token", "task token is required"));
    }
    let cancel_requested = session
        .state
        .engine
        .record_activity_heartbeat(&request.task_token, request.details)
        .await?;

    Ok(ActivityRecordHeartbeatReply {
        cancel_requested,
        error: None,
    })
}

/// Complete an activity that earlier replied `pending`.
///
/// Any session may complete the activity, not only the one that ran it.
#[instrument(skip(session, request), fields(task_token = %request.task_token, failed = request.failure.is_some()))]
pub async fn handle_activity_complete(
    session: &Session,
    request: ActivityCompleteRequest,
) -> Result<ActivityCompleteReply> {
    if request.task_token.is_empty() {
        return Err(HandlerError::validation("task_token", "task token is required"));
    }
    let result = match request.failure {
        Some(failure) => Err(failure),
        None => Ok(request.result),
    };
    session
        .state
        .engine
        .complete_activity(&request.task_token, result)
        .await?;
    info!("activity completed externally");

    Ok(ActivityCompleteReply::default())
}
