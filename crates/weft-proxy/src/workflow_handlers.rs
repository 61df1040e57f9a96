// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow client API handlers (start, result, signal, query, cancel, terminate, describe).

use std::time::Duration;

use tracing::{info, instrument};
use weft_protocol::messages::{
    WorkflowCancelReply, WorkflowCancelRequest, WorkflowDescribeReply, WorkflowDescribeRequest,
    WorkflowExecuteReply, WorkflowExecuteRequest, WorkflowGetResultReply,
    WorkflowGetResultRequest, WorkflowQueryReply, WorkflowQueryRequest, WorkflowSignalReply,
    WorkflowSignalRequest, WorkflowTerminateReply, WorkflowTerminateRequest,
};

use crate::engine::{StartWorkflow, WorkflowSelector};
use crate::error::{HandlerError, Result};
use crate::session::Session;

fn selector(
    session: &Session,
    namespace: Option<String>,
    workflow_id: String,
    run_id: Option<String>,
) -> Result<WorkflowSelector> {
    if workflow_id.is_empty() {
        return Err(HandlerError::validation("workflow_id", "workflow ID is required"));
    }
    Ok(WorkflowSelector {
        namespace: session.namespace(namespace)?,
        workflow_id,
        run_id: run_id.filter(|id| !id.is_empty()),
    })
}

/// Start a workflow execution.
///
/// # Errors
///
/// - `workflow_type` or `task_queue` is empty
/// - the namespace is unknown
/// - an open execution already uses `workflow_id`
#[instrument(skip(session, request), fields(workflow_type = %request.workflow_type, task_queue = %request.task_queue))]
pub async fn handle_workflow_execute(
    session: &Session,
    request: WorkflowExecuteRequest,
) -> Result<WorkflowExecuteReply> {
    let namespace = session.namespace(request.namespace)?;
    if request.workflow_type.is_empty() {
        return Err(HandlerError::validation("workflow_type", "workflow type is required"));
    }
    if request.task_queue.is_empty() {
        return Err(HandlerError::validation("task_queue", "task queue is required"));
    }

    let execution = session
        .state
        .engine
        .start_workflow(StartWorkflow {
            namespace,
            workflow_id: request.workflow_id,
            workflow_type: request.workflow_type,
            task_queue: request.task_queue,
            args: request.args,
            execution_timeout: request.execution_timeout_ms.map(Duration::from_millis),
        })
        .await?;
    info!(workflow_id = %execution.workflow_id, run_id = %execution.run_id, "workflow execution started");

    Ok(WorkflowExecuteReply {
        workflow_id: execution.workflow_id,
        run_id: execution.run_id,
        error: None,
    })
}

/// Wait for the execution to close.
///
/// A failed execution is reported through the reply's error, carrying the
/// execution's own error kind.
#[instrument(skip(session, request), fields(workflow_id = %request.workflow_id))]
pub async fn handle_workflow_get_result(
    session: &Session,
    request: WorkflowGetResultRequest,
) -> Result<WorkflowGetResultReply> {
    let selector = selector(session, request.namespace, request.workflow_id, request.run_id)?;
    let outcome = session.state.engine.get_workflow_result(&selector).await?;

    Ok(match outcome {
        Ok(result) => WorkflowGetResultReply {
            result,
            error: None,
        },
        Err(err) => WorkflowGetResultReply {
            result: None,
            error: Some(err),
        },
    })
}

#[instrument(skip(session, request), fields(workflow_id = %request.workflow_id, signal_name = %request.signal_name))]
pub async fn handle_workflow_signal(
    session: &Session,
    request: WorkflowSignalRequest,
) -> Result<WorkflowSignalReply> {
    if request.signal_name.is_empty() {
        return Err(HandlerError::validation("signal_name", "signal name is required"));
    }
    let selector = selector(session, request.namespace, request.workflow_id, request.run_id)?;
    session
        .state
        .engine
        .signal_workflow(&selector, &request.signal_name, request.args)
        .await?;

    Ok(WorkflowSignalReply::default())
}

#[instrument(skip(session, request), fields(workflow_id = %request.workflow_id, query_name = %request.query_name))]
pub async fn handle_workflow_query(
    session: &Session,
    request: WorkflowQueryRequest,
) -> Result<WorkflowQueryReply> {
    if request.query_name.is_empty() {
        return Err(HandlerError::validation("query_name", "query name is required"));
    }
    let selector = selector(session, request.namespace, request.workflow_id, request.run_id)?;
    let result = session
        .state
        .engine
        .query_workflow(&selector, &request.query_name, request.args)
        .await?;

    Ok(WorkflowQueryReply {
        result,
        error: None,
    })
}

#[instrument(skip(session, request), fields(workflow_id = %request.workflow_id))]
pub async fn handle_workflow_cancel(
    session: &Session,
    request: WorkflowCancelRequest,
) -> Result<WorkflowCancelReply> {
    let selector = selector(session, request.namespace, request.workflow_id, request.run_id)?;
    session.state.engine.cancel_workflow(&selector).await?;
    info!("workflow cancellation requested");

    Ok(WorkflowCancelReply::default())
}

#[instrument(skip(session, request), fields(workflow_id = %request.workflow_id))]
pub async fn handle_workflow_terminate(
    session: &Session,
    request: WorkflowTerminateRequest,
) -> Result<WorkflowTerminateReply> {
    let selector = selector(session, request.namespace, request.workflow_id, request.run_id)?;
    session
        .state
        .engine
        .terminate_workflow(&selector, request.reason.clone())
        .await?;
    info!(reason = ?request.reason, "workflow terminated");

    Ok(WorkflowTerminateReply::default())
}

pub async fn handle_workflow_describe(
    session: &Session,
    request: WorkflowDescribeRequest,
) -> Result<WorkflowDescribeReply> {
    let selector = selector(session, request.namespace, request.workflow_id, request.run_id)?;
    let description = session.state.engine.describe_workflow(&selector).await?;

    Ok(WorkflowDescribeReply {
        workflow_type: description.workflow_type,
        task_queue: description.task_queue,
        run_id: description.execution.run_id,
        status: description.status.to_string(),
        history_length: description.history_length,
        start_time_ms: description.start_time.timestamp_millis(),
        close_time_ms: description.close_time.map(|t| t.timestamp_millis()),
        error: None,
    })
}
