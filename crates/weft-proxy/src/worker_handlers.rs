// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker and type registration handlers.

use tracing::{debug, info, instrument};
use weft_protocol::WorkerKind;
use weft_protocol::messages::{
    ActivityRegisterReply, ActivityRegisterRequest, NewWorkerReply, NewWorkerRequest,
    StopWorkerReply, StopWorkerRequest, WorkflowRegisterReply, WorkflowRegisterRequest,
};

use crate::engine::WorkerSpec;
use crate::error::{HandlerError, Result};
use crate::session::Session;

/// Acquire a worker lease for `(namespace, task_queue, worker_kind)`.
///
/// Repeated requests for the same identity share one engine worker and
/// return the same `worker_id` with an incremented `ref_count`.
#[instrument(skip(session, request), fields(task_queue = %request.task_queue, kind = %request.worker_kind))]
pub async fn handle_new_worker(
    session: &Session,
    request: NewWorkerRequest,
) -> Result<NewWorkerReply> {
    let namespace = session.namespace(Some(request.namespace))?;
    if request.task_queue.is_empty() {
        return Err(HandlerError::validation("task_queue", "task queue is required"));
    }

    let lease = session
        .leases
        .ensure(
            WorkerSpec {
                namespace,
                task_queue: request.task_queue,
                kind: request.worker_kind,
            },
            session.sink()?,
        )
        .await?;

    Ok(NewWorkerReply {
        worker_id: lease.worker_id,
        ref_count: lease.ref_count,
        error: None,
    })
}

/// Release a worker lease; the engine worker stops when the count reaches zero.
#[instrument(skip(session, request), fields(worker_id = request.worker_id))]
pub async fn handle_stop_worker(
    session: &Session,
    request: StopWorkerRequest,
) -> Result<StopWorkerReply> {
    let ref_count = session.leases.release(request.worker_id).await?;
    Ok(StopWorkerReply {
        ref_count,
        error: None,
    })
}

pub async fn handle_workflow_register(
    session: &Session,
    request: WorkflowRegisterRequest,
) -> Result<WorkflowRegisterReply> {
    register(session, WorkerKind::Workflow, request.workflow_type)?;
    Ok(WorkflowRegisterReply::default())
}

pub async fn handle_activity_register(
    session: &Session,
    request: ActivityRegisterRequest,
) -> Result<ActivityRegisterReply> {
    register(session, WorkerKind::Activity, request.activity_type)?;
    Ok(ActivityRegisterReply::default())
}

fn register(session: &Session, kind: WorkerKind, type_name: String) -> Result<()> {
    if type_name.is_empty() {
        return Err(HandlerError::validation("type_name", "type name is required"));
    }
    let client_id = session.client_id()?;
    if session.registered.register(kind, type_name.clone()) {
        info!(client_id, %kind, type_name = %type_name, "type registered");
    } else {
        debug!(client_id, %kind, type_name = %type_name, "type already registered");
    }
    Ok(())
}
