// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Routes inbound requests to their handlers.
//!
//! The `match` below is the dispatch table: every request variant maps to one
//! handler and every handler result becomes exactly one reply envelope.

use tracing::{debug, warn};
use weft_protocol::messages::CancelReply;
use weft_protocol::{
    Direction, Envelope, Family, MessageKind, ProtocolError, Reply, ReplyValue, Request,
    build_reply,
};

use crate::activity_handlers::*;
use crate::client_handlers::*;
use crate::decision_handlers::*;
use crate::error::HandlerError;
use crate::namespace_handlers::*;
use crate::session::Session;
use crate::worker_handlers::*;
use crate::workflow_handlers::*;

/// Handle one request and build its reply envelope.
pub async fn dispatch(
    session: &Session,
    request_id: u64,
    request: Request,
) -> Result<Envelope, ProtocolError> {
    let kind = request.kind();
    debug!(request_id, %kind, "dispatching request");

    if kind.direction() == Direction::ProxyToClient {
        warn!(request_id, %kind, "client sent a proxy-initiated request");
        return fail(kind, HandlerError::WrongDirection(kind.to_string()));
    }
    if kind.family() != Family::Client {
        if !session.is_initialized() {
            return fail(kind, HandlerError::NotInitialized);
        }
        if session.is_terminating() {
            return fail(kind, HandlerError::Terminating);
        }
    }

    match request {
        // ========== Client ==========
        Request::Initialize(r) => respond(kind, handle_initialize(session, r).await),
        Request::Connect(r) => respond(kind, handle_connect(session, r).await),
        Request::Heartbeat(r) => respond(kind, handle_heartbeat(session, r).await),
        Request::Ping(r) => respond(kind, handle_ping(session, r).await),
        Request::Terminate(r) => respond(kind, handle_terminate(session, r).await),
        // Cancel is answered by the connection before dispatch
        Request::Cancel(_) => respond(
            kind,
            Ok(CancelReply {
                was_cancelled: false,
                error: None,
            }),
        ),

        // ========== Namespace ==========
        Request::NamespaceRegister(r) => respond(kind, handle_namespace_register(session, r).await),
        Request::NamespaceDescribe(r) => respond(kind, handle_namespace_describe(session, r).await),
        Request::NamespaceUpdate(r) => respond(kind, handle_namespace_update(session, r).await),
        Request::NamespaceList(r) => respond(kind, handle_namespace_list(session, r).await),

        // ========== Worker ==========
        Request::NewWorker(r) => respond(kind, handle_new_worker(session, r).await),
        Request::StopWorker(r) => respond(kind, handle_stop_worker(session, r).await),
        Request::WorkflowRegister(r) => respond(kind, handle_workflow_register(session, r).await),
        Request::ActivityRegister(r) => respond(kind, handle_activity_register(session, r).await),

        // ========== Workflow client API ==========
        Request::WorkflowExecute(r) => respond(kind, handle_workflow_execute(session, r).await),
        Request::WorkflowGetResult(r) => {
            respond(kind, handle_workflow_get_result(session, r).await)
        }
        Request::WorkflowSignal(r) => respond(kind, handle_workflow_signal(session, r).await),
        Request::WorkflowQuery(r) => respond(kind, handle_workflow_query(session, r).await),
        Request::WorkflowCancel(r) => respond(kind, handle_workflow_cancel(session, r).await),
        Request::WorkflowTerminate(r) => {
            respond(kind, handle_workflow_terminate(session, r).await)
        }
        Request::WorkflowDescribe(r) => respond(kind, handle_workflow_describe(session, r).await),

        // ========== Workflow decisions ==========
        Request::WorkflowExecuteActivity(r) => {
            respond(kind, handle_execute_activity(session, r).await)
        }
        Request::WorkflowSleep(r) => respond(kind, handle_sleep(session, r).await),
        Request::WorkflowSideEffect(r) => respond(kind, handle_side_effect(session, r).await),
        Request::WorkflowMutableSideEffect(r) => {
            respond(kind, handle_mutable_side_effect(session, r).await)
        }
        Request::WorkflowGetVersion(r) => respond(kind, handle_get_version(session, r).await),
        Request::WorkflowExecuteChild(r) => respond(kind, handle_execute_child(session, r).await),
        Request::WorkflowWaitForSignal(r) => {
            respond(kind, handle_wait_for_signal(session, r).await)
        }
        Request::WorkflowGetTime(r) => respond(kind, handle_get_time(session, r).await),

        // ========== Activity ==========
        Request::ActivityRecordHeartbeat(r) => {
            respond(kind, handle_activity_heartbeat(session, r).await)
        }
        Request::ActivityComplete(r) => respond(kind, handle_activity_complete(session, r).await),

        // Rejected by the direction check above
        Request::WorkflowInvoke(_)
        | Request::WorkflowQueryInvoke(_)
        | Request::WorkflowSideEffectInvoke(_)
        | Request::ActivityInvoke(_)
        | Request::ActivityStopping(_) => fail(kind, HandlerError::WrongDirection(kind.to_string())),
    }
}

fn respond<R: Into<Reply>>(
    kind: MessageKind,
    result: Result<R, HandlerError>,
) -> Result<Envelope, ProtocolError> {
    match result {
        Ok(reply) => Ok(reply.into().into_envelope()),
        Err(e) => fail(kind, e),
    }
}

fn fail(kind: MessageKind, err: HandlerError) -> Result<Envelope, ProtocolError> {
    debug!(%kind, code = err.error_code(), error = %err, "request failed");
    build_reply(kind, Some(err.to_proxy_error()), ReplyValue::Empty)
}
