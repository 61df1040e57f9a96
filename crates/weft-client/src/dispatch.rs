// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Handles requests the proxy sends to the client library.
//!
//! Workflow and activity bodies run on their own tasks so a panic is caught
//! as a [`tokio::task::JoinError`] and reported with `ErrorKind::Panic`.
//! Query handlers and side-effect closures run inline under `catch_unwind`
//! and are reported the same way. If
//! the proxy cancels an invocation the reply future is dropped, which aborts
//! the body and removes its context.

use std::any::Any;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};
use weft_protocol::messages::{
    ActivityInvokeReply, ActivityInvokeRequest, ActivityStoppingReply, ActivityStoppingRequest,
    PingReply, WorkflowInvokeReply, WorkflowInvokeRequest, WorkflowQueryInvokeReply,
    WorkflowQueryInvokeRequest, WorkflowSideEffectInvokeReply, WorkflowSideEffectInvokeRequest,
};
use weft_protocol::{
    ContextKey, Direction, Envelope, Message, Payload, ProtocolError, ProxyError, ReplyValue,
    Request, RequestHandler, build_reply,
};

use crate::activity::{ActivityContext, ActivityInfo, ActivityState};
use crate::client::ClientShared;
use crate::workflow::{WorkflowContext, WorkflowInfo, WorkflowState};

type BodyResult = Result<Payload, ProxyError>;

/// Inbound request handler installed on the client's connection.
pub(crate) struct ClientHandler {
    shared: Arc<ClientShared>,
}

impl ClientHandler {
    pub(crate) fn new(shared: Arc<ClientShared>) -> Self {
        Self { shared }
    }

    fn key(&self, context_id: i64) -> ContextKey {
        ContextKey::new(self.shared.client_id(), context_id)
    }

    async fn invoke_workflow(&self, request: WorkflowInvokeRequest) -> WorkflowInvokeReply {
        let key = self.key(request.context_id);
        let workflow = match self.shared.types.workflow(&request.workflow_type) {
            Ok(workflow) => workflow,
            Err(e) => return workflow_reply(Err(e.into())),
        };

        let info = WorkflowInfo {
            namespace: request.namespace,
            workflow_id: request.workflow_id,
            run_id: request.run_id,
            workflow_type: request.workflow_type,
            task_queue: request.task_queue,
            attempt: request.attempt,
        };
        info!(
            context = %key,
            workflow_id = %info.workflow_id,
            workflow_type = %info.workflow_type,
            replaying = request.replaying,
            attempt = info.attempt,
            "running workflow"
        );
        let state = Arc::new(WorkflowState::new(
            key,
            info,
            request.replaying,
            self.shared.connection.clone(),
        ));
        if let Err(e) = self.shared.workflows.add(key, state.clone()) {
            return workflow_reply(Err(ProxyError::generic(e.to_string())));
        }

        let shared = self.shared.clone();
        let cleanup_state = state.clone();
        let mut running = Running::spawn(
            workflow(WorkflowContext::new(state), request.args),
            move || {
                cleanup_state.cancel();
                if shared.workflows.remove(key).is_err() {
                    debug!(context = %key, "workflow context already removed");
                }
            },
        );
        let result = running.join("workflow").await;
        debug!(context = %key, ok = result.is_ok(), "workflow finished");
        workflow_reply(result)
    }

    async fn invoke_activity(&self, request: ActivityInvokeRequest) -> ActivityInvokeReply {
        let key = self.key(request.context_id);
        let activity = match self.shared.types.activity(&request.activity_type) {
            Ok(activity) => activity,
            Err(e) => return activity_reply(Err(e.into()), false),
        };

        let info = ActivityInfo {
            namespace: request.namespace,
            workflow_id: request.workflow_id,
            run_id: request.run_id,
            activity_type: request.activity_type,
            task_token: request.task_token,
            attempt: request.attempt,
        };
        debug!(context = %key, activity_type = %info.activity_type, attempt = info.attempt, "running activity");
        let state = Arc::new(ActivityState::new(key, info, self.shared.connection.clone()));
        if let Err(e) = self.shared.activities.add(key, state.clone()) {
            return activity_reply(Err(ProxyError::generic(e.to_string())), false);
        }

        let shared = self.shared.clone();
        let mut running = Running::spawn(
            activity(ActivityContext::new(state.clone()), request.args),
            move || {
                if shared.activities.remove(key).is_err() {
                    debug!(context = %key, "activity context already removed");
                }
            },
        );
        let result = running.join("activity").await;
        activity_reply(result, state.is_pending())
    }

    fn query(&self, request: WorkflowQueryInvokeRequest) -> WorkflowQueryInvokeReply {
        let result = self
            .shared
            .workflows
            .get(self.key(request.context_id))
            .map_err(|e| ProxyError::generic(e.to_string()))
            .and_then(|state| {
                guarded("query", || state.run_query(&request.query_name, request.args))
            });
        match result {
            Ok(result) => WorkflowQueryInvokeReply {
                result,
                error: None,
            },
            Err(err) => WorkflowQueryInvokeReply {
                result: None,
                error: Some(err),
            },
        }
    }

    fn side_effect(&self, request: WorkflowSideEffectInvokeRequest) -> WorkflowSideEffectInvokeReply {
        let result = self
            .shared
            .workflows
            .get(self.key(request.context_id))
            .map_err(|e| ProxyError::generic(e.to_string()))
            .and_then(|state| guarded("side effect", || state.run_side_effect(request.seq)));
        match result {
            Ok(result) => WorkflowSideEffectInvokeReply {
                result,
                error: None,
            },
            Err(err) => WorkflowSideEffectInvokeReply {
                result: None,
                error: Some(err),
            },
        }
    }

    fn stopping(&self, request: ActivityStoppingRequest) -> ActivityStoppingReply {
        match self.shared.activities.get(self.key(request.context_id)) {
            Ok(state) => {
                state.stop();
                ActivityStoppingReply::default()
            }
            Err(e) => {
                debug!(context_id = request.context_id, "stopping notification for finished activity");
                ActivityStoppingReply {
                    error: Some(ProxyError::generic(e.to_string())),
                }
            }
        }
    }
}

#[async_trait]
impl RequestHandler for ClientHandler {
    async fn handle(&self, request_id: u64, request: Request) -> Result<Envelope, ProtocolError> {
        let kind = request.kind();
        match request {
            Request::WorkflowInvoke(r) => Ok(self.invoke_workflow(r).await.into_envelope()),
            Request::ActivityInvoke(r) => Ok(self.invoke_activity(r).await.into_envelope()),
            Request::WorkflowQueryInvoke(r) => Ok(self.query(r).into_envelope()),
            Request::WorkflowSideEffectInvoke(r) => Ok(self.side_effect(r).into_envelope()),
            Request::ActivityStopping(r) => Ok(self.stopping(r).into_envelope()),
            Request::Ping(_) => Ok(PingReply::default().into_envelope()),
            _ => {
                let reason = if kind.direction() == Direction::ClientToProxy {
                    format!("{} must be sent to the proxy, not to a client", kind)
                } else {
                    format!("{} is not handled by this client", kind)
                };
                warn!(request_id, %kind, "rejecting request from proxy");
                build_reply(kind, Some(ProxyError::generic(reason)), ReplyValue::Empty)
            }
        }
    }
}

fn workflow_reply(result: BodyResult) -> WorkflowInvokeReply {
    match result {
        Ok(result) => WorkflowInvokeReply {
            result,
            error: None,
        },
        Err(err) => WorkflowInvokeReply {
            result: None,
            error: Some(err),
        },
    }
}

fn activity_reply(result: BodyResult, pending: bool) -> ActivityInvokeReply {
    match result {
        Ok(_) if pending => ActivityInvokeReply {
            result: None,
            pending: true,
            error: None,
        },
        Ok(result) => ActivityInvokeReply {
            result,
            pending: false,
            error: None,
        },
        Err(err) => ActivityInvokeReply {
            result: None,
            pending: false,
            error: Some(err),
        },
    }
}

/// A spawned workflow or activity body.
///
/// Dropping it aborts the task and runs the cleanup, whether the body
/// finished or the invocation was cancelled.
struct Running {
    handle: JoinHandle<BodyResult>,
    cleanup: Option<Box<dyn FnOnce() + Send>>,
}

impl Running {
    fn spawn<F>(body: F, cleanup: impl FnOnce() + Send + 'static) -> Self
    where
        F: Future<Output = BodyResult> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(body),
            cleanup: Some(Box::new(cleanup)),
        }
    }

    async fn join(&mut self, what: &str) -> BodyResult {
        match (&mut self.handle).await {
            Ok(result) => result,
            Err(e) => Err(join_error(e, what)),
        }
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        self.handle.abort();
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

fn join_error(err: JoinError, what: &str) -> ProxyError {
    if err.is_panic() {
        let message = panic_message(err.into_panic());
        warn!(%what, panic = %message, "body panicked");
        ProxyError::panic(format!("{} panicked: {}", what, message))
    } else {
        ProxyError::cancelled(format!("{} task cancelled", what))
    }
}

/// Run user code inline, reporting a panic as `ErrorKind::Panic`.
fn guarded(what: &str, f: impl FnOnce() -> BodyResult) -> BodyResult {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let message = panic_message(payload);
        warn!(%what, panic = %message, "handler panicked");
        Err(ProxyError::panic(format!("{} panicked: {}", what, message)))
    })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_protocol::ErrorKind;

    #[tokio::test]
    async fn test_panic_is_reported_as_panic_kind() {
        fn explode() -> BodyResult {
            panic!("ledger out of balance")
        }

        let mut running = Running::spawn(async { explode() }, || {});
        let err = running.join("activity").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Panic);
        assert_eq!(err.message, "activity panicked: ledger out of balance");
    }

    #[test]
    fn test_inline_panic_is_reported_as_panic_kind() {
        let err = guarded("side effect", || panic!("counter overflow")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Panic);
        assert_eq!(err.message, "side effect panicked: counter overflow");

        let ok = guarded("query", || Ok(Some(bytes::Bytes::from_static(b"2"))));
        assert_eq!(ok.unwrap(), Some(bytes::Bytes::from_static(b"2")));
    }

    #[tokio::test]
    async fn test_drop_runs_cleanup_and_aborts() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let running = Running::spawn(
            async {
                std::future::pending::<()>().await;
                Ok(None)
            },
            move || {
                let _ = tx.send(());
            },
        );
        drop(running);
        rx.await.unwrap();
    }

    #[test]
    fn test_pending_activity_reply_drops_result() {
        let reply = activity_reply(Ok(Some(bytes::Bytes::from_static(b"1"))), true);
        assert!(reply.pending);
        assert!(reply.result.is_none());

        let reply = activity_reply(Err(ProxyError::custom("declined")), true);
        assert!(!reply.pending);
        assert_eq!(reply.error.unwrap().kind, ErrorKind::Custom);
    }
}
