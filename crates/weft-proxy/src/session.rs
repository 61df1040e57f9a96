// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! One client library session.
//!
//! A [`Session`] handles the requests a client sends over its connection and
//! owns the client's worker leases. Work pushed by the engine reaches the
//! client through a [`SessionSink`], which turns engine tasks into
//! proxy-initiated `WorkflowInvoke`, `ActivityInvoke` and
//! `WorkflowQueryInvoke` requests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};
use weft_protocol::messages::{
    ActivityInvokeRequest, ActivityStoppingRequest, WorkflowInvokeRequest,
    WorkflowQueryInvokeRequest,
};
use weft_protocol::{
    Connection, ConnectionConfig, ContextKey, Envelope, Payload, ProtocolError, ProxyError,
    ReplyMessage, Request, RequestHandler, WorkerKind,
};

use crate::dispatch::dispatch;
use crate::engine::{ActivityOutcome, ActivityTask, QueryTask, TaskError, TaskSink, WorkflowTask};
use crate::error::{HandlerError, Result};
use crate::state::{ActivityContext, ProxyContexts, ProxyState, WorkflowContext};
use crate::workers::WorkerLeases;

/// Defaults pinned by `Connect`.
#[derive(Debug, Clone, Default)]
pub struct SessionDefaults {
    pub namespace: Option<String>,
    pub identity: Option<String>,
}

/// Workflow and activity type names the client has registered.
#[derive(Debug, Default)]
pub struct RegisteredTypes {
    workflows: RwLock<HashSet<String>>,
    activities: RwLock<HashSet<String>>,
}

impl RegisteredTypes {
    /// Record a type name. Returns `false` if it was already registered.
    pub fn register(&self, kind: WorkerKind, name: impl Into<String>) -> bool {
        self.types(kind).write().insert(name.into())
    }

    pub fn contains(&self, kind: WorkerKind, name: &str) -> bool {
        self.types(kind).read().contains(name)
    }

    fn types(&self, kind: WorkerKind) -> &RwLock<HashSet<String>> {
        match kind {
            WorkerKind::Workflow => &self.workflows,
            WorkerKind::Activity => &self.activities,
        }
    }
}

/// Proxy side of a client session.
pub struct Session {
    pub(crate) state: Arc<ProxyState>,
    pub(crate) connection: Connection,
    pub(crate) leases: WorkerLeases,
    pub(crate) registered: Arc<RegisteredTypes>,
    client_id: OnceLock<i64>,
    defaults: RwLock<SessionDefaults>,
    terminating: AtomicBool,
}

impl Session {
    pub fn new(state: Arc<ProxyState>, connection: Connection) -> Self {
        Self {
            leases: WorkerLeases::new(state.engine.clone()),
            state,
            connection,
            registered: Arc::new(RegisteredTypes::default()),
            client_id: OnceLock::new(),
            defaults: RwLock::new(SessionDefaults::default()),
            terminating: AtomicBool::new(false),
        }
    }

    /// Assign the client ID on first call; later calls return the same ID.
    pub(crate) fn initialize(&self) -> i64 {
        *self
            .client_id
            .get_or_init(|| self.state.client_ids.next_id())
    }

    pub fn is_initialized(&self) -> bool {
        self.client_id.get().is_some()
    }

    pub fn client_id(&self) -> Result<i64> {
        self.client_id
            .get()
            .copied()
            .ok_or(HandlerError::NotInitialized)
    }

    pub fn defaults(&self) -> SessionDefaults {
        self.defaults.read().clone()
    }

    pub(crate) fn update_defaults(&self, update: impl FnOnce(&mut SessionDefaults)) {
        update(&mut self.defaults.write());
    }

    /// The given namespace, or the session default when absent or empty.
    pub(crate) fn namespace(&self, namespace: Option<String>) -> Result<String> {
        namespace
            .filter(|ns| !ns.is_empty())
            .or_else(|| self.defaults.read().namespace.clone())
            .ok_or_else(|| {
                HandlerError::validation("namespace", "namespace is required (no session default)")
            })
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Acquire)
    }

    pub(crate) fn begin_terminate(&self) {
        self.terminating.store(true, Ordering::Release);
    }

    /// Task sink delivering engine work to this client.
    pub(crate) fn sink(&self) -> Result<Arc<SessionSink>> {
        Ok(Arc::new(SessionSink {
            connection: self.connection.clone(),
            client_id: self.client_id()?,
            contexts: self.state.contexts.clone(),
            registered: self.registered.clone(),
        }))
    }

    /// Release everything the session holds.
    async fn close(&self) {
        let stopped_workers = self.leases.release_all().await;
        match self.client_id.get() {
            Some(client_id) => {
                let removed_contexts = self.state.contexts.remove_client(*client_id);
                info!(client_id, stopped_workers, removed_contexts, "session closed");
            }
            None => debug!("uninitialized session closed"),
        }
    }
}

#[async_trait]
impl RequestHandler for Session {
    async fn handle(
        &self,
        request_id: u64,
        request: Request,
    ) -> std::result::Result<Envelope, ProtocolError> {
        dispatch(self, request_id, request).await
    }
}

/// Serve one client session over the given stream halves until it closes.
pub async fn serve_session<R, W>(
    reader: R,
    writer: W,
    state: Arc<ProxyState>,
) -> std::result::Result<(), ProtocolError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (connection, driver) = Connection::new(
        reader,
        writer,
        ConnectionConfig {
            role: "proxy",
            request_timeout: state.config.request_timeout,
        },
    );
    let session = Arc::new(Session::new(state, connection));
    let result = driver.run(session.clone()).await;
    session.close().await;
    result
}

// ============================================================================
// Task sink
// ============================================================================

/// Pushes engine tasks to one client library.
pub struct SessionSink {
    connection: Connection,
    client_id: i64,
    contexts: Arc<ProxyContexts>,
    registered: Arc<RegisteredTypes>,
}

impl SessionSink {
    fn ensure_registered(&self, kind: WorkerKind, name: &str) -> std::result::Result<(), TaskError> {
        if self.registered.contains(kind, name) {
            Ok(())
        } else {
            Err(TaskError::Failed(ProxyError::generic(format!(
                "{} type '{}' is not registered by client {}",
                kind, name, self.client_id
            ))))
        }
    }

    fn next_key(&self) -> ContextKey {
        ContextKey::new(self.client_id, self.contexts.context_ids.next_id())
    }

    fn task_error(&self, err: ProtocolError, what: &str) -> TaskError {
        match err {
            ProtocolError::Cancelled => {
                TaskError::Failed(ProxyError::cancelled(format!("{} cancelled", what)))
            }
            err if err.is_fatal() => TaskError::WorkerUnavailable(format!(
                "client {} unavailable: {}",
                self.client_id, err
            )),
            err => TaskError::Failed(err.into()),
        }
    }
}

#[async_trait]
impl TaskSink for SessionSink {
    async fn run_workflow(&self, task: WorkflowTask) -> std::result::Result<Payload, TaskError> {
        self.ensure_registered(WorkerKind::Workflow, &task.workflow_type)?;

        let key = self.next_key();
        let context = Arc::new(WorkflowContext::new(
            key,
            task.execution.clone(),
            task.workflow_type.clone(),
            task.task_queue.clone(),
            task.cancel.child_token(),
        )
        .with_replay_horizon(task.replay_horizon));
        self.contexts
            .workflows
            .add(key, context.clone())
            .map_err(|e| TaskError::Failed(ProxyError::generic(e.to_string())))?;

        debug!(context = %key, execution = %task.execution, replaying = task.replaying, "invoking workflow");
        let request = WorkflowInvokeRequest {
            context_id: key.context_id,
            namespace: task.execution.namespace,
            workflow_id: task.execution.workflow_id,
            run_id: task.execution.run_id,
            workflow_type: task.workflow_type,
            task_queue: task.task_queue,
            args: task.args,
            replaying: task.replaying,
            attempt: task.attempt,
        };
        let reply = tokio::select! {
            reply = self.connection.request_unbounded(request) => reply,
            _ = task.cancel.cancelled() => Err(ProtocolError::Cancelled),
        };

        if self.contexts.workflows.remove(key).is_err() {
            debug!(context = %key, "workflow context already removed");
        }
        if let Some(err) = context.poisoned() {
            return Err(TaskError::Failed(err));
        }

        match reply {
            Ok(reply) => reply
                .into_result()
                .map(|reply| reply.result)
                .map_err(TaskError::Failed),
            Err(err) => Err(self.task_error(err, "workflow")),
        }
    }

    async fn run_activity(
        &self,
        task: ActivityTask,
    ) -> std::result::Result<ActivityOutcome, TaskError> {
        self.ensure_registered(WorkerKind::Activity, &task.activity_type)?;

        let key = self.next_key();
        let context = Arc::new(ActivityContext {
            key,
            activity_type: task.activity_type.clone(),
            task_token: task.task_token.clone(),
            cancel: task.cancel.child_token(),
        });
        self.contexts
            .activities
            .add(key, context.clone())
            .map_err(|e| TaskError::Failed(ProxyError::generic(e.to_string())))?;

        debug!(context = %key, task_token = %task.task_token, "invoking activity");
        let request = ActivityInvokeRequest {
            context_id: key.context_id,
            namespace: task.execution.namespace,
            workflow_id: task.execution.workflow_id,
            run_id: task.execution.run_id,
            activity_type: task.activity_type,
            task_token: task.task_token,
            args: task.args,
            attempt: task.attempt,
        };
        let reply = tokio::select! {
            reply = self.connection.request_unbounded(request) => reply,
            _ = context.cancel.cancelled() => {
                if self.connection.is_closed() {
                    Err(ProtocolError::ConnectionClosed)
                } else {
                    let stopping = ActivityStoppingRequest { context_id: key.context_id };
                    if let Err(e) = self.connection.request(stopping).await {
                        debug!(context = %key, error = %e, "stopping notification not acknowledged");
                    }
                    Err(ProtocolError::Cancelled)
                }
            }
        };

        if self.contexts.activities.remove(key).is_err() {
            debug!(context = %key, "activity context already removed");
        }

        match reply {
            Ok(reply) => match reply.into_result() {
                Ok(reply) if reply.pending => Ok(ActivityOutcome::Pending),
                Ok(reply) => Ok(ActivityOutcome::Completed(reply.result)),
                Err(err) => Err(TaskError::Failed(err)),
            },
            Err(err) => Err(self.task_error(err, "activity")),
        }
    }

    async fn query(&self, task: QueryTask) -> std::result::Result<Payload, TaskError> {
        let context = self
            .contexts
            .workflows
            .find(|key, context| {
                key.client_id == self.client_id && context.execution == task.execution
            })
            .into_iter()
            .next()
            .ok_or_else(|| {
                TaskError::Failed(ProxyError::generic(format!(
                    "workflow {} is not running on client {}",
                    task.execution, self.client_id
                )))
            })?;

        let request = WorkflowQueryInvokeRequest {
            context_id: context.key.context_id,
            query_name: task.query_name,
            args: task.args,
        };
        match self.connection.request(request).await {
            Ok(reply) => reply
                .into_result()
                .map(|reply| reply.result)
                .map_err(TaskError::Failed),
            Err(err) => {
                warn!(context = %context.key, error = %err, "query invocation failed");
                Err(self.task_error(err, "query"))
            }
        }
    }
}
