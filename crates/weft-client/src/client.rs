// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client connection to the weft proxy.

use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use weft_protocol::messages::{
    ActivityCompleteRequest, ActivityRecordHeartbeatRequest, ActivityRegisterRequest,
    ConnectRequest, HeartbeatRequest, InitializeRequest, NamespaceDescribeRequest,
    NamespaceInfo, NamespaceListRequest, NamespaceRegisterRequest, NamespaceUpdateRequest,
    NewWorkerRequest, PingRequest, ReplyMessage, StopWorkerRequest, TerminateRequest,
    WorkflowCancelRequest, WorkflowDescribeRequest, WorkflowExecuteRequest,
    WorkflowGetResultRequest, WorkflowQueryRequest, WorkflowRegisterRequest,
    WorkflowSignalRequest, WorkflowTerminateRequest,
};
use weft_protocol::{
    Connection, ConnectionConfig, ContextKey, ProxyError, Registry, RequestHandler,
    RequestMessage, WeftTransport, WeftTransportConfig, WorkerKind,
};

use crate::activity::{ActivityContext, ActivityState};
use crate::config::ClientConfig;
use crate::convert::{decode, encode};
use crate::dispatch::ClientHandler;
use crate::error::{ClientError, Result};
use crate::registry::{
    TypeRegistry, activity_fn, next_handle_id, track_client, untrack_client, workflow_fn,
};
use crate::workflow::{WorkflowContext, WorkflowState};

// ============================================================================
// Public value types
// ============================================================================

/// Identifies a workflow execution for client API calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkflowExecution {
    /// Namespace (default: the session's namespace)
    pub namespace: Option<String>,
    pub workflow_id: String,
    /// Specific run (default: the latest run)
    pub run_id: Option<String>,
}

impl WorkflowExecution {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            ..Default::default()
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }
}

/// Options for [`WeftClient::start_workflow`].
#[derive(Debug, Clone, Default)]
pub struct StartWorkflowOptions {
    /// Namespace (default: the session's namespace)
    pub namespace: Option<String>,
    /// Workflow ID (default: generated by the proxy)
    pub workflow_id: Option<String>,
    pub task_queue: String,
    /// Fail the execution if it runs longer than this
    pub execution_timeout: Option<Duration>,
}

impl StartWorkflowOptions {
    pub fn new(task_queue: impl Into<String>) -> Self {
        Self {
            task_queue: task_queue.into(),
            ..Default::default()
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }
}

/// Namespace settings for [`WeftClient::register_namespace`].
#[derive(Debug, Clone)]
pub struct NamespaceRegistration {
    pub name: String,
    pub description: Option<String>,
    pub owner_email: Option<String>,
    pub retention_days: u32,
}

impl NamespaceRegistration {
    /// A namespace keeping closed executions for 7 days.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            owner_email: None,
            retention_days: 7,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_owner_email(mut self, owner_email: impl Into<String>) -> Self {
        self.owner_email = Some(owner_email.into());
        self
    }

    pub fn with_retention_days(mut self, retention_days: u32) -> Self {
        self.retention_days = retention_days;
        self
    }
}

/// Fields to change with [`WeftClient::update_namespace`]. `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct NamespaceChanges {
    pub description: Option<String>,
    pub owner_email: Option<String>,
    pub retention_days: Option<u32>,
}

/// A worker lease held by this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerLease {
    pub worker_id: u64,
    /// Leases on the same worker held by this session, including this one
    pub ref_count: u32,
}

/// Snapshot of a workflow execution.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowDescription {
    pub workflow_type: String,
    pub task_queue: String,
    pub run_id: String,
    /// Running, Completed, Failed, Cancelled, Terminated or TimedOut
    pub status: String,
    pub history_length: u64,
    pub start_time: DateTime<Utc>,
    pub close_time: Option<DateTime<Utc>>,
}

// ============================================================================
// Client
// ============================================================================

pub(crate) struct ClientShared {
    pub(crate) connection: Connection,
    config: ClientConfig,
    handle_id: i64,
    client_id: OnceLock<i64>,
    pub(crate) types: TypeRegistry,
    pub(crate) workflows: Registry<ContextKey, WorkflowState>,
    pub(crate) activities: Registry<ContextKey, ActivityState>,
    /// Keeps the QUIC connection open for as long as the session lives
    transport: Option<WeftTransport>,
}

impl ClientShared {
    /// Proxy-assigned ID, or 0 before `Initialize` completes.
    pub(crate) fn client_id(&self) -> i64 {
        self.client_id.get().copied().unwrap_or_default()
    }

    /// Cancel every context this client owns and forget the client.
    fn teardown(&self) {
        let workflows = self.workflows.remove_where(|_, _| true);
        for state in &workflows {
            state.cancel();
        }
        let activities = self.activities.remove_where(|_, _| true);
        for state in &activities {
            state.stop();
        }
        untrack_client(self.handle_id);
        debug!(
            client_id = self.client_id(),
            workflows = workflows.len(),
            activities = activities.len(),
            "client torn down"
        );
    }
}

/// Session with the weft proxy.
///
/// Cheap to clone; every clone shares the same session.
///
/// # Example
///
/// ```ignore
/// use weft_client::{ClientConfig, StartWorkflowOptions, WeftClient, WorkerKind};
///
/// let client = WeftClient::connect(ClientConfig::from_env()?).await?;
/// client.use_namespace("orders").await?;
/// client.register_activity("charge", |_ctx, order: Order| async move { charge(order).await }).await?;
/// client.new_worker(None, "checkout", WorkerKind::Activity).await?;
///
/// let execution = client
///     .start_workflow(StartWorkflowOptions::new("checkout"), "checkout", &order)
///     .await?;
/// let receipt: Receipt = client.workflow_result(&execution).await?;
/// ```
#[derive(Clone)]
pub struct WeftClient {
    shared: Arc<ClientShared>,
}

impl WeftClient {
    /// Connect to the proxy over QUIC and initialize a session.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let transport = WeftTransport::new(WeftTransportConfig {
            server_addr: config.proxy_addr,
            server_name: config.server_name.clone(),
            dangerous_skip_cert_verification: config.skip_cert_verification,
            connect_timeout_ms: config.connect_timeout_ms,
            ..Default::default()
        })?;
        transport.connect().await?;
        let (reader, writer) = transport.open_session().await?;
        Self::start(reader, writer, config, Some(transport)).await
    }

    /// Initialize a session over an already-open stream.
    pub async fn connect_with<R, W>(reader: R, writer: W, config: ClientConfig) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::start(reader, writer, config, None).await
    }

    #[instrument(skip_all, fields(proxy = %config.proxy_addr))]
    async fn start<R, W>(
        reader: R,
        writer: W,
        config: ClientConfig,
        transport: Option<WeftTransport>,
    ) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (connection, driver) = Connection::new(
            reader,
            writer,
            ConnectionConfig {
                role: "client",
                request_timeout: config.request_timeout(),
            },
        );
        let shared = Arc::new(ClientShared {
            connection: connection.clone(),
            config,
            handle_id: next_handle_id(),
            client_id: OnceLock::new(),
            types: TypeRegistry::new(),
            workflows: Registry::new("workflow"),
            activities: Registry::new("activity"),
            transport,
        });

        let handler: Arc<dyn RequestHandler> = Arc::new(ClientHandler::new(shared.clone()));
        let driver_shared = shared.clone();
        tokio::spawn(async move {
            if let Err(e) = driver.run(handler).await {
                warn!(error = %e, "session ended with a protocol error");
            }
            driver_shared.teardown();
        });

        // Callbacks travel on the session itself; there is no listener port
        let initialize = InitializeRequest {
            library_address: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            library_port: 0,
            identity: shared.config.identity.clone(),
        };
        let client_id = match connection.request(initialize).await {
            Ok(reply) => match reply.into_result() {
                Ok(reply) => reply.client_id,
                Err(e) => {
                    connection.close();
                    return Err(e.into());
                }
            },
            Err(e) => {
                connection.close();
                return Err(e.into());
            }
        };

        if shared.client_id.set(client_id).is_err() {
            debug!(client_id, "client ID already set");
        }
        if let Err(e) = track_client(shared.handle_id, shared.clone()) {
            connection.close();
            return Err(e);
        }
        info!(client_id, handle_id = shared.handle_id, "session initialized");

        if shared.config.heartbeat_interval_ms > 0 {
            tokio::spawn(heartbeat_loop(
                connection,
                Duration::from_millis(shared.config.heartbeat_interval_ms),
                Duration::from_millis(shared.config.heartbeat_deadline_ms),
                shared.config.request_timeout(),
            ));
        }

        Ok(Self { shared })
    }

    pub(crate) fn from_shared(shared: Arc<ClientShared>) -> Self {
        Self { shared }
    }

    /// ID the proxy assigned to this session.
    pub fn client_id(&self) -> i64 {
        self.shared.client_id()
    }

    /// Process-local ID for [`crate::lookup_client`].
    pub fn handle_id(&self) -> i64 {
        self.shared.handle_id
    }

    pub fn is_closed(&self) -> bool {
        self.shared.connection.is_closed()
    }

    /// Resolves when the session closes, for any reason.
    pub async fn closed(&self) {
        self.shared.connection.closed().await
    }

    /// Workflow executions currently running in this client.
    pub fn running_workflows(&self) -> usize {
        self.shared.workflows.len()
    }

    /// Activity attempts currently running in this client.
    pub fn running_activities(&self) -> usize {
        self.shared.activities.len()
    }

    async fn call<M: RequestMessage>(&self, request: M) -> Result<M::Reply> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        Ok(self.shared.connection.request(request).await?.into_result()?)
    }

    async fn call_unbounded<M: RequestMessage>(&self, request: M) -> Result<M::Reply> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        Ok(self
            .shared
            .connection
            .request_unbounded(request)
            .await?
            .into_result()?)
    }

    // ========== Session ==========

    /// Pin the session's default namespace.
    ///
    /// Requests that leave the namespace out use it from then on.
    pub async fn use_namespace(&self, namespace: &str) -> Result<()> {
        self.call(ConnectRequest {
            namespace: Some(namespace.to_string()),
            identity: self.shared.config.identity.clone(),
        })
        .await?;
        Ok(())
    }

    /// Round trip to the proxy.
    pub async fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        self.call(PingRequest {}).await?;
        Ok(started.elapsed())
    }

    /// Close the session. Running workflows and activities are cancelled.
    pub async fn close(&self) {
        self.shared.connection.close();
        self.shared.teardown();
        if let Some(transport) = &self.shared.transport {
            transport.close().await;
        }
        info!(client_id = self.client_id(), "client closed");
    }

    /// Ask the proxy process to drain and exit, then close this session.
    pub async fn terminate_proxy(&self) -> Result<()> {
        let result = self.call(TerminateRequest {}).await;
        self.close().await;
        result.map(|_| ())
    }

    // ========== Namespaces ==========

    #[instrument(skip(self, registration), fields(namespace = %registration.name))]
    pub async fn register_namespace(&self, registration: NamespaceRegistration) -> Result<()> {
        self.call(NamespaceRegisterRequest {
            name: registration.name,
            description: registration.description,
            owner_email: registration.owner_email,
            retention_days: registration.retention_days,
        })
        .await?;
        Ok(())
    }

    pub async fn describe_namespace(&self, name: &str) -> Result<NamespaceInfo> {
        let reply = self
            .call(NamespaceDescribeRequest {
                name: name.to_string(),
            })
            .await?;
        Ok(NamespaceInfo {
            name: reply.name,
            description: reply.description,
            owner_email: reply.owner_email,
            status: reply.status,
            retention_days: reply.retention_days,
        })
    }

    pub async fn update_namespace(&self, name: &str, changes: NamespaceChanges) -> Result<()> {
        self.call(NamespaceUpdateRequest {
            name: name.to_string(),
            description: changes.description,
            owner_email: changes.owner_email,
            retention_days: changes.retention_days,
        })
        .await?;
        Ok(())
    }

    pub async fn list_namespaces(&self) -> Result<Vec<NamespaceInfo>> {
        Ok(self.call(NamespaceListRequest {}).await?.namespaces.0)
    }

    // ========== Registration and workers ==========

    /// Register a workflow function under `name`.
    ///
    /// The proxy only dispatches types that were registered on the session
    /// running the worker.
    pub async fn register_workflow<A, R, F, Fut>(&self, name: &str, f: F) -> Result<()>
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(WorkflowContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, ProxyError>> + Send + 'static,
    {
        if self.shared.types.register_workflow(name, workflow_fn(f)) {
            debug!(workflow_type = name, "workflow registration replaced");
        }
        self.call(WorkflowRegisterRequest {
            workflow_type: name.to_string(),
        })
        .await?;
        Ok(())
    }

    /// Register an activity function under `name`.
    pub async fn register_activity<A, R, F, Fut>(&self, name: &str, f: F) -> Result<()>
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(ActivityContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, ProxyError>> + Send + 'static,
    {
        if self.shared.types.register_activity(name, activity_fn(f)) {
            debug!(activity_type = name, "activity registration replaced");
        }
        self.call(ActivityRegisterRequest {
            activity_type: name.to_string(),
        })
        .await?;
        Ok(())
    }

    /// Lease a worker polling `task_queue` for tasks of `kind`.
    ///
    /// Leases on the same `(namespace, task_queue, kind)` share one worker.
    #[instrument(skip(self), fields(client_id = self.client_id()))]
    pub async fn new_worker(
        &self,
        namespace: Option<&str>,
        task_queue: &str,
        kind: WorkerKind,
    ) -> Result<WorkerLease> {
        let reply = self
            .call(NewWorkerRequest {
                namespace: namespace.unwrap_or_default().to_string(),
                task_queue: task_queue.to_string(),
                worker_kind: kind,
            })
            .await?;
        Ok(WorkerLease {
            worker_id: reply.worker_id,
            ref_count: reply.ref_count,
        })
    }

    /// Release one lease. Returns the leases left on the worker.
    pub async fn stop_worker(&self, worker_id: u64) -> Result<u32> {
        Ok(self.call(StopWorkerRequest { worker_id }).await?.ref_count)
    }

    // ========== Workflows ==========

    #[instrument(skip(self, options, args), fields(task_queue = %options.task_queue))]
    pub async fn start_workflow<A: Serialize + ?Sized>(
        &self,
        options: StartWorkflowOptions,
        workflow_type: &str,
        args: &A,
    ) -> Result<WorkflowExecution> {
        let namespace = options.namespace.clone();
        let reply = self
            .call(WorkflowExecuteRequest {
                namespace: options.namespace,
                workflow_id: options.workflow_id,
                workflow_type: workflow_type.to_string(),
                task_queue: options.task_queue,
                args: encode(args)?,
                execution_timeout_ms: options.execution_timeout.map(|t| t.as_millis() as u64),
            })
            .await?;
        debug!(workflow_id = %reply.workflow_id, run_id = %reply.run_id, "workflow started");
        Ok(WorkflowExecution {
            namespace,
            workflow_id: reply.workflow_id,
            run_id: Some(reply.run_id),
        })
    }

    /// Wait for a workflow to close and return its result.
    pub async fn workflow_result<R: DeserializeOwned>(&self, execution: &WorkflowExecution) -> Result<R> {
        let reply = self
            .call_unbounded(WorkflowGetResultRequest {
                namespace: execution.namespace.clone(),
                workflow_id: execution.workflow_id.clone(),
                run_id: execution.run_id.clone(),
            })
            .await?;
        decode(&reply.result)
    }

    /// Start a workflow and wait for its result.
    pub async fn execute_workflow<A, R>(
        &self,
        options: StartWorkflowOptions,
        workflow_type: &str,
        args: &A,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let execution = self.start_workflow(options, workflow_type, args).await?;
        self.workflow_result(&execution).await
    }

    pub async fn signal_workflow<A: Serialize + ?Sized>(
        &self,
        execution: &WorkflowExecution,
        signal_name: &str,
        args: &A,
    ) -> Result<()> {
        self.call(WorkflowSignalRequest {
            namespace: execution.namespace.clone(),
            workflow_id: execution.workflow_id.clone(),
            run_id: execution.run_id.clone(),
            signal_name: signal_name.to_string(),
            args: encode(args)?,
        })
        .await?;
        Ok(())
    }

    /// Ask a running workflow a question answered by its query handler.
    pub async fn query_workflow<A, R>(
        &self,
        execution: &WorkflowExecution,
        query_name: &str,
        args: &A,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let reply = self
            .call(WorkflowQueryRequest {
                namespace: execution.namespace.clone(),
                workflow_id: execution.workflow_id.clone(),
                run_id: execution.run_id.clone(),
                query_name: query_name.to_string(),
                args: encode(args)?,
            })
            .await?;
        decode(&reply.result)
    }

    pub async fn cancel_workflow(&self, execution: &WorkflowExecution) -> Result<()> {
        self.call(WorkflowCancelRequest {
            namespace: execution.namespace.clone(),
            workflow_id: execution.workflow_id.clone(),
            run_id: execution.run_id.clone(),
        })
        .await?;
        Ok(())
    }

    pub async fn terminate_workflow(
        &self,
        execution: &WorkflowExecution,
        reason: Option<&str>,
    ) -> Result<()> {
        self.call(WorkflowTerminateRequest {
            namespace: execution.namespace.clone(),
            workflow_id: execution.workflow_id.clone(),
            run_id: execution.run_id.clone(),
            reason: reason.map(str::to_string),
        })
        .await?;
        Ok(())
    }

    pub async fn describe_workflow(&self, execution: &WorkflowExecution) -> Result<WorkflowDescription> {
        let reply = self
            .call(WorkflowDescribeRequest {
                namespace: execution.namespace.clone(),
                workflow_id: execution.workflow_id.clone(),
                run_id: execution.run_id.clone(),
            })
            .await?;
        Ok(WorkflowDescription {
            workflow_type: reply.workflow_type,
            task_queue: reply.task_queue,
            run_id: reply.run_id,
            status: reply.status,
            history_length: reply.history_length,
            start_time: timestamp(reply.start_time_ms)?,
            close_time: reply.close_time_ms.map(timestamp).transpose()?,
        })
    }

    // ========== Activities ==========

    /// Complete an activity left open with [`ActivityContext::complete_later`].
    pub async fn complete_activity<R: Serialize + ?Sized>(
        &self,
        task_token: &str,
        result: &R,
    ) -> Result<()> {
        self.call(ActivityCompleteRequest {
            task_token: task_token.to_string(),
            result: encode(result)?,
            failure: None,
        })
        .await?;
        Ok(())
    }

    /// Fail an activity left open with [`ActivityContext::complete_later`].
    pub async fn fail_activity(&self, task_token: &str, failure: ProxyError) -> Result<()> {
        self.call(ActivityCompleteRequest {
            task_token: task_token.to_string(),
            result: None,
            failure: Some(failure),
        })
        .await?;
        Ok(())
    }

    /// Heartbeat an activity by task token. Returns whether cancellation was requested.
    pub async fn record_activity_heartbeat<D: Serialize + ?Sized>(
        &self,
        task_token: &str,
        details: &D,
    ) -> Result<bool> {
        let reply = self
            .call(ActivityRecordHeartbeatRequest {
                task_token: task_token.to_string(),
                details: encode(details)?,
            })
            .await?;
        Ok(reply.cancel_requested)
    }
}

fn timestamp(unix_ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(unix_ms)
        .single()
        .ok_or_else(|| ClientError::Serialization(format!("timestamp {}ms is out of range", unix_ms)))
}

/// Send heartbeats until the session closes.
///
/// If no heartbeat succeeds for `deadline`, the proxy is considered gone:
/// the connection is closed, which tears down every context of the client.
async fn heartbeat_loop(
    connection: Connection,
    interval: Duration,
    deadline: Duration,
    request_timeout: Duration,
) {
    let timeout = request_timeout.min(deadline);
    let mut last_ok = Instant::now();
    debug!(interval_ms = interval.as_millis() as u64, "heartbeat task started");

    loop {
        tokio::select! {
            biased;

            _ = connection.closed() => {
                debug!("heartbeat task stopped");
                break;
            }

            _ = tokio::time::sleep(interval) => {
                let result = connection
                    .request_with_timeout(HeartbeatRequest {}, timeout)
                    .await
                    .map_err(ClientError::from)
                    .and_then(|reply| reply.into_result().map_err(ClientError::from));
                match result {
                    Ok(_) => last_ok = Instant::now(),
                    Err(e) if last_ok.elapsed() >= deadline => {
                        error!(error = %e, deadline_ms = deadline.as_millis() as u64, "no heartbeat reply within deadline, closing session");
                        connection.close();
                        break;
                    }
                    Err(e) => warn!(error = %e, "heartbeat failed"),
                }
            }
        }
    }
}
