// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine module - the durable-execution backend behind the proxy.
//!
//! The proxy never decides what happens to an execution on its own; it asks
//! the [`Engine`]. Engines push work back to the proxy through a
//! [`TaskSink`] registered with every worker.

pub mod memory;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use weft_protocol::{Payload, ProxyError, WorkerKind};
use weft_protocol::messages::NamespaceInfo;

pub use memory::{MemoryEngine, MemoryEngineConfig};

/// Errors from engine operations.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Namespace is not registered.
    #[error("namespace '{0}' not found")]
    NamespaceNotFound(String),

    /// Namespace is already registered.
    #[error("namespace '{0}' already exists")]
    NamespaceAlreadyExists(String),

    /// No execution with this workflow ID (and run ID, if given).
    #[error("workflow '{workflow_id}' not found in namespace '{namespace}'")]
    WorkflowNotFound {
        /// Namespace searched.
        namespace: String,
        /// Workflow ID searched.
        workflow_id: String,
    },

    /// An open execution already uses this workflow ID.
    #[error("workflow '{workflow_id}' is already running in namespace '{namespace}'")]
    WorkflowAlreadyStarted {
        /// Namespace of the running execution.
        namespace: String,
        /// The conflicting workflow ID.
        workflow_id: String,
    },

    /// The execution is closed.
    #[error("workflow '{0}' is not running")]
    WorkflowNotRunning(String),

    /// No activity is running with this task token.
    #[error("activity with task token '{0}' not found")]
    ActivityNotFound(String),

    /// No worker with this handle.
    #[error("worker {0} not found")]
    WorkerNotFound(u64),

    /// A query could not be answered.
    #[error("query failed: {0}")]
    QueryFailed(ProxyError),

    /// Input rejected by the engine.
    #[error("invalid {field}: {message}")]
    Invalid {
        /// The offending field.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

// ============================================================================
// Namespaces
// ============================================================================

/// Namespace registration.
#[derive(Debug, Clone, Default)]
pub struct NamespaceSpec {
    pub name: String,
    pub description: String,
    pub owner_email: String,
    pub retention_days: u32,
}

/// Partial namespace update; `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct NamespaceUpdate {
    pub description: Option<String>,
    pub owner_email: Option<String>,
    pub retention_days: Option<u32>,
}

// ============================================================================
// Executions and history
// ============================================================================

/// Identifies one run of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutionRef {
    pub namespace: String,
    pub workflow_id: String,
    pub run_id: String,
}

impl fmt::Display for ExecutionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.workflow_id, self.run_id)
    }
}

/// Names an execution from the client API; the run ID defaults to the latest run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowSelector {
    pub namespace: String,
    pub workflow_id: String,
    pub run_id: Option<String>,
}

/// Request to start a workflow execution.
#[derive(Debug, Clone, Default)]
pub struct StartWorkflow {
    pub namespace: String,
    /// Generated when absent
    pub workflow_id: Option<String>,
    pub workflow_type: String,
    pub task_queue: String,
    pub args: Payload,
    pub execution_timeout: Option<Duration>,
}

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    Terminated,
    TimedOut,
}

impl WorkflowStatus {
    pub fn is_closed(self) -> bool {
        self != WorkflowStatus::Running
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowStatus::Running => "Running",
            WorkflowStatus::Completed => "Completed",
            WorkflowStatus::Failed => "Failed",
            WorkflowStatus::Cancelled => "Cancelled",
            WorkflowStatus::Terminated => "Terminated",
            WorkflowStatus::TimedOut => "TimedOut",
        };
        f.write_str(name)
    }
}

/// Snapshot returned by `describe_workflow`.
#[derive(Debug, Clone)]
pub struct WorkflowDescription {
    pub execution: ExecutionRef,
    pub workflow_type: String,
    pub task_queue: String,
    pub status: WorkflowStatus,
    pub history_length: u64,
    pub start_time: DateTime<Utc>,
    pub close_time: Option<DateTime<Utc>>,
}

/// A non-deterministic call made by workflow code, identified by kind and key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Activity { activity_type: String },
    Timer,
    SideEffect,
    MutableSideEffect { mutable_id: String },
    Version { change_id: String },
    ChildWorkflow { workflow_type: String },
    Signal { signal_name: String },
    Time,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Activity { activity_type } => write!(f, "activity '{}'", activity_type),
            Decision::Timer => f.write_str("timer"),
            Decision::SideEffect => f.write_str("side effect"),
            Decision::MutableSideEffect { mutable_id } => {
                write!(f, "mutable side effect '{}'", mutable_id)
            }
            Decision::Version { change_id } => write!(f, "version marker '{}'", change_id),
            Decision::ChildWorkflow { workflow_type } => {
                write!(f, "child workflow '{}'", workflow_type)
            }
            Decision::Signal { signal_name } => write!(f, "signal '{}'", signal_name),
            Decision::Time => f.write_str("time"),
        }
    }
}

/// Recorded result of a decision.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Value(Payload),
    Failed(ProxyError),
    Version(i32),
    Time(i64),
    Child {
        workflow_id: String,
        run_id: String,
        result: Payload,
    },
    TimerFired,
}

/// One history entry, keyed by the decision sequence number.
///
/// An event without an outcome was scheduled but never completed.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEvent {
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
    pub decision: Decision,
    pub outcome: Option<Outcome>,
}

impl HistoryEvent {
    pub fn scheduled(seq: u64, decision: Decision) -> Self {
        Self {
            seq,
            recorded_at: Utc::now(),
            decision,
            outcome: None,
        }
    }

    pub fn completed(seq: u64, decision: Decision, outcome: Outcome) -> Self {
        Self {
            seq,
            recorded_at: Utc::now(),
            decision,
            outcome: Some(outcome),
        }
    }
}

/// Request to run an activity on behalf of a workflow.
#[derive(Debug, Clone)]
pub struct ActivityRequest {
    pub execution: ExecutionRef,
    pub activity_type: String,
    pub task_queue: String,
    pub args: Payload,
    pub start_to_close_timeout: Option<Duration>,
    /// Fired when the calling workflow no longer wants the result
    pub cancel: CancellationToken,
}

// ============================================================================
// Workers and tasks
// ============================================================================

/// Identity of a worker registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerSpec {
    pub namespace: String,
    pub task_queue: String,
    pub kind: WorkerKind,
}

/// Engine-side handle for a started worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerHandle {
    pub id: u64,
}

/// Workflow task pushed to a worker.
#[derive(Debug, Clone)]
pub struct WorkflowTask {
    pub execution: ExecutionRef,
    pub workflow_type: String,
    pub task_queue: String,
    pub args: Payload,
    /// History was non-empty when the task was dispatched
    pub replaying: bool,
    /// Highest sequence number recorded before the task was dispatched
    pub replay_horizon: u64,
    pub attempt: u32,
    pub cancel: CancellationToken,
}

/// Activity task pushed to a worker.
#[derive(Debug, Clone)]
pub struct ActivityTask {
    pub execution: ExecutionRef,
    pub activity_type: String,
    pub task_queue: String,
    pub task_token: String,
    pub args: Payload,
    pub attempt: u32,
    pub cancel: CancellationToken,
}

/// Query against a running workflow.
#[derive(Debug, Clone)]
pub struct QueryTask {
    pub execution: ExecutionRef,
    pub query_name: String,
    pub args: Payload,
}

/// How an activity task ended on the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityOutcome {
    Completed(Payload),
    /// Completion arrives later through `complete_activity`
    Pending,
}

/// Why a pushed task did not produce a result.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The task ran and failed; the failure belongs to the execution.
    #[error("{0}")]
    Failed(ProxyError),

    /// The worker is gone; the engine may dispatch the task elsewhere.
    #[error("worker unavailable: {0}")]
    WorkerUnavailable(String),
}

/// Receives work the engine pushes to a worker.
#[async_trait]
pub trait TaskSink: Send + Sync + 'static {
    async fn run_workflow(&self, task: WorkflowTask) -> std::result::Result<Payload, TaskError>;

    async fn run_activity(
        &self,
        task: ActivityTask,
    ) -> std::result::Result<ActivityOutcome, TaskError>;

    async fn query(&self, task: QueryTask) -> std::result::Result<Payload, TaskError>;
}

// ============================================================================
// Engine trait
// ============================================================================

/// Durable-execution backend.
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    // ========== Namespaces ==========

    async fn register_namespace(&self, spec: NamespaceSpec) -> Result<()>;

    async fn describe_namespace(&self, name: &str) -> Result<NamespaceInfo>;

    async fn update_namespace(&self, name: &str, update: NamespaceUpdate) -> Result<()>;

    async fn list_namespaces(&self) -> Result<Vec<NamespaceInfo>>;

    // ========== Workflow client API ==========

    async fn start_workflow(&self, request: StartWorkflow) -> Result<ExecutionRef>;

    async fn signal_workflow(
        &self,
        selector: &WorkflowSelector,
        signal_name: &str,
        args: Payload,
    ) -> Result<()>;

    async fn query_workflow(
        &self,
        selector: &WorkflowSelector,
        query_name: &str,
        args: Payload,
    ) -> Result<Payload>;

    async fn cancel_workflow(&self, selector: &WorkflowSelector) -> Result<()>;

    async fn terminate_workflow(
        &self,
        selector: &WorkflowSelector,
        reason: Option<String>,
    ) -> Result<()>;

    /// Wait for the execution to close and return its result.
    ///
    /// The outer `Result` reports lookup failures; the inner one is the
    /// execution's own outcome.
    async fn get_workflow_result(
        &self,
        selector: &WorkflowSelector,
    ) -> Result<std::result::Result<Payload, ProxyError>>;

    async fn describe_workflow(&self, selector: &WorkflowSelector) -> Result<WorkflowDescription>;

    // ========== Activities ==========

    /// Returns whether cancellation of the activity has been requested.
    async fn record_activity_heartbeat(&self, task_token: &str, details: Payload) -> Result<bool>;

    async fn complete_activity(
        &self,
        task_token: &str,
        result: std::result::Result<Payload, ProxyError>,
    ) -> Result<()>;

    // ========== Workers ==========

    async fn new_worker(&self, spec: WorkerSpec, sink: Arc<dyn TaskSink>) -> Result<WorkerHandle>;

    async fn stop_worker(&self, handle: WorkerHandle) -> Result<()>;

    // ========== Decision surface ==========

    async fn history(&self, execution: &ExecutionRef) -> Result<Vec<HistoryEvent>>;

    /// Insert or replace the event with the same sequence number.
    async fn record_event(&self, execution: &ExecutionRef, event: HistoryEvent) -> Result<()>;

    /// Run an activity to completion; the inner result is the activity's outcome.
    async fn execute_activity(
        &self,
        request: ActivityRequest,
    ) -> Result<std::result::Result<Payload, ProxyError>>;

    async fn wait_for_signal(
        &self,
        execution: &ExecutionRef,
        signal_name: &str,
        cancel: CancellationToken,
    ) -> Result<Option<Payload>>;
}
