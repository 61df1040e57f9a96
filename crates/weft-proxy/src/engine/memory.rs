// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory engine.
//!
//! Keeps namespaces, executions and workers in process memory. Nothing
//! survives a restart. Workflow tasks are re-dispatched when the worker
//! running them disappears, which makes the next run a replay of the
//! recorded history.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use weft_protocol::messages::NamespaceInfo;
use weft_protocol::{ErrorKind, Payload, ProxyError, WorkerKind};

use super::*;

/// Status reported for every registered namespace.
const NAMESPACE_STATUS: &str = "Registered";

/// Tunables for [`MemoryEngine`].
#[derive(Debug, Clone)]
pub struct MemoryEngineConfig {
    /// How long a task waits for a worker on its task queue
    pub worker_wait: Duration,
    /// Pause before re-dispatching a task whose worker was lost
    pub redispatch_backoff: Duration,
    /// How long a timed-out activity gets to observe its cancellation
    pub stop_grace: Duration,
}

impl Default for MemoryEngineConfig {
    fn default() -> Self {
        Self {
            worker_wait: Duration::from_secs(60),
            redispatch_backoff: Duration::from_millis(50),
            stop_grace: Duration::from_secs(5),
        }
    }
}

type ExecutionResult = std::result::Result<Payload, ProxyError>;

struct ExecutionState {
    status: WorkflowStatus,
    close_time: Option<DateTime<Utc>>,
    history: BTreeMap<u64, HistoryEvent>,
    signals: HashMap<String, VecDeque<Payload>>,
    /// Worker currently running the workflow task, used for queries
    sink: Option<Arc<dyn TaskSink>>,
}

struct Execution {
    execution: ExecutionRef,
    workflow_type: String,
    task_queue: String,
    args: Payload,
    execution_timeout: Option<Duration>,
    start_time: DateTime<Utc>,
    state: Mutex<ExecutionState>,
    signal_arrived: Notify,
    result: watch::Sender<Option<ExecutionResult>>,
    cancel: CancellationToken,
}

impl Execution {
    /// Close the execution. Only the first close takes effect.
    fn close(&self, status: WorkflowStatus, result: ExecutionResult) -> bool {
        {
            let mut state = self.state.lock();
            if state.status.is_closed() {
                return false;
            }
            state.status = status;
            state.close_time = Some(Utc::now());
            state.sink = None;
        }
        info!(execution = %self.execution, %status, "workflow closed");
        self.result.send_replace(Some(result));
        self.cancel.cancel();
        true
    }

    fn status(&self) -> WorkflowStatus {
        self.state.lock().status
    }

    fn ensure_running(&self) -> Result<()> {
        if self.status().is_closed() {
            return Err(EngineError::WorkflowNotRunning(
                self.execution.workflow_id.clone(),
            ));
        }
        Ok(())
    }
}

struct WorkerEntry {
    spec: WorkerSpec,
    sink: Arc<dyn TaskSink>,
}

#[derive(Default)]
struct WorkerTable {
    entries: HashMap<u64, WorkerEntry>,
    by_spec: HashMap<WorkerSpec, Vec<u64>>,
    cursor: HashMap<WorkerSpec, usize>,
}

impl WorkerTable {
    fn insert(&mut self, id: u64, spec: WorkerSpec, sink: Arc<dyn TaskSink>) {
        self.by_spec.entry(spec.clone()).or_default().push(id);
        self.entries.insert(id, WorkerEntry { spec, sink });
    }

    fn remove(&mut self, id: u64) -> bool {
        let Some(entry) = self.entries.remove(&id) else {
            return false;
        };
        if let Some(ids) = self.by_spec.get_mut(&entry.spec) {
            ids.retain(|other| *other != id);
        }
        true
    }

    /// Round-robin over the workers registered for `spec`.
    fn pick(&mut self, spec: &WorkerSpec) -> Option<(u64, Arc<dyn TaskSink>)> {
        let ids = self.by_spec.get(spec)?;
        if ids.is_empty() {
            return None;
        }
        let cursor = self.cursor.entry(spec.clone()).or_default();
        let id = ids[*cursor % ids.len()];
        *cursor = cursor.wrapping_add(1);
        self.entries.get(&id).map(|entry| (id, entry.sink.clone()))
    }
}

struct RunningActivity {
    cancel: CancellationToken,
    completion: Mutex<Option<oneshot::Sender<ExecutionResult>>>,
    details: Mutex<Payload>,
}

/// Keeps a task token in the activity table while its decision is alive.
///
/// Dropping it removes the token. If the activity never finished (the
/// decision future was dropped) it is also cancelled.
struct ActivityEntry<'a> {
    activities: &'a Mutex<HashMap<String, Arc<RunningActivity>>>,
    task_token: String,
    running: Arc<RunningActivity>,
    finished: bool,
}

impl<'a> ActivityEntry<'a> {
    fn insert(
        activities: &'a Mutex<HashMap<String, Arc<RunningActivity>>>,
        task_token: String,
        running: Arc<RunningActivity>,
    ) -> Self {
        activities.lock().insert(task_token.clone(), running.clone());
        Self {
            activities,
            task_token,
            running,
            finished: false,
        }
    }
}

impl Drop for ActivityEntry<'_> {
    fn drop(&mut self) {
        self.activities.lock().remove(&self.task_token);
        if !self.finished {
            debug!(task_token = %self.task_token, "activity abandoned, cancelling");
            self.running.cancel.cancel();
        }
    }
}

struct Inner {
    config: MemoryEngineConfig,
    namespaces: RwLock<BTreeMap<String, NamespaceInfo>>,
    executions: RwLock<HashMap<(String, String), Arc<Execution>>>,
    workers: Mutex<WorkerTable>,
    worker_added: Notify,
    activities: Mutex<HashMap<String, Arc<RunningActivity>>>,
    next_worker_id: AtomicU64,
}

/// In-memory engine for development and tests.
#[derive(Clone)]
pub struct MemoryEngine {
    inner: Arc<Inner>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::with_config(MemoryEngineConfig::default())
    }

    pub fn with_config(config: MemoryEngineConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                namespaces: RwLock::new(BTreeMap::new()),
                executions: RwLock::new(HashMap::new()),
                workers: Mutex::new(WorkerTable::default()),
                worker_added: Notify::new(),
                activities: Mutex::new(HashMap::new()),
                next_worker_id: AtomicU64::new(1),
            }),
        }
    }

    /// Number of registered workers.
    pub fn worker_count(&self) -> usize {
        self.inner.workers.lock().entries.len()
    }

    /// Number of activities currently running or awaiting completion.
    pub fn running_activities(&self) -> usize {
        self.inner.activities.lock().len()
    }
}

impl Inner {
    fn find(&self, selector: &WorkflowSelector) -> Result<Arc<Execution>> {
        let execution = self
            .executions
            .read()
            .get(&(selector.namespace.clone(), selector.workflow_id.clone()))
            .cloned();
        match execution {
            Some(execution)
                if selector
                    .run_id
                    .as_ref()
                    .is_none_or(|run_id| *run_id == execution.execution.run_id) =>
            {
                Ok(execution)
            }
            _ => Err(EngineError::WorkflowNotFound {
                namespace: selector.namespace.clone(),
                workflow_id: selector.workflow_id.clone(),
            }),
        }
    }

    fn find_ref(&self, execution: &ExecutionRef) -> Result<Arc<Execution>> {
        self.find(&WorkflowSelector {
            namespace: execution.namespace.clone(),
            workflow_id: execution.workflow_id.clone(),
            run_id: Some(execution.run_id.clone()),
        })
    }

    fn ensure_namespace(&self, name: &str) -> Result<()> {
        if self.namespaces.read().contains_key(name) {
            Ok(())
        } else {
            Err(EngineError::NamespaceNotFound(name.to_string()))
        }
    }

    fn remove_worker(&self, id: u64) -> bool {
        self.workers.lock().remove(id)
    }

    /// Wait up to `worker_wait` for a worker registered for `spec`.
    async fn wait_for_worker(&self, spec: &WorkerSpec) -> Option<(u64, Arc<dyn TaskSink>)> {
        let deadline = Instant::now() + self.config.worker_wait;
        loop {
            let notified = self.worker_added.notified();
            if let Some(worker) = self.workers.lock().pick(spec) {
                return Some(worker);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Drive a workflow execution until it closes.
    async fn drive_workflow(self: Arc<Self>, execution: Arc<Execution>) {
        let attempts = self.clone().run_workflow_attempts(execution.clone());
        match execution.execution_timeout {
            Some(timeout) => {
                if tokio::time::timeout(timeout, attempts).await.is_err() {
                    execution.close(
                        WorkflowStatus::TimedOut,
                        Err(ProxyError::timeout(format!(
                            "workflow execution timed out after {}ms",
                            timeout.as_millis()
                        ))),
                    );
                }
            }
            None => attempts.await,
        }
    }

    async fn run_workflow_attempts(self: Arc<Self>, execution: Arc<Execution>) {
        let spec = WorkerSpec {
            namespace: execution.execution.namespace.clone(),
            task_queue: execution.task_queue.clone(),
            kind: WorkerKind::Workflow,
        };
        let mut attempt = 0;

        loop {
            attempt += 1;
            let worker = tokio::select! {
                worker = self.wait_for_worker(&spec) => worker,
                _ = execution.cancel.cancelled() => return,
            };
            let Some((worker_id, sink)) = worker else {
                execution.close(
                    WorkflowStatus::Failed,
                    Err(ProxyError::timeout(format!(
                        "no workflow worker available on task queue '{}'",
                        spec.task_queue
                    ))),
                );
                return;
            };

            let replay_horizon = {
                let mut state = execution.state.lock();
                state.sink = Some(sink.clone());
                state.history.keys().next_back().copied().unwrap_or(0)
            };
            let replaying = replay_horizon > 0;
            debug!(execution = %execution.execution, worker_id, attempt, replaying, "dispatching workflow task");

            let task = WorkflowTask {
                execution: execution.execution.clone(),
                workflow_type: execution.workflow_type.clone(),
                task_queue: execution.task_queue.clone(),
                args: execution.args.clone(),
                replaying,
                replay_horizon,
                attempt,
                cancel: execution.cancel.child_token(),
            };
            let result = tokio::select! {
                result = sink.run_workflow(task) => result,
                _ = execution.cancel.cancelled() => return,
            };

            match result {
                Ok(payload) => {
                    execution.close(WorkflowStatus::Completed, Ok(payload));
                    return;
                }
                Err(TaskError::Failed(err)) => {
                    let status = match err.kind {
                        ErrorKind::Cancelled => WorkflowStatus::Cancelled,
                        ErrorKind::Terminated => WorkflowStatus::Terminated,
                        _ => WorkflowStatus::Failed,
                    };
                    execution.close(status, Err(err));
                    return;
                }
                Err(TaskError::WorkerUnavailable(reason)) => {
                    warn!(execution = %execution.execution, worker_id, %reason, "workflow worker lost, re-dispatching");
                    self.remove_worker(worker_id);
                    execution.state.lock().sink = None;
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.redispatch_backoff) => {}
                        _ = execution.cancel.cancelled() => return,
                    }
                }
            }
        }
    }

    async fn run_activity_attempts(
        &self,
        request: &ActivityRequest,
        task_token: &str,
        running: &RunningActivity,
    ) -> ExecutionResult {
        let spec = WorkerSpec {
            namespace: request.execution.namespace.clone(),
            task_queue: request.task_queue.clone(),
            kind: WorkerKind::Activity,
        };
        let cancelled = || ProxyError::cancelled(format!("activity '{}' cancelled", request.activity_type));
        let mut attempt = 0;

        loop {
            attempt += 1;
            let worker = tokio::select! {
                worker = self.wait_for_worker(&spec) => worker,
                _ = running.cancel.cancelled() => return Err(cancelled()),
            };
            let Some((worker_id, sink)) = worker else {
                return Err(ProxyError::timeout(format!(
                    "no activity worker available on task queue '{}'",
                    spec.task_queue
                )));
            };

            let (complete, completed) = oneshot::channel();
            *running.completion.lock() = Some(complete);

            let task = ActivityTask {
                execution: request.execution.clone(),
                activity_type: request.activity_type.clone(),
                task_queue: request.task_queue.clone(),
                task_token: task_token.to_string(),
                args: request.args.clone(),
                attempt,
                cancel: running.cancel.clone(),
            };

            match sink.run_activity(task).await {
                Ok(ActivityOutcome::Completed(payload)) => return Ok(payload),
                Ok(ActivityOutcome::Pending) => {
                    debug!(task_token, "activity completes asynchronously");
                    return tokio::select! {
                        result = completed => result.unwrap_or_else(|_| {
                            Err(ProxyError::generic("activity completion was dropped"))
                        }),
                        _ = running.cancel.cancelled() => Err(cancelled()),
                    };
                }
                Err(TaskError::Failed(err)) => return Err(err),
                Err(TaskError::WorkerUnavailable(reason)) => {
                    warn!(task_token, worker_id, %reason, "activity worker lost, re-dispatching");
                    self.remove_worker(worker_id);
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.redispatch_backoff) => {}
                        _ = running.cancel.cancelled() => return Err(cancelled()),
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Engine for MemoryEngine {
    // ========== Namespaces ==========

    #[instrument(skip(self, spec), fields(namespace = %spec.name))]
    async fn register_namespace(&self, spec: NamespaceSpec) -> Result<()> {
        if spec.name.is_empty() {
            return Err(EngineError::Invalid {
                field: "name",
                message: "namespace name is required".to_string(),
            });
        }
        let mut namespaces = self.inner.namespaces.write();
        if namespaces.contains_key(&spec.name) {
            return Err(EngineError::NamespaceAlreadyExists(spec.name));
        }
        namespaces.insert(
            spec.name.clone(),
            NamespaceInfo {
                name: spec.name,
                description: spec.description,
                owner_email: spec.owner_email,
                status: NAMESPACE_STATUS.to_string(),
                retention_days: spec.retention_days,
            },
        );
        info!("namespace registered");
        Ok(())
    }

    async fn describe_namespace(&self, name: &str) -> Result<NamespaceInfo> {
        self.inner
            .namespaces
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::NamespaceNotFound(name.to_string()))
    }

    async fn update_namespace(&self, name: &str, update: NamespaceUpdate) -> Result<()> {
        let mut namespaces = self.inner.namespaces.write();
        let info = namespaces
            .get_mut(name)
            .ok_or_else(|| EngineError::NamespaceNotFound(name.to_string()))?;
        if let Some(description) = update.description {
            info.description = description;
        }
        if let Some(owner_email) = update.owner_email {
            info.owner_email = owner_email;
        }
        if let Some(retention_days) = update.retention_days {
            info.retention_days = retention_days;
        }
        Ok(())
    }

    async fn list_namespaces(&self) -> Result<Vec<NamespaceInfo>> {
        Ok(self.inner.namespaces.read().values().cloned().collect())
    }

    // ========== Workflow client API ==========

    #[instrument(skip(self, request), fields(namespace = %request.namespace, workflow_type = %request.workflow_type))]
    async fn start_workflow(&self, request: StartWorkflow) -> Result<ExecutionRef> {
        self.inner.ensure_namespace(&request.namespace)?;
        if request.workflow_type.is_empty() {
            return Err(EngineError::Invalid {
                field: "workflow_type",
                message: "workflow type is required".to_string(),
            });
        }
        if request.task_queue.is_empty() {
            return Err(EngineError::Invalid {
                field: "task_queue",
                message: "task queue is required".to_string(),
            });
        }

        let workflow_id = request
            .workflow_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let execution_ref = ExecutionRef {
            namespace: request.namespace.clone(),
            workflow_id: workflow_id.clone(),
            run_id: Uuid::new_v4().to_string(),
        };

        let (result, _) = watch::channel(None);
        let execution = Arc::new(Execution {
            execution: execution_ref.clone(),
            workflow_type: request.workflow_type,
            task_queue: request.task_queue,
            args: request.args,
            execution_timeout: request.execution_timeout,
            start_time: Utc::now(),
            state: Mutex::new(ExecutionState {
                status: WorkflowStatus::Running,
                close_time: None,
                history: BTreeMap::new(),
                signals: HashMap::new(),
                sink: None,
            }),
            signal_arrived: Notify::new(),
            result,
            cancel: CancellationToken::new(),
        });

        {
            let mut executions = self.inner.executions.write();
            let key = (request.namespace.clone(), workflow_id.clone());
            if let Some(existing) = executions.get(&key)
                && !existing.status().is_closed()
            {
                return Err(EngineError::WorkflowAlreadyStarted {
                    namespace: request.namespace,
                    workflow_id,
                });
            }
            executions.insert(key, execution.clone());
        }

        info!(workflow_id = %execution_ref.workflow_id, run_id = %execution_ref.run_id, "workflow started");
        tokio::spawn(self.inner.clone().drive_workflow(execution));
        Ok(execution_ref)
    }

    async fn signal_workflow(
        &self,
        selector: &WorkflowSelector,
        signal_name: &str,
        args: Payload,
    ) -> Result<()> {
        let execution = self.inner.find(selector)?;
        {
            let mut state = execution.state.lock();
            if state.status.is_closed() {
                return Err(EngineError::WorkflowNotRunning(selector.workflow_id.clone()));
            }
            state
                .signals
                .entry(signal_name.to_string())
                .or_default()
                .push_back(args);
        }
        debug!(execution = %execution.execution, signal_name, "signal delivered");
        execution.signal_arrived.notify_waiters();
        Ok(())
    }

    async fn query_workflow(
        &self,
        selector: &WorkflowSelector,
        query_name: &str,
        args: Payload,
    ) -> Result<Payload> {
        let execution = self.inner.find(selector)?;
        execution.ensure_running()?;
        let sink = execution.state.lock().sink.clone().ok_or_else(|| {
            EngineError::QueryFailed(ProxyError::generic(format!(
                "workflow '{}' has no active worker",
                selector.workflow_id
            )))
        })?;

        let task = QueryTask {
            execution: execution.execution.clone(),
            query_name: query_name.to_string(),
            args,
        };
        sink.query(task).await.map_err(|err| match err {
            TaskError::Failed(err) => EngineError::QueryFailed(err),
            TaskError::WorkerUnavailable(reason) => {
                EngineError::QueryFailed(ProxyError::generic(reason))
            }
        })
    }

    async fn cancel_workflow(&self, selector: &WorkflowSelector) -> Result<()> {
        let execution = self.inner.find(selector)?;
        if !execution.close(
            WorkflowStatus::Cancelled,
            Err(ProxyError::cancelled("workflow cancelled")),
        ) {
            return Err(EngineError::WorkflowNotRunning(selector.workflow_id.clone()));
        }
        Ok(())
    }

    async fn terminate_workflow(
        &self,
        selector: &WorkflowSelector,
        reason: Option<String>,
    ) -> Result<()> {
        let execution = self.inner.find(selector)?;
        let mut err = ProxyError::terminated("workflow terminated");
        if let Some(reason) = reason {
            err = err.with_details(reason);
        }
        if !execution.close(WorkflowStatus::Terminated, Err(err)) {
            return Err(EngineError::WorkflowNotRunning(selector.workflow_id.clone()));
        }
        Ok(())
    }

    async fn get_workflow_result(
        &self,
        selector: &WorkflowSelector,
    ) -> Result<ExecutionResult> {
        let execution = self.inner.find(selector)?;
        let mut receiver = execution.result.subscribe();
        let result = receiver
            .wait_for(|result| result.is_some())
            .await
            .map_err(|_| EngineError::WorkflowNotRunning(selector.workflow_id.clone()))?;
        Ok(result
            .clone()
            .unwrap_or_else(|| Err(ProxyError::generic("workflow closed without a result"))))
    }

    async fn describe_workflow(&self, selector: &WorkflowSelector) -> Result<WorkflowDescription> {
        let execution = self.inner.find(selector)?;
        let state = execution.state.lock();
        Ok(WorkflowDescription {
            execution: execution.execution.clone(),
            workflow_type: execution.workflow_type.clone(),
            task_queue: execution.task_queue.clone(),
            status: state.status,
            history_length: state.history.len() as u64,
            start_time: execution.start_time,
            close_time: state.close_time,
        })
    }

    // ========== Activities ==========

    async fn record_activity_heartbeat(&self, task_token: &str, details: Payload) -> Result<bool> {
        let running = self
            .inner
            .activities
            .lock()
            .get(task_token)
            .cloned()
            .ok_or_else(|| EngineError::ActivityNotFound(task_token.to_string()))?;
        *running.details.lock() = details;
        Ok(running.cancel.is_cancelled())
    }

    async fn complete_activity(&self, task_token: &str, result: ExecutionResult) -> Result<()> {
        let running = self
            .inner
            .activities
            .lock()
            .get(task_token)
            .cloned()
            .ok_or_else(|| EngineError::ActivityNotFound(task_token.to_string()))?;
        let complete = running
            .completion
            .lock()
            .take()
            .ok_or_else(|| EngineError::ActivityNotFound(task_token.to_string()))?;
        complete
            .send(result)
            .map_err(|_| EngineError::ActivityNotFound(task_token.to_string()))
    }

    // ========== Workers ==========

    #[instrument(skip(self, sink), fields(namespace = %spec.namespace, task_queue = %spec.task_queue, kind = %spec.kind))]
    async fn new_worker(&self, spec: WorkerSpec, sink: Arc<dyn TaskSink>) -> Result<WorkerHandle> {
        self.inner.ensure_namespace(&spec.namespace)?;
        if spec.task_queue.is_empty() {
            return Err(EngineError::Invalid {
                field: "task_queue",
                message: "task queue is required".to_string(),
            });
        }
        let id = self.inner.next_worker_id.fetch_add(1, Ordering::Relaxed);
        self.inner.workers.lock().insert(id, spec, sink);
        self.inner.worker_added.notify_waiters();
        info!(worker_id = id, "worker started");
        Ok(WorkerHandle { id })
    }

    async fn stop_worker(&self, handle: WorkerHandle) -> Result<()> {
        if !self.inner.remove_worker(handle.id) {
            return Err(EngineError::WorkerNotFound(handle.id));
        }
        info!(worker_id = handle.id, "worker stopped");
        Ok(())
    }

    // ========== Decision surface ==========

    async fn history(&self, execution: &ExecutionRef) -> Result<Vec<HistoryEvent>> {
        let execution = self.inner.find_ref(execution)?;
        let state = execution.state.lock();
        Ok(state.history.values().cloned().collect())
    }

    async fn record_event(&self, execution: &ExecutionRef, event: HistoryEvent) -> Result<()> {
        let execution = self.inner.find_ref(execution)?;
        let mut state = execution.state.lock();
        if state.status.is_closed() {
            return Err(EngineError::WorkflowNotRunning(
                execution.execution.workflow_id.clone(),
            ));
        }
        state.history.insert(event.seq, event);
        Ok(())
    }

    #[instrument(skip(self, request), fields(execution = %request.execution, activity_type = %request.activity_type))]
    async fn execute_activity(&self, request: ActivityRequest) -> Result<ExecutionResult> {
        self.inner.find_ref(&request.execution)?.ensure_running()?;

        let task_token = Uuid::new_v4().to_string();
        let running = Arc::new(RunningActivity {
            cancel: request.cancel.child_token(),
            completion: Mutex::new(None),
            details: Mutex::new(None),
        });
        let mut entry =
            ActivityEntry::insert(&self.inner.activities, task_token.clone(), running.clone());

        let attempts = self
            .inner
            .run_activity_attempts(&request, &task_token, &running);
        tokio::pin!(attempts);

        let deadline = request.start_to_close_timeout;
        let result = tokio::select! {
            result = &mut attempts => result,
            _ = sleep_for(deadline) => {
                running.cancel.cancel();
                // Let the worker observe the cancellation before giving up on it
                let _ = tokio::time::timeout(self.inner.config.stop_grace, &mut attempts).await;
                Err(ProxyError::timeout(format!(
                    "activity '{}' timed out after {}ms",
                    request.activity_type,
                    deadline.map(|d| d.as_millis()).unwrap_or_default()
                )))
            }
        };

        entry.finished = true;
        drop(entry);
        Ok(result)
    }

    async fn wait_for_signal(
        &self,
        execution: &ExecutionRef,
        signal_name: &str,
        cancel: CancellationToken,
    ) -> Result<Option<Payload>> {
        let execution = self.inner.find_ref(execution)?;
        loop {
            let notified = execution.signal_arrived.notified();
            if let Some(payload) = execution
                .state
                .lock()
                .signals
                .get_mut(signal_name)
                .and_then(VecDeque::pop_front)
            {
                return Ok(Some(payload));
            }
            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => return Ok(None),
                _ = execution.cancel.cancelled() => return Ok(None),
            }
        }
    }
}

async fn sleep_for(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::AtomicU32;

    /// Sink that echoes arguments back and records dispatched workflow tasks.
    #[derive(Default)]
    struct EchoSink {
        workflow_tasks: Mutex<Vec<WorkflowTask>>,
        activity_tasks: Mutex<Vec<ActivityTask>>,
        pending_activities: bool,
    }

    #[async_trait]
    impl TaskSink for EchoSink {
        async fn run_workflow(
            &self,
            task: WorkflowTask,
        ) -> std::result::Result<Payload, TaskError> {
            let args = task.args.clone();
            self.workflow_tasks.lock().push(task);
            Ok(args)
        }

        async fn run_activity(
            &self,
            task: ActivityTask,
        ) -> std::result::Result<ActivityOutcome, TaskError> {
            let args = task.args.clone();
            self.activity_tasks.lock().push(task);
            if self.pending_activities {
                Ok(ActivityOutcome::Pending)
            } else {
                Ok(ActivityOutcome::Completed(args))
            }
        }

        async fn query(&self, task: QueryTask) -> std::result::Result<Payload, TaskError> {
            Ok(Some(Bytes::from(task.query_name)))
        }
    }

    /// Sink whose workflow tasks never finish until cancelled.
    struct BlockingSink;

    #[async_trait]
    impl TaskSink for BlockingSink {
        async fn run_workflow(
            &self,
            task: WorkflowTask,
        ) -> std::result::Result<Payload, TaskError> {
            task.cancel.cancelled().await;
            Err(TaskError::Failed(ProxyError::cancelled("stopped")))
        }

        async fn run_activity(
            &self,
            task: ActivityTask,
        ) -> std::result::Result<ActivityOutcome, TaskError> {
            task.cancel.cancelled().await;
            Err(TaskError::Failed(ProxyError::cancelled("stopped")))
        }

        async fn query(&self, task: QueryTask) -> std::result::Result<Payload, TaskError> {
            Ok(Some(Bytes::from(task.query_name)))
        }
    }

    /// Sink that reports its worker as gone.
    #[derive(Default)]
    struct LostSink {
        calls: AtomicU32,
    }

    #[async_trait]
    impl TaskSink for LostSink {
        async fn run_workflow(&self, _: WorkflowTask) -> std::result::Result<Payload, TaskError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(TaskError::WorkerUnavailable("session closed".to_string()))
        }

        async fn run_activity(
            &self,
            _: ActivityTask,
        ) -> std::result::Result<ActivityOutcome, TaskError> {
            Err(TaskError::WorkerUnavailable("session closed".to_string()))
        }

        async fn query(&self, _: QueryTask) -> std::result::Result<Payload, TaskError> {
            Err(TaskError::WorkerUnavailable("session closed".to_string()))
        }
    }

    fn fast_engine() -> MemoryEngine {
        MemoryEngine::with_config(MemoryEngineConfig {
            worker_wait: Duration::from_millis(500),
            redispatch_backoff: Duration::from_millis(5),
            stop_grace: Duration::from_millis(100),
        })
    }

    async fn engine_with_namespace() -> MemoryEngine {
        let engine = fast_engine();
        engine
            .register_namespace(NamespaceSpec {
                name: "ns-A".to_string(),
                retention_days: 3,
                ..Default::default()
            })
            .await
            .unwrap();
        engine
    }

    fn spec(kind: WorkerKind) -> WorkerSpec {
        WorkerSpec {
            namespace: "ns-A".to_string(),
            task_queue: "tq-1".to_string(),
            kind,
        }
    }

    fn start(args: &'static [u8]) -> StartWorkflow {
        StartWorkflow {
            namespace: "ns-A".to_string(),
            workflow_id: Some("wf-1".to_string()),
            workflow_type: "greet".to_string(),
            task_queue: "tq-1".to_string(),
            args: Some(Bytes::from_static(args)),
            execution_timeout: None,
        }
    }

    fn selector(execution: &ExecutionRef) -> WorkflowSelector {
        WorkflowSelector {
            namespace: execution.namespace.clone(),
            workflow_id: execution.workflow_id.clone(),
            run_id: None,
        }
    }

    #[tokio::test]
    async fn test_namespace_lifecycle() {
        let engine = engine_with_namespace().await;

        let info = engine.describe_namespace("ns-A").await.unwrap();
        assert_eq!(info.status, "Registered");
        assert_eq!(info.retention_days, 3);

        assert!(matches!(
            engine
                .register_namespace(NamespaceSpec {
                    name: "ns-A".to_string(),
                    ..Default::default()
                })
                .await,
            Err(EngineError::NamespaceAlreadyExists(_))
        ));
        assert!(matches!(
            engine.describe_namespace("missing").await,
            Err(EngineError::NamespaceNotFound(_))
        ));

        engine
            .update_namespace(
                "ns-A",
                NamespaceUpdate {
                    description: Some("orders".to_string()),
                    retention_days: Some(7),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let listed = engine.list_namespaces().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].description, "orders");
        assert_eq!(listed[0].retention_days, 7);
    }

    #[tokio::test]
    async fn test_workflow_waits_for_worker() {
        let engine = engine_with_namespace().await;
        let execution = engine.start_workflow(start(b"\"world\"")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let sink = Arc::new(EchoSink::default());
        engine
            .new_worker(spec(WorkerKind::Workflow), sink.clone())
            .await
            .unwrap();

        let result = engine.get_workflow_result(&selector(&execution)).await.unwrap();
        assert_eq!(result.unwrap(), Some(Bytes::from_static(b"\"world\"")));

        let tasks = sink.workflow_tasks.lock();
        assert_eq!(tasks.len(), 1);
        assert!(!tasks[0].replaying);
        assert_eq!(tasks[0].attempt, 1);

        let description = engine.describe_workflow(&selector(&execution)).await.unwrap();
        assert_eq!(description.status, WorkflowStatus::Completed);
        assert!(description.close_time.is_some());
    }

    #[tokio::test]
    async fn test_no_worker_fails_with_timeout() {
        let engine = MemoryEngine::with_config(MemoryEngineConfig {
            worker_wait: Duration::from_millis(20),
            ..Default::default()
        });
        engine
            .register_namespace(NamespaceSpec {
                name: "ns-A".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let execution = engine.start_workflow(start(b"1")).await.unwrap();
        let err = engine
            .get_workflow_result(&selector(&execution))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_lost_worker_redispatches_as_replay() {
        let engine = engine_with_namespace().await;
        let lost = Arc::new(LostSink::default());
        let echo = Arc::new(EchoSink::default());
        engine
            .new_worker(spec(WorkerKind::Workflow), lost.clone())
            .await
            .unwrap();

        let execution = engine.start_workflow(start(b"2")).await.unwrap();
        engine
            .record_event(
                &execution,
                HistoryEvent::completed(1, Decision::Time, Outcome::Time(1_700_000_000_000)),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        engine
            .new_worker(spec(WorkerKind::Workflow), echo.clone())
            .await
            .unwrap();

        let result = engine.get_workflow_result(&selector(&execution)).await.unwrap();
        assert_eq!(result.unwrap(), Some(Bytes::from_static(b"2")));
        assert!(lost.calls.load(Ordering::SeqCst) >= 1);

        let tasks = echo.workflow_tasks.lock();
        assert!(tasks[0].replaying);
        assert!(tasks[0].attempt >= 2);
        // The lost worker was dropped from the table
        assert_eq!(engine.worker_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_workflow_id_rejected_while_running() {
        let engine = engine_with_namespace().await;
        engine
            .new_worker(spec(WorkerKind::Workflow), Arc::new(BlockingSink))
            .await
            .unwrap();
        let execution = engine.start_workflow(start(b"1")).await.unwrap();

        assert!(matches!(
            engine.start_workflow(start(b"1")).await,
            Err(EngineError::WorkflowAlreadyStarted { .. })
        ));

        engine.cancel_workflow(&selector(&execution)).await.unwrap();
        let err = engine
            .get_workflow_result(&selector(&execution))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
        assert!(matches!(
            engine.cancel_workflow(&selector(&execution)).await,
            Err(EngineError::WorkflowNotRunning(_))
        ));

        // A closed workflow ID can be reused for a new run
        let second = engine.start_workflow(start(b"1")).await.unwrap();
        assert_ne!(second.run_id, execution.run_id);
    }

    #[tokio::test]
    async fn test_terminate_records_reason() {
        let engine = engine_with_namespace().await;
        engine
            .new_worker(spec(WorkerKind::Workflow), Arc::new(BlockingSink))
            .await
            .unwrap();
        let execution = engine.start_workflow(start(b"1")).await.unwrap();

        engine
            .terminate_workflow(&selector(&execution), Some("operator request".to_string()))
            .await
            .unwrap();
        let err = engine
            .get_workflow_result(&selector(&execution))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Terminated);
        assert_eq!(err.details.as_deref(), Some("operator request"));

        let description = engine.describe_workflow(&selector(&execution)).await.unwrap();
        assert_eq!(description.status, WorkflowStatus::Terminated);
    }

    #[tokio::test]
    async fn test_history_is_keyed_by_seq() {
        let engine = engine_with_namespace().await;
        engine
            .new_worker(spec(WorkerKind::Workflow), Arc::new(BlockingSink))
            .await
            .unwrap();
        let execution = engine.start_workflow(start(b"1")).await.unwrap();

        engine
            .record_event(&execution, HistoryEvent::scheduled(2, Decision::SideEffect))
            .await
            .unwrap();
        engine
            .record_event(&execution, HistoryEvent::scheduled(1, Decision::Timer))
            .await
            .unwrap();
        engine
            .record_event(
                &execution,
                HistoryEvent::completed(2, Decision::SideEffect, Outcome::Value(None)),
            )
            .await
            .unwrap();

        let history = engine.history(&execution).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].seq, 1);
        assert_eq!(history[1].outcome, Some(Outcome::Value(None)));
    }

    #[tokio::test]
    async fn test_activity_completes_externally() {
        let engine = engine_with_namespace().await;
        engine
            .new_worker(spec(WorkerKind::Workflow), Arc::new(BlockingSink))
            .await
            .unwrap();
        engine
            .new_worker(
                spec(WorkerKind::Activity),
                Arc::new(EchoSink {
                    pending_activities: true,
                    ..Default::default()
                }),
            )
            .await
            .unwrap();
        let execution = engine.start_workflow(start(b"1")).await.unwrap();

        let activity = {
            let engine = engine.clone();
            let execution = execution.clone();
            tokio::spawn(async move {
                engine
                    .execute_activity(ActivityRequest {
                        execution,
                        activity_type: "charge".to_string(),
                        task_queue: "tq-1".to_string(),
                        args: None,
                        start_to_close_timeout: Some(Duration::from_secs(5)),
                        cancel: CancellationToken::new(),
                    })
                    .await
            })
        };

        // Wait for the activity to be registered, then complete it by token
        let token = loop {
            if let Some(token) = engine.inner.activities.lock().keys().next().cloned() {
                break token;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert!(!engine.record_activity_heartbeat(&token, None).await.unwrap());
        engine
            .complete_activity(&token, Ok(Some(Bytes::from_static(b"done"))))
            .await
            .unwrap();

        let result = activity.await.unwrap().unwrap();
        assert_eq!(result.unwrap(), Some(Bytes::from_static(b"done")));
        assert_eq!(engine.running_activities(), 0);
        assert!(matches!(
            engine.complete_activity(&token, Ok(None)).await,
            Err(EngineError::ActivityNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_abandoned_activity_is_removed_and_cancelled() {
        let engine = engine_with_namespace().await;
        let sink = Arc::new(EchoSink {
            pending_activities: true,
            ..Default::default()
        });
        engine
            .new_worker(spec(WorkerKind::Workflow), Arc::new(BlockingSink))
            .await
            .unwrap();
        engine
            .new_worker(spec(WorkerKind::Activity), sink.clone())
            .await
            .unwrap();
        let execution = engine.start_workflow(start(b"1")).await.unwrap();

        let activity = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .execute_activity(ActivityRequest {
                        execution,
                        activity_type: "review".to_string(),
                        task_queue: "tq-1".to_string(),
                        args: None,
                        start_to_close_timeout: None,
                        cancel: CancellationToken::new(),
                    })
                    .await
            })
        };
        let token = loop {
            if let Some(task) = sink.activity_tasks.lock().first() {
                break task.task_token.clone();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert_eq!(engine.running_activities(), 1);

        // The workflow side goes away while the activity awaits completion
        activity.abort();
        assert!(activity.await.unwrap_err().is_cancelled());

        assert_eq!(engine.running_activities(), 0);
        assert!(sink.activity_tasks.lock()[0].cancel.is_cancelled());
        assert!(matches!(
            engine.complete_activity(&token, Ok(None)).await,
            Err(EngineError::ActivityNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_activity_start_to_close_timeout() {
        let engine = engine_with_namespace().await;
        engine
            .new_worker(spec(WorkerKind::Workflow), Arc::new(BlockingSink))
            .await
            .unwrap();
        engine
            .new_worker(spec(WorkerKind::Activity), Arc::new(BlockingSink))
            .await
            .unwrap();
        let execution = engine.start_workflow(start(b"1")).await.unwrap();

        let result = engine
            .execute_activity(ActivityRequest {
                execution,
                activity_type: "slow".to_string(),
                task_queue: "tq-1".to_string(),
                args: None,
                start_to_close_timeout: Some(Duration::from_millis(30)),
                cancel: CancellationToken::new(),
            })
            .await
            .unwrap();
        assert_eq!(result.unwrap_err().kind, ErrorKind::Timeout);
        assert_eq!(engine.running_activities(), 0);
    }

    #[tokio::test]
    async fn test_signals_are_queued_until_waited_for() {
        let engine = engine_with_namespace().await;
        engine
            .new_worker(spec(WorkerKind::Workflow), Arc::new(BlockingSink))
            .await
            .unwrap();
        let execution = engine.start_workflow(start(b"1")).await.unwrap();

        engine
            .signal_workflow(&selector(&execution), "approve", Some(Bytes::from_static(b"yes")))
            .await
            .unwrap();
        let received = engine
            .wait_for_signal(&execution, "approve", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(received, Some(Some(Bytes::from_static(b"yes"))));

        let waiter = {
            let engine = engine.clone();
            let execution = execution.clone();
            tokio::spawn(async move {
                engine
                    .wait_for_signal(&execution, "approve", CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine
            .signal_workflow(&selector(&execution), "approve", None)
            .await
            .unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), Some(None));

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(
            engine
                .wait_for_signal(&execution, "never", cancel)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_query_uses_active_worker() {
        let engine = engine_with_namespace().await;
        engine
            .new_worker(spec(WorkerKind::Workflow), Arc::new(BlockingSink))
            .await
            .unwrap();
        let execution = engine.start_workflow(start(b"1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let answer = engine
            .query_workflow(&selector(&execution), "state", None)
            .await
            .unwrap();
        assert_eq!(answer, Some(Bytes::from_static(b"state")));

        let wrong_run = WorkflowSelector {
            run_id: Some("other".to_string()),
            ..selector(&execution)
        };
        assert!(matches!(
            engine.query_workflow(&wrong_run, "state", None).await,
            Err(EngineError::WorkflowNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_workers_require_namespace() {
        let engine = fast_engine();
        assert!(matches!(
            engine
                .new_worker(spec(WorkerKind::Workflow), Arc::new(EchoSink::default()))
                .await,
            Err(EngineError::NamespaceNotFound(_))
        ));
        assert!(matches!(
            engine.stop_worker(WorkerHandle { id: 42 }).await,
            Err(EngineError::WorkerNotFound(42))
        ));
    }
}
