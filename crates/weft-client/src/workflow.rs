// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Context handed to workflow functions.
//!
//! Every non-deterministic call a workflow makes goes through its context
//! and is numbered in call order. The proxy answers each number from history
//! when the execution is replayed, so workflow code must issue the same
//! calls in the same order on every run.
//!
//! ```ignore
//! async fn checkout(ctx: WorkflowContext, order: Order) -> Result<Receipt, ProxyError> {
//!     let charge: Charge = ctx.execute_activity("charge", &order).await?;
//!     ctx.sleep(Duration::from_secs(60)).await?;
//!     let receipt_id = ctx.new_uuid().await?;
//!     Ok(Receipt { charge, receipt_id })
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use uuid::Uuid;
use weft_protocol::messages::{
    ReplyMessage, WorkflowExecuteActivityRequest, WorkflowExecuteChildRequest,
    WorkflowGetTimeRequest, WorkflowGetVersionRequest, WorkflowMutableSideEffectRequest,
    WorkflowSideEffectRequest, WorkflowSleepRequest, WorkflowWaitForSignalRequest,
};
use weft_protocol::{Connection, ContextKey, Payload, ProxyError};

use crate::convert::{decode, encode};
use crate::error::{ClientError, Result};

type SideEffectFn = Box<dyn FnOnce() -> std::result::Result<Payload, ProxyError> + Send>;
type QueryFn = Arc<dyn Fn(Payload) -> std::result::Result<Payload, ProxyError> + Send + Sync>;

/// Identity of a running workflow execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkflowInfo {
    pub namespace: String,
    pub workflow_id: String,
    pub run_id: String,
    pub workflow_type: String,
    pub task_queue: String,
    /// 1 for the first dispatch, incremented on every re-dispatch
    pub attempt: u32,
}

/// Options for [`WorkflowContext::execute_activity_with_options`].
#[derive(Debug, Clone, Default)]
pub struct ActivityOptions {
    /// Task queue to schedule on (default: the workflow's task queue)
    pub task_queue: Option<String>,
    /// Fail the attempt if it runs longer than this
    pub start_to_close_timeout: Option<Duration>,
}

/// Options for [`WorkflowContext::execute_child_workflow_with_options`].
#[derive(Debug, Clone, Default)]
pub struct ChildWorkflowOptions {
    /// Workflow ID for the child (default: generated by the proxy)
    pub workflow_id: Option<String>,
    /// Task queue for the child (default: the parent's task queue)
    pub task_queue: Option<String>,
}

/// Identity and result of a finished child workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildWorkflow<R> {
    pub workflow_id: String,
    pub run_id: String,
    pub result: R,
}

pub(crate) struct WorkflowState {
    pub(crate) key: ContextKey,
    info: WorkflowInfo,
    connection: Connection,
    seq: AtomicU64,
    replaying: AtomicBool,
    side_effects: Mutex<HashMap<u64, SideEffectFn>>,
    queries: Mutex<HashMap<String, QueryFn>>,
    cancel: CancellationToken,
}

impl WorkflowState {
    pub(crate) fn new(
        key: ContextKey,
        info: WorkflowInfo,
        replaying: bool,
        connection: Connection,
    ) -> Self {
        Self {
            key,
            info,
            seq: AtomicU64::new(0),
            replaying: AtomicBool::new(replaying),
            side_effects: Mutex::new(HashMap::new()),
            queries: Mutex::new(HashMap::new()),
            cancel: connection.closed_token().child_token(),
            connection,
        }
    }

    /// Run the closure registered for `seq`. Each closure runs at most once.
    pub(crate) fn run_side_effect(&self, seq: u64) -> std::result::Result<Payload, ProxyError> {
        let side_effect = self.side_effects.lock().remove(&seq).ok_or_else(|| {
            ProxyError::generic(format!(
                "no side effect pending at seq {} in context {}",
                seq, self.key
            ))
        })?;
        side_effect()
    }

    pub(crate) fn run_query(
        &self,
        name: &str,
        args: Payload,
    ) -> std::result::Result<Payload, ProxyError> {
        let handler = self.queries.lock().get(name).cloned().ok_or_else(|| {
            ProxyError::generic(format!(
                "workflow {} has no handler for query '{}'",
                self.info.workflow_id, name
            ))
        })?;
        handler(args)
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Handle passed to a running workflow.
#[derive(Clone)]
pub struct WorkflowContext {
    state: Arc<WorkflowState>,
}

impl WorkflowContext {
    pub(crate) fn new(state: Arc<WorkflowState>) -> Self {
        Self { state }
    }

    pub fn info(&self) -> &WorkflowInfo {
        &self.state.info
    }

    /// Whether the calls made so far are being answered from history.
    ///
    /// Starts as the dispatch flag (history was non-empty) and follows every
    /// decision reply after that. Use it to skip logging or metrics that
    /// should only happen once per execution.
    pub fn is_replaying(&self) -> bool {
        self.state.replaying.load(Ordering::Acquire)
    }

    /// Resolves when the session behind this execution closes.
    pub async fn cancelled(&self) {
        self.state.cancel.cancelled().await
    }

    fn next_seq(&self) -> u64 {
        self.state.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn context_id(&self) -> i64 {
        self.state.key.context_id
    }

    fn observe(&self, replaying: bool) {
        self.state.replaying.store(replaying, Ordering::Release);
    }

    /// Run an activity on the workflow's task queue and wait for its result.
    pub async fn execute_activity<A, R>(&self, activity_type: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.execute_activity_with_options(activity_type, args, ActivityOptions::default())
            .await
    }

    #[instrument(skip(self, args, options), fields(context = %self.state.key))]
    pub async fn execute_activity_with_options<A, R>(
        &self,
        activity_type: &str,
        args: &A,
        options: ActivityOptions,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let request = WorkflowExecuteActivityRequest {
            context_id: self.context_id(),
            seq: self.next_seq(),
            activity_type: activity_type.to_string(),
            task_queue: options.task_queue,
            args: encode(args)?,
            start_to_close_timeout_ms: options
                .start_to_close_timeout
                .map(|t| t.as_millis() as u64),
        };
        let reply = self
            .state
            .connection
            .request_unbounded(request)
            .await?
            .into_result()?;
        self.observe(reply.replaying);
        decode(&reply.result)
    }

    /// Durable timer. Replays return immediately once the timer has fired.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        let request = WorkflowSleepRequest {
            context_id: self.context_id(),
            seq: self.next_seq(),
            duration_ms: duration.as_millis() as u64,
        };
        let reply = self
            .state
            .connection
            .request_unbounded(request)
            .await?
            .into_result()?;
        self.observe(reply.replaying);
        Ok(())
    }

    /// Run `f` once per execution and record its value.
    ///
    /// On replay the recorded value is returned and `f` is dropped unrun.
    pub async fn side_effect<T, F>(&self, f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let seq = self.next_seq();
        let side_effect: SideEffectFn = Box::new(move || encode(&f()).map_err(ProxyError::from));
        self.state.side_effects.lock().insert(seq, side_effect);

        let reply = self
            .state
            .connection
            .request(WorkflowSideEffectRequest {
                context_id: self.context_id(),
                seq,
            })
            .await;
        if self.state.side_effects.lock().remove(&seq).is_some() {
            debug!(context = %self.state.key, seq, "side effect answered from history");
        }

        let reply = reply?.into_result()?;
        self.observe(reply.replaying);
        decode(&reply.result)
    }

    /// Record `value` under `id` the first time; replays return the recorded value.
    pub async fn mutable_side_effect<T>(&self, id: &str, value: &T) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let request = WorkflowMutableSideEffectRequest {
            context_id: self.context_id(),
            seq: self.next_seq(),
            mutable_id: id.to_string(),
            value: encode(value)?,
        };
        let reply = self.state.connection.request(request).await?.into_result()?;
        self.observe(reply.replaying);
        decode(&reply.result)
    }

    /// Version marker for a code change.
    ///
    /// New executions get `max_supported`. Replays get the version recorded
    /// when the execution first passed this point, or an error if it is no
    /// longer in `min_supported..=max_supported`.
    pub async fn get_version(
        &self,
        change_id: &str,
        min_supported: i32,
        max_supported: i32,
    ) -> Result<i32> {
        let request = WorkflowGetVersionRequest {
            context_id: self.context_id(),
            seq: self.next_seq(),
            change_id: change_id.to_string(),
            min_supported,
            max_supported,
        };
        let reply = self.state.connection.request(request).await?.into_result()?;
        self.observe(reply.replaying);
        Ok(reply.version)
    }

    /// Start a child workflow and wait for it to finish.
    pub async fn execute_child_workflow<A, R>(&self, workflow_type: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let child = self
            .execute_child_workflow_with_options(
                workflow_type,
                args,
                ChildWorkflowOptions::default(),
            )
            .await?;
        Ok(child.result)
    }

    #[instrument(skip(self, args, options), fields(context = %self.state.key))]
    pub async fn execute_child_workflow_with_options<A, R>(
        &self,
        workflow_type: &str,
        args: &A,
        options: ChildWorkflowOptions,
    ) -> Result<ChildWorkflow<R>>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let request = WorkflowExecuteChildRequest {
            context_id: self.context_id(),
            seq: self.next_seq(),
            workflow_type: workflow_type.to_string(),
            workflow_id: options.workflow_id,
            task_queue: options.task_queue,
            args: encode(args)?,
        };
        let reply = self
            .state
            .connection
            .request_unbounded(request)
            .await?
            .into_result()?;
        self.observe(reply.replaying);
        Ok(ChildWorkflow {
            workflow_id: reply.child_workflow_id,
            run_id: reply.child_run_id,
            result: decode(&reply.result)?,
        })
    }

    /// Wait for the next signal named `signal_name` and return its payload.
    pub async fn wait_for_signal<T: DeserializeOwned>(&self, signal_name: &str) -> Result<T> {
        let request = WorkflowWaitForSignalRequest {
            context_id: self.context_id(),
            seq: self.next_seq(),
            signal_name: signal_name.to_string(),
        };
        let reply = self
            .state
            .connection
            .request_unbounded(request)
            .await?
            .into_result()?;
        self.observe(reply.replaying);
        decode(&reply.result)
    }

    /// Deterministic current time: recorded on first use, replayed after.
    pub async fn now(&self) -> Result<DateTime<Utc>> {
        let request = WorkflowGetTimeRequest {
            context_id: self.context_id(),
            seq: self.next_seq(),
        };
        let reply = self.state.connection.request(request).await?.into_result()?;
        self.observe(reply.replaying);
        Utc.timestamp_millis_opt(reply.unix_ms).single().ok_or_else(|| {
            ClientError::Serialization(format!("time {}ms is out of range", reply.unix_ms))
        })
    }

    /// A random UUID that stays the same across replays.
    pub async fn new_uuid(&self) -> Result<Uuid> {
        self.side_effect(Uuid::new_v4).await
    }

    /// Answer `WorkflowQuery` requests named `name` while this execution runs.
    ///
    /// Handlers must not block; they run on the session's request task.
    pub fn set_query_handler<A, R, F>(&self, name: impl Into<String>, handler: F)
    where
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(A) -> std::result::Result<R, ProxyError> + Send + Sync + 'static,
    {
        let query: QueryFn = Arc::new(move |args| {
            let args = decode::<A>(&args)?;
            let result = handler(args)?;
            encode(&result).map_err(ProxyError::from)
        });
        self.state.queries.lock().insert(name.into(), query);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use weft_protocol::{ConnectionConfig, ErrorKind};

    fn context() -> WorkflowContext {
        let (reader, writer) = tokio::io::duplex(64);
        let (connection, _driver) = Connection::new(reader, writer, ConnectionConfig::default());
        WorkflowContext::new(Arc::new(WorkflowState::new(
            ContextKey::new(1, 7),
            WorkflowInfo {
                workflow_id: "wf-1".to_string(),
                ..Default::default()
            },
            true,
            connection,
        )))
    }

    #[test]
    fn test_sequence_numbers_start_at_one() {
        let ctx = context();
        assert_eq!(ctx.next_seq(), 1);
        assert_eq!(ctx.next_seq(), 2);
        assert_eq!(ctx.next_seq(), 3);
    }

    #[test]
    fn test_replaying_follows_decision_replies() {
        let ctx = context();
        assert!(ctx.is_replaying());
        ctx.observe(false);
        assert!(!ctx.is_replaying());
    }

    #[test]
    fn test_side_effect_runs_at_most_once() {
        let ctx = context();
        ctx.state.side_effects.lock().insert(
            3,
            Box::new(|| Ok::<_, ProxyError>(Some(Bytes::from_static(b"\"v\"")))),
        );

        let value = ctx.state.run_side_effect(3).unwrap();
        assert_eq!(value.as_deref(), Some(&b"\"v\""[..]));
        assert_eq!(ctx.state.run_side_effect(3).unwrap_err().kind, ErrorKind::Generic);
    }

    #[test]
    fn test_query_handlers() {
        let ctx = context();
        ctx.set_query_handler("progress", |step: u32| Ok(format!("step {}", step)));

        let result = ctx
            .state
            .run_query("progress", Some(Bytes::from_static(b"4")))
            .unwrap();
        assert_eq!(result.as_deref(), Some(&b"\"step 4\""[..]));

        let err = ctx.state.run_query("missing", None).unwrap_err();
        assert!(err.message.contains("no handler for query 'missing'"));
    }
}
