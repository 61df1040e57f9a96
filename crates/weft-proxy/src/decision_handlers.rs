// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow decision handlers.
//!
//! Every non-deterministic call made by workflow code arrives here with the
//! sequence number the client allocated for it. [`decide`] answers it from
//! history when the decision was already made and otherwise runs it, records
//! the outcome and replies. Recording happens in two steps (scheduled, then
//! completed) so a decision interrupted by a lost worker is run again on the
//! next attempt instead of being reported as missing.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, instrument, warn};
use weft_protocol::messages::{
    WorkflowExecuteActivityReply, WorkflowExecuteActivityRequest, WorkflowExecuteChildReply,
    WorkflowExecuteChildRequest, WorkflowGetTimeReply, WorkflowGetTimeRequest,
    WorkflowGetVersionReply, WorkflowGetVersionRequest, WorkflowMutableSideEffectReply,
    WorkflowMutableSideEffectRequest, WorkflowSideEffectInvokeRequest, WorkflowSideEffectReply,
    WorkflowSideEffectRequest, WorkflowSleepReply, WorkflowSleepRequest,
    WorkflowWaitForSignalReply, WorkflowWaitForSignalRequest,
};
use weft_protocol::{ContextKey, Payload, ProxyError, ReplyMessage};

use crate::engine::{
    ActivityRequest, Decision, EngineError, HistoryEvent, Outcome, StartWorkflow,
    WorkflowSelector,
};
use crate::error::{HandlerError, Result};
use crate::replay::{self, Lookup};
use crate::session::Session;
use crate::state::WorkflowContext;

/// A decided outcome and whether more recorded history follows it.
#[derive(Debug)]
struct Decided {
    outcome: Outcome,
    replaying: bool,
}

/// Answer the decision at `seq` from history, or run `fresh` and record it.
///
/// A decision that contradicts history fails the request and poisons the
/// workflow context, so the execution fails when the invocation returns.
async fn decide<F, Fut>(
    session: &Session,
    context_id: i64,
    seq: u64,
    decision: Decision,
    fresh: F,
) -> Result<Decided>
where
    F: FnOnce(Arc<WorkflowContext>) -> Fut,
    Fut: Future<Output = Result<Outcome>>,
{
    if seq == 0 {
        return Err(HandlerError::validation("seq", "decision sequence numbers start at 1"));
    }
    let client_id = session.client_id()?;
    let context = session
        .state
        .contexts
        .workflows
        .get(ContextKey::new(client_id, context_id))?;
    let engine = &session.state.engine;
    let history = engine.history(&context.execution).await?;

    let replaying = match replay::lookup(&history, seq, &decision, context.replay_horizon) {
        Lookup::Replayed { outcome, replaying } => {
            debug!(seq, %decision, replaying, "decision answered from history");
            return Ok(Decided {
                outcome: outcome.clone(),
                replaying,
            });
        }
        Lookup::Resume { replaying } => {
            debug!(seq, %decision, "re-running interrupted decision");
            replaying
        }
        Lookup::Fresh => {
            engine
                .record_event(
                    &context.execution,
                    HistoryEvent::scheduled(seq, decision.clone()),
                )
                .await?;
            false
        }
        Lookup::Nondeterministic(message) => {
            warn!(execution = %context.execution, seq, %message, "nondeterministic decision");
            context.poison(ProxyError::generic(format!(
                "nondeterministic workflow: {}",
                message
            )));
            return Err(HandlerError::Nondeterministic(message));
        }
    };

    let outcome = fresh(context.clone()).await?;
    engine
        .record_event(
            &context.execution,
            HistoryEvent::completed(seq, decision, outcome.clone()),
        )
        .await?;

    Ok(Decided { outcome, replaying })
}

fn unexpected(what: &str, outcome: &Outcome) -> HandlerError {
    HandlerError::Nondeterministic(format!(
        "recorded outcome {:?} does not belong to {}",
        outcome, what
    ))
}

/// Split a payload-valued outcome into its value or recorded failure.
fn into_value(what: &str, outcome: Outcome) -> Result<std::result::Result<Payload, ProxyError>> {
    match outcome {
        Outcome::Value(payload) => Ok(Ok(payload)),
        Outcome::Failed(err) => Ok(Err(err)),
        other => Err(unexpected(what, &other)),
    }
}

// ============================================================================
// Activities and timers
// ============================================================================

/// Run an activity, or replay its recorded result.
///
/// Activity failures are recorded like results; a replay sees the same
/// failure.
#[instrument(skip(session, request), fields(context_id = request.context_id, seq = request.seq, activity_type = %request.activity_type))]
pub async fn handle_execute_activity(
    session: &Session,
    request: WorkflowExecuteActivityRequest,
) -> Result<WorkflowExecuteActivityReply> {
    if request.activity_type.is_empty() {
        return Err(HandlerError::validation("activity_type", "activity type is required"));
    }
    let WorkflowExecuteActivityRequest {
        context_id,
        seq,
        activity_type,
        task_queue,
        args,
        start_to_close_timeout_ms,
    } = request;
    let engine = session.state.engine.clone();
    let decision = Decision::Activity {
        activity_type: activity_type.clone(),
    };

    let decided = decide(session, context_id, seq, decision, |context| async move {
        let result = engine
            .execute_activity(ActivityRequest {
                execution: context.execution.clone(),
                activity_type,
                task_queue: task_queue
                    .filter(|queue| !queue.is_empty())
                    .unwrap_or_else(|| context.task_queue.clone()),
                args,
                start_to_close_timeout: start_to_close_timeout_ms.map(Duration::from_millis),
                cancel: context.cancel.clone(),
            })
            .await?;
        match result {
            Ok(payload) => Ok(Outcome::Value(payload)),
            // Not recorded: the workflow itself is going away
            Err(err) if context.cancel.is_cancelled() => Err(HandlerError::Cancelled(err.message)),
            Err(err) => Ok(Outcome::Failed(err)),
        }
    })
    .await?;

    let replaying = decided.replaying;
    Ok(match into_value("an activity", decided.outcome)? {
        Ok(result) => WorkflowExecuteActivityReply {
            result,
            replaying,
            error: None,
        },
        Err(err) => WorkflowExecuteActivityReply {
            result: None,
            replaying,
            error: Some(err),
        },
    })
}

/// Durable timer. An interrupted timer restarts with its full duration.
#[instrument(skip(session, request), fields(context_id = request.context_id, seq = request.seq, duration_ms = request.duration_ms))]
pub async fn handle_sleep(
    session: &Session,
    request: WorkflowSleepRequest,
) -> Result<WorkflowSleepReply> {
    let duration = Duration::from_millis(request.duration_ms);

    let decided = decide(
        session,
        request.context_id,
        request.seq,
        Decision::Timer,
        |context| async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => Ok(Outcome::TimerFired),
                _ = context.cancel.cancelled() => {
                    Err(HandlerError::Cancelled("sleep cancelled".to_string()))
                }
            }
        },
    )
    .await?;

    match decided.outcome {
        Outcome::TimerFired => Ok(WorkflowSleepReply {
            replaying: decided.replaying,
            error: None,
        }),
        other => Err(unexpected("a timer", &other)),
    }
}

// ============================================================================
// Side effects and versioning
// ============================================================================

/// Record a value computed once by the client.
///
/// On the recording pass the proxy asks the client to run the closure it
/// registered for this sequence number; replays return the recorded bytes.
#[instrument(skip(session, request), fields(context_id = request.context_id, seq = request.seq))]
pub async fn handle_side_effect(
    session: &Session,
    request: WorkflowSideEffectRequest,
) -> Result<WorkflowSideEffectReply> {
    let WorkflowSideEffectRequest { context_id, seq } = request;
    let connection = session.connection.clone();

    let decided = decide(session, context_id, seq, Decision::SideEffect, |_| async move {
        let reply = connection
            .request(WorkflowSideEffectInvokeRequest { context_id, seq })
            .await
            .map_err(|e| HandlerError::Client(e.into()))?;
        reply
            .into_result()
            .map(|reply| Outcome::Value(reply.result))
            .map_err(HandlerError::Client)
    })
    .await?;

    let replaying = decided.replaying;
    Ok(match into_value("a side effect", decided.outcome)? {
        Ok(result) => WorkflowSideEffectReply {
            result,
            replaying,
            error: None,
        },
        Err(err) => WorkflowSideEffectReply {
            result: None,
            replaying,
            error: Some(err),
        },
    })
}

/// Record the value the workflow supplied; replays return the recorded one.
#[instrument(skip(session, request), fields(context_id = request.context_id, seq = request.seq, mutable_id = %request.mutable_id))]
pub async fn handle_mutable_side_effect(
    session: &Session,
    request: WorkflowMutableSideEffectRequest,
) -> Result<WorkflowMutableSideEffectReply> {
    if request.mutable_id.is_empty() {
        return Err(HandlerError::validation("mutable_id", "mutable side effect ID is required"));
    }
    let WorkflowMutableSideEffectRequest {
        context_id,
        seq,
        mutable_id,
        value,
    } = request;

    let decided = decide(
        session,
        context_id,
        seq,
        Decision::MutableSideEffect { mutable_id },
        |_| async move { Ok(Outcome::Value(value)) },
    )
    .await?;

    let replaying = decided.replaying;
    Ok(match into_value("a mutable side effect", decided.outcome)? {
        Ok(result) => WorkflowMutableSideEffectReply {
            result,
            replaying,
            error: None,
        },
        Err(err) => WorkflowMutableSideEffectReply {
            result: None,
            replaying,
            error: Some(err),
        },
    })
}

/// Version marker for a code change.
///
/// The first run records `max_supported`. A replayed version outside
/// `[min_supported, max_supported]` means the running code can no longer
/// replay this execution.
#[instrument(skip(session, request), fields(context_id = request.context_id, seq = request.seq, change_id = %request.change_id))]
pub async fn handle_get_version(
    session: &Session,
    request: WorkflowGetVersionRequest,
) -> Result<WorkflowGetVersionReply> {
    if request.change_id.is_empty() {
        return Err(HandlerError::validation("change_id", "change ID is required"));
    }
    if request.min_supported > request.max_supported {
        return Err(HandlerError::validation(
            "min_supported",
            format!(
                "min_supported {} is greater than max_supported {}",
                request.min_supported, request.max_supported
            ),
        ));
    }
    let (min, max) = (request.min_supported, request.max_supported);
    let change_id = request.change_id;

    let decided = decide(
        session,
        request.context_id,
        request.seq,
        Decision::Version {
            change_id: change_id.clone(),
        },
        |_| async move { Ok(Outcome::Version(max)) },
    )
    .await?;

    match decided.outcome {
        Outcome::Version(version) if (min..=max).contains(&version) => Ok(WorkflowGetVersionReply {
            version,
            replaying: decided.replaying,
            error: None,
        }),
        Outcome::Version(version) => Ok(WorkflowGetVersionReply {
            version,
            replaying: decided.replaying,
            error: Some(ProxyError::generic(format!(
                "version {} of change '{}' is outside the supported range {}..={}",
                version, change_id, min, max
            ))),
        }),
        other => Err(unexpected("a version marker", &other)),
    }
}

// ============================================================================
// Child workflows, signals and time
// ============================================================================

/// Start a child workflow and wait for its result.
///
/// Cancelling the parent cancels the child.
#[instrument(skip(session, request), fields(context_id = request.context_id, seq = request.seq, workflow_type = %request.workflow_type))]
pub async fn handle_execute_child(
    session: &Session,
    request: WorkflowExecuteChildRequest,
) -> Result<WorkflowExecuteChildReply> {
    if request.workflow_type.is_empty() {
        return Err(HandlerError::validation("workflow_type", "workflow type is required"));
    }
    let WorkflowExecuteChildRequest {
        context_id,
        seq,
        workflow_type,
        workflow_id,
        task_queue,
        args,
    } = request;
    let engine = session.state.engine.clone();
    let decision = Decision::ChildWorkflow {
        workflow_type: workflow_type.clone(),
    };

    let decided = decide(session, context_id, seq, decision, |context| async move {
        let started = engine
            .start_workflow(StartWorkflow {
                namespace: context.execution.namespace.clone(),
                workflow_id,
                workflow_type: workflow_type.clone(),
                task_queue: task_queue
                    .filter(|queue| !queue.is_empty())
                    .unwrap_or_else(|| context.task_queue.clone()),
                args,
                execution_timeout: None,
            })
            .await;
        let child = match started {
            Ok(child) => {
                debug!(child = %child, "child workflow started");
                child
            }
            // Started by an earlier attempt of this decision
            Err(EngineError::WorkflowAlreadyStarted {
                namespace,
                workflow_id,
            }) => {
                let running = engine
                    .describe_workflow(&WorkflowSelector {
                        namespace: namespace.clone(),
                        workflow_id: workflow_id.clone(),
                        run_id: None,
                    })
                    .await?;
                if running.workflow_type != workflow_type {
                    return Err(EngineError::WorkflowAlreadyStarted {
                        namespace,
                        workflow_id,
                    }
                    .into());
                }
                debug!(child = %running.execution, "attached to running child workflow");
                running.execution
            }
            Err(e) => return Err(e.into()),
        };

        let selector = WorkflowSelector {
            namespace: child.namespace.clone(),
            workflow_id: child.workflow_id.clone(),
            run_id: Some(child.run_id.clone()),
        };
        let result = tokio::select! {
            result = engine.get_workflow_result(&selector) => result?,
            _ = context.cancel.cancelled() => {
                if let Err(e) = engine.cancel_workflow(&selector).await {
                    debug!(child = %child, error = %e, "child workflow already closed");
                }
                return Err(HandlerError::Cancelled(
                    "child workflow cancelled with its parent".to_string(),
                ));
            }
        };

        Ok(match result {
            Ok(result) => Outcome::Child {
                workflow_id: child.workflow_id,
                run_id: child.run_id,
                result,
            },
            Err(err) => Outcome::Failed(err),
        })
    })
    .await?;

    let replaying = decided.replaying;
    match decided.outcome {
        Outcome::Child {
            workflow_id,
            run_id,
            result,
        } => Ok(WorkflowExecuteChildReply {
            result,
            child_workflow_id: workflow_id,
            child_run_id: run_id,
            replaying,
            error: None,
        }),
        Outcome::Failed(err) => Ok(WorkflowExecuteChildReply {
            replaying,
            error: Some(err),
            ..Default::default()
        }),
        other => Err(unexpected("a child workflow", &other)),
    }
}

/// Block until a signal with the given name arrives.
#[instrument(skip(session, request), fields(context_id = request.context_id, seq = request.seq, signal_name = %request.signal_name))]
pub async fn handle_wait_for_signal(
    session: &Session,
    request: WorkflowWaitForSignalRequest,
) -> Result<WorkflowWaitForSignalReply> {
    if request.signal_name.is_empty() {
        return Err(HandlerError::validation("signal_name", "signal name is required"));
    }
    let WorkflowWaitForSignalRequest {
        context_id,
        seq,
        signal_name,
    } = request;
    let engine = session.state.engine.clone();
    let decision = Decision::Signal {
        signal_name: signal_name.clone(),
    };

    let decided = decide(session, context_id, seq, decision, |context| async move {
        match engine
            .wait_for_signal(&context.execution, &signal_name, context.cancel.clone())
            .await?
        {
            Some(payload) => Ok(Outcome::Value(payload)),
            None => Err(HandlerError::Cancelled(format!(
                "wait for signal '{}' cancelled",
                signal_name
            ))),
        }
    })
    .await?;

    let replaying = decided.replaying;
    Ok(match into_value("a signal", decided.outcome)? {
        Ok(result) => WorkflowWaitForSignalReply {
            result,
            replaying,
            error: None,
        },
        Err(err) => WorkflowWaitForSignalReply {
            result: None,
            replaying,
            error: Some(err),
        },
    })
}

/// Deterministic wall-clock time.
pub async fn handle_get_time(
    session: &Session,
    request: WorkflowGetTimeRequest,
) -> Result<WorkflowGetTimeReply> {
    let decided = decide(
        session,
        request.context_id,
        request.seq,
        Decision::Time,
        |_| async move { Ok(Outcome::Time(Utc::now().timestamp_millis())) },
    )
    .await?;

    match decided.outcome {
        Outcome::Time(unix_ms) => Ok(WorkflowGetTimeReply {
            unix_ms,
            replaying: decided.replaying,
            error: None,
        }),
        other => Err(unexpected("a time marker", &other)),
    }
}
