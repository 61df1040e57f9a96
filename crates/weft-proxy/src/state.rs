// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-wide proxy state shared by every session.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use weft_protocol::{ContextKey, IdGenerator, ProxyError, Registry};

use crate::config::ProxyConfig;
use crate::engine::{Engine, ExecutionRef};

/// A workflow invocation running in a client library.
#[derive(Debug)]
pub struct WorkflowContext {
    pub key: ContextKey,
    pub execution: ExecutionRef,
    pub workflow_type: String,
    pub task_queue: String,
    /// Fired when the execution is cancelled or the session closes
    pub cancel: CancellationToken,
    /// Highest sequence number recorded before this invocation started.
    /// Anything above it was recorded by the invocation itself.
    pub replay_horizon: u64,
    poisoned: Mutex<Option<ProxyError>>,
}

impl WorkflowContext {
    pub fn new(
        key: ContextKey,
        execution: ExecutionRef,
        workflow_type: String,
        task_queue: String,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            key,
            execution,
            workflow_type,
            task_queue,
            cancel,
            replay_horizon: 0,
            poisoned: Mutex::new(None),
        }
    }

    pub fn with_replay_horizon(mut self, seq: u64) -> Self {
        self.replay_horizon = seq;
        self
    }

    /// Fail the execution once the invocation returns, whatever it returns.
    ///
    /// The first poison wins.
    pub fn poison(&self, err: ProxyError) {
        let mut poisoned = self.poisoned.lock();
        if poisoned.is_none() {
            *poisoned = Some(err);
        }
    }

    pub fn poisoned(&self) -> Option<ProxyError> {
        self.poisoned.lock().clone()
    }
}

/// An activity invocation running in a client library.
#[derive(Debug)]
pub struct ActivityContext {
    pub key: ContextKey,
    pub activity_type: String,
    pub task_token: String,
    pub cancel: CancellationToken,
}

/// Live execution contexts across all sessions.
pub struct ProxyContexts {
    pub workflows: Registry<ContextKey, WorkflowContext>,
    pub activities: Registry<ContextKey, ActivityContext>,
    pub context_ids: IdGenerator,
}

impl Default for ProxyContexts {
    fn default() -> Self {
        Self {
            workflows: Registry::new("workflow"),
            activities: Registry::new("activity"),
            context_ids: IdGenerator::new(),
        }
    }
}

impl ProxyContexts {
    /// Drop every context owned by `client_id`, cancelling each one.
    ///
    /// Returns the number of contexts removed.
    pub fn remove_client(&self, client_id: i64) -> usize {
        let workflows = self
            .workflows
            .remove_where(|key, _| key.client_id == client_id);
        let activities = self
            .activities
            .remove_where(|key, _| key.client_id == client_id);
        for context in &workflows {
            context.cancel.cancel();
        }
        for context in &activities {
            context.cancel.cancel();
        }
        workflows.len() + activities.len()
    }
}

/// Shared state for proxy handlers.
pub struct ProxyState {
    pub engine: Arc<dyn Engine>,
    pub config: ProxyConfig,
    pub client_ids: IdGenerator,
    pub contexts: Arc<ProxyContexts>,
    /// Cancelled when a client asks the proxy to terminate
    pub shutdown: CancellationToken,
}

impl ProxyState {
    pub fn new(engine: Arc<dyn Engine>, config: ProxyConfig) -> Self {
        Self {
            engine,
            config,
            client_ids: IdGenerator::new(),
            contexts: Arc::new(ProxyContexts::default()),
            shutdown: CancellationToken::new(),
        }
    }
}
