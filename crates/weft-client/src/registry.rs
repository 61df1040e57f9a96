// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow and activity registration.
//!
//! Each client keeps a [`TypeRegistry`] mapping type names to the functions
//! the proxy may invoke. Functions are stored type-erased: arguments and
//! results cross the boundary as JSON payloads and are converted at the edge
//! by [`workflow_fn`] and [`activity_fn`].
//!
//! Connected clients are also tracked process-wide under a local handle ID,
//! so code that only holds the ID (for example a component completing
//! activities by task token) can reach the owning client. Client IDs are
//! assigned per proxy and are not unique within a process.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use weft_protocol::{IdGenerator, Payload, ProxyError, Registry, WorkerKind};

use crate::activity::ActivityContext;
use crate::client::{ClientShared, WeftClient};
use crate::convert::{decode, encode};
use crate::error::{ClientError, Result};
use crate::workflow::WorkflowContext;

/// Boxed future returned by registered functions.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Type-erased workflow function.
pub type WorkflowFn =
    Arc<dyn Fn(WorkflowContext, Payload) -> BoxFuture<std::result::Result<Payload, ProxyError>> + Send + Sync>;

/// Type-erased activity function.
pub type ActivityFn =
    Arc<dyn Fn(ActivityContext, Payload) -> BoxFuture<std::result::Result<Payload, ProxyError>> + Send + Sync>;

/// Wrap a typed workflow function.
///
/// Argument decoding failures are reported as `Generic` errors without
/// running the body.
pub fn workflow_fn<A, R, F, Fut>(f: F) -> WorkflowFn
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(WorkflowContext, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<R, ProxyError>> + Send + 'static,
{
    Arc::new(
        move |ctx: WorkflowContext, args: Payload| -> BoxFuture<std::result::Result<Payload, ProxyError>> {
            match decode::<A>(&args) {
                Ok(args) => {
                    let fut = f(ctx, args);
                    Box::pin(async move {
                        match fut.await {
                            Ok(result) => encode(&result).map_err(ProxyError::from),
                            Err(e) => Err(e),
                        }
                    })
                }
                Err(e) => Box::pin(async move { Err(ProxyError::from(e)) }),
            }
        },
    )
}

/// Wrap a typed activity function.
pub fn activity_fn<A, R, F, Fut>(f: F) -> ActivityFn
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(ActivityContext, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<R, ProxyError>> + Send + 'static,
{
    Arc::new(
        move |ctx: ActivityContext, args: Payload| -> BoxFuture<std::result::Result<Payload, ProxyError>> {
            match decode::<A>(&args) {
                Ok(args) => {
                    let fut = f(ctx, args);
                    Box::pin(async move {
                        match fut.await {
                            Ok(result) => encode(&result).map_err(ProxyError::from),
                            Err(e) => Err(e),
                        }
                    })
                }
                Err(e) => Box::pin(async move { Err(ProxyError::from(e)) }),
            }
        },
    )
}

/// Name-based table of the functions a client can run.
#[derive(Default)]
pub struct TypeRegistry {
    workflows: RwLock<HashMap<String, WorkflowFn>>,
    activities: RwLock<HashMap<String, ActivityFn>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow. Returns `true` when a previous registration was replaced.
    pub fn register_workflow(&self, name: impl Into<String>, f: WorkflowFn) -> bool {
        self.workflows.write().insert(name.into(), f).is_some()
    }

    /// Register an activity. Returns `true` when a previous registration was replaced.
    pub fn register_activity(&self, name: impl Into<String>, f: ActivityFn) -> bool {
        self.activities.write().insert(name.into(), f).is_some()
    }

    pub fn workflow(&self, name: &str) -> Result<WorkflowFn> {
        self.workflows
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| not_registered(WorkerKind::Workflow, name))
    }

    pub fn activity(&self, name: &str) -> Result<ActivityFn> {
        self.activities
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| not_registered(WorkerKind::Activity, name))
    }

    pub fn contains(&self, kind: WorkerKind, name: &str) -> bool {
        match kind {
            WorkerKind::Workflow => self.workflows.read().contains_key(name),
            WorkerKind::Activity => self.activities.read().contains_key(name),
        }
    }

    /// Registered names of the given kind, sorted.
    pub fn names(&self, kind: WorkerKind) -> Vec<String> {
        let mut names: Vec<String> = match kind {
            WorkerKind::Workflow => self.workflows.read().keys().cloned().collect(),
            WorkerKind::Activity => self.activities.read().keys().cloned().collect(),
        };
        names.sort();
        names
    }
}

fn not_registered(kind: WorkerKind, name: &str) -> ClientError {
    ClientError::NotRegistered {
        kind,
        name: name.to_string(),
    }
}

// ============================================================================
// Process-wide client table
// ============================================================================

static HANDLE_IDS: IdGenerator = IdGenerator::new();

/// Connected clients by handle ID.
static CLIENTS: Lazy<Registry<i64, ClientShared>> = Lazy::new(|| Registry::new("client"));

pub(crate) fn next_handle_id() -> i64 {
    HANDLE_IDS.next_id()
}

pub(crate) fn track_client(handle_id: i64, shared: Arc<ClientShared>) -> Result<()> {
    CLIENTS.add(handle_id, shared)?;
    Ok(())
}

pub(crate) fn untrack_client(handle_id: i64) {
    if CLIENTS.remove(handle_id).is_err() {
        tracing::debug!(handle_id, "client already untracked");
    }
}

/// Look up a connected client by its [`WeftClient::handle_id`].
pub fn lookup_client(handle_id: i64) -> Result<WeftClient> {
    Ok(WeftClient::from_shared(CLIENTS.get(handle_id)?))
}

/// Number of connected clients in this process.
pub fn connected_clients() -> usize {
    CLIENTS.len()
}

/// Forget every tracked client. Only for test harness resets.
#[doc(hidden)]
pub fn reset() {
    CLIENTS.clear();
    HANDLE_IDS.reset();
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_missing_type_is_not_registered() {
        let registry = TypeRegistry::new();
        assert!(matches!(
            registry.workflow("greet"),
            Err(ClientError::NotRegistered { kind: WorkerKind::Workflow, ref name }) if name == "greet"
        ));
        assert!(matches!(
            registry.activity("charge"),
            Err(ClientError::NotRegistered { kind: WorkerKind::Activity, .. })
        ));
    }

    #[test]
    fn test_registration_is_per_kind() {
        let registry = TypeRegistry::new();
        let f = activity_fn(|_ctx: ActivityContext, s: String| async move { Ok::<_, ProxyError>(s) });
        assert!(!registry.register_activity("echo", f.clone()));
        assert!(registry.register_activity("echo", f));

        assert!(registry.contains(WorkerKind::Activity, "echo"));
        assert!(!registry.contains(WorkerKind::Workflow, "echo"));
        assert_eq!(registry.names(WorkerKind::Activity), vec!["echo".to_string()]);
        assert!(registry.names(WorkerKind::Workflow).is_empty());
    }

    #[tokio::test]
    async fn test_typed_wrapper_rejects_bad_arguments() {
        let registry = TypeRegistry::new();
        registry.register_activity(
            "double",
            activity_fn(|_ctx: ActivityContext, n: u32| async move { Ok::<_, ProxyError>(n * 2) }),
        );
        let f = registry.activity("double").unwrap();

        let ctx = ActivityContext::detached("token-1");
        let result = f(ctx.clone(), Some(Bytes::from_static(b"21"))).await.unwrap();
        assert_eq!(result.as_deref(), Some(&b"42"[..]));

        let err = f(ctx, Some(Bytes::from_static(b"\"x\""))).await.unwrap_err();
        assert_eq!(err.kind, weft_protocol::ErrorKind::Generic);
        assert!(err.message.contains("serialization error"));
    }
}
