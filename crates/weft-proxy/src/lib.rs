// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Weft Proxy - Workflow Proxy for Client Libraries
//!
//! The proxy sits between language client libraries and a durable-execution
//! engine. Client libraries speak the weft envelope protocol over one
//! bidirectional stream per session; the proxy owns history, decides what
//! each workflow call returns and replays executions after a worker is lost.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────┐          ┌───────────────────────────┐
//! │      Client library       │          │      Client library       │
//! │  (weft-client or other)   │          │                           │
//! └─────────────┬─────────────┘          └─────────────┬─────────────┘
//!               │ session (QUIC stream)                │
//!               ▼                                      ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          weft-proxy                                 │
//! │   Session ─► dispatch ─► handlers ─► Engine                         │
//! │      ▲                                  │                           │
//! │      └──────── SessionSink ◄────────────┘  (invoke, query, stop)    │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Sessions
//!
//! Both sides may issue requests. Client requests are routed by
//! [`dispatch`]; the proxy pushes `WorkflowInvoke`, `ActivityInvoke`,
//! `WorkflowQueryInvoke`, `WorkflowSideEffectInvoke` and `ActivityStopping`
//! requests back to the client. Every request gets exactly one reply whose
//! `error` field carries any failure.
//!
//! | Family    | Operations |
//! |-----------|------------|
//! | Client    | `Initialize`, `Connect`, `Heartbeat`, `Ping`, `Cancel`, `Terminate` |
//! | Namespace | `NamespaceRegister`, `NamespaceDescribe`, `NamespaceUpdate`, `NamespaceList` |
//! | Worker    | `NewWorker`, `StopWorker`, `WorkflowRegister`, `ActivityRegister` |
//! | Workflow  | `WorkflowExecute`, `WorkflowGetResult`, `WorkflowSignal`, `WorkflowQuery`, `WorkflowCancel`, `WorkflowTerminate`, `WorkflowDescribe` and the decisions below |
//! | Activity  | `ActivityRecordHeartbeat`, `ActivityComplete` |
//!
//! # Decisions and replay
//!
//! Workflow code numbers its non-deterministic calls (activities, timers,
//! side effects, version markers, child workflows, signal waits, time). The
//! proxy records each outcome under that number. When an execution is
//! dispatched again the same numbers are answered from history and the
//! reply's `replaying` flag tells the client whether more history follows.
//! A call that contradicts history fails the execution.
//!
//! # Worker leases
//!
//! `NewWorker` is reference counted per `(namespace, task_queue, kind)`
//! within a session. The engine worker is started by the first lease and
//! stopped when the last one is released or the session closes.
//!
//! # Configuration
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `WEFT_PROXY_BIND` | `0.0.0.0` | Bind IP address |
//! | `WEFT_PROXY_PORT` | `7933` | QUIC server port |
//! | `WEFT_REQUEST_TIMEOUT_MS` | `30000` | Timeout for proxy-initiated requests |
//! | `WEFT_TERMINATE_GRACE_MS` | `5000` | Drain period after `Terminate` |
//! | `WEFT_WORKER_WAIT_MS` | `60000` | Max wait for a worker on a task queue |

/// Activity heartbeat and external completion handlers.
pub mod activity_handlers;

/// Session-level handlers (initialize, connect, heartbeat, ping, terminate).
pub mod client_handlers;

/// Proxy configuration loaded from environment variables.
pub mod config;

/// Workflow decision handlers answered from or recorded into history.
pub mod decision_handlers;

/// Request routing for a session.
pub mod dispatch;

/// Durable-execution engine abstraction and the in-memory engine.
pub mod engine;

/// Handler error type and its mapping onto reply errors.
pub mod error;

/// Namespace administration handlers.
pub mod namespace_handlers;

/// History lookup for replayed decisions.
pub mod replay;

/// Client sessions and the task sink that pushes work to them.
pub mod session;

/// Shared proxy state and execution context registries.
pub mod state;

/// Worker lease and type registration handlers.
pub mod worker_handlers;

/// Reference-counted worker leases.
pub mod workers;

/// Workflow client API handlers.
pub mod workflow_handlers;

/// QUIC server accepting client sessions.
#[cfg(feature = "server")]
pub mod server;

pub use config::ProxyConfig;
pub use engine::{Engine, MemoryEngine, MemoryEngineConfig};
pub use error::HandlerError;
pub use session::{Session, serve_session};
pub use state::ProxyState;
