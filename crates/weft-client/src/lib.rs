// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Weft Client - run workflows and activities behind the weft proxy
//!
//! The client library holds the business logic; the proxy owns history and
//! decides what every workflow call returns. One session connects them and
//! either side may send requests on it.
//!
//! # Quick Start
//!
//! ```ignore
//! use weft_client::{ClientConfig, StartWorkflowOptions, WeftClient, WorkerKind, WorkflowContext};
//! use weft_protocol::ProxyError;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = WeftClient::connect(ClientConfig::from_env()?).await?;
//!     client.use_namespace("orders").await?;
//!
//!     client
//!         .register_activity("greet", |_ctx, name: String| async move {
//!             Ok::<_, ProxyError>(format!("hello {}", name))
//!         })
//!         .await?;
//!     client
//!         .register_workflow("greeting", |ctx: WorkflowContext, name: String| async move {
//!             let greeting: String = ctx.execute_activity("greet", &name).await?;
//!             Ok::<_, ProxyError>(greeting)
//!         })
//!         .await?;
//!     client.new_worker(None, "greetings", WorkerKind::Workflow).await?;
//!     client.new_worker(None, "greetings", WorkerKind::Activity).await?;
//!
//!     let greeting: String = client
//!         .execute_workflow(StartWorkflowOptions::new("greetings"), "greeting", "weft")
//!         .await?;
//!     println!("{}", greeting);
//!     Ok(())
//! }
//! ```
//!
//! # Replay
//!
//! Workflow code must be deterministic. Every call on [`WorkflowContext`]
//! that can differ between runs (activities, timers, side effects, time,
//! UUIDs, version markers, child workflows, signals) is numbered in call
//! order and answered from history when an execution is replayed on another
//! worker. [`WorkflowContext::is_replaying`] tells workflow code whether it is
//! currently catching up.
//!
//! # Liveness
//!
//! A background task sends `Heartbeat` every `heartbeat_interval_ms`. If no
//! heartbeat succeeds within `heartbeat_deadline_ms` the session is closed and
//! every running workflow and activity in this client is cancelled.
//!
//! # Configuration
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `WEFT_PROXY_ADDR` | `127.0.0.1:7933` | Proxy address |
//! | `WEFT_SERVER_NAME` | `localhost` | TLS server name |
//! | `WEFT_SKIP_CERT_VERIFICATION` | `false` | Accept self-signed certificates |
//! | `WEFT_CONNECT_TIMEOUT_MS` | `10000` | Connection timeout |
//! | `WEFT_REQUEST_TIMEOUT_MS` | `30000` | Default request timeout |
//! | `WEFT_HEARTBEAT_INTERVAL_MS` | `1000` | Heartbeat interval (0 disables) |
//! | `WEFT_HEARTBEAT_DEADLINE_MS` | `60000` | Close the session after this long without a heartbeat reply |
//! | `WEFT_IDENTITY` | | Identity reported to the proxy |

mod activity;
mod client;
mod config;
mod convert;
mod dispatch;
mod error;
mod registry;
mod workflow;

pub use activity::{ActivityContext, ActivityInfo};
pub use client::{
    NamespaceChanges, NamespaceRegistration, StartWorkflowOptions, WeftClient, WorkerLease,
    WorkflowDescription, WorkflowExecution,
};
pub use config::ClientConfig;
pub use convert::{decode, encode};
pub use error::{ClientError, Result};
pub use registry::{
    ActivityFn, BoxFuture, TypeRegistry, WorkflowFn, activity_fn, connected_clients,
    lookup_client, reset, workflow_fn,
};
pub use workflow::{
    ActivityOptions, ChildWorkflow, ChildWorkflowOptions, WorkflowContext, WorkflowInfo,
};

// Re-export protocol types used in the public API
pub use weft_protocol::messages::NamespaceInfo;
pub use weft_protocol::{ErrorKind, Payload, ProxyError, WorkerKind};
