// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Weft Protocol - session protocol between the proxy and client libraries
//!
//! A client library and the weft proxy share one long-lived, bidirectional
//! session. Either side may initiate requests; every request gets exactly
//! one reply carrying the same request ID.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      weft-protocol                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Session: Connection + PendingOperations (correlation)      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Messages: typed request/reply pairs, Envelope codec        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Framing: length + kind prefixed frames                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: QUIC bidirectional stream (quinn)               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Message families
//!
//! - Client (1-99): initialize, connect, heartbeat, terminate, cancel, ping
//! - Namespace (101-199): register, describe, update, list
//! - Worker (201-299): new/stop worker, workflow and activity registration
//! - Workflow (301-499): client API, proxy callbacks, workflow decisions
//! - Activity (501-599): invoke, stopping, heartbeat, external completion
//!
//! # Usage
//!
//! ```ignore
//! use weft_protocol::{Connection, ConnectionConfig, WeftTransport, WeftTransportConfig};
//! use weft_protocol::messages::PingRequest;
//!
//! let transport = WeftTransport::new(WeftTransportConfig {
//!     dangerous_skip_cert_verification: true,
//!     ..Default::default()
//! })?;
//! let (reader, writer) = transport.open_session().await?;
//! let (connection, driver) = Connection::new(reader, writer, ConnectionConfig::default());
//! tokio::spawn(driver.run(handler));
//!
//! connection.request(PingRequest {}).await?;
//! ```

pub mod client;
pub mod connection;
pub mod context;
pub mod correlation;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod kind;
pub mod messages;
pub mod reply;
pub mod server;

// Re-export main types
pub use client::{TransportError, WeftTransport, WeftTransportConfig};
pub use connection::{Connection, ConnectionConfig, ConnectionDriver, RequestHandler};
pub use context::{ContextError, ContextKey, IdGenerator, Registry};
pub use correlation::PendingOperations;
pub use envelope::{Envelope, EnvelopeField, Json, Payload};
pub use error::{ErrorKind, ProtocolError, ProxyError};
pub use frame::{Frame, FrameError};
pub use kind::{Direction, Family, MessageKind};
pub use messages::{Message, ReplyMessage, Reply, Request, RequestMessage, WorkerKind};
pub use reply::{ReplyValue, build_reply};
pub use server::{ConnectionHandler, ServerError, SessionStream, WeftServer, WeftServerConfig};
