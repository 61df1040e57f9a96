// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client error types.

use thiserror::Error;
use weft_protocol::{ContextError, ProtocolError, ProxyError, TransportError, WorkerKind};

/// Errors that can occur in the client library.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The proxy answered with an error reply
    #[error(transparent)]
    Remote(#[from] ProxyError),

    /// Session-level failure (closed connection, timeout, malformed reply)
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Connecting to the proxy failed
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration error (missing or invalid environment variable)
    #[error("configuration error: {0}")]
    Config(String),

    /// No workflow or activity function is registered under this name
    #[error("{kind} type '{name}' is not registered")]
    NotRegistered { kind: WorkerKind, name: String },

    /// Arguments or results could not be converted
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A workflow or activity context is gone
    #[error("context error: {0}")]
    Context(#[from] ContextError),

    /// The client has been closed
    #[error("client is closed")]
    Closed,
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Serialization(err.to_string())
    }
}

impl From<ClientError> for ProxyError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Remote(err) => err,
            ClientError::Protocol(err) => err.into(),
            other => ProxyError::generic(other.to_string()),
        }
    }
}

impl ClientError {
    /// Whether the error means the session is no longer usable.
    pub fn is_fatal(&self) -> bool {
        match self {
            ClientError::Closed | ClientError::Transport(_) => true,
            ClientError::Protocol(err) => err.is_fatal(),
            _ => false,
        }
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;
    use weft_protocol::{ErrorKind, MessageKind};

    #[test]
    fn test_remote_error_passes_through() {
        let remote = ProxyError::custom("card declined").with_details("{\"code\":51}");
        let converted: ProxyError = ClientError::Remote(remote.clone()).into();
        assert_eq!(converted, remote);
    }

    #[test]
    fn test_local_errors_map_to_wire_kinds() {
        let timeout = ClientError::Protocol(ProtocolError::Timeout {
            kind: MessageKind::PingRequest,
            request_id: 4,
            timeout_ms: 100,
        });
        assert_eq!(ProxyError::from(timeout).kind, ErrorKind::Timeout);

        let cancelled = ClientError::Protocol(ProtocolError::Cancelled);
        assert_eq!(ProxyError::from(cancelled).kind, ErrorKind::Cancelled);

        let missing = ClientError::NotRegistered {
            kind: WorkerKind::Activity,
            name: "charge".to_string(),
        };
        let converted = ProxyError::from(missing);
        assert_eq!(converted.kind, ErrorKind::Generic);
        assert_eq!(converted.message, "activity type 'charge' is not registered");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(ClientError::Closed.is_fatal());
        assert!(ClientError::Protocol(ProtocolError::ConnectionClosed).is_fatal());
        assert!(!ClientError::Remote(ProxyError::generic("nope")).is_fatal());
        assert!(!ClientError::Serialization("bad json".to_string()).is_fatal());
    }
}
