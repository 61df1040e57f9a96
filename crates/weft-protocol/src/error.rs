// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types shared by both ends of a session.
//!
//! [`ProxyError`] travels on the wire inside replies. [`ProtocolError`] is
//! local: malformed frames, unknown kinds and closed connections never cross
//! the wire and are fatal to the connection that produced them.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::FrameError;
use crate::kind::MessageKind;

/// Error taxonomy carried on every reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The operation or execution was cancelled
    Cancelled,
    /// Raised by application code
    Custom,
    /// Anything else, including engine and internal failures
    Generic,
    /// Unexpected fault while running a workflow or activity body
    Panic,
    /// The execution was terminated
    Terminated,
    /// A deadline elapsed
    Timeout,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Custom => "custom",
            ErrorKind::Generic => "generic",
            ErrorKind::Panic => "panic",
            ErrorKind::Terminated => "terminated",
            ErrorKind::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Error carried in the `error` property of a reply.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind} error: {message}")]
pub struct ProxyError {
    pub kind: ErrorKind,
    pub message: String,
    /// Optional application-supplied details (for example a serialized payload)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ProxyError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn custom(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Custom, message)
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Generic, message)
    }

    pub fn panic(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Panic, message)
    }

    pub fn terminated(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Terminated, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Local transport and protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("expected {expected}, received {actual}")]
    UnexpectedKind {
        expected: MessageKind,
        actual: MessageKind,
    },

    #[error("{kind} is missing required field '{field}'")]
    MissingField {
        kind: MessageKind,
        field: &'static str,
    },

    #[error("{kind} has invalid value for '{field}': {value}")]
    InvalidField {
        kind: MessageKind,
        field: &'static str,
        value: String,
    },

    #[error("{0} has no reply kind")]
    NoReplyKind(MessageKind),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request {request_id} ({kind}) timed out after {timeout_ms}ms")]
    Timeout {
        kind: MessageKind,
        request_id: u64,
        timeout_ms: u64,
    },

    #[error("request cancelled")]
    Cancelled,
}

impl ProtocolError {
    /// Whether this error must tear down the connection that observed it.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ProtocolError::Timeout { .. } | ProtocolError::Cancelled
        )
    }
}

impl From<ProtocolError> for ProxyError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Timeout { .. } => ProxyError::timeout(err.to_string()),
            ProtocolError::Cancelled => ProxyError::cancelled(err.to_string()),
            other => ProxyError::generic(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_error_json_shape() {
        let err = ProxyError::custom("boom");
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(json, r#"{"kind":"Custom","message":"boom"}"#);

        let with_details = ProxyError::generic("x").with_details("d");
        let back: ProxyError =
            serde_json::from_str(&serde_json::to_string(&with_details).unwrap()).unwrap();
        assert_eq!(back, with_details);
    }

    #[test]
    fn test_protocol_error_fatality() {
        assert!(ProtocolError::ConnectionClosed.is_fatal());
        assert!(ProtocolError::NoReplyKind(MessageKind::PingReply).is_fatal());
        assert!(!ProtocolError::Cancelled.is_fatal());
        assert!(
            !ProtocolError::Timeout {
                kind: MessageKind::PingRequest,
                request_id: 1,
                timeout_ms: 10
            }
            .is_fatal()
        );
    }

    #[test]
    fn test_timeout_maps_to_timeout_kind() {
        let err: ProxyError = ProtocolError::Timeout {
            kind: MessageKind::HeartbeatRequest,
            request_id: 7,
            timeout_ms: 100,
        }
        .into();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(err.message.contains("request 7"));
    }
}
