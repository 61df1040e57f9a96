// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for weft-proxy.
//!
//! Provides a unified handler error that maps to reply errors. None of these
//! close the session; they are reported in the `error` field of the reply.

use thiserror::Error;
use weft_protocol::{ContextError, ErrorKind, ProxyError};

use crate::engine::EngineError;

/// Result type using HandlerError
pub type Result<T> = std::result::Result<T, HandlerError>;

/// Errors that can occur while handling a request.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum HandlerError {
    /// Worker lease ID was never issued.
    #[error("worker {0} not found")]
    WorkerNotFound(u64),

    /// Worker lease was already released to zero.
    #[error("worker {0} has already been stopped")]
    WorkerDisposed(u64),

    /// The request names an execution context that is gone.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// A non-client request arrived before `Initialize`.
    #[error("session not initialized")]
    NotInitialized,

    /// The session is draining after `Terminate`.
    #[error("session is terminating")]
    Terminating,

    /// The request was sent in the wrong direction.
    #[error("{0} is not accepted by the proxy")]
    WrongDirection(String),

    /// Input validation failed.
    #[error("invalid {field}: {message}")]
    Validation {
        /// The field that failed validation.
        field: &'static str,
        /// The validation error message.
        message: String,
    },

    /// Engine call failed.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Workflow code diverged from recorded history.
    #[error("nondeterministic workflow: {0}")]
    Nondeterministic(String),

    /// The workflow or decision was cancelled.
    #[error("{0}")]
    Cancelled(String),

    /// The client library failed a proxy-initiated request.
    #[error("client request failed: {0}")]
    Client(ProxyError),
}

impl HandlerError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::WorkerNotFound(_) => "WORKER_NOT_FOUND",
            Self::WorkerDisposed(_) => "WORKER_DISPOSED",
            Self::Context(ContextError::NotFound { .. }) => "CONTEXT_NOT_FOUND",
            Self::Context(ContextError::AlreadyExists { .. }) => "CONTEXT_ALREADY_EXISTS",
            Self::NotInitialized => "NOT_INITIALIZED",
            Self::Terminating => "TERMINATING",
            Self::WrongDirection(_) => "WRONG_DIRECTION",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Engine(EngineError::NamespaceNotFound(_)) => "NAMESPACE_NOT_FOUND",
            Self::Engine(EngineError::NamespaceAlreadyExists(_)) => "NAMESPACE_ALREADY_EXISTS",
            Self::Engine(EngineError::WorkflowNotFound { .. }) => "WORKFLOW_NOT_FOUND",
            Self::Engine(EngineError::WorkflowAlreadyStarted { .. }) => "WORKFLOW_ALREADY_STARTED",
            Self::Engine(EngineError::WorkflowNotRunning(_)) => "WORKFLOW_NOT_RUNNING",
            Self::Engine(EngineError::ActivityNotFound(_)) => "ACTIVITY_NOT_FOUND",
            Self::Engine(EngineError::QueryFailed(_)) => "QUERY_FAILED",
            Self::Engine(_) => "ENGINE_ERROR",
            Self::Nondeterministic(_) => "NONDETERMINISTIC",
            Self::Cancelled(_) => "CANCELLED",
            Self::Client(_) => "CLIENT_ERROR",
        }
    }

    /// Convert this error to the error carried on a reply.
    ///
    /// Errors raised by client code (query handlers, side-effect closures)
    /// are passed through; everything else becomes a `Generic` error with the
    /// error code in `details`.
    pub fn to_proxy_error(&self) -> ProxyError {
        match self {
            Self::Engine(EngineError::QueryFailed(err)) | Self::Client(err) => err.clone(),
            Self::Cancelled(message) => ProxyError::cancelled(message.clone()),
            other => ProxyError::new(ErrorKind::Generic, other.to_string())
                .with_details(other.error_code()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_errors_map_to_generic() {
        let err = HandlerError::from(EngineError::NamespaceNotFound("ns-A".to_string()));
        let proxy = err.to_proxy_error();
        assert_eq!(proxy.kind, ErrorKind::Generic);
        assert_eq!(proxy.message, "namespace 'ns-A' not found");
        assert_eq!(proxy.details.as_deref(), Some("NAMESPACE_NOT_FOUND"));
    }

    #[test]
    fn test_query_failure_passes_through() {
        let raised = ProxyError::custom("unknown query 'state'");
        let err = HandlerError::from(EngineError::QueryFailed(raised.clone()));
        assert_eq!(err.to_proxy_error(), raised);
    }

    #[test]
    fn test_context_not_found_code() {
        let err = HandlerError::from(ContextError::NotFound {
            registry: "workflow",
            key: "1/9".to_string(),
        });
        assert_eq!(err.error_code(), "CONTEXT_NOT_FOUND");
        assert_eq!(err.to_string(), "workflow context 1/9 not found");
    }

    #[test]
    fn test_cancelled_keeps_kind() {
        let err = HandlerError::Cancelled("sleep cancelled".to_string());
        assert_eq!(err.to_proxy_error().kind, ErrorKind::Cancelled);
        assert_eq!(
            HandlerError::WorkerDisposed(3).to_string(),
            "worker 3 has already been stopped"
        );
    }
}
