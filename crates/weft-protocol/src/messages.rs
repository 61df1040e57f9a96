// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed request and reply messages.
//!
//! Every operation defines one request struct and one reply struct. Replies
//! always carry an optional [`ProxyError`]; the correlation ID lives on the
//! envelope and is managed by [`crate::connection::Connection`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::envelope::{Envelope, EnvelopeField, Json, Payload};
use crate::error::{ProtocolError, ProxyError};
use crate::kind::MessageKind;

/// A typed message that maps to exactly one [`MessageKind`].
pub trait Message: Sized + Send + 'static {
    const KIND: MessageKind;

    fn into_envelope(self) -> Envelope;

    fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError>;
}

/// A request message and the reply it expects.
pub trait RequestMessage: Message + Into<Request> {
    type Reply: ReplyMessage;
}

/// A reply message.
pub trait ReplyMessage: Message + Into<Reply> {
    fn error(&self) -> Option<&ProxyError>;

    fn take_error(&mut self) -> Option<ProxyError>;

    /// Split the reply into its value or its carried error.
    fn into_result(mut self) -> Result<Self, ProxyError> {
        match self.take_error() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

fn expect_kind(envelope: &Envelope, expected: MessageKind) -> Result<(), ProtocolError> {
    if envelope.kind == expected {
        Ok(())
    } else {
        Err(ProtocolError::UnexpectedKind {
            expected,
            actual: envelope.kind,
        })
    }
}

macro_rules! protocol {
    ( $(
        $(#[$op_meta:meta])*
        $op:ident {
            request $req:ident { $( $(#[$rq_meta:meta])* $rq_field:ident : $rq_ty:ty ),* $(,)? }
            reply $rep:ident { $( $(#[$rp_meta:meta])* $rp_field:ident : $rp_ty:ty ),* $(,)? }
        }
    )* ) => {
        $(
            $(#[$op_meta])*
            #[derive(Debug, Clone, Default, PartialEq)]
            pub struct $req {
                $( $(#[$rq_meta])* pub $rq_field: $rq_ty, )*
            }

            #[doc = concat!("Reply to [`", stringify!($req), "`].")]
            #[derive(Debug, Clone, Default, PartialEq)]
            pub struct $rep {
                $( $(#[$rp_meta])* pub $rp_field: $rp_ty, )*
                pub error: Option<ProxyError>,
            }

            impl Message for $req {
                const KIND: MessageKind = MessageKind::$req;

                fn into_envelope(self) -> Envelope {
                    #[allow(unused_mut)]
                    let mut envelope = Envelope::new(Self::KIND);
                    $( EnvelopeField::put(self.$rq_field, stringify!($rq_field), &mut envelope); )*
                    envelope
                }

                #[allow(unused_mut)]
                fn from_envelope(mut envelope: Envelope) -> Result<Self, ProtocolError> {
                    expect_kind(&envelope, Self::KIND)?;
                    Ok(Self {
                        $( $rq_field: EnvelopeField::take(stringify!($rq_field), &mut envelope)?, )*
                    })
                }
            }

            impl Message for $rep {
                const KIND: MessageKind = MessageKind::$rep;

                fn into_envelope(self) -> Envelope {
                    let mut envelope = Envelope::new(Self::KIND);
                    $( EnvelopeField::put(self.$rp_field, stringify!($rp_field), &mut envelope); )*
                    EnvelopeField::put(self.error, crate::envelope::ERROR, &mut envelope);
                    envelope
                }

                fn from_envelope(mut envelope: Envelope) -> Result<Self, ProtocolError> {
                    expect_kind(&envelope, Self::KIND)?;
                    let error: Option<ProxyError> =
                        EnvelopeField::take(crate::envelope::ERROR, &mut envelope)?;
                    // Fields of a failed reply are not required to be present
                    if error.is_some() {
                        return Ok(Self { error, ..Default::default() });
                    }
                    Ok(Self {
                        $( $rp_field: EnvelopeField::take(stringify!($rp_field), &mut envelope)?, )*
                        error,
                    })
                }
            }

            impl RequestMessage for $req {
                type Reply = $rep;
            }

            impl ReplyMessage for $rep {
                fn error(&self) -> Option<&ProxyError> {
                    self.error.as_ref()
                }

                fn take_error(&mut self) -> Option<ProxyError> {
                    self.error.take()
                }
            }

            impl From<$req> for Request {
                fn from(message: $req) -> Self {
                    Request::$op(message)
                }
            }

            impl From<$rep> for Reply {
                fn from(message: $rep) -> Self {
                    Reply::$op(message)
                }
            }
        )*

        /// Any request, decoded.
        #[derive(Debug, Clone, PartialEq)]
        pub enum Request {
            $( $op($req), )*
        }

        impl Request {
            pub fn kind(&self) -> MessageKind {
                match self {
                    $( Request::$op(_) => MessageKind::$req, )*
                }
            }

            pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
                match envelope.kind {
                    $( MessageKind::$req => Ok(Request::$op($req::from_envelope(envelope)?)), )*
                    other => Err(ProtocolError::UnexpectedKind {
                        expected: other.request_kind().unwrap_or(other),
                        actual: other,
                    }),
                }
            }

            pub fn into_envelope(self) -> Envelope {
                match self {
                    $( Request::$op(message) => message.into_envelope(), )*
                }
            }
        }

        /// Any reply, decoded.
        #[derive(Debug, Clone, PartialEq)]
        pub enum Reply {
            $( $op($rep), )*
        }

        impl Reply {
            pub fn kind(&self) -> MessageKind {
                match self {
                    $( Reply::$op(_) => MessageKind::$rep, )*
                }
            }

            pub fn error(&self) -> Option<&ProxyError> {
                match self {
                    $( Reply::$op(message) => message.error.as_ref(), )*
                }
            }

            pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
                match envelope.kind {
                    $( MessageKind::$rep => Ok(Reply::$op($rep::from_envelope(envelope)?)), )*
                    other => Err(ProtocolError::UnexpectedKind {
                        expected: other.reply_kind().unwrap_or(other),
                        actual: other,
                    }),
                }
            }

            pub fn into_envelope(self) -> Envelope {
                match self {
                    $( Reply::$op(message) => message.into_envelope(), )*
                }
            }

            /// The default reply for a request kind, optionally carrying an error.
            ///
            /// Fails for reply kinds: there is no reply to a reply.
            pub fn for_request(
                request_kind: MessageKind,
                error: Option<ProxyError>,
            ) -> Result<Self, ProtocolError> {
                match request_kind {
                    $( MessageKind::$req => Ok(Reply::$op($rep { error, ..Default::default() })), )*
                    other => Err(ProtocolError::NoReplyKind(other)),
                }
            }
        }
    };
}

// ============================================================================
// Shared field types
// ============================================================================

/// Which kind of tasks a worker polls for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerKind {
    #[default]
    Workflow,
    Activity,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerKind::Workflow => f.write_str("workflow"),
            WorkerKind::Activity => f.write_str("activity"),
        }
    }
}

impl FromStr for WorkerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "workflow" => Ok(WorkerKind::Workflow),
            "activity" => Ok(WorkerKind::Activity),
            other => Err(format!("unknown worker kind '{}'", other)),
        }
    }
}

impl EnvelopeField for WorkerKind {
    fn put(self, name: &'static str, envelope: &mut Envelope) {
        envelope.set_property(name, self.to_string());
    }

    fn take(name: &'static str, envelope: &mut Envelope) -> Result<Self, ProtocolError> {
        let raw = envelope.take_property(name).ok_or(ProtocolError::MissingField {
            kind: envelope.kind,
            field: name,
        })?;
        raw.parse().map_err(|_| ProtocolError::InvalidField {
            kind: envelope.kind,
            field: name,
            value: raw,
        })
    }
}

/// Namespace description as reported by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceInfo {
    pub name: String,
    pub description: String,
    pub owner_email: String,
    pub status: String,
    pub retention_days: u32,
}

// ============================================================================
// Message definitions
// ============================================================================

protocol! {
    // ========== Client ==========

    /// Session handshake carrying the client's callback endpoint.
    Initialize {
        request InitializeRequest {
            library_address: String,
            library_port: u32,
            identity: Option<String>,
        }
        reply InitializeReply {
            /// Proxy-assigned ID for this session
            client_id: i64,
        }
    }

    /// Pin session defaults used when requests omit them.
    Connect {
        request ConnectRequest {
            namespace: Option<String>,
            identity: Option<String>,
        }
        reply ConnectReply {}
    }

    /// Periodic liveness probe.
    Heartbeat {
        request HeartbeatRequest {}
        reply HeartbeatReply {}
    }

    /// Ask the proxy to drain in-flight work and exit.
    Terminate {
        request TerminateRequest {}
        reply TerminateReply {}
    }

    /// Cancel an in-flight request previously sent by the same side.
    Cancel {
        request CancelRequest {
            target_request_id: u64,
        }
        reply CancelReply {
            was_cancelled: bool,
        }
    }

    /// On-demand round trip.
    Ping {
        request PingRequest {}
        reply PingReply {}
    }

    // ========== Namespace ==========

    NamespaceRegister {
        request NamespaceRegisterRequest {
            name: String,
            description: Option<String>,
            owner_email: Option<String>,
            retention_days: u32,
        }
        reply NamespaceRegisterReply {}
    }

    NamespaceDescribe {
        request NamespaceDescribeRequest {
            name: String,
        }
        reply NamespaceDescribeReply {
            name: String,
            description: String,
            owner_email: String,
            status: String,
            retention_days: u32,
        }
    }

    NamespaceUpdate {
        request NamespaceUpdateRequest {
            name: String,
            description: Option<String>,
            owner_email: Option<String>,
            retention_days: Option<u32>,
        }
        reply NamespaceUpdateReply {}
    }

    NamespaceList {
        request NamespaceListRequest {}
        reply NamespaceListReply {
            namespaces: Json<Vec<NamespaceInfo>>,
        }
    }

    // ========== Worker ==========

    /// Acquire a reference to the worker for `(namespace, task_queue, worker_kind)`.
    NewWorker {
        request NewWorkerRequest {
            namespace: String,
            task_queue: String,
            worker_kind: WorkerKind,
        }
        reply NewWorkerReply {
            worker_id: u64,
            ref_count: u32,
        }
    }

    /// Release a reference obtained by `NewWorker`.
    StopWorker {
        request StopWorkerRequest {
            worker_id: u64,
        }
        reply StopWorkerReply {
            ref_count: u32,
        }
    }

    WorkflowRegister {
        request WorkflowRegisterRequest {
            workflow_type: String,
        }
        reply WorkflowRegisterReply {}
    }

    ActivityRegister {
        request ActivityRegisterRequest {
            activity_type: String,
        }
        reply ActivityRegisterReply {}
    }

    // ========== Workflow client API ==========

    /// Start a workflow execution.
    WorkflowExecute {
        request WorkflowExecuteRequest {
            namespace: Option<String>,
            /// Generated by the engine when absent
            workflow_id: Option<String>,
            workflow_type: String,
            task_queue: String,
            args: Payload,
            execution_timeout_ms: Option<u64>,
        }
        reply WorkflowExecuteReply {
            workflow_id: String,
            run_id: String,
        }
    }

    /// Wait for a workflow execution to close and return its result.
    WorkflowGetResult {
        request WorkflowGetResultRequest {
            namespace: Option<String>,
            workflow_id: String,
            run_id: Option<String>,
        }
        reply WorkflowGetResultReply {
            result: Payload,
        }
    }

    WorkflowSignal {
        request WorkflowSignalRequest {
            namespace: Option<String>,
            workflow_id: String,
            run_id: Option<String>,
            signal_name: String,
            args: Payload,
        }
        reply WorkflowSignalReply {}
    }

    WorkflowQuery {
        request WorkflowQueryRequest {
            namespace: Option<String>,
            workflow_id: String,
            run_id: Option<String>,
            query_name: String,
            args: Payload,
        }
        reply WorkflowQueryReply {
            result: Payload,
        }
    }

    WorkflowCancel {
        request WorkflowCancelRequest {
            namespace: Option<String>,
            workflow_id: String,
            run_id: Option<String>,
        }
        reply WorkflowCancelReply {}
    }

    WorkflowTerminate {
        request WorkflowTerminateRequest {
            namespace: Option<String>,
            workflow_id: String,
            run_id: Option<String>,
            reason: Option<String>,
        }
        reply WorkflowTerminateReply {}
    }

    WorkflowDescribe {
        request WorkflowDescribeRequest {
            namespace: Option<String>,
            workflow_id: String,
            run_id: Option<String>,
        }
        reply WorkflowDescribeReply {
            workflow_type: String,
            task_queue: String,
            run_id: String,
            status: String,
            history_length: u64,
            start_time_ms: i64,
            close_time_ms: Option<i64>,
        }
    }

    // ========== Workflow proxy -> client ==========

    /// Run a registered workflow function in a new workflow context.
    WorkflowInvoke {
        request WorkflowInvokeRequest {
            context_id: i64,
            namespace: String,
            workflow_id: String,
            run_id: String,
            workflow_type: String,
            task_queue: String,
            args: Payload,
            /// Whether execution history was non-empty at dispatch
            replaying: bool,
            attempt: u32,
        }
        reply WorkflowInvokeReply {
            result: Payload,
        }
    }

    /// Answer a query using handlers registered by the running workflow.
    WorkflowQueryInvoke {
        request WorkflowQueryInvokeRequest {
            context_id: i64,
            query_name: String,
            args: Payload,
        }
        reply WorkflowQueryInvokeReply {
            result: Payload,
        }
    }

    /// Compute a side-effect value once, on the recording pass.
    WorkflowSideEffectInvoke {
        request WorkflowSideEffectInvokeRequest {
            context_id: i64,
            seq: u64,
        }
        reply WorkflowSideEffectInvokeReply {
            result: Payload,
        }
    }

    // ========== Workflow decisions ==========

    WorkflowExecuteActivity {
        request WorkflowExecuteActivityRequest {
            context_id: i64,
            seq: u64,
            activity_type: String,
            /// Defaults to the workflow's own task queue
            task_queue: Option<String>,
            args: Payload,
            start_to_close_timeout_ms: Option<u64>,
        }
        reply WorkflowExecuteActivityReply {
            result: Payload,
            replaying: bool,
        }
    }

    WorkflowSleep {
        request WorkflowSleepRequest {
            context_id: i64,
            seq: u64,
            duration_ms: u64,
        }
        reply WorkflowSleepReply {
            replaying: bool,
        }
    }

    WorkflowSideEffect {
        request WorkflowSideEffectRequest {
            context_id: i64,
            seq: u64,
        }
        reply WorkflowSideEffectReply {
            result: Payload,
            replaying: bool,
        }
    }

    WorkflowMutableSideEffect {
        request WorkflowMutableSideEffectRequest {
            context_id: i64,
            seq: u64,
            mutable_id: String,
            value: Payload,
        }
        reply WorkflowMutableSideEffectReply {
            result: Payload,
            replaying: bool,
        }
    }

    WorkflowGetVersion {
        request WorkflowGetVersionRequest {
            context_id: i64,
            seq: u64,
            change_id: String,
            min_supported: i32,
            max_supported: i32,
        }
        reply WorkflowGetVersionReply {
            version: i32,
            replaying: bool,
        }
    }

    WorkflowExecuteChild {
        request WorkflowExecuteChildRequest {
            context_id: i64,
            seq: u64,
            workflow_type: String,
            workflow_id: Option<String>,
            task_queue: Option<String>,
            args: Payload,
        }
        reply WorkflowExecuteChildReply {
            result: Payload,
            child_workflow_id: String,
            child_run_id: String,
            replaying: bool,
        }
    }

    WorkflowWaitForSignal {
        request WorkflowWaitForSignalRequest {
            context_id: i64,
            seq: u64,
            signal_name: String,
        }
        reply WorkflowWaitForSignalReply {
            result: Payload,
            replaying: bool,
        }
    }

    WorkflowGetTime {
        request WorkflowGetTimeRequest {
            context_id: i64,
            seq: u64,
        }
        reply WorkflowGetTimeReply {
            unix_ms: i64,
            replaying: bool,
        }
    }

    // ========== Activity ==========

    /// Run a registered activity function in a new activity context.
    ActivityInvoke {
        request ActivityInvokeRequest {
            context_id: i64,
            namespace: String,
            workflow_id: String,
            run_id: String,
            activity_type: String,
            task_token: String,
            args: Payload,
            attempt: u32,
        }
        reply ActivityInvokeReply {
            result: Payload,
            /// The activity will be completed later through `ActivityComplete`
            pending: bool,
        }
    }

    /// The activity's execution is being cancelled.
    ActivityStopping {
        request ActivityStoppingRequest {
            context_id: i64,
        }
        reply ActivityStoppingReply {}
    }

    ActivityRecordHeartbeat {
        request ActivityRecordHeartbeatRequest {
            task_token: String,
            details: Payload,
        }
        reply ActivityRecordHeartbeatReply {
            cancel_requested: bool,
        }
    }

    /// Complete an activity that replied `pending`.
    ActivityComplete {
        request ActivityCompleteRequest {
            task_token: String,
            result: Payload,
            failure: Option<ProxyError>,
        }
        reply ActivityCompleteReply {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_every_request_kind_has_a_typed_reply() {
        for kind in MessageKind::ALL.iter().copied().filter(|k| k.is_request()) {
            let reply = Reply::for_request(kind, None).unwrap();
            assert_eq!(Some(reply.kind()), kind.reply_kind());
        }
    }

    #[test]
    fn test_reply_kinds_have_no_reply() {
        for kind in MessageKind::ALL.iter().copied().filter(|k| k.is_reply()) {
            assert!(matches!(
                Reply::for_request(kind, None),
                Err(ProtocolError::NoReplyKind(k)) if k == kind
            ));
        }
    }

    #[test]
    fn test_request_envelope_decoding() {
        let request = WorkflowExecuteRequest {
            namespace: Some("ns-A".to_string()),
            workflow_id: None,
            workflow_type: "greet".to_string(),
            task_queue: "tq-1".to_string(),
            args: Some(Bytes::from_static(b"\"world\"")),
            execution_timeout_ms: Some(5_000),
        };
        let envelope = request.clone().into_envelope();
        assert_eq!(envelope.kind, MessageKind::WorkflowExecuteRequest);
        assert_eq!(envelope.property("workflow_type"), Some("greet"));
        assert_eq!(envelope.property("workflow_id"), None);

        match Request::from_envelope(envelope).unwrap() {
            Request::WorkflowExecute(decoded) => assert_eq!(decoded, request),
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn test_failed_reply_skips_missing_fields() {
        let mut envelope = Envelope::new(MessageKind::NewWorkerReply);
        EnvelopeField::put(
            Some(ProxyError::generic("no such namespace")),
            crate::envelope::ERROR,
            &mut envelope,
        );

        let reply = NewWorkerReply::from_envelope(envelope).unwrap();
        assert_eq!(reply.worker_id, 0);
        assert_eq!(
            reply.into_result().unwrap_err(),
            ProxyError::generic("no such namespace")
        );
    }

    #[test]
    fn test_successful_reply_requires_fields() {
        let envelope = Envelope::new(MessageKind::NewWorkerReply);
        let err = NewWorkerReply::from_envelope(envelope).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField { .. }));
    }

    #[test]
    fn test_wrong_kind_is_rejected() {
        let envelope = PingRequest {}.into_envelope();
        let err = HeartbeatRequest::from_envelope(envelope).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnexpectedKind {
                expected: MessageKind::HeartbeatRequest,
                actual: MessageKind::PingRequest
            }
        ));
    }

    #[test]
    fn test_request_from_reply_envelope_fails() {
        let envelope = PingReply::default().into_envelope();
        assert!(Request::from_envelope(envelope).is_err());
    }

    #[test]
    fn test_namespace_list_json_field() {
        let reply = NamespaceListReply {
            namespaces: Json(vec![NamespaceInfo {
                name: "ns-A".to_string(),
                status: "Registered".to_string(),
                retention_days: 14,
                ..Default::default()
            }]),
            error: None,
        };
        let decoded = NamespaceListReply::from_envelope(reply.clone().into_envelope()).unwrap();
        assert_eq!(decoded, reply);
    }
}
