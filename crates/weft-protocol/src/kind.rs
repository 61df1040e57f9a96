// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message kinds and their request/reply pairing.
//!
//! Kinds are partitioned into disjoint numeric ranges per family. Within a
//! family every request kind is odd and its reply kind is the next even value.

use std::fmt;

use crate::frame::FrameError;

/// Message family, derived from the numeric range of a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// 1-99: session management (initialize, heartbeat, cancel, ...)
    Client,
    /// 101-199: namespace administration
    Namespace,
    /// 201-299: worker and type registration
    Worker,
    /// 301-499: workflow client API, proxy callbacks and decisions
    Workflow,
    /// 501-599: activity execution
    Activity,
}

/// Which side of the session may initiate a request kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Sent by the client library, handled by the proxy
    ClientToProxy,
    /// Sent by the proxy, handled by the client library
    ProxyToClient,
    /// Either side may send it
    Both,
}

macro_rules! message_kinds {
    ( $( $(#[$meta:meta])* $name:ident = $value:literal ),+ $(,)? ) => {
        /// Wire message kind.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u32)]
        pub enum MessageKind {
            $( $(#[$meta])* $name = $value, )+
        }

        impl MessageKind {
            /// Every defined kind, in wire order.
            pub const ALL: &'static [MessageKind] = &[ $( MessageKind::$name, )+ ];

            /// Name of the kind as used in logs.
            pub fn name(self) -> &'static str {
                match self {
                    $( MessageKind::$name => stringify!($name), )+
                }
            }
        }

        impl TryFrom<u32> for MessageKind {
            type Error = FrameError;

            fn try_from(value: u32) -> Result<Self, Self::Error> {
                match value {
                    $( $value => Ok(MessageKind::$name), )+
                    _ => Err(FrameError::InvalidMessageType(value)),
                }
            }
        }
    };
}

message_kinds! {
    // ========== Client ==========
    InitializeRequest = 1,
    InitializeReply = 2,
    ConnectRequest = 3,
    ConnectReply = 4,
    HeartbeatRequest = 5,
    HeartbeatReply = 6,
    TerminateRequest = 7,
    TerminateReply = 8,
    CancelRequest = 9,
    CancelReply = 10,
    PingRequest = 11,
    PingReply = 12,

    // ========== Namespace ==========
    NamespaceRegisterRequest = 101,
    NamespaceRegisterReply = 102,
    NamespaceDescribeRequest = 103,
    NamespaceDescribeReply = 104,
    NamespaceUpdateRequest = 105,
    NamespaceUpdateReply = 106,
    NamespaceListRequest = 107,
    NamespaceListReply = 108,

    // ========== Worker ==========
    NewWorkerRequest = 201,
    NewWorkerReply = 202,
    StopWorkerRequest = 203,
    StopWorkerReply = 204,
    WorkflowRegisterRequest = 205,
    WorkflowRegisterReply = 206,
    ActivityRegisterRequest = 207,
    ActivityRegisterReply = 208,

    // ========== Workflow client API ==========
    WorkflowExecuteRequest = 301,
    WorkflowExecuteReply = 302,
    WorkflowGetResultRequest = 303,
    WorkflowGetResultReply = 304,
    WorkflowSignalRequest = 305,
    WorkflowSignalReply = 306,
    WorkflowQueryRequest = 307,
    WorkflowQueryReply = 308,
    WorkflowCancelRequest = 309,
    WorkflowCancelReply = 310,
    WorkflowTerminateRequest = 311,
    WorkflowTerminateReply = 312,
    WorkflowDescribeRequest = 313,
    WorkflowDescribeReply = 314,

    // ========== Workflow proxy -> client ==========
    WorkflowInvokeRequest = 351,
    WorkflowInvokeReply = 352,
    WorkflowQueryInvokeRequest = 353,
    WorkflowQueryInvokeReply = 354,
    WorkflowSideEffectInvokeRequest = 355,
    WorkflowSideEffectInvokeReply = 356,

    // ========== Workflow decisions ==========
    WorkflowExecuteActivityRequest = 401,
    WorkflowExecuteActivityReply = 402,
    WorkflowSleepRequest = 403,
    WorkflowSleepReply = 404,
    WorkflowSideEffectRequest = 405,
    WorkflowSideEffectReply = 406,
    WorkflowMutableSideEffectRequest = 407,
    WorkflowMutableSideEffectReply = 408,
    WorkflowGetVersionRequest = 409,
    WorkflowGetVersionReply = 410,
    WorkflowExecuteChildRequest = 411,
    WorkflowExecuteChildReply = 412,
    WorkflowWaitForSignalRequest = 413,
    WorkflowWaitForSignalReply = 414,
    WorkflowGetTimeRequest = 415,
    WorkflowGetTimeReply = 416,

    // ========== Activity ==========
    ActivityInvokeRequest = 501,
    ActivityInvokeReply = 502,
    ActivityStoppingRequest = 503,
    ActivityStoppingReply = 504,
    ActivityRecordHeartbeatRequest = 505,
    ActivityRecordHeartbeatReply = 506,
    ActivityCompleteRequest = 507,
    ActivityCompleteReply = 508,
}

impl MessageKind {
    /// Family this kind belongs to.
    pub fn family(self) -> Family {
        match self as u32 {
            1..=99 => Family::Client,
            101..=199 => Family::Namespace,
            201..=299 => Family::Worker,
            301..=499 => Family::Workflow,
            _ => Family::Activity,
        }
    }

    pub fn is_request(self) -> bool {
        (self as u32) % 2 == 1
    }

    pub fn is_reply(self) -> bool {
        !self.is_request()
    }

    /// The fixed reply kind for a request kind, `None` for reply kinds.
    pub fn reply_kind(self) -> Option<MessageKind> {
        if self.is_request() {
            MessageKind::try_from(self as u32 + 1).ok()
        } else {
            None
        }
    }

    /// The request kind a reply kind answers, `None` for request kinds.
    pub fn request_kind(self) -> Option<MessageKind> {
        if self.is_reply() {
            MessageKind::try_from(self as u32 - 1).ok()
        } else {
            None
        }
    }

    /// Which side initiates this kind (for replies, the side that sent the request).
    pub fn direction(self) -> Direction {
        let request = self.request_kind().unwrap_or(self);
        match request {
            MessageKind::CancelRequest | MessageKind::PingRequest => Direction::Both,
            MessageKind::WorkflowInvokeRequest
            | MessageKind::WorkflowQueryInvokeRequest
            | MessageKind::WorkflowSideEffectInvokeRequest
            | MessageKind::ActivityInvokeRequest
            | MessageKind::ActivityStoppingRequest => Direction::ProxyToClient,
            _ => Direction::ClientToProxy,
        }
    }

    /// Name of the single result payload attachment carried by this reply kind.
    ///
    /// Reply kinds not listed here carry no result payload.
    pub fn result_field(self) -> Option<&'static str> {
        match self {
            MessageKind::WorkflowGetResultReply
            | MessageKind::WorkflowQueryReply
            | MessageKind::WorkflowInvokeReply
            | MessageKind::WorkflowQueryInvokeReply
            | MessageKind::WorkflowSideEffectInvokeReply
            | MessageKind::WorkflowExecuteActivityReply
            | MessageKind::WorkflowSideEffectReply
            | MessageKind::WorkflowMutableSideEffectReply
            | MessageKind::WorkflowExecuteChildReply
            | MessageKind::WorkflowWaitForSignalReply
            | MessageKind::ActivityInvokeReply => Some("result"),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), *self as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_every_request_has_exactly_one_reply() {
        let mut seen = HashSet::new();
        for kind in MessageKind::ALL.iter().copied().filter(|k| k.is_request()) {
            let reply = kind
                .reply_kind()
                .unwrap_or_else(|| panic!("{} has no reply kind", kind));
            assert!(reply.is_reply());
            assert_eq!(reply.request_kind(), Some(kind));
            assert_eq!(reply.family(), kind.family());
            assert!(seen.insert(reply), "{} reused as a reply kind", reply);
        }
        assert_eq!(seen.len() * 2, MessageKind::ALL.len());
    }

    #[test]
    fn test_families_are_disjoint_ranges() {
        assert_eq!(MessageKind::PingRequest.family(), Family::Client);
        assert_eq!(MessageKind::NamespaceListReply.family(), Family::Namespace);
        assert_eq!(MessageKind::NewWorkerRequest.family(), Family::Worker);
        assert_eq!(MessageKind::WorkflowGetTimeReply.family(), Family::Workflow);
        assert_eq!(MessageKind::ActivityCompleteRequest.family(), Family::Activity);
    }

    #[test]
    fn test_try_from_rejects_unknown() {
        assert_eq!(MessageKind::try_from(1).unwrap(), MessageKind::InitializeRequest);
        assert!(MessageKind::try_from(0).is_err());
        assert!(MessageKind::try_from(13).is_err());
        assert!(MessageKind::try_from(9_999).is_err());
    }

    #[test]
    fn test_direction() {
        assert_eq!(
            MessageKind::WorkflowInvokeReply.direction(),
            Direction::ProxyToClient
        );
        assert_eq!(
            MessageKind::WorkflowExecuteRequest.direction(),
            Direction::ClientToProxy
        );
        assert_eq!(MessageKind::CancelRequest.direction(), Direction::Both);
    }
}
