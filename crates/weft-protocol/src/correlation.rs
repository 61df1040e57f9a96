// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pending-operation table for outbound requests.
//!
//! Each outbound request gets the next ID from a monotonic counter and one
//! pending entry holding the completion for its caller. An entry is removed
//! exactly once: by the matching reply, by its deadline, by caller
//! cancellation, or by connection failure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::envelope::Envelope;
use crate::error::ProtocolError;
use crate::kind::MessageKind;

/// Completion delivered to the caller awaiting a request.
pub type Completion = Result<Envelope, ProtocolError>;

struct PendingOperation {
    kind: MessageKind,
    created: Instant,
    complete: oneshot::Sender<Completion>,
}

/// A registered request awaiting its reply.
pub struct Registration {
    pub request_id: u64,
    /// `None` for requests that wait until replied to or cancelled
    pub deadline: Option<Instant>,
    pub receiver: oneshot::Receiver<Completion>,
}

/// Correlation registry keyed by request ID.
pub struct PendingOperations {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingOperation>>,
}

impl Default for PendingOperations {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingOperations {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the next request ID and store its pending entry.
    pub fn register(&self, kind: MessageKind, timeout: Option<Duration>) -> Registration {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let created = Instant::now();
        let deadline = timeout.and_then(|t| created.checked_add(t));
        let (complete, receiver) = oneshot::channel();

        self.pending.lock().insert(
            request_id,
            PendingOperation {
                kind,
                created,
                complete,
            },
        );

        Registration {
            request_id,
            deadline,
            receiver,
        }
    }

    /// Allocate an ID for a request that expects no tracked reply.
    pub fn next_untracked_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Complete the pending entry for `request_id` with a reply.
    ///
    /// Returns `false` when no entry exists, which is expected after a local
    /// timeout or cancellation already removed it.
    pub fn resolve(&self, request_id: u64, reply: Envelope) -> bool {
        let Some(op) = self.pending.lock().remove(&request_id) else {
            debug!(request_id, kind = %reply.kind, "dropping reply for unknown request");
            return false;
        };
        debug!(
            request_id,
            kind = %op.kind,
            elapsed_ms = op.created.elapsed().as_millis() as u64,
            "reply resolved"
        );
        if op.complete.send(Ok(reply)).is_err() {
            debug!(request_id, "caller went away before reply arrived");
        }
        true
    }

    /// Remove an entry without completing it. Returns whether it existed.
    pub fn remove(&self, request_id: u64) -> bool {
        self.pending.lock().remove(&request_id).is_some()
    }

    /// Complete every pending entry with an error produced by `error`.
    pub fn fail_all(&self, error: impl Fn() -> ProtocolError) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (_, op) in drained {
            let _ = op.complete.send(Err(error()));
        }
        count
    }

    pub fn contains(&self, request_id: u64) -> bool {
        self.pending.lock().contains_key(&request_id)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_ids_are_unique_and_monotonic() {
        let ops = PendingOperations::new();
        let a = ops.register(MessageKind::PingRequest, Some(Duration::from_secs(1)));
        let b = ops.register(MessageKind::PingRequest, Some(Duration::from_secs(1)));
        assert!(b.request_id > a.request_id);
        assert_eq!(ops.len(), 2);
    }

    #[test]
    fn test_ids_unique_across_threads() {
        let ops = Arc::new(PendingOperations::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ops = ops.clone();
                std::thread::spawn(move || {
                    (0..250)
                        .map(|_| {
                            ops.register(MessageKind::PingRequest, Some(Duration::from_secs(5)))
                                .request_id
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "request id {} reused", id);
            }
        }
        assert_eq!(ops.len(), 2_000);
    }

    #[tokio::test]
    async fn test_resolve_exactly_once() {
        let ops = PendingOperations::new();
        let registration = ops.register(MessageKind::PingRequest, Some(Duration::from_secs(1)));
        let id = registration.request_id;

        assert!(ops.resolve(id, Envelope::new(MessageKind::PingReply)));
        assert!(!ops.resolve(id, Envelope::new(MessageKind::PingReply)));
        assert!(ops.is_empty());

        let reply = registration.receiver.await.unwrap().unwrap();
        assert_eq!(reply.kind, MessageKind::PingReply);
    }

    #[test]
    fn test_resolve_unknown_id_is_dropped() {
        let ops = PendingOperations::new();
        assert!(!ops.resolve(999, Envelope::new(MessageKind::PingReply)));
    }

    #[tokio::test]
    async fn test_fail_all_completes_every_entry() {
        let ops = PendingOperations::new();
        let a = ops.register(MessageKind::PingRequest, Some(Duration::from_secs(1)));
        let b = ops.register(MessageKind::HeartbeatRequest, Some(Duration::from_secs(1)));

        assert_eq!(ops.fail_all(|| ProtocolError::ConnectionClosed), 2);
        assert!(ops.is_empty());
        assert!(matches!(
            a.receiver.await.unwrap(),
            Err(ProtocolError::ConnectionClosed)
        ));
        assert!(matches!(
            b.receiver.await.unwrap(),
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_remove_then_resolve() {
        let ops = PendingOperations::new();
        let registration = ops.register(MessageKind::PingRequest, Some(Duration::from_secs(1)));
        assert!(ops.remove(registration.request_id));
        assert!(!ops.remove(registration.request_id));
        assert!(!ops.resolve(
            registration.request_id,
            Envelope::new(MessageKind::PingReply)
        ));
    }
}
