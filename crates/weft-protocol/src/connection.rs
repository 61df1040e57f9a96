// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bidirectional request/reply session over a duplex byte stream.
//!
//! Either side may initiate requests at any time. A [`Connection`] is the
//! cloneable handle used to send; a [`ConnectionDriver`] owns the stream
//! halves and runs the receive loop. Inbound requests are each dispatched on
//! their own task so a slow handler never stalls delivery of unrelated
//! replies. Outbound envelopes are queued to a dedicated writer task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::correlation::{PendingOperations, Registration};
use crate::envelope::Envelope;
use crate::error::{ProtocolError, ProxyError};
use crate::frame::{FrameError, read_envelope, write_envelope};
use crate::messages::{CancelReply, CancelRequest, Message, Request, RequestMessage};
use crate::reply::{ReplyValue, build_reply};

/// Handles requests initiated by the peer.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Produce the reply envelope for `request`.
    ///
    /// The connection stamps the request ID on the returned envelope. An
    /// `Err` is a protocol failure and closes the connection.
    async fn handle(&self, request_id: u64, request: Request) -> Result<Envelope, ProtocolError>;
}

/// Connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Label used in logs ("proxy", "client", ...)
    pub role: &'static str,
    /// Default timeout for outbound requests
    pub request_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            role: "session",
            request_timeout: Duration::from_secs(30),
        }
    }
}

struct Shared {
    role: &'static str,
    request_timeout: Duration,
    outbound: mpsc::UnboundedSender<Envelope>,
    pending: PendingOperations,
    inbound: Mutex<HashMap<u64, CancellationToken>>,
    idle: Notify,
    closed: CancellationToken,
}

impl Shared {
    fn send(&self, envelope: Envelope) -> Result<(), ProtocolError> {
        if self.closed.is_cancelled() {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.outbound
            .send(envelope)
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    fn cancel_inbound(&self, request_id: u64) -> bool {
        match self.inbound.lock().get(&request_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn finish_inbound(&self, request_id: u64) {
        self.inbound.lock().remove(&request_id);
        self.idle.notify_waiters();
    }

    fn shutdown(&self) {
        self.closed.cancel();
        let failed = self.pending.fail_all(|| ProtocolError::ConnectionClosed);
        let inbound: Vec<CancellationToken> =
            self.inbound.lock().drain().map(|(_, token)| token).collect();
        for token in &inbound {
            token.cancel();
        }
        self.idle.notify_waiters();
        debug!(
            role = self.role,
            failed_pending = failed,
            cancelled_inbound = inbound.len(),
            "connection shut down"
        );
    }
}

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

/// Owns the stream halves and runs the receive and write loops.
pub struct ConnectionDriver<R, W> {
    reader: R,
    writer: W,
    outbound: mpsc::UnboundedReceiver<Envelope>,
    shared: Arc<Shared>,
}

impl Connection {
    /// Create a connection over the given stream halves.
    ///
    /// Nothing is read or written until [`ConnectionDriver::run`] is awaited.
    pub fn new<R, W>(reader: R, writer: W, config: ConnectionConfig) -> (Self, ConnectionDriver<R, W>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            role: config.role,
            request_timeout: config.request_timeout,
            outbound: tx,
            pending: PendingOperations::new(),
            inbound: Mutex::new(HashMap::new()),
            idle: Notify::new(),
            closed: CancellationToken::new(),
        });

        let connection = Self {
            shared: shared.clone(),
        };
        let driver = ConnectionDriver {
            reader,
            writer,
            outbound: rx,
            shared,
        };
        (connection, driver)
    }

    /// Enqueue an envelope for the writer task.
    pub fn send(&self, envelope: Envelope) -> Result<(), ProtocolError> {
        self.shared.send(envelope)
    }

    /// Send a request and wait for its reply using the default timeout.
    pub async fn request<M: RequestMessage>(&self, message: M) -> Result<M::Reply, ProtocolError> {
        self.request_with_timeout(message, self.shared.request_timeout)
            .await
    }

    /// Send a request and wait for its reply.
    ///
    /// Dropping the returned future removes the pending entry and sends a
    /// best-effort `CancelRequest` for it to the peer.
    pub async fn request_with_timeout<M: RequestMessage>(
        &self,
        message: M,
        timeout: Duration,
    ) -> Result<M::Reply, ProtocolError> {
        self.send_request(message, Some(timeout)).await
    }

    /// Send a request that waits until replied to, cancelled, or the
    /// connection closes. Used for long-running invocations.
    pub async fn request_unbounded<M: RequestMessage>(
        &self,
        message: M,
    ) -> Result<M::Reply, ProtocolError> {
        self.send_request(message, None).await
    }

    async fn send_request<M: RequestMessage>(
        &self,
        message: M,
        timeout: Option<Duration>,
    ) -> Result<M::Reply, ProtocolError> {
        let Registration {
            request_id,
            deadline,
            receiver,
        } = self.shared.pending.register(M::KIND, timeout);
        let mut guard = PendingGuard {
            shared: &self.shared,
            request_id,
            armed: true,
        };

        let mut envelope = message.into_envelope();
        envelope.set_request_id(request_id);
        if let Err(e) = self.send(envelope) {
            guard.armed = false;
            self.shared.pending.remove(request_id);
            return Err(e);
        }

        let completion = match deadline {
            Some(deadline) => {
                tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), receiver).await
            }
            None => Ok(receiver.await),
        };

        match completion {
            Ok(Ok(Ok(reply))) => {
                guard.armed = false;
                M::Reply::from_envelope(reply).inspect_err(|e| {
                    error!(role = self.shared.role, request_id, error = %e, "malformed reply, closing connection");
                    self.close();
                })
            }
            Ok(Ok(Err(e))) => {
                guard.armed = false;
                Err(e)
            }
            Ok(Err(_)) => {
                guard.armed = false;
                Err(ProtocolError::ConnectionClosed)
            }
            Err(_) => {
                // Guard removes the entry and notifies the peer
                drop(guard);
                debug!(role = self.shared.role, request_id, kind = %M::KIND, "request timed out");
                Err(ProtocolError::Timeout {
                    kind: M::KIND,
                    request_id,
                    timeout_ms: timeout.map(|t| t.as_millis() as u64).unwrap_or_default(),
                })
            }
        }
    }

    /// Close the connection. Pending requests fail with `ConnectionClosed`.
    pub fn close(&self) {
        self.shared.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Wait until the connection is closed.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    /// Token cancelled when the connection closes.
    pub fn closed_token(&self) -> CancellationToken {
        self.shared.closed.clone()
    }

    /// Number of inbound requests still being handled.
    pub fn in_flight(&self) -> usize {
        self.shared.inbound.lock().len()
    }

    /// Number of outbound requests awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    /// Wait until at most `max_in_flight` inbound requests remain.
    pub async fn wait_idle(&self, max_in_flight: usize) {
        loop {
            let notified = self.shared.idle.notified();
            if self.in_flight() <= max_in_flight || self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    pub fn role(&self) -> &'static str {
        self.shared.role
    }
}

struct PendingGuard<'a> {
    shared: &'a Shared,
    request_id: u64,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed || !self.shared.pending.remove(self.request_id) {
            return;
        }
        if self.shared.closed.is_cancelled() {
            return;
        }

        let mut cancel = CancelRequest {
            target_request_id: self.request_id,
        }
        .into_envelope();
        cancel.set_request_id(self.shared.pending.next_untracked_id());
        if self.shared.send(cancel).is_err() {
            debug!(request_id = self.request_id, "could not notify peer of cancellation");
        }
    }
}

impl<R, W> ConnectionDriver<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Run the session until either side closes it.
    ///
    /// Returns `Ok(())` on an orderly close and the fatal error otherwise.
    /// On return every pending outbound request has failed and every
    /// inbound handler has been cancelled.
    pub async fn run(self, handler: Arc<dyn RequestHandler>) -> Result<(), ProtocolError> {
        let ConnectionDriver {
            mut reader,
            writer,
            outbound,
            shared,
        } = self;

        let writer_task = tokio::spawn(write_loop(writer, outbound, shared.clone()));
        let result = read_loop(&mut reader, &shared, &handler).await;

        if let Err(e) = &result {
            error!(role = shared.role, error = %e, "fatal protocol error, closing connection");
        }
        shared.shutdown();
        if let Err(e) = writer_task.await {
            warn!(role = shared.role, error = %e, "writer task failed");
        }
        result
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    reader: &mut R,
    shared: &Arc<Shared>,
    handler: &Arc<dyn RequestHandler>,
) -> Result<(), ProtocolError> {
    loop {
        let envelope = tokio::select! {
            _ = shared.closed.cancelled() => return Ok(()),
            envelope = read_envelope(reader) => envelope,
        };

        let envelope = match envelope {
            Ok(envelope) => envelope,
            Err(FrameError::ConnectionClosed) => {
                debug!(role = shared.role, "peer closed the connection");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let request_id = envelope.request_id()?;
        if envelope.kind.is_reply() {
            shared.pending.resolve(request_id, envelope);
            continue;
        }

        match Request::from_envelope(envelope)? {
            Request::Cancel(cancel) => {
                let was_cancelled = shared.cancel_inbound(cancel.target_request_id);
                debug!(
                    role = shared.role,
                    target_request_id = cancel.target_request_id,
                    was_cancelled,
                    "peer cancelled request"
                );
                let mut reply = CancelReply {
                    was_cancelled,
                    error: None,
                }
                .into_envelope();
                reply.set_request_id(request_id);
                if shared.send(reply).is_err() {
                    return Ok(());
                }
            }
            request => spawn_handler(shared.clone(), handler.clone(), request_id, request),
        }
    }
}

fn spawn_handler(
    shared: Arc<Shared>,
    handler: Arc<dyn RequestHandler>,
    request_id: u64,
    request: Request,
) {
    let kind = request.kind();
    let token = shared.closed.child_token();
    shared.inbound.lock().insert(request_id, token.clone());

    tokio::spawn(async move {
        let result = tokio::select! {
            result = handler.handle(request_id, request) => result,
            _ = token.cancelled() => build_reply(
                kind,
                Some(ProxyError::cancelled(format!("request {} cancelled", request_id))),
                ReplyValue::Empty,
            ),
        };
        shared.finish_inbound(request_id);

        match result {
            Ok(mut reply) => {
                reply.set_request_id(request_id);
                if shared.send(reply).is_err() {
                    debug!(role = shared.role, request_id, %kind, "connection closed before reply was sent");
                }
            }
            Err(e) => {
                error!(role = shared.role, request_id, %kind, error = %e, "handler failed, closing connection");
                shared.closed.cancel();
            }
        }
    });
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
    shared: Arc<Shared>,
) {
    loop {
        let envelope = tokio::select! {
            biased;
            envelope = outbound.recv() => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
            _ = shared.closed.cancelled() => break,
        };
        if let Err(e) = write_envelope(&mut writer, &envelope).await {
            warn!(role = shared.role, error = %e, "write failed, closing connection");
            shared.closed.cancel();
            return;
        }
    }

    // Flush replies queued before the close
    while let Ok(envelope) = outbound.try_recv() {
        if write_envelope(&mut writer, &envelope).await.is_err() {
            break;
        }
    }
    if let Err(e) = writer.shutdown().await {
        debug!(role = shared.role, error = %e, "writer shutdown failed");
    }
}
