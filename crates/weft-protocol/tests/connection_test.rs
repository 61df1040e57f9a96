// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Session behaviour tests over an in-memory duplex stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures::future::BoxFuture;
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use weft_protocol::connection::{Connection, ConnectionConfig, ConnectionDriver, RequestHandler};
use weft_protocol::envelope::Envelope;
use weft_protocol::error::{ErrorKind, ProtocolError};
use weft_protocol::frame::{read_envelope, write_envelope};
use weft_protocol::kind::MessageKind;
use weft_protocol::messages::{
    CancelRequest, Message, PingRequest, Request, WorkflowInvokeRequest,
    WorkflowSideEffectInvokeRequest, WorkflowSleepRequest,
};
use weft_protocol::reply::{ReplyValue, build_reply};

type Driver = ConnectionDriver<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;
type HandlerFn =
    dyn Fn(u64, Request) -> BoxFuture<'static, Result<Envelope, ProtocolError>> + Send + Sync;

struct FnHandler(Box<HandlerFn>);

#[async_trait]
impl RequestHandler for FnHandler {
    async fn handle(&self, request_id: u64, request: Request) -> Result<Envelope, ProtocolError> {
        (self.0)(request_id, request).await
    }
}

fn handler<F>(f: F) -> Arc<dyn RequestHandler>
where
    F: Fn(u64, Request) -> BoxFuture<'static, Result<Envelope, ProtocolError>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnHandler(Box::new(f)))
}

fn empty_replies() -> Arc<dyn RequestHandler> {
    handler(|_, request| {
        Box::pin(async move { build_reply(request.kind(), None, ReplyValue::Empty) })
    })
}

fn connected_pair() -> ((Connection, Driver), (Connection, Driver)) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    let client = Connection::new(
        a_read,
        a_write,
        ConnectionConfig {
            role: "client",
            request_timeout: Duration::from_secs(5),
        },
    );
    let proxy = Connection::new(
        b_read,
        b_write,
        ConnectionConfig {
            role: "proxy",
            request_timeout: Duration::from_secs(5),
        },
    );
    (client, proxy)
}

/// Sets its flag when dropped, which happens when a handler future is cancelled.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

fn never_replies(flag: Arc<AtomicBool>) -> Arc<dyn RequestHandler> {
    handler(move |_, _| {
        let guard = DropFlag(flag.clone());
        Box::pin(async move {
            let _guard = guard;
            futures::future::pending::<Result<Envelope, ProtocolError>>().await
        })
    })
}

async fn wait_for(flag: &AtomicBool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !flag.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("flag was never set");
}

#[tokio::test]
async fn test_ping_in_both_directions() {
    let ((client, client_driver), (proxy, proxy_driver)) = connected_pair();
    tokio::spawn(client_driver.run(empty_replies()));
    tokio::spawn(proxy_driver.run(empty_replies()));

    let reply = client.request(PingRequest {}).await.unwrap();
    assert!(reply.error.is_none());

    let reply = proxy.request(PingRequest {}).await.unwrap();
    assert!(reply.error.is_none());

    assert_eq!(client.pending_requests(), 0);
    assert_eq!(proxy.pending_requests(), 0);
}

#[tokio::test]
async fn test_out_of_order_replies_reach_their_callers() {
    let ((client, client_driver), (_proxy, proxy_driver)) = connected_pair();
    tokio::spawn(client_driver.run(empty_replies()));

    let completed = Arc::new(Mutex::new(Vec::new()));
    let proxy_handler = handler(|_, request| {
        Box::pin(async move {
            match request {
                Request::WorkflowSideEffectInvoke(invoke) => {
                    tokio::time::sleep(Duration::from_millis(invoke.seq * 40)).await;
                    build_reply(
                        MessageKind::WorkflowSideEffectInvokeRequest,
                        None,
                        ReplyValue::Payload(Some(Bytes::from(invoke.seq.to_string()))),
                    )
                }
                other => build_reply(other.kind(), None, ReplyValue::Empty),
            }
        })
    });
    tokio::spawn(proxy_driver.run(proxy_handler));

    let call = |seq: u64| {
        let client = client.clone();
        let completed = completed.clone();
        async move {
            let reply = client
                .request(WorkflowSideEffectInvokeRequest { context_id: 1, seq })
                .await
                .unwrap();
            completed.lock().await.push(seq);
            assert_eq!(reply.result, Some(Bytes::from(seq.to_string())));
        }
    };

    tokio::join!(call(3), call(2), call(1));
    assert_eq!(*completed.lock().await, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_timeout_removes_entry_and_cancels_peer_handler() {
    let ((client, client_driver), (_proxy, proxy_driver)) = connected_pair();
    let cancelled = Arc::new(AtomicBool::new(false));
    tokio::spawn(client_driver.run(empty_replies()));
    tokio::spawn(proxy_driver.run(never_replies(cancelled.clone())));

    let err = client
        .request_with_timeout(
            WorkflowSleepRequest {
                context_id: 1,
                seq: 1,
                duration_ms: 60_000,
            },
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProtocolError::Timeout {
            kind: MessageKind::WorkflowSleepRequest,
            timeout_ms: 50,
            ..
        }
    ));
    assert!(!err.is_fatal());
    assert_eq!(client.pending_requests(), 0);

    wait_for(&cancelled).await;
    assert!(!client.is_closed());
}

#[tokio::test]
async fn test_dropped_caller_cancels_request() {
    let ((client, client_driver), (proxy, proxy_driver)) = connected_pair();
    let cancelled = Arc::new(AtomicBool::new(false));
    tokio::spawn(client_driver.run(empty_replies()));
    tokio::spawn(proxy_driver.run(never_replies(cancelled.clone())));

    let caller = {
        let client = client.clone();
        tokio::spawn(async move { client.request(PingRequest {}).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.pending_requests(), 1);

    caller.abort();
    let _ = caller.await;
    assert_eq!(client.pending_requests(), 0);

    wait_for(&cancelled).await;
    proxy.wait_idle(0).await;
    assert_eq!(proxy.in_flight(), 0);
}

#[tokio::test]
async fn test_cancel_for_unknown_request_reports_false() {
    let ((client, client_driver), (_proxy, proxy_driver)) = connected_pair();
    tokio::spawn(client_driver.run(empty_replies()));
    tokio::spawn(proxy_driver.run(empty_replies()));

    let reply = client
        .request(CancelRequest {
            target_request_id: 4242,
        })
        .await
        .unwrap();
    assert!(!reply.was_cancelled);
}

#[tokio::test]
async fn test_unknown_kind_is_fatal_and_fails_pending() {
    let (a, mut raw) = tokio::io::duplex(64 * 1024);
    let (a_read, a_write) = tokio::io::split(a);
    let (client, driver) = Connection::new(a_read, a_write, ConnectionConfig::default());
    let driver = tokio::spawn(driver.run(empty_replies()));

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.request(PingRequest {}).await })
    };

    // Read the ping, then answer with a frame of an unassigned kind
    let ping = read_envelope(&mut raw).await.unwrap();
    assert_eq!(ping.kind, MessageKind::PingRequest);

    let mut frame = BytesMut::new();
    frame.put_u32(4);
    frame.put_u32(9999);
    raw.write_all(&frame).await.unwrap();

    let result = driver.await.unwrap();
    assert!(result.is_err());
    assert!(matches!(
        pending.await.unwrap(),
        Err(ProtocolError::ConnectionClosed)
    ));
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_reply_without_pending_entry_is_ignored() {
    let (a, mut raw) = tokio::io::duplex(64 * 1024);
    let (a_read, a_write) = tokio::io::split(a);
    let (client, driver) = Connection::new(a_read, a_write, ConnectionConfig::default());
    tokio::spawn(driver.run(empty_replies()));

    let mut stray = Envelope::new(MessageKind::PingReply);
    stray.set_request_id(777);
    write_envelope(&mut raw, &stray).await.unwrap();

    let mut ping = Envelope::new(MessageKind::PingRequest);
    ping.set_request_id(1);
    write_envelope(&mut raw, &ping).await.unwrap();

    let reply = read_envelope(&mut raw).await.unwrap();
    assert_eq!(reply.kind, MessageKind::PingReply);
    assert_eq!(reply.request_id().unwrap(), 1);
    assert!(!client.is_closed());
}

#[tokio::test]
async fn test_handler_can_issue_nested_requests() {
    let ((client, client_driver), (proxy, proxy_driver)) = connected_pair();
    tokio::spawn(proxy_driver.run(empty_replies()));

    let nested = client.clone();
    let client_handler = handler(move |_, request| {
        let nested = nested.clone();
        Box::pin(async move {
            match request {
                Request::WorkflowInvoke(_) => {
                    let pong = nested.request(PingRequest {}).await?;
                    let value = if pong.error.is_none() { "pong" } else { "error" };
                    build_reply(
                        MessageKind::WorkflowInvokeRequest,
                        None,
                        ReplyValue::Payload(Some(Bytes::from(value))),
                    )
                }
                other => build_reply(other.kind(), None, ReplyValue::Empty),
            }
        })
    });
    tokio::spawn(client_driver.run(client_handler));

    let reply = proxy
        .request(WorkflowInvokeRequest {
            context_id: 1,
            workflow_type: "greet".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(reply.result, Some(Bytes::from_static(b"pong")));
}

#[tokio::test]
async fn test_close_fails_pending_requests() {
    let ((client, client_driver), (_proxy, proxy_driver)) = connected_pair();
    let cancelled = Arc::new(AtomicBool::new(false));
    let client_run = tokio::spawn(client_driver.run(empty_replies()));
    tokio::spawn(proxy_driver.run(never_replies(cancelled.clone())));

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.request(PingRequest {}).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    client.close();
    assert!(matches!(
        pending.await.unwrap(),
        Err(ProtocolError::ConnectionClosed)
    ));
    assert!(client_run.await.unwrap().is_ok());

    // The proxy side sees the stream end and cancels its in-flight handler
    wait_for(&cancelled).await;

    let err = client.request(PingRequest {}).await.unwrap_err();
    assert!(matches!(err, ProtocolError::ConnectionClosed));
}

#[tokio::test]
async fn test_cancelled_handler_replies_with_cancelled_error() {
    let (a, mut raw) = tokio::io::duplex(64 * 1024);
    let (a_read, a_write) = tokio::io::split(a);
    let cancelled = Arc::new(AtomicBool::new(false));
    let (_client, driver) = Connection::new(a_read, a_write, ConnectionConfig::default());
    tokio::spawn(driver.run(never_replies(cancelled.clone())));

    let mut sleep = WorkflowSleepRequest {
        context_id: 1,
        seq: 1,
        duration_ms: 1_000,
    }
    .into_envelope();
    sleep.set_request_id(10);
    write_envelope(&mut raw, &sleep).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut cancel = CancelRequest {
        target_request_id: 10,
    }
    .into_envelope();
    cancel.set_request_id(11);
    write_envelope(&mut raw, &cancel).await.unwrap();

    let mut replies = Vec::new();
    for _ in 0..2 {
        replies.push(read_envelope(&mut raw).await.unwrap());
    }
    replies.sort_by_key(|r| r.request_id().unwrap());

    assert_eq!(replies[0].kind, MessageKind::WorkflowSleepReply);
    let sleep_reply =
        weft_protocol::messages::WorkflowSleepReply::from_envelope(replies.remove(0)).unwrap();
    assert_eq!(sleep_reply.error.unwrap().kind, ErrorKind::Cancelled);

    let cancel_reply =
        weft_protocol::messages::CancelReply::from_envelope(replies.remove(0)).unwrap();
    assert!(cancel_reply.was_cancelled);
    wait_for(&cancelled).await;
}
