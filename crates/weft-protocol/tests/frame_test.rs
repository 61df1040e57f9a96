// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Frame encoding/decoding tests for weft-protocol.

use bytes::{BufMut, Bytes, BytesMut};
use weft_protocol::envelope::{Envelope, EnvelopeField};
use weft_protocol::frame::{
    Frame, FrameError, HEADER_SIZE, MAX_FRAME_SIZE, read_envelope, read_frame, write_envelope,
};
use weft_protocol::kind::MessageKind;
use weft_protocol::messages::{
    InitializeRequest, Message, NewWorkerReply, Request, WorkflowInvokeRequest,
};

fn raw_frame(kind: u32, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u32((body.len() + 4) as u32);
    buf.put_u32(kind);
    buf.put_slice(body);
    buf.freeze()
}

#[test]
fn test_frame_header_size() {
    assert_eq!(HEADER_SIZE, 8);
    let frame = Frame::from_envelope(&Envelope::new(MessageKind::PingRequest)).unwrap();
    let encoded = frame.encode();
    assert_eq!(&encoded[4..8], &(MessageKind::PingRequest as u32).to_be_bytes());
    let length = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize;
    assert_eq!(length, encoded.len() - 4);
}

#[test]
fn test_frame_encode_decode() {
    let mut envelope = InitializeRequest {
        library_address: "127.0.0.1".to_string(),
        library_port: 5000,
        identity: Some("worker-1".to_string()),
    }
    .into_envelope();
    envelope.set_request_id(17);

    let encoded = Frame::from_envelope(&envelope).unwrap().encode();
    let decoded = Frame::decode_from_bytes(encoded).unwrap();
    assert_eq!(decoded.kind, MessageKind::InitializeRequest);

    let decoded = decoded.into_envelope().unwrap();
    assert_eq!(decoded.request_id().unwrap(), 17);
    assert_eq!(decoded.property("library_port"), Some("5000"));
}

#[test]
fn test_frame_too_large_header() {
    let mut buf = BytesMut::new();
    buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
    buf.put_u32(MessageKind::PingRequest as u32);
    let err = Frame::decode_from_bytes(buf.freeze()).unwrap_err();
    assert!(matches!(err, FrameError::FrameTooLarge(n) if n == MAX_FRAME_SIZE + 1));
}

#[test]
fn test_frame_incomplete_header() {
    let err = Frame::decode_from_bytes(Bytes::from_static(&[0, 0, 0])).unwrap_err();
    assert!(matches!(err, FrameError::Io(_)));
}

#[test]
fn test_frame_unknown_kind() {
    let err = Frame::decode_from_bytes(raw_frame(9999, &[])).unwrap_err();
    assert!(matches!(err, FrameError::InvalidMessageType(9999)));
}

#[tokio::test]
async fn test_envelopes_over_duplex_stream() {
    let (mut a, mut b) = tokio::io::duplex(64 * 1024);

    let mut invoke = WorkflowInvokeRequest {
        context_id: 3,
        namespace: "ns-A".to_string(),
        workflow_id: "wf-1".to_string(),
        run_id: "run-1".to_string(),
        workflow_type: "greet".to_string(),
        task_queue: "tq-1".to_string(),
        args: Some(Bytes::from_static(b"\"world\"")),
        replaying: false,
        attempt: 1,
    }
    .into_envelope();
    invoke.set_request_id(1);

    let mut failed = Envelope::new(MessageKind::NewWorkerReply);
    EnvelopeField::put(
        Some(weft_protocol::ProxyError::generic("no such namespace")),
        weft_protocol::envelope::ERROR,
        &mut failed,
    );
    failed.set_request_id(2);

    write_envelope(&mut a, &invoke).await.unwrap();
    write_envelope(&mut a, &failed).await.unwrap();
    drop(a);

    let first = read_envelope(&mut b).await.unwrap();
    match Request::from_envelope(first).unwrap() {
        Request::WorkflowInvoke(request) => {
            assert_eq!(request.context_id, 3);
            assert_eq!(request.args, Some(Bytes::from_static(b"\"world\"")));
        }
        other => panic!("unexpected request {:?}", other),
    }

    let second = read_envelope(&mut b).await.unwrap();
    assert_eq!(second.request_id().unwrap(), 2);
    let reply = NewWorkerReply::from_envelope(second).unwrap();
    assert_eq!(reply.error.unwrap().message, "no such namespace");

    assert!(matches!(
        read_envelope(&mut b).await,
        Err(FrameError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_unknown_kind_consumes_whole_frame() {
    use tokio::io::AsyncWriteExt;

    let (mut a, mut b) = tokio::io::duplex(1024);
    a.write_all(&raw_frame(9999, b"junk-body")).await.unwrap();
    let ping = Frame::from_envelope(&Envelope::new(MessageKind::PingRequest)).unwrap();
    a.write_all(&ping.encode()).await.unwrap();
    drop(a);

    assert!(matches!(
        read_frame(&mut b).await,
        Err(FrameError::InvalidMessageType(9999))
    ));
    let next = read_frame(&mut b).await.unwrap();
    assert_eq!(next.kind, MessageKind::PingRequest);
}
