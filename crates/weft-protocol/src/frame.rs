// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for session stream framing.
//!
//! A session stream carries a sequence of frames in each direction:
//! - 4 bytes: length of the rest of the frame (big-endian)
//! - 4 bytes: message kind (big-endian)
//! - N bytes: envelope body (properties and attachments, see [`crate::envelope`])
//!
//! The length is read before the kind is validated, so an unknown kind is
//! rejected without desynchronizing the stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::envelope::Envelope;
use crate::kind::MessageKind;

/// Maximum frame size (64 MB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Frame header size (4 bytes length + 4 bytes kind)
pub const HEADER_SIZE: usize = 8;

/// Size of the kind field, counted in the frame length
const KIND_SIZE: usize = 4;

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("invalid message type: {0}")]
    InvalidMessageType(u32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("connection closed")]
    ConnectionClosed,
}

/// A framed message with kind and encoded envelope body
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: MessageKind,
    pub payload: Bytes,
}

impl Frame {
    /// Encode an envelope into a frame
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, FrameError> {
        let mut body = BytesMut::new();
        envelope.encode_body(&mut body);
        if body.len() + KIND_SIZE > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(body.len() + KIND_SIZE));
        }
        Ok(Self {
            kind: envelope.kind,
            payload: body.freeze(),
        })
    }

    /// Decode the frame body into an envelope
    pub fn into_envelope(self) -> Result<Envelope, FrameError> {
        Envelope::decode_body(self.kind, self.payload)
    }

    /// Encode the frame to bytes for wire transmission
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32((self.payload.len() + KIND_SIZE) as u32);
        buf.put_u32(self.kind as u32);
        buf.put(self.payload.clone());
        buf.freeze()
    }

    /// Decode a frame from bytes
    pub fn decode_from_bytes(mut bytes: Bytes) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame header",
            )));
        }

        let length = bytes.get_u32() as usize;
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(length));
        }
        if length < KIND_SIZE {
            return Err(FrameError::Malformed(format!(
                "frame length {} shorter than kind field",
                length
            )));
        }
        let raw_kind = bytes.get_u32();

        let body_len = length - KIND_SIZE;
        if bytes.len() < body_len {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame payload",
            )));
        }

        let payload = bytes.split_to(body_len);
        let kind = MessageKind::try_from(raw_kind)?;
        Ok(Self { kind, payload })
    }
}

/// Write a frame to an async writer
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    let encoded = frame.encode();
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a frame from an async reader
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    // Read length prefix
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes(len_buf) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(length));
    }
    if length < KIND_SIZE {
        return Err(FrameError::Malformed(format!(
            "frame length {} shorter than kind field",
            length
        )));
    }

    // Read kind and body in full before validating the kind
    let mut rest = vec![0u8; length];
    reader.read_exact(&mut rest).await?;

    let mut rest = Bytes::from(rest);
    let raw_kind = rest.get_u32();
    let kind = MessageKind::try_from(raw_kind)?;

    Ok(Frame {
        kind,
        payload: rest,
    })
}

/// Read a frame and decode it into an envelope
pub async fn read_envelope<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Envelope, FrameError> {
    read_frame(reader).await?.into_envelope()
}

/// Encode an envelope and write it as a frame
pub async fn write_envelope<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> Result<(), FrameError> {
    let frame = Frame::from_envelope(envelope)?;
    write_frame(writer, &frame).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let envelope = Envelope::new(MessageKind::PingRequest);
        let frame = Frame::from_envelope(&envelope).unwrap();
        let encoded = frame.encode();

        let length = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize;
        assert_eq!(length, frame.payload.len() + KIND_SIZE);

        let kind = u32::from_be_bytes([encoded[4], encoded[5], encoded[6], encoded[7]]);
        assert_eq!(kind, MessageKind::PingRequest as u32);
        assert_eq!(encoded.len(), HEADER_SIZE + frame.payload.len());
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let mut buf = BytesMut::new();
        buf.put_u32(KIND_SIZE as u32);
        buf.put_u32(9_999);
        let err = Frame::decode_from_bytes(buf.freeze()).unwrap_err();
        assert!(matches!(err, FrameError::InvalidMessageType(9_999)));
    }

    #[test]
    fn test_decode_rejects_short_length() {
        let mut buf = BytesMut::new();
        buf.put_u32(2);
        buf.put_u32(1);
        let err = Frame::decode_from_bytes(buf.freeze()).unwrap_err();
        assert!(matches!(err, FrameError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_unknown_kind_consumes_whole_frame() {
        let mut buf = BytesMut::new();
        // Unknown kind with a 3-byte body
        buf.put_u32((KIND_SIZE + 3) as u32);
        buf.put_u32(4_242);
        buf.put_slice(&[1, 2, 3]);
        // Followed by a valid ping
        let ping = Frame::from_envelope(&Envelope::new(MessageKind::PingRequest)).unwrap();
        buf.put(ping.encode());

        let mut reader = &buf[..];
        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(matches!(err, FrameError::InvalidMessageType(4_242)));

        // The stream is still aligned on the next frame
        let next = read_frame(&mut reader).await.unwrap();
        assert_eq!(next.kind, MessageKind::PingRequest);
    }

    #[tokio::test]
    async fn test_read_frame_eof_is_connection_closed() {
        let mut reader: &[u8] = &[];
        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }
}
