// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The message envelope: a kind, a string property map and a list of
//! binary attachments.
//!
//! Body layout (everything after the frame header, big-endian):
//!
//! ```text
//! u32 property_count
//!   u32 key_len, key bytes (UTF-8)
//!   i32 value_len, value bytes (UTF-8)      -1 = absent value
//! u32 attachment_count
//!   i32 len, bytes                          -1 = absent attachment
//! ```
//!
//! Scalar message fields live in properties. Payload fields live in
//! attachments, with a property of the same name holding the attachment
//! index so the body stays self-describing.

use std::collections::BTreeMap;
use std::str::FromStr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{ProtocolError, ProxyError};
use crate::frame::FrameError;
use crate::kind::MessageKind;

/// An opaque serialized argument or result. `None` is distinct from empty.
pub type Payload = Option<Bytes>;

/// Property holding the correlation ID on every request and reply.
pub const REQUEST_ID: &str = "request_id";

/// Property holding the serialized [`ProxyError`] on replies.
pub const ERROR: &str = "error";

/// The wire unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: MessageKind,
    properties: BTreeMap<String, String>,
    attachments: Vec<Payload>,
}

impl Envelope {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            properties: BTreeMap::new(),
            attachments: Vec::new(),
        }
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn take_property(&mut self, key: &str) -> Option<String> {
        self.properties.remove(key)
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn attachments(&self) -> &[Payload] {
        &self.attachments
    }

    /// Append an attachment and return its index.
    pub fn push_attachment(&mut self, payload: Payload) -> usize {
        self.attachments.push(payload);
        self.attachments.len() - 1
    }

    /// Replace the attachment at `index`. Returns `false` if out of range.
    pub fn replace_attachment(&mut self, index: usize, payload: Payload) -> bool {
        match self.attachments.get_mut(index) {
            Some(slot) => {
                *slot = payload;
                true
            }
            None => false,
        }
    }

    /// Take the attachment at `index`, leaving `None` behind.
    pub fn take_attachment(&mut self, index: usize) -> Option<Payload> {
        self.attachments.get_mut(index).map(Option::take)
    }

    pub fn request_id(&self) -> Result<u64, ProtocolError> {
        let raw = self.property(REQUEST_ID).ok_or(ProtocolError::MissingField {
            kind: self.kind,
            field: REQUEST_ID,
        })?;
        raw.parse().map_err(|_| ProtocolError::InvalidField {
            kind: self.kind,
            field: REQUEST_ID,
            value: raw.to_string(),
        })
    }

    pub fn set_request_id(&mut self, request_id: u64) {
        self.set_property(REQUEST_ID, request_id.to_string());
    }

    /// Encode properties and attachments (not the frame header).
    pub fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u32(self.properties.len() as u32);
        for (key, value) in &self.properties {
            buf.put_u32(key.len() as u32);
            buf.put_slice(key.as_bytes());
            buf.put_i32(value.len() as i32);
            buf.put_slice(value.as_bytes());
        }

        buf.put_u32(self.attachments.len() as u32);
        for attachment in &self.attachments {
            match attachment {
                Some(bytes) => {
                    buf.put_i32(bytes.len() as i32);
                    buf.put_slice(bytes);
                }
                None => buf.put_i32(-1),
            }
        }
    }

    /// Decode a body produced by [`Envelope::encode_body`].
    pub fn decode_body(kind: MessageKind, mut body: Bytes) -> Result<Self, FrameError> {
        let mut envelope = Envelope::new(kind);

        let property_count = read_u32(&mut body, "property count")?;
        for _ in 0..property_count {
            let key_len = read_u32(&mut body, "property key length")? as usize;
            let key = read_string(&mut body, key_len, "property key")?;
            let value_len = read_i32(&mut body, "property value length")?;
            match value_len {
                -1 => continue,
                len if len < 0 => {
                    return Err(FrameError::Malformed(format!(
                        "negative length {} for property '{}'",
                        len, key
                    )));
                }
                len => {
                    let value = read_string(&mut body, len as usize, "property value")?;
                    envelope.properties.insert(key, value);
                }
            }
        }

        let attachment_count = read_u32(&mut body, "attachment count")?;
        for _ in 0..attachment_count {
            let len = read_i32(&mut body, "attachment length")?;
            match len {
                -1 => envelope.attachments.push(None),
                len if len < 0 => {
                    return Err(FrameError::Malformed(format!(
                        "negative attachment length {}",
                        len
                    )));
                }
                len => {
                    let len = len as usize;
                    if body.remaining() < len {
                        return Err(FrameError::Malformed("truncated attachment".to_string()));
                    }
                    envelope.attachments.push(Some(body.split_to(len)));
                }
            }
        }

        if body.has_remaining() {
            return Err(FrameError::Malformed(format!(
                "{} trailing bytes after envelope body",
                body.remaining()
            )));
        }

        Ok(envelope)
    }
}

fn read_u32(body: &mut Bytes, what: &str) -> Result<u32, FrameError> {
    if body.remaining() < 4 {
        return Err(FrameError::Malformed(format!("truncated {}", what)));
    }
    Ok(body.get_u32())
}

fn read_i32(body: &mut Bytes, what: &str) -> Result<i32, FrameError> {
    if body.remaining() < 4 {
        return Err(FrameError::Malformed(format!("truncated {}", what)));
    }
    Ok(body.get_i32())
}

fn read_string(body: &mut Bytes, len: usize, what: &str) -> Result<String, FrameError> {
    if body.remaining() < len {
        return Err(FrameError::Malformed(format!("truncated {}", what)));
    }
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| FrameError::Malformed(format!("{} is not valid UTF-8", what)))
}

// ============================================================================
// Typed field mapping
// ============================================================================

/// A value that can be stored in and taken out of an envelope under a field name.
pub trait EnvelopeField: Sized {
    fn put(self, name: &'static str, envelope: &mut Envelope);
    fn take(name: &'static str, envelope: &mut Envelope) -> Result<Self, ProtocolError>;
}

fn parse_property<T: FromStr>(
    name: &'static str,
    envelope: &mut Envelope,
) -> Result<Option<T>, ProtocolError> {
    match envelope.take_property(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ProtocolError::InvalidField {
                kind: envelope.kind,
                field: name,
                value: raw,
            }),
    }
}

macro_rules! scalar_field {
    ($($ty:ty),* $(,)?) => {
        $(
            impl EnvelopeField for $ty {
                fn put(self, name: &'static str, envelope: &mut Envelope) {
                    envelope.set_property(name, self.to_string());
                }

                fn take(name: &'static str, envelope: &mut Envelope) -> Result<Self, ProtocolError> {
                    parse_property(name, envelope)?.ok_or(ProtocolError::MissingField {
                        kind: envelope.kind,
                        field: name,
                    })
                }
            }

            impl EnvelopeField for Option<$ty> {
                fn put(self, name: &'static str, envelope: &mut Envelope) {
                    if let Some(value) = self {
                        envelope.set_property(name, value.to_string());
                    }
                }

                fn take(name: &'static str, envelope: &mut Envelope) -> Result<Self, ProtocolError> {
                    parse_property(name, envelope)
                }
            }
        )*
    };
}

scalar_field!(String, bool, i32, u32, i64, u64);

impl EnvelopeField for Payload {
    fn put(self, name: &'static str, envelope: &mut Envelope) {
        let index = envelope.push_attachment(self);
        envelope.set_property(name, index.to_string());
    }

    fn take(name: &'static str, envelope: &mut Envelope) -> Result<Self, ProtocolError> {
        let Some(index) = parse_property::<usize>(name, envelope)? else {
            return Ok(None);
        };
        envelope
            .take_attachment(index)
            .ok_or_else(|| ProtocolError::InvalidField {
                kind: envelope.kind,
                field: name,
                value: format!("attachment index {} out of range", index),
            })
    }
}

impl EnvelopeField for Option<ProxyError> {
    fn put(self, name: &'static str, envelope: &mut Envelope) {
        if let Some(err) = self {
            // Serializing a plain struct of strings cannot fail
            if let Ok(json) = serde_json::to_string(&err) {
                envelope.set_property(name, json);
            }
        }
    }

    fn take(name: &'static str, envelope: &mut Envelope) -> Result<Self, ProtocolError> {
        match envelope.take_property(name) {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|_| ProtocolError::InvalidField {
                    kind: envelope.kind,
                    field: name,
                    value: raw,
                }),
        }
    }
}

/// A structured field stored as a JSON-encoded property.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Json<T>(pub T);

impl<T: Serialize + DeserializeOwned + Default> EnvelopeField for Json<T> {
    fn put(self, name: &'static str, envelope: &mut Envelope) {
        match serde_json::to_string(&self.0) {
            Ok(json) => envelope.set_property(name, json),
            Err(e) => tracing::warn!(field = name, error = %e, "failed to encode JSON field"),
        }
    }

    fn take(name: &'static str, envelope: &mut Envelope) -> Result<Self, ProtocolError> {
        match envelope.take_property(name) {
            None => Ok(Json(T::default())),
            Some(raw) => serde_json::from_str(&raw)
                .map(Json)
                .map_err(|_| ProtocolError::InvalidField {
                    kind: envelope.kind,
                    field: name,
                    value: raw,
                }),
        }
    }
}
