// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reply construction for handlers that produce untyped results.

use tracing::warn;

use crate::envelope::{Envelope, EnvelopeField, Payload};
use crate::error::{ProtocolError, ProxyError};
use crate::kind::MessageKind;
use crate::messages::{ActivityInvokeReply, Message, Reply};

/// Result value produced by a handler.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyValue {
    /// No value; payload-carrying replies get an absent result
    Empty,
    /// A serialized result payload
    Payload(Payload),
    /// The work continues asynchronously (activity invocations only)
    Pending,
}

/// Build the reply envelope for `request_kind`.
///
/// Sets the shared error field and, for reply kinds that carry a result
/// payload, embeds the value. A value whose shape does not fit the reply
/// kind becomes a `Generic` error reply. A kind without a reply (any reply
/// kind) is a protocol mismatch and is returned as an error.
pub fn build_reply(
    request_kind: MessageKind,
    error: Option<ProxyError>,
    value: ReplyValue,
) -> Result<Envelope, ProtocolError> {
    let reply_kind = request_kind
        .reply_kind()
        .ok_or(ProtocolError::NoReplyKind(request_kind))?;

    if error.is_some() {
        return Ok(Reply::for_request(request_kind, error)?.into_envelope());
    }

    match value {
        ReplyValue::Empty => Ok(Reply::for_request(request_kind, None)?.into_envelope()),
        ReplyValue::Payload(payload) => match reply_kind.result_field() {
            Some(field) => {
                let mut envelope = Reply::for_request(request_kind, None)?.into_envelope();
                set_result(&mut envelope, field, payload);
                Ok(envelope)
            }
            None => mismatch(request_kind, reply_kind, "a result payload"),
        },
        ReplyValue::Pending if reply_kind == MessageKind::ActivityInvokeReply => {
            Ok(ActivityInvokeReply {
                pending: true,
                ..Default::default()
            }
            .into_envelope())
        }
        ReplyValue::Pending => mismatch(request_kind, reply_kind, "a pending marker"),
    }
}

fn set_result(envelope: &mut Envelope, field: &'static str, payload: Payload) {
    let index = envelope.property(field).and_then(|raw| raw.parse::<usize>().ok());
    match index {
        Some(index) if envelope.replace_attachment(index, payload.clone()) => {}
        _ => EnvelopeField::put(payload, field, envelope),
    }
}

fn mismatch(
    request_kind: MessageKind,
    reply_kind: MessageKind,
    what: &str,
) -> Result<Envelope, ProtocolError> {
    warn!(%request_kind, %reply_kind, "handler produced {} for a reply that cannot carry it", what);
    let err = ProxyError::generic(format!("internal error: {} cannot carry {}", reply_kind, what));
    Ok(Reply::for_request(request_kind, Some(err))?.into_envelope())
}
