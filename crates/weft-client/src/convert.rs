// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! JSON data converter for workflow and activity arguments and results.
//!
//! An absent payload decodes as JSON `null`, so `()` and `Option<T>` accept
//! it. Everything else must be present.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use weft_protocol::Payload;

use crate::error::Result;

/// Serialize `value` into a payload.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Payload> {
    Ok(Some(Bytes::from(serde_json::to_vec(value)?)))
}

/// Deserialize a payload.
pub fn decode<T: DeserializeOwned>(payload: &Payload) -> Result<T> {
    let value = match payload {
        Some(bytes) if !bytes.is_empty() => serde_json::from_slice(bytes)?,
        _ => serde_json::from_slice(b"null")?,
    };
    Ok(value)
}
