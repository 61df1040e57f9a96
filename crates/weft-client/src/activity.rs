// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Context handed to activity functions.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use weft_protocol::messages::{ActivityRecordHeartbeatRequest, ReplyMessage};
use weft_protocol::{Connection, ContextKey};

use crate::convert::encode;
use crate::error::{ClientError, Result};

/// Identity of a running activity attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivityInfo {
    pub namespace: String,
    pub workflow_id: String,
    pub run_id: String,
    pub activity_type: String,
    /// Opaque token for heartbeats and external completion
    pub task_token: String,
    pub attempt: u32,
}

pub(crate) struct ActivityState {
    pub(crate) key: ContextKey,
    info: ActivityInfo,
    connection: Connection,
    cancel: CancellationToken,
    pending: AtomicBool,
}

impl ActivityState {
    pub(crate) fn new(key: ContextKey, info: ActivityInfo, connection: Connection) -> Self {
        Self {
            key,
            info,
            cancel: connection.closed_token().child_token(),
            connection,
            pending: AtomicBool::new(false),
        }
    }

    /// Fired by an `ActivityStopping` notification from the proxy.
    pub(crate) fn stop(&self) {
        debug!(context = %self.key, "activity stopping");
        self.cancel.cancel();
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

/// Handle passed to a running activity.
///
/// Cheap to clone; all clones observe the same cancellation state.
#[derive(Clone)]
pub struct ActivityContext {
    state: Arc<ActivityState>,
}

impl ActivityContext {
    pub(crate) fn new(state: Arc<ActivityState>) -> Self {
        Self { state }
    }

    pub fn info(&self) -> &ActivityInfo {
        &self.state.info
    }

    pub fn task_token(&self) -> &str {
        &self.state.info.task_token
    }

    /// Whether the proxy asked this activity to stop.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancel.is_cancelled()
    }

    /// Resolves once the activity is asked to stop or the session closes.
    pub async fn cancelled(&self) {
        self.state.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.state.cancel.clone()
    }

    /// Report progress.
    ///
    /// Returns whether cancellation was requested; the context is cancelled
    /// as well so `cancelled()` waiters wake up.
    pub async fn heartbeat<T: Serialize + ?Sized>(&self, details: &T) -> Result<bool> {
        let reply = self
            .state
            .connection
            .request(ActivityRecordHeartbeatRequest {
                task_token: self.state.info.task_token.clone(),
                details: encode(details)?,
            })
            .await?
            .into_result()
            .map_err(ClientError::Remote)?;

        if reply.cancel_requested {
            self.state.stop();
        }
        Ok(reply.cancel_requested)
    }

    /// Leave the activity open after the function returns.
    ///
    /// The return value is discarded and the proxy waits for
    /// [`crate::WeftClient::complete_activity`] with this context's task token.
    pub fn complete_later(&self) {
        self.state.pending.store(true, Ordering::Release);
    }

    /// A context with no live session behind it.
    #[cfg(test)]
    pub(crate) fn detached(task_token: &str) -> Self {
        let (reader, writer) = tokio::io::duplex(64);
        let (connection, _driver) =
            Connection::new(reader, writer, weft_protocol::ConnectionConfig::default());
        let info = ActivityInfo {
            task_token: task_token.to_string(),
            ..Default::default()
        };
        Self::new(Arc::new(ActivityState::new(
            ContextKey::new(0, 0),
            info,
            connection,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_cancels_every_clone() {
        let ctx = ActivityContext::detached("token-1");
        let clone = ctx.clone();
        assert!(!clone.is_cancelled());

        ctx.state.stop();
        clone.cancelled().await;
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_complete_later_marks_pending() {
        let ctx = ActivityContext::detached("token-1");
        assert!(!ctx.state.is_pending());
        ctx.complete_later();
        assert!(ctx.state.is_pending());
        assert_eq!(ctx.task_token(), "token-1");
    }
}
