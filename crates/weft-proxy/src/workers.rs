// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker lifecycle manager.
//!
//! A client may ask for the same worker many times. The first `NewWorker`
//! for a `(namespace, task_queue, kind)` starts an engine worker; later ones
//! share it and bump a reference count. The engine worker is stopped when the
//! count drops to zero, and the lease is then disposed for good: asking
//! again allocates a new lease ID. Disposed leases are dropped from the
//! table; lease IDs are never reused, so any issued ID that is no longer in
//! the table is known to be disposed.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::engine::{Engine, EngineError, TaskSink, WorkerHandle, WorkerSpec};
use crate::error::{HandlerError, Result};

/// Result of acquiring or reusing a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseRef {
    pub worker_id: u64,
    pub ref_count: u32,
}

#[derive(Debug)]
struct Lease {
    spec: WorkerSpec,
    ref_count: u32,
    handle: WorkerHandle,
}

#[derive(Default)]
struct LeaseTable {
    /// Live lease per worker identity
    live: HashMap<WorkerSpec, u64>,
    leases: HashMap<u64, Lease>,
}

/// Reference-counted worker leases for one session.
pub struct WorkerLeases {
    engine: Arc<dyn Engine>,
    next_id: AtomicU64,
    // Held across engine calls so concurrent ensures for one identity start
    // a single engine worker
    table: Mutex<LeaseTable>,
}

impl WorkerLeases {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            next_id: AtomicU64::new(1),
            table: Mutex::new(LeaseTable::default()),
        }
    }

    /// Acquire a reference to the worker for `spec`, starting it if needed.
    #[instrument(skip(self, sink), fields(namespace = %spec.namespace, task_queue = %spec.task_queue, kind = %spec.kind))]
    pub async fn ensure(&self, spec: WorkerSpec, sink: Arc<dyn TaskSink>) -> Result<LeaseRef> {
        let mut table = self.table.lock().await;

        if let Some(worker_id) = table.live.get(&spec).copied()
            && let Some(lease) = table.leases.get_mut(&worker_id)
        {
            lease.ref_count += 1;
            debug!(worker_id, ref_count = lease.ref_count, "worker lease reused");
            return Ok(LeaseRef {
                worker_id,
                ref_count: lease.ref_count,
            });
        }

        let handle = self.engine.new_worker(spec.clone(), sink).await?;
        let worker_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        table.live.insert(spec.clone(), worker_id);
        table.leases.insert(
            worker_id,
            Lease {
                spec,
                ref_count: 1,
                handle,
            },
        );
        info!(worker_id, engine_worker = handle.id, "worker lease created");

        Ok(LeaseRef {
            worker_id,
            ref_count: 1,
        })
    }

    /// Release one reference. Returns the remaining count.
    #[instrument(skip(self))]
    pub async fn release(&self, worker_id: u64) -> Result<u32> {
        let mut table = self.table.lock().await;
        let Some(lease) = table.leases.get_mut(&worker_id) else {
            return Err(if self.was_issued(worker_id) {
                HandlerError::WorkerDisposed(worker_id)
            } else {
                HandlerError::WorkerNotFound(worker_id)
            });
        };

        lease.ref_count = lease.ref_count.saturating_sub(1);
        if lease.ref_count > 0 {
            debug!(ref_count = lease.ref_count, "worker lease released");
            return Ok(lease.ref_count);
        }

        if let Some(lease) = table.leases.remove(&worker_id) {
            table.live.remove(&lease.spec);
            self.stop_engine_worker(worker_id, lease.handle).await;
        }
        Ok(0)
    }

    /// Stop every live worker. Called when the session closes.
    pub async fn release_all(&self) -> usize {
        let mut table = self.table.lock().await;
        table.live.clear();
        let stopped: Vec<(u64, Lease)> = table.leases.drain().collect();
        for (worker_id, lease) in &stopped {
            self.stop_engine_worker(*worker_id, lease.handle).await;
        }
        stopped.len()
    }

    /// Number of leases not yet disposed.
    pub async fn live_count(&self) -> usize {
        self.table.lock().await.live.len()
    }

    /// Number of leases held in the table.
    pub async fn table_len(&self) -> usize {
        self.table.lock().await.leases.len()
    }

    fn was_issued(&self, worker_id: u64) -> bool {
        worker_id > 0 && worker_id < self.next_id.load(Ordering::Relaxed)
    }

    async fn stop_engine_worker(&self, worker_id: u64, handle: WorkerHandle) {
        match self.engine.stop_worker(handle).await {
            Ok(()) => info!(worker_id, engine_worker = handle.id, "worker stopped"),
            Err(EngineError::WorkerNotFound(_)) => {
                debug!(worker_id, engine_worker = handle.id, "engine worker already gone")
            }
            Err(e) => warn!(worker_id, error = %e, "failed to stop engine worker"),
        }
    }
}
