// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Concurrent context registries and identity counters.
//!
//! Registries map a key (usually a [`ContextKey`]) to a shared context.
//! Each registry has its own lock; there is no global lock across them.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::RwLock;
use thiserror::Error;

/// Identifies one execution context within one client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextKey {
    pub client_id: i64,
    pub context_id: i64,
}

impl ContextKey {
    pub fn new(client_id: i64, context_id: i64) -> Self {
        Self {
            client_id,
            context_id,
        }
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.client_id, self.context_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("{registry} context {key} not found")]
    NotFound { registry: &'static str, key: String },

    #[error("{registry} context {key} already exists")]
    AlreadyExists { registry: &'static str, key: String },
}

/// A named concurrent map of live contexts.
pub struct Registry<K, V> {
    name: &'static str,
    entries: RwLock<HashMap<K, Arc<V>>>,
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Copy + fmt::Display,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Insert a context. Fails if the key is already present.
    pub fn add(&self, key: K, value: Arc<V>) -> Result<(), ContextError> {
        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            return Err(ContextError::AlreadyExists {
                registry: self.name,
                key: key.to_string(),
            });
        }
        entries.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: K) -> Result<Arc<V>, ContextError> {
        self.entries
            .read()
            .get(&key)
            .cloned()
            .ok_or_else(|| self.not_found(key))
    }

    pub fn remove(&self, key: K) -> Result<Arc<V>, ContextError> {
        self.entries
            .write()
            .remove(&key)
            .ok_or_else(|| self.not_found(key))
    }

    /// Remove every entry matching `predicate` and return them.
    pub fn remove_where(&self, predicate: impl Fn(&K, &V) -> bool) -> Vec<Arc<V>> {
        let mut entries = self.entries.write();
        let keys: Vec<K> = entries
            .iter()
            .filter(|(k, v)| predicate(k, v))
            .map(|(k, _)| *k)
            .collect();
        keys.into_iter()
            .filter_map(|k| entries.remove(&k))
            .collect()
    }

    /// Snapshot of the entries matching `predicate`.
    pub fn find(&self, predicate: impl Fn(&K, &V) -> bool) -> Vec<Arc<V>> {
        self.entries
            .read()
            .iter()
            .filter(|(k, v)| predicate(k, v))
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn contains(&self, key: K) -> bool {
        self.entries.read().contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop every entry. Only for test harness resets.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    fn not_found(&self, key: K) -> ContextError {
        ContextError::NotFound {
            registry: self.name,
            key: key.to_string(),
        }
    }
}

/// Monotonic ID generator. IDs start at 1.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicI64,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator {
    pub const fn new() -> Self {
        Self {
            next: AtomicI64::new(1),
        }
    }

    pub fn next_id(&self) -> i64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Restart the sequence. Only for test harness resets.
    pub fn reset(&self) {
        self.next.store(1, Ordering::Relaxed);
    }
}
