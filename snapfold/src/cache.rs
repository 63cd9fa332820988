//! Bounded snapshot cache for inline-lifecycle aggregates.
//!
//! Fetch-for-writing may reuse a recently folded snapshot instead of
//! refolding from raw events. The cache is an explicit bounded LRU keyed by
//! `(tenant, identity)` and owned by the store instance; a capacity of zero
//! is the no-op variant that never retains anything. Correctness never
//! depends on a hit: a cached entry is only used when its version still
//! matches the stream.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::types::{StreamIdentity, StreamVersion, TenantId};

type CacheKey = (TenantId, StreamIdentity);

struct Entry<A> {
    snapshot: A,
    version: StreamVersion,
    touched: u64,
}

struct Inner<A> {
    entries: HashMap<CacheKey, Entry<A>>,
    clock: u64,
}

/// A bounded LRU of folded snapshots keyed by tenant and identity.
pub struct SnapshotCache<A> {
    capacity: usize,
    inner: Mutex<Inner<A>>,
}

impl<A> std::fmt::Debug for SnapshotCache<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotCache")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl<A: Clone> SnapshotCache<A> {
    /// Creates a cache holding at most `capacity` snapshots. Zero disables
    /// caching entirely.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                clock: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<A>> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Returns the cached snapshot and its folded-through version, marking
    /// the entry most recently used.
    pub fn get(&self, tenant: &TenantId, identity: &StreamIdentity) -> Option<(A, StreamVersion)> {
        if self.capacity == 0 {
            return None;
        }
        let mut inner = self.lock();
        inner.clock += 1;
        let clock = inner.clock;
        let entry = inner.entries.get_mut(&(tenant.clone(), identity.clone()))?;
        entry.touched = clock;
        Some((entry.snapshot.clone(), entry.version))
    }

    /// Inserts or replaces the snapshot for an identity, evicting the least
    /// recently used entry when full.
    pub fn put(
        &self,
        tenant: &TenantId,
        identity: &StreamIdentity,
        snapshot: A,
        version: StreamVersion,
    ) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.lock();
        inner.clock += 1;
        let touched = inner.clock;
        let key = (tenant.clone(), identity.clone());

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            if let Some(evict) = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.touched)
                .map(|(key, _)| key.clone())
            {
                inner.entries.remove(&evict);
            }
        }
        inner.entries.insert(
            key,
            Entry {
                snapshot,
                version,
                touched,
            },
        );
    }

    /// Drops the entry for an identity, if present. Used after deletes and
    /// rebuilds so stale snapshots cannot be served.
    pub fn invalidate(&self, tenant: &TenantId, identity: &StreamIdentity) {
        if self.capacity == 0 {
            return;
        }
        self.lock()
            .entries
            .remove(&(tenant.clone(), identity.clone()));
    }

    /// How many snapshots are currently cached.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether the cache currently holds nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
