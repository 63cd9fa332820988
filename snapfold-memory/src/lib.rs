//! In-memory implementations of the snapfold storage ports.
//!
//! Intended for tests and ephemeral use. The log honors the same contracts
//! the engine assumes of a durable backend: gapless per-stream versions
//! starting at 1, store-wide monotonic sequence numbers, atomic batch
//! appends with expected-version checks, and a non-blocking exclusive
//! per-stream lock released when its guard drops.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use snapfold::errors::{StorageError, StorageResult};
use snapfold::event::{DomainEvent, EventEnvelope};
use snapfold::storage::{
    DocumentStore, EventLog, ExpectedVersion, FetchOptions, PendingEvent, StoredDocument,
    StreamLock,
};
use snapfold::types::{
    EventId, GlobalSequence, ShardName, StreamIdentity, StreamVersion, TenantId, Timestamp,
};
use snapfold::Archiver;

type StreamKey = (TenantId, StreamIdentity);

struct StreamState<E> {
    envelopes: Vec<EventEnvelope<E>>,
    archived_through: StreamVersion,
    locked: bool,
}

impl<E> Default for StreamState<E> {
    fn default() -> Self {
        Self {
            envelopes: Vec::new(),
            archived_through: StreamVersion::none(),
            locked: false,
        }
    }
}

impl<E> StreamState<E> {
    fn version(&self) -> StreamVersion {
        self.envelopes
            .last()
            .map_or_else(StreamVersion::none, |env| env.version)
    }
}

struct LogInner<E> {
    streams: HashMap<StreamKey, StreamState<E>>,
    sequence: GlobalSequence,
}

/// An in-process append log.
pub struct InMemoryEventLog<E> {
    inner: Arc<Mutex<LogInner<E>>>,
}

impl<E> Default for InMemoryEventLog<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for InMemoryEventLog<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> std::fmt::Debug for InMemoryEventLog<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEventLog").finish_non_exhaustive()
    }
}

impl<E> InMemoryEventLog<E> {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LogInner {
                streams: HashMap::new(),
                sequence: GlobalSequence::start(),
            })),
        }
    }
}

struct InMemoryStreamLock<E> {
    key: StreamKey,
    inner: Arc<Mutex<LogInner<E>>>,
}

impl<E: Send + Sync> StreamLock for InMemoryStreamLock<E> {
    fn identity(&self) -> &StreamIdentity {
        &self.key.1
    }
}

impl<E> Drop for InMemoryStreamLock<E> {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        if let Some(stream) = inner.streams.get_mut(&self.key) {
            stream.locked = false;
        }
    }
}

#[async_trait]
impl<E: DomainEvent> EventLog<E> for InMemoryEventLog<E> {
    async fn append(
        &self,
        tenant: &TenantId,
        identity: &StreamIdentity,
        expected: ExpectedVersion,
        events: Vec<PendingEvent<E>>,
    ) -> StorageResult<Vec<EventEnvelope<E>>> {
        let mut inner = self.inner.lock();
        let key = (tenant.clone(), identity.clone());
        let current = inner
            .streams
            .get(&key)
            .map_or_else(StreamVersion::none, StreamState::version);

        let matches = match expected {
            ExpectedVersion::Any => true,
            ExpectedVersion::NoStream => current == StreamVersion::none(),
            ExpectedVersion::Exact(version) => current == version,
        };
        if !matches {
            return Err(StorageError::VersionConflict {
                identity: identity.clone(),
                expected,
                current,
            });
        }

        let mut version = current;
        let mut appended = Vec::with_capacity(events.len());
        for pending in events {
            version = version.next();
            inner.sequence = inner.sequence.next();
            appended.push(EventEnvelope {
                id: EventId::new(),
                sequence: inner.sequence,
                version,
                identity: identity.clone(),
                tenant: tenant.clone(),
                timestamp: Timestamp::now(),
                headers: pending.headers,
                payload: pending.payload,
            });
        }

        let stream = inner.streams.entry(key).or_default();
        stream.envelopes.extend(appended.iter().cloned());
        Ok(appended)
    }

    async fn fetch(
        &self,
        tenant: &TenantId,
        identity: &StreamIdentity,
        options: FetchOptions,
    ) -> StorageResult<Vec<EventEnvelope<E>>> {
        let inner = self.inner.lock();
        let key = (tenant.clone(), identity.clone());
        let Some(stream) = inner.streams.get(&key) else {
            return Ok(Vec::new());
        };

        let envelopes = stream
            .envelopes
            .iter()
            .filter(|env| options.include_archived || env.version > stream.archived_through)
            .filter(|env| {
                options
                    .through_version
                    .is_none_or(|through| env.version <= through)
            })
            .filter(|env| options.as_of.is_none_or(|at| env.timestamp <= at))
            .cloned()
            .collect();
        Ok(envelopes)
    }

    async fn stream_version(
        &self,
        tenant: &TenantId,
        identity: &StreamIdentity,
    ) -> StorageResult<StreamVersion> {
        let inner = self.inner.lock();
        Ok(inner
            .streams
            .get(&(tenant.clone(), identity.clone()))
            .map_or_else(StreamVersion::none, StreamState::version))
    }

    async fn high_water_mark(&self) -> StorageResult<GlobalSequence> {
        Ok(self.inner.lock().sequence)
    }

    async fn fetch_since(
        &self,
        after: GlobalSequence,
        limit: usize,
    ) -> StorageResult<Vec<EventEnvelope<E>>> {
        let inner = self.inner.lock();
        let mut envelopes: Vec<EventEnvelope<E>> = inner
            .streams
            .values()
            .flat_map(|stream| stream.envelopes.iter())
            .filter(|env| env.sequence > after)
            .cloned()
            .collect();
        envelopes.sort_by_key(|env| env.sequence);
        envelopes.truncate(limit);
        Ok(envelopes)
    }

    async fn try_lock(
        &self,
        tenant: &TenantId,
        identity: &StreamIdentity,
    ) -> StorageResult<Option<Box<dyn StreamLock>>> {
        let mut inner = self.inner.lock();
        let key = (tenant.clone(), identity.clone());
        let stream = inner.streams.entry(key.clone()).or_default();
        if stream.locked {
            return Ok(None);
        }
        stream.locked = true;
        Ok(Some(Box::new(InMemoryStreamLock {
            key,
            inner: Arc::clone(&self.inner),
        })))
    }

    async fn mark_archived(
        &self,
        tenant: &TenantId,
        identity: &StreamIdentity,
        through: StreamVersion,
    ) -> StorageResult<Vec<EventEnvelope<E>>> {
        let mut inner = self.inner.lock();
        let key = (tenant.clone(), identity.clone());
        let Some(stream) = inner.streams.get_mut(&key) else {
            return Err(StorageError::StreamNotFound(identity.clone()));
        };
        if through > stream.archived_through {
            stream.archived_through = through;
        }
        Ok(stream
            .envelopes
            .iter()
            .filter(|env| env.version <= through)
            .cloned()
            .collect())
    }
}

type DocumentKey = (String, TenantId, StreamIdentity);

#[derive(Default)]
struct DocInner {
    documents: HashMap<DocumentKey, StoredDocument>,
    progress: HashMap<ShardName, GlobalSequence>,
}

/// An in-process materialized-snapshot store.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    inner: Mutex<DocInner>,
}

impl std::fmt::Debug for InMemoryDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDocumentStore").finish_non_exhaustive()
    }
}

impl InMemoryDocumentStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// How many snapshot rows exist, soft-deleted ones included.
    pub fn document_count(&self) -> usize {
        self.inner.lock().documents.len()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn load(
        &self,
        projection: &str,
        tenant: &TenantId,
        identity: &StreamIdentity,
    ) -> StorageResult<Option<StoredDocument>> {
        let inner = self.inner.lock();
        Ok(inner
            .documents
            .get(&(projection.to_string(), tenant.clone(), identity.clone()))
            .cloned())
    }

    async fn store(
        &self,
        projection: &str,
        tenant: &TenantId,
        identity: &StreamIdentity,
        document: StoredDocument,
    ) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        inner.documents.insert(
            (projection.to_string(), tenant.clone(), identity.clone()),
            document,
        );
        Ok(())
    }

    async fn delete(
        &self,
        projection: &str,
        tenant: &TenantId,
        identity: &StreamIdentity,
    ) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        inner
            .documents
            .remove(&(projection.to_string(), tenant.clone(), identity.clone()));
        Ok(())
    }

    async fn soft_delete(
        &self,
        projection: &str,
        tenant: &TenantId,
        identity: &StreamIdentity,
        at: Timestamp,
    ) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if let Some(document) = inner
            .documents
            .get_mut(&(projection.to_string(), tenant.clone(), identity.clone()))
        {
            document.deleted = true;
            document.deleted_at = Some(at);
        }
        Ok(())
    }

    async fn undelete(
        &self,
        projection: &str,
        tenant: &TenantId,
        identity: &StreamIdentity,
    ) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if let Some(document) = inner
            .documents
            .get_mut(&(projection.to_string(), tenant.clone(), identity.clone()))
        {
            document.deleted = false;
            document.deleted_at = None;
        }
        Ok(())
    }

    async fn load_progress(&self, shard: &ShardName) -> StorageResult<Option<GlobalSequence>> {
        Ok(self.inner.lock().progress.get(shard).copied())
    }

    async fn store_progress(
        &self,
        shard: &ShardName,
        sequence: GlobalSequence,
    ) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .progress
            .entry(shard.clone())
            .or_insert_with(GlobalSequence::start);
        // Progress never moves backwards.
        if sequence > *entry {
            *entry = sequence;
        }
        Ok(())
    }
}

/// An archiver that keeps every envelope handed to it, for inspection.
pub struct CollectingArchiver<E> {
    received: Mutex<Vec<EventEnvelope<E>>>,
}

impl<E> Default for CollectingArchiver<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for CollectingArchiver<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectingArchiver").finish_non_exhaustive()
    }
}

impl<E> CollectingArchiver<E> {
    /// Creates an empty archiver.
    pub fn new() -> Self {
        Self {
            received: Mutex::new(Vec::new()),
        }
    }

    /// How many envelopes have been handed over so far.
    pub fn archived_count(&self) -> usize {
        self.received.lock().len()
    }
}

impl<E: Clone> CollectingArchiver<E> {
    /// Every envelope handed over so far, in arrival order.
    pub fn archived(&self) -> Vec<EventEnvelope<E>> {
        self.received.lock().clone()
    }
}

#[async_trait]
impl<E: DomainEvent> Archiver<E> for CollectingArchiver<E> {
    async fn archive(
        &self,
        _tenant: &TenantId,
        _identity: &StreamIdentity,
        envelopes: Vec<EventEnvelope<E>>,
    ) -> StorageResult<()> {
        self.received.lock().extend(envelopes);
        Ok(())
    }
}
