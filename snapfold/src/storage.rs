//! Storage collaborator ports.
//!
//! The aggregation engine never talks to a database directly. It consumes
//! two ports: an [`EventLog`] (durable append log with monotonic per-stream
//! versions and atomic multi-event appends) and a [`DocumentStore`]
//! (load/store/delete of materialized snapshots plus shard progress rows).
//! `snapfold-memory` provides in-process implementations for tests and
//! ephemeral use.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::StorageResult;
use crate::event::{DomainEvent, EventEnvelope, Stored};
use crate::types::{
    GlobalSequence, ShardName, StreamIdentity, StreamVersion, TenantId, Timestamp,
};

/// The version expectation an append carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectedVersion {
    /// No expectation; the append always wins.
    Any,
    /// The stream must not exist yet.
    NoStream,
    /// The stream's current version must equal this exactly.
    Exact(StreamVersion),
}

/// Options for fetching a stream's envelopes.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    /// Only envelopes at or below this version.
    pub through_version: Option<StreamVersion>,
    /// Only envelopes appended at or before this instant.
    pub as_of: Option<Timestamp>,
    /// Include envelopes that compaction has archived.
    pub include_archived: bool,
}

impl FetchOptions {
    /// Fetch the whole live stream.
    pub const fn all() -> Self {
        Self {
            through_version: None,
            as_of: None,
            include_archived: false,
        }
    }

    /// Fetch only envelopes at or below `version`.
    #[must_use]
    pub const fn through(mut self, version: StreamVersion) -> Self {
        self.through_version = Some(version);
        self
    }

    /// Fetch only envelopes appended at or before `at`.
    #[must_use]
    pub const fn as_of(mut self, at: Timestamp) -> Self {
        self.as_of = Some(at);
        self
    }

    /// Also fetch envelopes a previous compaction archived.
    #[must_use]
    pub const fn with_archived(mut self) -> Self {
        self.include_archived = true;
        self
    }
}

/// A pending event handed to [`EventLog::append`].
///
/// Sequence, version, id, and timestamp are assigned by the log at append
/// time.
#[derive(Debug, Clone)]
pub struct PendingEvent<E> {
    /// The payload to append.
    pub payload: Stored<E>,
    /// Headers to attach to the envelope.
    pub headers: HashMap<String, String>,
}

impl<E: DomainEvent> PendingEvent<E> {
    /// Wraps a domain event with no headers.
    pub fn new(event: E) -> Self {
        Self {
            payload: Stored::Domain(event),
            headers: HashMap::new(),
        }
    }

    /// Wraps any stored payload, including compacted entries.
    pub fn stored(payload: Stored<E>) -> Self {
        Self {
            payload,
            headers: HashMap::new(),
        }
    }

    /// Attaches one header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// An exclusive per-stream lock held by one session.
///
/// Dropping the guard releases the lock; the log must make a concurrent
/// acquisition attempt fail immediately while a guard is live.
pub trait StreamLock: Send + Sync {
    /// The locked stream.
    fn identity(&self) -> &StreamIdentity;
}

/// The durable append log collaborator.
///
/// Guarantees assumed by the engine: per-stream versions are gapless and
/// strictly increasing from 1, global sequence numbers are monotonic across
/// the store, and one `append` call is atomic.
#[async_trait]
pub trait EventLog<E: DomainEvent>: Send + Sync {
    /// Appends a batch to one stream, checking `expected` first.
    ///
    /// Returns the envelopes as appended, with assigned sequence numbers and
    /// versions.
    async fn append(
        &self,
        tenant: &TenantId,
        identity: &StreamIdentity,
        expected: ExpectedVersion,
        events: Vec<PendingEvent<E>>,
    ) -> StorageResult<Vec<EventEnvelope<E>>>;

    /// Fetches one stream's envelopes in version order.
    async fn fetch(
        &self,
        tenant: &TenantId,
        identity: &StreamIdentity,
        options: FetchOptions,
    ) -> StorageResult<Vec<EventEnvelope<E>>>;

    /// The stream's current version, or [`StreamVersion::none`] when the
    /// stream does not exist.
    async fn stream_version(
        &self,
        tenant: &TenantId,
        identity: &StreamIdentity,
    ) -> StorageResult<StreamVersion>;

    /// The latest global sequence number in the store.
    async fn high_water_mark(&self) -> StorageResult<GlobalSequence>;

    /// Fetches all envelopes with a sequence strictly greater than `after`,
    /// across every stream, in sequence order, up to `limit`.
    async fn fetch_since(
        &self,
        after: GlobalSequence,
        limit: usize,
    ) -> StorageResult<Vec<EventEnvelope<E>>>;

    /// Attempts the exclusive per-stream lock without blocking.
    ///
    /// Returns `None` when another session already holds it.
    async fn try_lock(
        &self,
        tenant: &TenantId,
        identity: &StreamIdentity,
    ) -> StorageResult<Option<Box<dyn StreamLock>>>;

    /// Flags the stream's envelopes at or below `through` as archived, so
    /// default fetches skip them. Returns the envelopes that were archived.
    async fn mark_archived(
        &self,
        tenant: &TenantId,
        identity: &StreamIdentity,
        through: StreamVersion,
    ) -> StorageResult<Vec<EventEnvelope<E>>>;
}

/// A materialized snapshot row as the document store holds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDocument {
    /// The serialized snapshot.
    pub body: serde_json::Value,
    /// The stream version the snapshot was folded through.
    pub version: StreamVersion,
    /// Whether the row carries a soft-delete marker.
    pub deleted: bool,
    /// When the soft-delete marker was set.
    pub deleted_at: Option<Timestamp>,
}

/// The materialized-snapshot store collaborator.
///
/// One logical table per projection, keyed by identity within a tenant.
/// Shard progress rows live here too so the async lifecycle can update them
/// transactionally alongside its own writes.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Loads a snapshot row, soft-deleted or not.
    async fn load(
        &self,
        projection: &str,
        tenant: &TenantId,
        identity: &StreamIdentity,
    ) -> StorageResult<Option<StoredDocument>>;

    /// Upserts a snapshot row, clearing any soft-delete marker.
    async fn store(
        &self,
        projection: &str,
        tenant: &TenantId,
        identity: &StreamIdentity,
        document: StoredDocument,
    ) -> StorageResult<()>;

    /// Hard-deletes a snapshot row. Deleting a missing row is a no-op.
    async fn delete(
        &self,
        projection: &str,
        tenant: &TenantId,
        identity: &StreamIdentity,
    ) -> StorageResult<()>;

    /// Sets the soft-delete marker on an existing row.
    async fn soft_delete(
        &self,
        projection: &str,
        tenant: &TenantId,
        identity: &StreamIdentity,
        at: Timestamp,
    ) -> StorageResult<()>;

    /// Clears the soft-delete marker on an existing row.
    async fn undelete(
        &self,
        projection: &str,
        tenant: &TenantId,
        identity: &StreamIdentity,
    ) -> StorageResult<()>;

    /// Loads a shard's last durably recorded progress.
    async fn load_progress(&self, shard: &ShardName) -> StorageResult<Option<GlobalSequence>>;

    /// Records a shard's progress. Must never move backwards.
    async fn store_progress(
        &self,
        shard: &ShardName,
        sequence: GlobalSequence,
    ) -> StorageResult<()>;
}
