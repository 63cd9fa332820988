//! Error types for snapfold.
//!
//! The taxonomy follows the failure surfaces of the aggregation engine:
//!
//! - **`ConfigError`**: projection-build-time validation failures. Fatal,
//!   never retried, raised before any event flows.
//! - **`ConcurrencyError`**: expected and commonly caught by callers of the
//!   write-side operations (fetch-for-writing, commit, start-stream).
//! - **`StorageError`**: failures surfaced by the storage collaborators.
//! - **`FoldError`**: failures while folding a slice. Author hook failures
//!   propagate unchanged; the engine adds no retry and stages no partial
//!   write for the affected slice.
//! - **`DaemonError`**: async daemon operations, including the distinct
//!   wait-for-non-stale timeout.

use crate::types::{EventId, GlobalSequence, IdentityScheme, ShardName, StreamIdentity, StreamVersion};
use thiserror::Error;

/// Projection-build-time validation failures.
///
/// These surface synchronously, as early as possible, and are never
/// swallowed at runtime.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// More than one member qualifies as the aggregate's version member.
    #[error("Ambiguous version member on '{aggregate}': candidates {candidates:?}")]
    AmbiguousVersionMember {
        /// The aggregate type under inspection
        aggregate: String,
        /// The names of the competing candidates
        candidates: Vec<String>,
    },

    /// Two handlers were registered for the same event type and role.
    #[error("Duplicate {role} handler for event type '{event_type}'")]
    DuplicateHandler {
        /// The role of the colliding handlers ("create" or "apply")
        role: &'static str,
        /// The contested event type
        event_type: String,
    },

    /// A sync and an async handler exist for the same event type.
    ///
    /// There is no precedence order between the two conventions; pick one
    /// per event type per projection.
    #[error("Event type '{0}' registers both a synchronous and an asynchronous handler")]
    MixedHandlerConventions(String),

    /// A declared event type has no handler, no ignore marker, and no
    /// default-create fallback to absorb it.
    #[error("Event type '{event_type}' has no create or apply handler on projection '{projection}'")]
    UnhandledEventType {
        /// The projection that failed validation
        projection: String,
        /// The unhandled event type
        event_type: String,
    },

    /// Per-event-type handlers were combined with a whole-fold override.
    #[error("Projection '{0}' combines per-type handlers with an evolve override")]
    EvolveOverrideConflict(String),

    /// Soft-delete behavior was requested on an aggregate without a
    /// deleted-flag capability.
    #[error("Aggregate '{0}' does not expose a deleted flag; soft-delete is unsupported")]
    SoftDeleteUnsupported(String),

    /// The identity used does not match the store's configured scheme.
    #[error("This store is configured for {configured}-identified streams; a {used}-identified stream was requested")]
    IdentitySchemeMismatch {
        /// The scheme the store was built with
        configured: IdentityScheme,
        /// The scheme of the identity the caller supplied
        used: IdentityScheme,
    },

    /// A projection registration failed a structural check.
    #[error("Invalid projection registration '{projection}': {reason}")]
    InvalidRegistration {
        /// The projection name
        projection: String,
        /// Why the registration was rejected
        reason: String,
    },
}

/// Optimistic- and pessimistic-concurrency failures on the write side.
#[derive(Debug, Clone, Error)]
pub enum ConcurrencyError {
    /// The version supplied to fetch-for-writing did not match the stream.
    ///
    /// Raised at fetch time, before any append is attempted.
    #[error("Expected version {expected} for stream '{identity}', but current is {current}")]
    ExpectedVersionMismatch {
        /// The stream that failed the check
        identity: StreamIdentity,
        /// The version the caller expected
        expected: StreamVersion,
        /// The actual current version
        current: StreamVersion,
    },

    /// Another writer advanced the stream between fetch and commit.
    ///
    /// Raised at commit time by `save_changes`.
    #[error("Stream '{identity}' advanced past version {fetched} before commit")]
    VersionAdvanced {
        /// The stream that advanced
        identity: StreamIdentity,
        /// The version observed at fetch time
        fetched: StreamVersion,
    },

    /// The stream is exclusively locked by another session.
    ///
    /// Exclusive fetch fails immediately rather than blocking.
    #[error("Stream '{0}' is locked for exclusive writing by another session")]
    StreamLocked(StreamIdentity),

    /// A new stream was started at an identity that already has events.
    #[error("Stream '{identity}' already exists with version {current}")]
    StreamCollision {
        /// The contested identity
        identity: StreamIdentity,
        /// The existing stream's version
        current: StreamVersion,
    },
}

/// Failures surfaced by the storage collaborators.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested stream has no events.
    #[error("Stream '{0}' not found")]
    StreamNotFound(StreamIdentity),

    /// An append failed its expected-version check.
    #[error("Version conflict on stream '{identity}': expected {expected:?}, but current is {current}")]
    VersionConflict {
        /// The stream with the conflict
        identity: StreamIdentity,
        /// The expectation the append carried
        expected: crate::storage::ExpectedVersion,
        /// The actual current version
        current: StreamVersion,
    },

    /// Serialization of a document or snapshot failed.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Deserialization of a document or snapshot failed.
    #[error("Deserialization failed: {0}")]
    Deserialization(String),

    /// The backing store reported a failure.
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Failures while folding a slice of events.
#[derive(Debug, Error)]
pub enum FoldError {
    /// An author-supplied create or apply hook failed.
    ///
    /// The failure propagates unchanged apart from event-id context; the
    /// whole slice's action is abandoned.
    #[error("Apply hook failed on event {event_id}: {reason}")]
    ApplyFailed {
        /// The event being folded when the hook failed
        event_id: EventId,
        /// The hook's own failure message
        reason: String,
    },

    /// The async enrichment pre-step failed before any evolve call ran.
    #[error("Enrichment failed: {0}")]
    EnrichmentFailed(String),

    /// An event type reached the fold with no handler.
    ///
    /// Configuration validation catches this at build time whenever the
    /// event-type universe is declared; this is the runtime backstop.
    #[error("No handler registered for event type '{0}'")]
    MissingHandler(String),

    /// A compacted envelope's wrapped snapshot could not be decoded.
    #[error("Failed to decode compacted snapshot at version {version}: {reason}")]
    SnapshotDecode {
        /// The version of the compacted envelope
        version: StreamVersion,
        /// The decode failure
        reason: String,
    },

    /// The fold was cancelled before completion; nothing was staged.
    #[error("Fold cancelled")]
    Cancelled,

    /// A storage collaborator failed mid-operation.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Concurrency failure surfaced through a fold-driven operation.
    #[error("Concurrency error: {0}")]
    Concurrency(#[from] ConcurrencyError),

    /// Configuration/usage error surfaced through a fold-driven operation.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Failures of the async projection daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Waiting for non-stale data exceeded the caller-supplied budget.
    #[error("Shard '{shard}' did not reach sequence {target} within {timeout:?}")]
    WaitTimeout {
        /// The shard being waited on
        shard: ShardName,
        /// The high-water mark captured at call time
        target: GlobalSequence,
        /// The caller-supplied budget
        timeout: std::time::Duration,
    },

    /// The named shard is not registered with the daemon.
    #[error("Unknown shard '{0}'")]
    UnknownShard(ShardName),

    /// The shard stalled at its last good checkpoint after a fold failure.
    #[error("Shard '{shard}' is faulted: {reason}")]
    ShardFaulted {
        /// The faulted shard
        shard: ShardName,
        /// The failure that stalled it
        reason: String,
    },

    /// A storage collaborator failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Type alias for configuration results.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Type alias for storage results.
pub type StorageResult<T> = Result<T, StorageError>;

/// Type alias for fold results.
pub type FoldResult<T> = Result<T, FoldError>;

/// Type alias for daemon results.
pub type DaemonResult<T> = Result<T, DaemonError>;
