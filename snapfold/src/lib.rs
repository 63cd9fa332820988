//! `Snapfold` - an event-sourced aggregation and projection engine
//!
//! Snapfold folds ordered domain events into materialized aggregate
//! snapshots. It covers event slicing by identity, a build-time-validated
//! evolve/apply dispatch table, aggregate versioning, action determination
//! (store, delete, soft-delete, undelete), stream compaction with reset-point
//! envelopes, fetch-for-writing with optimistic and pessimistic concurrency,
//! and three projection lifecycles: inline, live, and async (daemon-driven,
//! tracked by per-shard progress).
//!
//! Durable storage is consumed through two ports, [`storage::EventLog`] and
//! [`storage::DocumentStore`]; the `snapfold-memory` crate provides
//! in-process implementations.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod action;
pub mod cache;
pub mod compaction;
pub mod config;
pub mod daemon;
pub mod errors;
pub mod event;
pub mod fold;
pub mod session;
pub mod slicing;
pub mod storage;
pub mod types;
pub mod versioning;

pub use action::{determine_action, last_known_good, AggregateAction, Determination};
pub use compaction::{compact_stream, Archiver, CompactionRequest, NullArchiver};
pub use config::{
    ProjectionLifecycle, ProjectionRegistration, ProjectionScope, StoreConfig, TenancyStyle,
};
pub use daemon::{DaemonOptions, ProjectionDaemon, ProjectionShard, ShardStatus};
pub use errors::{
    ConcurrencyError, ConfigError, ConfigResult, DaemonError, DaemonResult, FoldError, FoldResult,
    StorageError, StorageResult,
};
pub use event::{CompactedSnapshot, DomainEvent, EventEnvelope, Stored};
pub use fold::{Aggregate, FoldNext, FoldOutcome, Folder, FolderBuilder};
pub use session::{AggregateStore, Session, WritableStream};
pub use slicing::{ByEventKey, ByStreamIdentity, EventSlice, Slicer};
pub use storage::{
    DocumentStore, EventLog, ExpectedVersion, FetchOptions, PendingEvent, StoredDocument,
    StreamLock,
};
pub use types::{
    EventId, GlobalSequence, IdentityScheme, ShardName, StreamIdentity, StreamKey, StreamVersion,
    TenantId, Timestamp,
};
pub use versioning::{MemberKind, ValueKind, VersionCandidate, VersionMember, VersionScope};
