//! Stream compaction: replacing a long replay prefix with one consolidated
//! synthetic envelope.
//!
//! Compaction folds a stream prefix into a snapshot, appends it as a
//! compacted entry at the next version, and hands the superseded envelopes
//! to an [`Archiver`]. It never rewrites existing versions, and it inherits
//! the append log's concurrency rules: a concurrent append to the same
//! stream makes the compaction's expected-version append fail.

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::{FoldResult, StorageError, StorageResult};
use crate::event::{CompactedSnapshot, DomainEvent, EventEnvelope, Stored};
use crate::fold::{Aggregate, Folder};
use crate::slicing::EventSlice;
use crate::storage::{EventLog, ExpectedVersion, FetchOptions, PendingEvent};
use crate::types::{StreamIdentity, StreamVersion, TenantId};

/// Decides what happens to envelopes a compaction superseded.
#[async_trait]
pub trait Archiver<E: DomainEvent>: Send + Sync {
    /// Receives every envelope at or before the compaction point.
    ///
    /// Implementations may delete, export, or ignore them; compaction
    /// succeeds either way.
    async fn archive(
        &self,
        tenant: &TenantId,
        identity: &StreamIdentity,
        envelopes: Vec<EventEnvelope<E>>,
    ) -> StorageResult<()>;
}

/// The archiver that does nothing with superseded envelopes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullArchiver;

#[async_trait]
impl<E: DomainEvent> Archiver<E> for NullArchiver {
    async fn archive(
        &self,
        _tenant: &TenantId,
        _identity: &StreamIdentity,
        _envelopes: Vec<EventEnvelope<E>>,
    ) -> StorageResult<()> {
        Ok(())
    }
}

/// Parameters for one compaction run.
#[derive(Debug, Clone)]
pub struct CompactionRequest {
    /// Compact events at or below this version. Defaults to the stream's
    /// current latest version.
    pub through_version: Option<StreamVersion>,
    /// The operation id recorded as provenance on the compacted entry.
    pub requested_by: Uuid,
    /// Optional free-form reason recorded with the compaction.
    pub reason: Option<String>,
}

impl CompactionRequest {
    /// A request compacting the whole stream, with a fresh operation id.
    pub fn everything() -> Self {
        Self {
            through_version: None,
            requested_by: Uuid::now_v7(),
            reason: None,
        }
    }

    /// Limits the compaction to events at or below `version`.
    #[must_use]
    pub const fn through(mut self, version: StreamVersion) -> Self {
        self.through_version = Some(version);
        self
    }

    /// Records a reason on the compacted entry.
    #[must_use]
    pub fn because(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Folds a stream prefix into a compacted entry and appends it.
///
/// Returns the appended compacted envelope. The superseded envelopes are
/// flagged as archived on the log and handed to `archiver`; their count
/// equals the number of envelopes at or before the compaction point.
///
/// # Errors
///
/// Fails when the stream does not exist, the requested compaction point is
/// past the stream head, the prefix folds to no snapshot, or the append
/// loses a concurrency race.
pub async fn compact_stream<A, E, L, R>(
    folder: &Folder<A, E>,
    log: &L,
    archiver: &R,
    tenant: &TenantId,
    identity: &StreamIdentity,
    request: CompactionRequest,
) -> FoldResult<EventEnvelope<E>>
where
    A: Aggregate,
    E: DomainEvent,
    L: EventLog<E>,
    R: Archiver<E>,
{
    let current = log.stream_version(tenant, identity).await?;
    if current == StreamVersion::none() {
        return Err(StorageError::StreamNotFound(identity.clone()).into());
    }
    let through = request.through_version.unwrap_or(current);
    if through > current {
        return Err(StorageError::Backend(format!(
            "compaction point {through} is past the stream head {current}"
        ))
        .into());
    }

    // The prefix must cover envelopes an earlier compaction archived:
    // a compaction point between the previous one and the head would
    // otherwise fold only the gap events and summarize a truncated history.
    let prefix = log
        .fetch(
            tenant,
            identity,
            FetchOptions::all().through(through).with_archived(),
        )
        .await?;
    let mut slice = EventSlice::new(identity.clone(), tenant.clone());
    slice.events = prefix;
    folder.enrich(std::slice::from_mut(&mut slice)).await?;
    let outcome = folder.fold(None, &slice.events, None).await?;
    let Some(snapshot) = outcome.snapshot else {
        return Err(StorageError::Backend(format!(
            "stream '{identity}' folds to no snapshot through version {through}; nothing to compact"
        ))
        .into());
    };

    let compacted = CompactedSnapshot::wrap(
        folder.aggregate_type(),
        through,
        &snapshot,
        request.requested_by,
        request.reason,
    )
    .map_err(StorageError::from)?;

    let appended = log
        .append(
            tenant,
            identity,
            ExpectedVersion::Exact(current),
            vec![PendingEvent::stored(Stored::Compacted(compacted))],
        )
        .await?;
    let envelope = appended
        .into_iter()
        .next()
        .ok_or_else(|| StorageError::Backend("append returned no envelope".to_string()))?;

    let superseded = log.mark_archived(tenant, identity, through).await?;
    let archived_count = superseded.len();
    archiver.archive(tenant, identity, superseded).await?;

    debug!(
        stream = %identity,
        through = %through,
        archived = archived_count,
        "handed superseded envelopes to archiver"
    );
    info!(
        stream = %identity,
        through = %through,
        at_version = %envelope.version,
        "compacted stream"
    );
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults_to_the_whole_stream() {
        let request = CompactionRequest::everything();
        assert!(request.through_version.is_none());
        assert!(request.reason.is_none());
    }

    #[test]
    fn request_builder_composes() {
        let request = CompactionRequest::everything()
            .through(StreamVersion::try_new(5).unwrap())
            .because("nightly maintenance");
        assert_eq!(request.through_version.unwrap().value(), 5);
        assert_eq!(request.reason.as_deref(), Some("nightly maintenance"));
    }
}
