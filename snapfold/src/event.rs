//! Event envelopes and payload types.
//!
//! An [`EventEnvelope`] wraps a raw domain event payload with the metadata
//! assigned at append time: global sequence, per-stream version, stream
//! identity, tenant, timestamp, and headers. Envelopes are immutable once
//! appended.
//!
//! A stream's history may also contain [`CompactedSnapshot`] entries, written
//! by the compaction operation. A compacted entry wraps a previously folded
//! snapshot plus provenance and acts as a full reset point for any read that
//! encounters it.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{FoldError, FoldResult};
use crate::types::{EventId, GlobalSequence, StreamIdentity, StreamVersion, TenantId, Timestamp};

/// The contract every domain event payload must satisfy.
///
/// Dispatch in the fold engine is keyed on [`DomainEvent::event_type`], so the
/// name must be stable and unique within one event universe. Deriving
/// `Serialize`/`Deserialize` is required because payloads cross the storage
/// collaborator boundary.
pub trait DomainEvent: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// A stable, unique name for this event's type.
    fn event_type(&self) -> &'static str;
}

/// The event-type name reported for compacted entries.
pub const COMPACTED_EVENT_TYPE: &str = "$compacted";

/// A synthetic payload wrapping a consolidated snapshot of a stream prefix.
///
/// At most one compacted entry is "active" for any read: the most recent one
/// in sequence order wins, and all envelopes strictly before it are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactedSnapshot {
    /// The aggregate type the wrapped snapshot was folded into.
    pub aggregate_type: String,
    /// The last stream version folded into the snapshot.
    pub through_version: StreamVersion,
    /// The serialized snapshot.
    pub snapshot: serde_json::Value,
    /// The operation that requested the compaction.
    pub requested_by: Uuid,
    /// Optional free-form reason recorded with the compaction.
    pub reason: Option<String>,
}

impl CompactedSnapshot {
    /// Wraps a folded snapshot for appending as a compacted entry.
    pub fn wrap<A: Serialize>(
        aggregate_type: impl Into<String>,
        through_version: StreamVersion,
        snapshot: &A,
        requested_by: Uuid,
        reason: Option<String>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            aggregate_type: aggregate_type.into(),
            through_version,
            snapshot: serde_json::to_value(snapshot)?,
            requested_by,
            reason,
        })
    }

    /// Decodes the wrapped snapshot back into the aggregate type.
    pub fn unwrap_snapshot<A: DeserializeOwned>(&self) -> FoldResult<A> {
        serde_json::from_value(self.snapshot.clone()).map_err(|e| FoldError::SnapshotDecode {
            version: self.through_version,
            reason: e.to_string(),
        })
    }
}

/// The payload slot of a stored envelope: either a raw domain event or a
/// compacted snapshot entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum Stored<E> {
    /// A raw domain event.
    Domain(E),
    /// A compacted snapshot entry written by the compaction operation.
    Compacted(CompactedSnapshot),
}

impl<E: DomainEvent> Stored<E> {
    /// The dispatch key for this payload.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Domain(event) => event.event_type(),
            Self::Compacted(_) => COMPACTED_EVENT_TYPE,
        }
    }

    /// Returns the domain event, if this is not a compacted entry.
    pub const fn as_domain(&self) -> Option<&E> {
        match self {
            Self::Domain(event) => Some(event),
            Self::Compacted(_) => None,
        }
    }

    /// Returns the compacted entry, if present.
    pub const fn as_compacted(&self) -> Option<&CompactedSnapshot> {
        match self {
            Self::Domain(_) => None,
            Self::Compacted(snapshot) => Some(snapshot),
        }
    }
}

/// An immutable event as it exists in the append log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    /// Unique identifier for this event.
    pub id: EventId,
    /// Position in the store-wide append log.
    pub sequence: GlobalSequence,
    /// Position within the owning stream, starting at 1.
    pub version: StreamVersion,
    /// The owning stream.
    pub identity: StreamIdentity,
    /// The tenant whose session appended the event.
    pub tenant: TenantId,
    /// When the event was appended.
    pub timestamp: Timestamp,
    /// Optional headers attached at append time.
    pub headers: HashMap<String, String>,
    /// The payload.
    pub payload: Stored<E>,
}

impl<E: DomainEvent> EventEnvelope<E> {
    /// The dispatch key for this envelope's payload.
    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }

    /// Returns the domain event payload, if this is not a compacted entry.
    pub const fn domain_event(&self) -> Option<&E> {
        self.payload.as_domain()
    }

    /// Whether this envelope is a compacted snapshot entry.
    pub const fn is_compacted(&self) -> bool {
        matches!(self.payload, Stored::Compacted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StreamIdentity;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    enum CounterEvent {
        Incremented { by: u64 },
        Reset,
    }

    impl DomainEvent for CounterEvent {
        fn event_type(&self) -> &'static str {
            match self {
                Self::Incremented { .. } => "Incremented",
                Self::Reset => "Reset",
            }
        }
    }

    fn envelope(payload: Stored<CounterEvent>) -> EventEnvelope<CounterEvent> {
        EventEnvelope {
            id: EventId::new(),
            sequence: GlobalSequence::try_new(1).unwrap(),
            version: StreamVersion::try_new(1).unwrap(),
            identity: StreamIdentity::key("counter-1").unwrap(),
            tenant: TenantId::default_tenant(),
            timestamp: Timestamp::now(),
            headers: HashMap::new(),
            payload,
        }
    }

    #[test]
    fn domain_payload_reports_the_event_type() {
        let env = envelope(Stored::Domain(CounterEvent::Incremented { by: 2 }));
        assert_eq!(env.event_type(), "Incremented");
        assert!(!env.is_compacted());
        assert!(env.domain_event().is_some());
    }

    #[test]
    fn compacted_payload_reports_the_reserved_type() {
        #[derive(Serialize, Deserialize)]
        struct Counter {
            total: u64,
        }

        let compacted = CompactedSnapshot::wrap(
            "Counter",
            StreamVersion::try_new(5).unwrap(),
            &Counter { total: 9 },
            Uuid::now_v7(),
            Some("nightly compaction".to_string()),
        )
        .unwrap();

        let env = envelope(Stored::Compacted(compacted));
        assert_eq!(env.event_type(), COMPACTED_EVENT_TYPE);
        assert!(env.is_compacted());
        assert!(env.domain_event().is_none());
    }

    #[test]
    fn compacted_snapshot_roundtrips_the_wrapped_aggregate() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Counter {
            total: u64,
        }

        let original = Counter { total: 41 };
        let wrapped = CompactedSnapshot::wrap(
            "Counter",
            StreamVersion::try_new(3).unwrap(),
            &original,
            Uuid::now_v7(),
            None,
        )
        .unwrap();

        let decoded: Counter = wrapped.unwrap_snapshot().unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn snapshot_decode_failure_carries_the_compaction_version() {
        #[derive(Debug, Serialize, Deserialize)]
        struct Incompatible {
            name: String,
        }

        let wrapped = CompactedSnapshot::wrap(
            "Counter",
            StreamVersion::try_new(7).unwrap(),
            &42u64,
            Uuid::now_v7(),
            None,
        )
        .unwrap();

        let err = wrapped.unwrap_snapshot::<Incompatible>().unwrap_err();
        match err {
            FoldError::SnapshotDecode { version, .. } => {
                assert_eq!(version.value(), 7);
            }
            other => panic!("expected SnapshotDecode, got {other:?}"),
        }
    }

    #[test]
    fn envelope_serialization_roundtrip() {
        let env = envelope(Stored::Domain(CounterEvent::Reset));
        let json = serde_json::to_string(&env).unwrap();
        let decoded: EventEnvelope<CounterEvent> = serde_json::from_str(&json).unwrap();
        assert_eq!(env, decoded);
    }
}
