//! Core identifier and sequence types for the snapfold aggregation engine.
//!
//! All types use smart constructors so that a value, once constructed, is
//! always valid. Raw strings and integers only appear at the system boundary.

use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A string stream key for stores configured with the string identity scheme.
///
/// Keys are trimmed, non-empty, and at most 255 characters.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct StreamKey(String);

/// A globally unique event identifier using UUIDv7 format.
///
/// UUIDv7 carries a timestamp component, so event ids sort in creation order.
#[nutype(
    validate(predicate = |id: &Uuid| id.get_version() == Some(uuid::Version::SortRand)),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new `EventId` with the current timestamp.
    pub fn new() -> Self {
        Self::try_new(Uuid::now_v7()).expect("Uuid::now_v7() should always return a valid v7 UUID")
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

/// The position of an event within one stream.
///
/// The first event of a stream has version 1; versions increase by exactly
/// one per event with no gaps. Version 0 means "the stream has no events".
#[nutype(
    validate(greater_or_equal = 0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct StreamVersion(u64);

impl StreamVersion {
    /// The version of a stream before any event has been appended.
    pub fn none() -> Self {
        Self::try_new(0).expect("0 is always a valid version")
    }

    /// Returns the version of the next event to be appended.
    #[must_use]
    pub fn next(self) -> Self {
        let current: u64 = self.into();
        Self::try_new(current + 1).expect("next version should always be valid")
    }

    /// Returns the raw numeric value.
    pub fn value(self) -> u64 {
        self.into()
    }
}

/// A position in the store-wide append log.
///
/// Global sequence numbers are assigned at append time and are monotonic
/// across all streams. They drive multi-stream versioning and async shard
/// progress tracking.
#[nutype(
    validate(greater_or_equal = 0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct GlobalSequence(u64);

impl GlobalSequence {
    /// The sequence before any event exists in the store.
    pub fn start() -> Self {
        Self::try_new(0).expect("0 is always a valid sequence")
    }

    /// Returns the next sequence number.
    #[must_use]
    pub fn next(self) -> Self {
        let current: u64 = self.into();
        Self::try_new(current + 1).expect("next sequence should always be valid")
    }

    /// Returns the raw numeric value.
    pub fn value(self) -> u64 {
        self.into()
    }
}

/// A tenant identifier for multi-tenant stores.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct TenantId(String);

impl TenantId {
    /// The tenant used by single-tenant stores and by global projections.
    pub fn default_tenant() -> Self {
        Self::try_new("*default*").expect("default tenant id is always valid")
    }
}

/// The name of one asynchronous projection shard.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ShardName(String);

/// A timestamp for when an event occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a new timestamp from a UTC `DateTime`.
    pub const fn new(datetime: DateTime<Utc>) -> Self {
        Self(datetime)
    }

    /// Creates a timestamp representing the current moment.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Returns the underlying `DateTime`.
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Converts the timestamp into the underlying `DateTime`.
    pub const fn into_datetime(self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(datetime: DateTime<Utc>) -> Self {
        Self::new(datetime)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The identity scheme a store is configured with.
///
/// Exactly one scheme applies per store, fixed at configuration time.
/// Calling the Guid-keyed API against a string-keyed store (or vice versa)
/// is a usage error raised synchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdentityScheme {
    /// Streams are keyed by `Uuid`.
    Guid,
    /// Streams are keyed by string `StreamKey`.
    Key,
}

impl std::fmt::Display for IdentityScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Guid => write!(f, "Guid"),
            Self::Key => write!(f, "String"),
        }
    }
}

/// The identity of one event stream, under either identity scheme.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StreamIdentity {
    /// A Guid-keyed stream.
    Guid(Uuid),
    /// A string-keyed stream.
    Key(StreamKey),
}

impl StreamIdentity {
    /// Creates a Guid-scheme identity.
    pub const fn guid(id: Uuid) -> Self {
        Self::Guid(id)
    }

    /// Creates a string-scheme identity from a raw key.
    ///
    /// # Errors
    ///
    /// Returns the `nutype` validation error when the key is empty or too long.
    pub fn key(key: impl Into<String>) -> Result<Self, StreamKeyError> {
        Ok(Self::Key(StreamKey::try_new(key.into())?))
    }

    /// Returns the scheme this identity belongs to.
    pub const fn scheme(&self) -> IdentityScheme {
        match self {
            Self::Guid(_) => IdentityScheme::Guid,
            Self::Key(_) => IdentityScheme::Key,
        }
    }
}

impl std::fmt::Display for StreamIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Guid(id) => id.fmt(f),
            Self::Key(key) => key.fmt(f),
        }
    }
}

impl From<Uuid> for StreamIdentity {
    fn from(id: Uuid) -> Self {
        Self::Guid(id)
    }
}

impl From<StreamKey> for StreamIdentity {
    fn from(key: StreamKey) -> Self {
        Self::Key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn stream_key_accepts_valid_strings(s in "[a-zA-Z0-9_-]{1,255}") {
            let result = StreamKey::try_new(s.clone());
            prop_assert!(result.is_ok());
            let key = result.unwrap();
            prop_assert_eq!(key.as_ref(), &s);
        }

        #[test]
        fn stream_key_rejects_blank_strings(s in " {0,50}") {
            prop_assert!(StreamKey::try_new(s).is_err());
        }

        #[test]
        fn stream_version_next_increments_by_one(v in 0u64..u64::MAX) {
            let version = StreamVersion::try_new(v).unwrap();
            prop_assert_eq!(version.next().value(), v + 1);
        }

        #[test]
        fn global_sequence_ordering_matches_raw_ordering(a in 0u64..=u64::MAX, b in 0u64..=u64::MAX) {
            let sa = GlobalSequence::try_new(a).unwrap();
            let sb = GlobalSequence::try_new(b).unwrap();
            prop_assert_eq!(sa < sb, a < b);
            prop_assert_eq!(sa == sb, a == b);
        }

        #[test]
        fn stream_version_roundtrip_serialization(v in 0u64..=u64::MAX) {
            let version = StreamVersion::try_new(v).unwrap();
            let json = serde_json::to_string(&version).unwrap();
            let deserialized: StreamVersion = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(version, deserialized);
        }
    }

    #[test]
    fn stream_version_none_is_zero() {
        assert_eq!(StreamVersion::none().value(), 0);
    }

    #[test]
    fn first_appended_version_is_one() {
        assert_eq!(StreamVersion::none().next().value(), 1);
    }

    #[test]
    fn event_id_new_creates_valid_v7() {
        let event_id = EventId::new();
        assert_eq!(
            event_id.as_ref().get_version(),
            Some(uuid::Version::SortRand)
        );
    }

    #[test]
    fn event_id_rejects_non_v7_uuids() {
        assert!(EventId::try_new(Uuid::nil()).is_err());
        assert!(EventId::try_new(Uuid::max()).is_err());
    }

    #[test]
    fn identity_scheme_is_derived_from_the_variant() {
        let guid = StreamIdentity::guid(Uuid::now_v7());
        assert_eq!(guid.scheme(), IdentityScheme::Guid);

        let key = StreamIdentity::key("order-17").unwrap();
        assert_eq!(key.scheme(), IdentityScheme::Key);
    }

    #[test]
    fn identity_display_shows_underlying_value() {
        let key = StreamIdentity::key("invoice-9").unwrap();
        assert_eq!(key.to_string(), "invoice-9");
    }

    #[test]
    fn default_tenant_is_stable() {
        assert_eq!(TenantId::default_tenant(), TenantId::default_tenant());
    }

    #[test]
    fn stream_key_trims_whitespace() {
        let key = StreamKey::try_new("  trimmed  ").unwrap();
        assert_eq!(key.as_ref(), "trimmed");
    }
}
