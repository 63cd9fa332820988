//! Aggregate version-member discovery and assignment.
//!
//! An aggregate may expose a member that tracks "events applied so far". The
//! engine discovers that member once, at projection build time, from a set of
//! declared candidates, then writes it after every applied event.
//!
//! Discovery order:
//!
//! 1. a candidate explicitly marked as the version member wins
//!    unconditionally, even when a conventionally named member also exists;
//! 2. otherwise a member literally named `Version` of integer kind, with a
//!    property beating a field of the same name;
//! 3. otherwise none, and version assignment is a no-op for the type.
//!
//! Candidates of unsupported value kinds or explicitly marked as ignored are
//! never selected, regardless of name.

use std::sync::Arc;

use crate::errors::{ConfigError, ConfigResult};
use crate::event::EventEnvelope;

/// The conventional member name used by discovery rule 2.
pub const CONVENTIONAL_VERSION_NAME: &str = "Version";

/// Whether versions come from the per-stream version or the store-wide
/// sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionScope {
    /// The aggregate folds one stream; versions are per-stream.
    SingleStream,
    /// The aggregate folds events across streams; versions are global
    /// sequence numbers.
    MultiStream,
}

/// The structural kind of a candidate member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    /// An accessor pair. Preferred over a field of the same name.
    Property,
    /// A plain field.
    Field,
}

/// The value kind of a candidate member.
///
/// Only integer kinds are selectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// 32-bit integer.
    Int,
    /// 64-bit integer.
    Long,
    /// Anything else. Never selected, even when conventionally named.
    Other,
}

type Setter<A> = Arc<dyn Fn(&mut A, u64) + Send + Sync>;

/// One declared candidate for an aggregate's version member.
pub struct VersionCandidate<A> {
    name: String,
    member_kind: MemberKind,
    value_kind: ValueKind,
    marked: bool,
    ignored: bool,
    setter: Option<Setter<A>>,
}

impl<A> VersionCandidate<A> {
    /// Declares a property candidate.
    pub fn property(name: impl Into<String>, value_kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            member_kind: MemberKind::Property,
            value_kind,
            marked: false,
            ignored: false,
            setter: None,
        }
    }

    /// Declares a field candidate.
    pub fn field(name: impl Into<String>, value_kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            member_kind: MemberKind::Field,
            value_kind,
            marked: false,
            ignored: false,
            setter: None,
        }
    }

    /// Marks this candidate as the explicit version member.
    #[must_use]
    pub const fn marked(mut self) -> Self {
        self.marked = true;
        self
    }

    /// Excludes this candidate from discovery.
    #[must_use]
    pub const fn ignored(mut self) -> Self {
        self.ignored = true;
        self
    }

    /// Attaches the assignment function invoked when this candidate wins.
    #[must_use]
    pub fn with_setter(mut self, setter: impl Fn(&mut A, u64) + Send + Sync + 'static) -> Self {
        self.setter = Some(Arc::new(setter));
        self
    }

    const fn selectable(&self) -> bool {
        !self.ignored && matches!(self.value_kind, ValueKind::Int | ValueKind::Long)
    }
}

impl<A> std::fmt::Debug for VersionCandidate<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionCandidate")
            .field("name", &self.name)
            .field("member_kind", &self.member_kind)
            .field("value_kind", &self.value_kind)
            .field("marked", &self.marked)
            .field("ignored", &self.ignored)
            .finish_non_exhaustive()
    }
}

/// The resolved version member for an aggregate type.
#[derive(Clone)]
pub struct VersionMember<A> {
    name: String,
    setter: Option<Setter<A>>,
}

impl<A> VersionMember<A> {
    /// The name of the member that won discovery.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn set(&self, aggregate: &mut A, value: u64) {
        if let Some(setter) = &self.setter {
            setter(aggregate, value);
        }
    }
}

impl<A> std::fmt::Debug for VersionMember<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionMember")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Runs discovery over the declared candidates.
///
/// Returns `Ok(None)` when no candidate qualifies; versioning is then a no-op
/// for the aggregate type.
///
/// # Errors
///
/// Returns [`ConfigError::AmbiguousVersionMember`] when discovery cannot pick
/// exactly one winner.
pub fn resolve_version_member<A>(
    aggregate_type: &str,
    candidates: Vec<VersionCandidate<A>>,
) -> ConfigResult<Option<VersionMember<A>>> {
    let ambiguous = |names: Vec<String>| ConfigError::AmbiguousVersionMember {
        aggregate: aggregate_type.to_string(),
        candidates: names,
    };

    let marked: Vec<&VersionCandidate<A>> = candidates
        .iter()
        .filter(|c| c.marked && !c.ignored)
        .collect();
    match marked.as_slice() {
        [] => {}
        [winner] => {
            return Ok(Some(VersionMember {
                name: winner.name.clone(),
                setter: winner.setter.clone(),
            }))
        }
        many => {
            return Err(ambiguous(many.iter().map(|c| c.name.clone()).collect()));
        }
    }

    let conventional: Vec<&VersionCandidate<A>> = candidates
        .iter()
        .filter(|c| c.selectable() && c.name == CONVENTIONAL_VERSION_NAME)
        .collect();

    let properties: Vec<&&VersionCandidate<A>> = conventional
        .iter()
        .filter(|c| c.member_kind == MemberKind::Property)
        .collect();
    let fields: Vec<&&VersionCandidate<A>> = conventional
        .iter()
        .filter(|c| c.member_kind == MemberKind::Field)
        .collect();

    // Property beats field; two of the same kind cannot be told apart.
    let winner = match (properties.as_slice(), fields.as_slice()) {
        ([], []) => return Ok(None),
        ([p], _) => **p,
        ([], [f]) => **f,
        _ => {
            return Err(ambiguous(
                conventional.iter().map(|c| c.name.clone()).collect(),
            ));
        }
    };

    Ok(Some(VersionMember {
        name: winner.name.clone(),
        setter: winner.setter.clone(),
    }))
}

/// Writes the version member on the aggregate from the envelope just applied.
///
/// Single-stream scope writes the per-stream version; multi-stream scope
/// writes the global sequence. A missing member makes this a no-op, not an
/// error.
pub fn try_set_version<A, E>(
    member: Option<&VersionMember<A>>,
    scope: VersionScope,
    aggregate: &mut A,
    envelope: &EventEnvelope<E>,
) {
    let Some(member) = member else { return };
    let value = match scope {
        VersionScope::SingleStream => envelope.version.value(),
        VersionScope::MultiStream => envelope.sequence.value(),
    };
    member.set(aggregate, value);
}
