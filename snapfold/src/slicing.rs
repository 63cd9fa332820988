//! Partitioning of flat event batches into per-identity slices.
//!
//! A [`Slicer`] takes a batch of envelopes spanning many streams and groups
//! them by aggregate identity, preserving the relative order in which they
//! were appended. The fold engine never reorders a slice's envelopes.

use std::collections::HashMap;
use std::sync::Arc;

use crate::event::{DomainEvent, EventEnvelope};
use crate::types::{StreamIdentity, TenantId};

/// All envelopes for one aggregate identity within one processing batch.
///
/// Slices are one-shot: created per aggregation run and discarded after
/// folding. The `aggregate` slot carries the current snapshot, if one was
/// loaded before folding.
#[derive(Debug)]
pub struct EventSlice<A, E> {
    /// The aggregate identity this slice belongs to.
    pub identity: StreamIdentity,
    /// The tenant the slice's events belong to.
    pub tenant: TenantId,
    /// The slice's envelopes, in append order.
    pub events: Vec<EventEnvelope<E>>,
    /// The current snapshot for the identity, when one exists.
    pub aggregate: Option<A>,
    /// Whether no snapshot existed before this run.
    pub is_new: bool,
}

impl<A, E> EventSlice<A, E> {
    /// Creates a slice for an identity with no existing snapshot.
    pub const fn new(identity: StreamIdentity, tenant: TenantId) -> Self {
        Self {
            identity,
            tenant,
            events: Vec::new(),
            aggregate: None,
            is_new: true,
        }
    }

    /// Attaches the previously materialized snapshot.
    #[must_use]
    pub fn with_aggregate(mut self, aggregate: A) -> Self {
        self.aggregate = Some(aggregate);
        self.is_new = false;
        self
    }

    /// The last envelope of the slice, if any.
    pub fn last_event(&self) -> Option<&EventEnvelope<E>> {
        self.events.last()
    }
}

/// Policy object partitioning a batch of envelopes into per-identity slices.
pub trait Slicer<A, E>: Send + Sync {
    /// Groups the batch into slices, preserving append order within each
    /// slice and first-seen order across slices.
    fn slice(&self, batch: &[EventEnvelope<E>]) -> Vec<EventSlice<A, E>>;
}

/// Slices by the envelope's owning stream identity.
///
/// This is the trivial partition used by single-stream snapshot projections.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByStreamIdentity;

impl<A, E: Clone> Slicer<A, E> for ByStreamIdentity {
    fn slice(&self, batch: &[EventEnvelope<E>]) -> Vec<EventSlice<A, E>> {
        group_by(batch, |envelope| Some(envelope.identity.clone()))
    }
}

/// Slices by an identity derived from the event payload.
///
/// Events whose payload does not yield an identity are excluded from this
/// slicer's view. That is not an error: it lets multiple projections with
/// different key functions coexist over a shared event stream.
pub struct ByEventKey<E> {
    key_fn: Arc<dyn Fn(&E) -> Option<StreamIdentity> + Send + Sync>,
}

impl<E> ByEventKey<E> {
    /// Creates a slicer deriving the identity from each event's payload.
    pub fn new(key_fn: impl Fn(&E) -> Option<StreamIdentity> + Send + Sync + 'static) -> Self {
        Self {
            key_fn: Arc::new(key_fn),
        }
    }
}

impl<E> Clone for ByEventKey<E> {
    fn clone(&self) -> Self {
        Self {
            key_fn: Arc::clone(&self.key_fn),
        }
    }
}

impl<E> std::fmt::Debug for ByEventKey<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByEventKey").finish_non_exhaustive()
    }
}

impl<A, E: DomainEvent> Slicer<A, E> for ByEventKey<E> {
    fn slice(&self, batch: &[EventEnvelope<E>]) -> Vec<EventSlice<A, E>> {
        group_by(batch, |envelope| {
            // Compacted entries stay with their owning stream.
            match envelope.domain_event() {
                Some(event) => (self.key_fn)(event),
                None => Some(envelope.identity.clone()),
            }
        })
    }
}

fn group_by<A, E: Clone>(
    batch: &[EventEnvelope<E>],
    key_of: impl Fn(&EventEnvelope<E>) -> Option<StreamIdentity>,
) -> Vec<EventSlice<A, E>> {
    let mut slices: Vec<EventSlice<A, E>> = Vec::new();
    let mut index: HashMap<StreamIdentity, usize> = HashMap::new();

    for envelope in batch {
        let Some(identity) = key_of(envelope) else {
            continue;
        };
        let at = *index.entry(identity.clone()).or_insert_with(|| {
            slices.push(EventSlice::new(identity, envelope.tenant.clone()));
            slices.len() - 1
        });
        slices[at].events.push(envelope.clone());
    }

    slices
}
