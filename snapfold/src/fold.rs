//! The fold engine: evolve/apply dispatch over event slices.
//!
//! Authors register per-event-type handlers (create, apply, ignore) or a
//! whole-fold evolve override on a [`FolderBuilder`]. Registration happens at
//! projection build time and produces a closed dispatch table keyed by event
//! type and role; ambiguities are configuration errors raised by
//! [`FolderBuilder::build`], never swallowed at runtime.
//!
//! Every calling convention is normalized to one internal contract:
//! `evolve(snapshot, event) -> FoldNext`. Within one slice, events fold
//! strictly in order; an async handler is awaited fully before the next event
//! is touched.

use std::collections::{HashMap, HashSet};
use std::future::Future;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;

use crate::errors::{ConfigError, ConfigResult, FoldError, FoldResult};
use crate::event::{DomainEvent, EventEnvelope, Stored};
use crate::slicing::EventSlice;
use crate::types::{StreamVersion, Timestamp};
use crate::versioning::{
    resolve_version_member, try_set_version, VersionCandidate, VersionMember, VersionScope,
};

/// The contract every aggregate snapshot type must satisfy.
///
/// Snapshots cross the document-store boundary and are wrapped by compacted
/// envelopes, so they must serialize.
pub trait Aggregate: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Aggregate for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// The result of evolving a snapshot by one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FoldNext<A> {
    /// The next snapshot value.
    Snapshot(A),
    /// The event deletes the aggregate; the snapshot becomes absent.
    Deleted,
    /// The event leaves the snapshot untouched.
    Unchanged,
}

/// The net result of folding one slice.
#[derive(Debug, Clone)]
pub struct FoldOutcome<A> {
    /// The snapshot after the last applied event, if any.
    pub snapshot: Option<A>,
    /// Whether an explicit delete was the net effect of the fold.
    pub deleted: bool,
    /// Whether a restart-marked event recreated the aggregate after a delete.
    pub restarted: bool,
    /// How many events were dispatched to handlers.
    pub applied: usize,
}

type SyncCreate<A, E> = Box<dyn Fn(&EventEnvelope<E>) -> FoldResult<A> + Send + Sync>;
type SyncApply<A, E> = Box<dyn Fn(A, &EventEnvelope<E>) -> FoldResult<FoldNext<A>> + Send + Sync>;
type AsyncCreate<A, E> =
    Box<dyn Fn(EventEnvelope<E>) -> BoxFuture<'static, FoldResult<A>> + Send + Sync>;
type AsyncApply<A, E> =
    Box<dyn Fn(A, EventEnvelope<E>) -> BoxFuture<'static, FoldResult<FoldNext<A>>> + Send + Sync>;
type EvolveOverride<A, E> =
    Box<dyn Fn(Option<A>, &EventEnvelope<E>) -> FoldResult<FoldNext<A>> + Send + Sync>;
type MetadataHook<A, E> = Box<dyn Fn(A, &EventEnvelope<E>) -> A + Send + Sync>;
type Enricher<A, E> =
    Box<dyn for<'a> Fn(&'a mut [EventSlice<A, E>]) -> BoxFuture<'a, FoldResult<()>> + Send + Sync>;
type DeletePredicate<E> = Box<dyn Fn(&E) -> bool + Send + Sync>;

enum CreateHandler<A, E> {
    Sync(SyncCreate<A, E>),
    Async(AsyncCreate<A, E>),
}

enum ApplyHandler<A, E> {
    Sync(SyncApply<A, E>),
    Async(AsyncApply<A, E>),
}

struct TypeHandlers<A, E> {
    create: Option<CreateHandler<A, E>>,
    apply: Option<ApplyHandler<A, E>>,
    ignored: bool,
}

impl<A, E> Default for TypeHandlers<A, E> {
    fn default() -> Self {
        Self {
            create: None,
            apply: None,
            ignored: false,
        }
    }
}

impl<A, E> TypeHandlers<A, E> {
    fn has_async(&self) -> bool {
        matches!(self.create, Some(CreateHandler::Async(_)))
            || matches!(self.apply, Some(ApplyHandler::Async(_)))
    }

    fn has_sync(&self) -> bool {
        matches!(self.create, Some(CreateHandler::Sync(_)))
            || matches!(self.apply, Some(ApplyHandler::Sync(_)))
    }
}

/// Accessors for an aggregate's soft-delete capability.
///
/// Declared once at build time; action determination consults the resulting
/// feature flag instead of probing the aggregate at runtime.
pub struct SoftDeleteAccess<A> {
    pub(crate) is_deleted: Box<dyn Fn(&A) -> bool + Send + Sync>,
    pub(crate) set_deleted: Box<dyn Fn(&mut A, bool, Option<Timestamp>) + Send + Sync>,
}

/// Builder for a [`Folder`] dispatch table.
///
/// All registration happens here; [`FolderBuilder::build`] validates the
/// whole table and returns configuration errors before any event flows.
pub struct FolderBuilder<A, E> {
    projection_name: String,
    handlers: HashMap<&'static str, TypeHandlers<A, E>>,
    declared_types: Vec<&'static str>,
    evolve_override: Option<EvolveOverride<A, E>>,
    default_create: Option<Box<dyn Fn() -> A + Send + Sync>>,
    metadata_hook: Option<MetadataHook<A, E>>,
    enricher: Option<Enricher<A, E>>,
    should_delete: Option<DeletePredicate<E>>,
    start_types: Option<HashSet<&'static str>>,
    restart_types: HashSet<&'static str>,
    soft_delete: Option<SoftDeleteAccess<A>>,
    version_candidates: Vec<VersionCandidate<A>>,
    version_scope: VersionScope,
    errors: Vec<ConfigError>,
}

impl<A: Aggregate, E: DomainEvent> FolderBuilder<A, E> {
    /// Starts a builder for the named projection.
    pub fn new(projection_name: impl Into<String>) -> Self {
        Self {
            projection_name: projection_name.into(),
            handlers: HashMap::new(),
            declared_types: Vec::new(),
            evolve_override: None,
            default_create: None,
            metadata_hook: None,
            enricher: None,
            should_delete: None,
            start_types: None,
            restart_types: HashSet::new(),
            soft_delete: None,
            version_candidates: Vec::new(),
            version_scope: VersionScope::SingleStream,
            errors: Vec::new(),
        }
    }

    fn slot(&mut self, event_type: &'static str) -> &mut TypeHandlers<A, E> {
        self.handlers.entry(event_type).or_default()
    }

    fn record_duplicate(&mut self, role: &'static str, event_type: &'static str) {
        self.errors.push(ConfigError::DuplicateHandler {
            role,
            event_type: event_type.to_string(),
        });
    }

    /// Registers a synchronous create handler, invoked only when no snapshot
    /// exists yet.
    #[must_use]
    pub fn create<F>(mut self, event_type: &'static str, f: F) -> Self
    where
        F: Fn(&EventEnvelope<E>) -> A + Send + Sync + 'static,
    {
        self.register_create(event_type, CreateHandler::Sync(Box::new(move |env| Ok(f(env)))));
        self
    }

    /// Registers a fallible synchronous create handler.
    #[must_use]
    pub fn try_create<F>(mut self, event_type: &'static str, f: F) -> Self
    where
        F: Fn(&EventEnvelope<E>) -> FoldResult<A> + Send + Sync + 'static,
    {
        self.register_create(event_type, CreateHandler::Sync(Box::new(f)));
        self
    }

    /// Registers an asynchronous create handler.
    #[must_use]
    pub fn create_async<F, Fut>(mut self, event_type: &'static str, f: F) -> Self
    where
        F: Fn(EventEnvelope<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FoldResult<A>> + Send + 'static,
    {
        self.register_create(
            event_type,
            CreateHandler::Async(Box::new(move |env| Box::pin(f(env)))),
        );
        self
    }

    /// Registers a mutate-in-place apply handler.
    #[must_use]
    pub fn apply<F>(mut self, event_type: &'static str, f: F) -> Self
    where
        F: Fn(&mut A, &EventEnvelope<E>) + Send + Sync + 'static,
    {
        self.register_apply(
            event_type,
            ApplyHandler::Sync(Box::new(move |mut aggregate, env| {
                f(&mut aggregate, env);
                Ok(FoldNext::Snapshot(aggregate))
            })),
        );
        self
    }

    /// Registers an immutable-style apply handler returning the next
    /// snapshot.
    #[must_use]
    pub fn apply_returning<F>(mut self, event_type: &'static str, f: F) -> Self
    where
        F: Fn(A, &EventEnvelope<E>) -> A + Send + Sync + 'static,
    {
        self.register_apply(
            event_type,
            ApplyHandler::Sync(Box::new(move |aggregate, env| {
                Ok(FoldNext::Snapshot(f(aggregate, env)))
            })),
        );
        self
    }

    /// Registers an action-returning apply handler that can signal deletion
    /// or leave the snapshot untouched, and may fail.
    #[must_use]
    pub fn try_apply<F>(mut self, event_type: &'static str, f: F) -> Self
    where
        F: Fn(A, &EventEnvelope<E>) -> FoldResult<FoldNext<A>> + Send + Sync + 'static,
    {
        self.register_apply(event_type, ApplyHandler::Sync(Box::new(f)));
        self
    }

    /// Registers an asynchronous apply handler.
    #[must_use]
    pub fn apply_async<F, Fut>(mut self, event_type: &'static str, f: F) -> Self
    where
        F: Fn(A, EventEnvelope<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FoldResult<FoldNext<A>>> + Send + 'static,
    {
        self.register_apply(
            event_type,
            ApplyHandler::Async(Box::new(move |aggregate, env| Box::pin(f(aggregate, env)))),
        );
        self
    }

    /// Marks an event type as deliberately ignored by this projection.
    #[must_use]
    pub fn ignore(mut self, event_type: &'static str) -> Self {
        self.slot(event_type).ignored = true;
        self
    }

    /// Supplies one explicit evolve method, bypassing per-type dispatch.
    ///
    /// Combining this with per-type registrations is a build-time error.
    #[must_use]
    pub fn evolve_with<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<A>, &EventEnvelope<E>) -> FoldResult<FoldNext<A>> + Send + Sync + 'static,
    {
        self.evolve_override = Some(Box::new(f));
        self
    }

    /// Declares the universe of event types this projection expects.
    ///
    /// Each declared type must end up with a handler or an ignore marker, or
    /// build validation fails.
    #[must_use]
    pub fn event_types(mut self, types: &[&'static str]) -> Self {
        self.declared_types.extend_from_slice(types);
        self
    }

    /// Enables the parameterless-construction fallback for event types that
    /// have an apply handler but no explicit create handler.
    #[must_use]
    pub fn default_create(mut self) -> Self
    where
        A: Default,
    {
        self.default_create = Some(Box::new(A::default));
        self
    }

    /// Registers the metadata enrichment hook, run exactly once per fold
    /// after the last event, given the last envelope.
    #[must_use]
    pub fn metadata_hook<F>(mut self, f: F) -> Self
    where
        F: Fn(A, &EventEnvelope<E>) -> A + Send + Sync + 'static,
    {
        self.metadata_hook = Some(Box::new(f));
        self
    }

    /// Registers the async enrichment pre-step, run once per batch of slices
    /// before any evolve call. Its failure aborts the fold with no partial
    /// enrichment applied.
    #[must_use]
    pub fn enrich_with<F>(mut self, f: F) -> Self
    where
        F: for<'a> Fn(&'a mut [EventSlice<A, E>]) -> BoxFuture<'a, FoldResult<()>>
            + Send
            + Sync
            + 'static,
    {
        self.enricher = Some(Box::new(f));
        self
    }

    /// Registers the hard-delete predicate, checked against the last
    /// relevant event of a slice.
    #[must_use]
    pub fn should_delete_when<F>(mut self, f: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_delete = Some(Box::new(f));
        self
    }

    /// Declares the event types that start the aggregate's lifecycle.
    ///
    /// Only projections that declare start types get the first-event guard:
    /// update-only events against a nonexistent aggregate resolve to no
    /// action instead of materializing a snapshot.
    #[must_use]
    pub fn start_when(mut self, types: &[&'static str]) -> Self {
        self.start_types
            .get_or_insert_with(HashSet::new)
            .extend(types.iter().copied());
        self
    }

    /// Declares the event types that restart a previously deleted aggregate.
    #[must_use]
    pub fn restart_when(mut self, types: &[&'static str]) -> Self {
        self.restart_types.extend(types.iter().copied());
        // Restart events also begin a lifecycle when nothing exists yet.
        if let Some(start) = &mut self.start_types {
            start.extend(types.iter().copied());
        }
        self
    }

    /// Declares the soft-delete capability on the aggregate type.
    #[must_use]
    pub fn soft_delete_access<G, S>(mut self, is_deleted: G, set_deleted: S) -> Self
    where
        G: Fn(&A) -> bool + Send + Sync + 'static,
        S: Fn(&mut A, bool, Option<Timestamp>) + Send + Sync + 'static,
    {
        self.soft_delete = Some(SoftDeleteAccess {
            is_deleted: Box::new(is_deleted),
            set_deleted: Box::new(set_deleted),
        });
        self
    }

    /// Declares the version-member candidates for discovery.
    #[must_use]
    pub fn version_candidates(mut self, candidates: Vec<VersionCandidate<A>>) -> Self {
        self.version_candidates.extend(candidates);
        self
    }

    /// Sets the versioning scope (per-stream version vs global sequence).
    #[must_use]
    pub const fn version_scope(mut self, scope: VersionScope) -> Self {
        self.version_scope = scope;
        self
    }

    fn register_create(&mut self, event_type: &'static str, handler: CreateHandler<A, E>) {
        let slot = self.slot(event_type);
        if slot.create.is_some() {
            self.record_duplicate("create", event_type);
        } else {
            slot.create = Some(handler);
        }
    }

    fn register_apply(&mut self, event_type: &'static str, handler: ApplyHandler<A, E>) {
        let slot = self.slot(event_type);
        if slot.apply.is_some() {
            self.record_duplicate("apply", event_type);
        } else {
            slot.apply = Some(handler);
        }
    }

    /// Validates the dispatch table and produces the immutable [`Folder`].
    ///
    /// # Errors
    ///
    /// Returns the first configuration error found: duplicate handlers,
    /// mixed sync/async conventions for one event type, per-type handlers
    /// combined with an evolve override, a declared event type with no
    /// handler, or an ambiguous version member.
    pub fn build(mut self) -> ConfigResult<Folder<A, E>> {
        if let Some(error) = self.errors.into_iter().next() {
            return Err(error);
        }

        if self.evolve_override.is_some() && !self.handlers.is_empty() {
            return Err(ConfigError::EvolveOverrideConflict(self.projection_name));
        }

        for (event_type, slot) in &self.handlers {
            if slot.has_sync() && slot.has_async() {
                return Err(ConfigError::MixedHandlerConventions((*event_type).to_string()));
            }
        }

        if self.evolve_override.is_none() {
            for event_type in &self.declared_types {
                let covered = self
                    .handlers
                    .get(event_type)
                    .is_some_and(|slot| slot.ignored || slot.create.is_some() || slot.apply.is_some());
                if !covered {
                    return Err(ConfigError::UnhandledEventType {
                        projection: self.projection_name,
                        event_type: (*event_type).to_string(),
                    });
                }
            }
        }

        let aggregate_type = short_type_name::<A>();
        let version_member =
            resolve_version_member(aggregate_type, std::mem::take(&mut self.version_candidates))?;

        Ok(Folder {
            projection_name: self.projection_name,
            aggregate_type: aggregate_type.to_string(),
            handlers: self.handlers,
            evolve_override: self.evolve_override,
            default_create: self.default_create,
            metadata_hook: self.metadata_hook,
            enricher: self.enricher,
            should_delete: self.should_delete,
            start_types: self.start_types,
            restart_types: self.restart_types,
            soft_delete: self.soft_delete,
            version_member,
            version_scope: self.version_scope,
        })
    }
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

/// The validated, immutable fold dispatch table for one projection.
pub struct Folder<A, E> {
    projection_name: String,
    aggregate_type: String,
    handlers: HashMap<&'static str, TypeHandlers<A, E>>,
    evolve_override: Option<EvolveOverride<A, E>>,
    default_create: Option<Box<dyn Fn() -> A + Send + Sync>>,
    metadata_hook: Option<MetadataHook<A, E>>,
    enricher: Option<Enricher<A, E>>,
    should_delete: Option<DeletePredicate<E>>,
    start_types: Option<HashSet<&'static str>>,
    restart_types: HashSet<&'static str>,
    soft_delete: Option<SoftDeleteAccess<A>>,
    version_member: Option<VersionMember<A>>,
    version_scope: VersionScope,
}

impl<A, E> std::fmt::Debug for Folder<A, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Folder")
            .field("projection_name", &self.projection_name)
            .field("aggregate_type", &self.aggregate_type)
            .field("event_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl<A: Aggregate, E: DomainEvent> Folder<A, E> {
    /// The projection this table was built for.
    pub fn projection_name(&self) -> &str {
        &self.projection_name
    }

    /// The short name of the aggregate type, used in compacted envelopes.
    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    /// Whether the aggregate exposes the soft-delete capability.
    pub fn supports_soft_delete(&self) -> bool {
        self.soft_delete.is_some()
    }

    /// Whether this projection distinguishes explicit start events.
    pub fn has_start_types(&self) -> bool {
        self.start_types.is_some()
    }

    pub(crate) fn is_start_type(&self, event_type: &str) -> bool {
        self.start_types
            .as_ref()
            .is_some_and(|set| set.contains(event_type))
    }

    pub(crate) fn is_restart_type(&self, event_type: &str) -> bool {
        self.restart_types.contains(event_type)
    }

    pub(crate) fn should_delete_on(&self, event: &E) -> bool {
        self.should_delete.as_ref().is_some_and(|pred| pred(event))
    }

    pub(crate) fn is_soft_deleted(&self, aggregate: &A) -> bool {
        self.soft_delete
            .as_ref()
            .is_some_and(|access| (access.is_deleted)(aggregate))
    }

    pub(crate) fn set_soft_deleted(&self, aggregate: &mut A, deleted: bool, at: Option<Timestamp>) {
        if let Some(access) = &self.soft_delete {
            (access.set_deleted)(aggregate, deleted, at);
        }
    }

    pub(crate) fn version_member(&self) -> Option<&VersionMember<A>> {
        self.version_member.as_ref()
    }

    pub(crate) const fn version_scope(&self) -> VersionScope {
        self.version_scope
    }

    /// Runs the async enrichment pre-step over a batch of slices.
    ///
    /// Must complete before any evolve call in the batch; a failure aborts
    /// the whole batch's fold.
    pub async fn enrich(&self, slices: &mut [EventSlice<A, E>]) -> FoldResult<()> {
        if let Some(enricher) = &self.enricher {
            enricher(slices).await?;
        }
        Ok(())
    }

    /// Folds an ordered event list over a starting snapshot.
    ///
    /// A compacted envelope anywhere in the list resets the fold: the
    /// snapshot restarts from the wrapped value and domain events at or
    /// before its `through_version` are skipped. When several compacted
    /// envelopes are present, the latest one governs.
    pub async fn fold(
        &self,
        start: Option<A>,
        events: &[EventEnvelope<E>],
        cancel: Option<&watch::Receiver<bool>>,
    ) -> FoldResult<FoldOutcome<A>> {
        let mut outcome = FoldOutcome {
            snapshot: start,
            deleted: false,
            restarted: false,
            applied: 0,
        };

        // Latest compacted envelope wins; everything it summarizes is skipped.
        let reset = events
            .iter()
            .filter_map(|env| env.payload.as_compacted())
            .max_by_key(|compacted| compacted.through_version);
        let mut skip_through = StreamVersion::none();
        if let Some(compacted) = reset {
            outcome.snapshot = Some(compacted.unwrap_snapshot()?);
            outcome.deleted = false;
            skip_through = compacted.through_version;
        }

        for envelope in events {
            if cancel.is_some_and(|rx| *rx.borrow()) {
                return Err(FoldError::Cancelled);
            }

            match &envelope.payload {
                Stored::Compacted(_) => continue,
                Stored::Domain(_) if envelope.version <= skip_through => continue,
                Stored::Domain(_) => {}
            }

            let had_snapshot = outcome.snapshot.is_some();
            let next = self.evolve(outcome.snapshot.take(), envelope).await?;

            match next {
                Evolved::Next(FoldNext::Snapshot(mut aggregate)) => {
                    try_set_version(
                        self.version_member(),
                        self.version_scope,
                        &mut aggregate,
                        envelope,
                    );
                    if !had_snapshot && outcome.deleted {
                        outcome.deleted = false;
                        if self.is_restart_type(envelope.event_type()) {
                            outcome.restarted = true;
                        }
                    }
                    outcome.snapshot = Some(aggregate);
                    outcome.applied += 1;
                }
                Evolved::Next(FoldNext::Deleted) => {
                    outcome.snapshot = None;
                    outcome.deleted = true;
                    outcome.applied += 1;
                }
                Evolved::Next(FoldNext::Unchanged) => {
                    outcome.applied += 1;
                }
                Evolved::Skipped(snapshot) => {
                    outcome.snapshot = snapshot;
                }
            }
        }

        if let (Some(hook), Some(last)) = (&self.metadata_hook, events.last()) {
            if let Some(snapshot) = outcome.snapshot.take() {
                outcome.snapshot = Some(hook(snapshot, last));
            }
        }

        Ok(outcome)
    }

    async fn evolve(
        &self,
        snapshot: Option<A>,
        envelope: &EventEnvelope<E>,
    ) -> FoldResult<Evolved<A>> {
        let event_type = envelope.event_type();

        if let Some(evolve) = &self.evolve_override {
            return Ok(Evolved::Next(evolve(snapshot, envelope)?));
        }

        let Some(slot) = self.handlers.get(event_type) else {
            // Start/stop machines skip unknown update types when nothing
            // exists yet; everything else is a missing-handler failure.
            if snapshot.is_none() && self.has_start_types() && !self.is_start_type(event_type) {
                return Ok(Evolved::Skipped(snapshot));
            }
            return Err(FoldError::MissingHandler(event_type.to_string()));
        };

        if slot.ignored {
            return Ok(Evolved::Skipped(snapshot));
        }

        match snapshot {
            None => {
                if let Some(create) = &slot.create {
                    let aggregate = match create {
                        CreateHandler::Sync(f) => f(envelope)?,
                        CreateHandler::Async(f) => f(envelope.clone()).await?,
                    };
                    return Ok(Evolved::Next(FoldNext::Snapshot(aggregate)));
                }
                if let (Some(default), Some(apply)) = (&self.default_create, &slot.apply) {
                    let next = Self::run_apply(apply, default(), envelope).await?;
                    return Ok(Evolved::Next(next));
                }
                if self.has_start_types() && !self.is_start_type(event_type) {
                    return Ok(Evolved::Skipped(None));
                }
                Err(FoldError::MissingHandler(event_type.to_string()))
            }
            Some(aggregate) => {
                if let Some(apply) = &slot.apply {
                    let next = Self::run_apply(apply, aggregate, envelope).await?;
                    return Ok(Evolved::Next(next));
                }
                // Create-only types (duplicate starts) only fire on a null
                // snapshot.
                Ok(Evolved::Skipped(Some(aggregate)))
            }
        }
    }

    async fn run_apply(
        handler: &ApplyHandler<A, E>,
        aggregate: A,
        envelope: &EventEnvelope<E>,
    ) -> FoldResult<FoldNext<A>> {
        match handler {
            ApplyHandler::Sync(f) => f(aggregate, envelope),
            ApplyHandler::Async(f) => f(aggregate, envelope.clone()).await,
        }
    }
}

enum Evolved<A> {
    Next(FoldNext<A>),
    Skipped(Option<A>),
}
