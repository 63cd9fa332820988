//! The aggregate store facade, tenant sessions, and fetch-for-writing.
//!
//! An [`AggregateStore`] wires one projection (its [`Folder`], lifecycle,
//! and scope) to the storage collaborators. A [`Session`] scopes operations
//! to one tenant. A [`WritableStream`] is the handle fetch-for-writing
//! returns: it carries the current snapshot and version, accumulates pending
//! events, and commits them as one batch with optimistic (or, for the
//! exclusive variant, pessimistic) concurrency.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::action::{
    determine_action, last_known_good, snapshot_of_prefix, AggregateAction, Determination,
};
use crate::cache::SnapshotCache;
use crate::config::{ProjectionLifecycle, ProjectionRegistration, ProjectionScope, StoreConfig, TenancyStyle};
use crate::errors::{ConcurrencyError, ConfigError, ConfigResult, FoldError, FoldResult, StorageError};
use crate::event::{DomainEvent, EventEnvelope};
use crate::fold::{Aggregate, Folder};
use crate::slicing::{ByStreamIdentity, EventSlice, Slicer};
use crate::storage::{
    DocumentStore, EventLog, ExpectedVersion, FetchOptions, PendingEvent, StoredDocument,
    StreamLock,
};
use crate::types::{StreamIdentity, StreamVersion, TenantId, Timestamp};

/// One projection wired to its storage collaborators.
pub struct AggregateStore<A, E, L, D> {
    folder: Arc<Folder<A, E>>,
    registration: ProjectionRegistration,
    config: StoreConfig,
    log: Arc<L>,
    documents: Arc<D>,
    cache: SnapshotCache<A>,
    slicer: Arc<dyn Slicer<A, E>>,
}

impl<A, E, L, D> AggregateStore<A, E, L, D>
where
    A: Aggregate,
    E: DomainEvent,
    L: EventLog<E>,
    D: DocumentStore,
{
    /// Builds the store, validating the registration eagerly.
    ///
    /// # Errors
    ///
    /// Returns the registration's structural validation failure, if any.
    pub fn new(
        config: StoreConfig,
        registration: ProjectionRegistration,
        folder: Folder<A, E>,
        log: Arc<L>,
        documents: Arc<D>,
    ) -> ConfigResult<Self> {
        registration.validate(config.tenancy)?;
        let cache = SnapshotCache::new(config.snapshot_cache_capacity);
        Ok(Self {
            folder: Arc::new(folder),
            registration,
            config,
            log,
            documents,
            cache,
            slicer: Arc::new(ByStreamIdentity),
        })
    }

    /// Replaces the default per-stream slicer.
    ///
    /// Cross-stream projections route events by a derived identity instead
    /// of the owning stream; the async daemon partitions its batches with
    /// whatever slicer is configured here.
    #[must_use]
    pub fn with_slicer(mut self, slicer: impl Slicer<A, E> + 'static) -> Self {
        self.slicer = Arc::new(slicer);
        self
    }

    /// The projection's fold dispatch table.
    pub fn folder(&self) -> &Folder<A, E> {
        &self.folder
    }

    /// The slicer partitioning event batches for this projection.
    pub fn slicer(&self) -> &dyn Slicer<A, E> {
        self.slicer.as_ref()
    }

    /// The projection's registration.
    pub fn registration(&self) -> &ProjectionRegistration {
        &self.registration
    }

    pub(crate) fn log(&self) -> &Arc<L> {
        &self.log
    }

    pub(crate) fn documents(&self) -> &Arc<D> {
        &self.documents
    }

    pub(crate) const fn tenancy(&self) -> TenancyStyle {
        self.config.tenancy
    }

    /// A session on the default tenant.
    pub fn session(&self) -> Session<'_, A, E, L, D> {
        Session {
            store: self,
            tenant: TenantId::default_tenant(),
        }
    }

    /// A session scoped to the given tenant.
    ///
    /// # Errors
    ///
    /// A single-tenant store only accepts the default tenant.
    pub fn session_for(&self, tenant: TenantId) -> ConfigResult<Session<'_, A, E, L, D>> {
        if self.config.tenancy == TenancyStyle::Single && tenant != TenantId::default_tenant() {
            return Err(ConfigError::InvalidRegistration {
                projection: self.registration.name.clone(),
                reason: format!("store is single-tenant; tenant '{tenant}' is not available"),
            });
        }
        Ok(Session {
            store: self,
            tenant,
        })
    }

    fn check_identity_scheme(&self, identity: &StreamIdentity) -> ConfigResult<()> {
        if identity.scheme() == self.config.identity_scheme {
            Ok(())
        } else {
            Err(ConfigError::IdentitySchemeMismatch {
                configured: self.config.identity_scheme,
                used: identity.scheme(),
            })
        }
    }

    /// The tenant whose snapshot table holds this projection's documents.
    ///
    /// Global projections share one table regardless of which tenant's
    /// session appended the events.
    fn document_tenant(&self, session_tenant: &TenantId) -> TenantId {
        match self.registration.scope {
            ProjectionScope::Global => TenantId::default_tenant(),
            ProjectionScope::Tenanted => session_tenant.clone(),
        }
    }
}

impl<A, E, L, D> std::fmt::Debug for AggregateStore<A, E, L, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateStore")
            .field("projection", &self.registration.name)
            .field("lifecycle", &self.registration.lifecycle)
            .finish_non_exhaustive()
    }
}

/// A tenant-scoped view of an [`AggregateStore`].
pub struct Session<'s, A, E, L, D> {
    store: &'s AggregateStore<A, E, L, D>,
    tenant: TenantId,
}

impl<A, E, L, D> std::fmt::Debug for Session<'_, A, E, L, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("store", &self.store)
            .field("tenant", &self.tenant)
            .finish()
    }
}

impl<'s, A, E, L, D> Session<'s, A, E, L, D>
where
    A: Aggregate,
    E: DomainEvent,
    L: EventLog<E>,
    D: DocumentStore,
{
    /// The session's tenant.
    pub const fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Folds the stream from scratch and returns the live snapshot.
    ///
    /// Never consults materialized documents; a deleted aggregate is `None`.
    pub async fn aggregate_stream(&self, identity: &StreamIdentity) -> FoldResult<Option<A>> {
        self.store.check_identity_scheme(identity)?;
        let slice = self.enriched_slice(identity).await?;
        snapshot_of_prefix(&self.store.folder, &slice.events, None).await
    }

    /// The snapshot as of a stream version, with tight-delete semantics.
    pub async fn aggregate_as_of_version(
        &self,
        identity: &StreamIdentity,
        version: StreamVersion,
    ) -> FoldResult<Option<A>> {
        self.store.check_identity_scheme(identity)?;
        let slice = self.enriched_slice(identity).await?;
        crate::action::snapshot_as_of_version(&self.store.folder, &slice.events, version, None)
            .await
    }

    /// The snapshot as of an instant, with tight-delete semantics.
    pub async fn aggregate_as_of_time(
        &self,
        identity: &StreamIdentity,
        at: Timestamp,
    ) -> FoldResult<Option<A>> {
        self.store.check_identity_scheme(identity)?;
        let slice = self.enriched_slice(identity).await?;
        crate::action::snapshot_as_of_time(&self.store.folder, &slice.events, at, None).await
    }

    /// The last snapshot state that was not deleted, ignoring a trailing
    /// delete. `None` when no good state ever existed.
    pub async fn aggregate_last_known_good(
        &self,
        identity: &StreamIdentity,
    ) -> FoldResult<Option<A>> {
        self.store.check_identity_scheme(identity)?;
        let slice = self.enriched_slice(identity).await?;
        last_known_good(&self.store.folder, &slice.events, None).await
    }

    /// The latest snapshot under the projection's lifecycle.
    ///
    /// Inline and async lifecycles read the materialized document (absent
    /// when soft-deleted); the live lifecycle refolds on demand.
    pub async fn fetch_latest(&self, identity: &StreamIdentity) -> FoldResult<Option<A>> {
        self.store.check_identity_scheme(identity)?;
        match self.store.registration.lifecycle {
            ProjectionLifecycle::Live => self.aggregate_stream(identity).await,
            ProjectionLifecycle::Inline | ProjectionLifecycle::Async => {
                let tenant = self.store.document_tenant(&self.tenant);
                let document = self
                    .store
                    .documents
                    .load(&self.store.registration.name, &tenant, identity)
                    .await?;
                match document {
                    Some(doc) if !doc.deleted => {
                        let snapshot = serde_json::from_value(doc.body)
                            .map_err(|e| StorageError::Deserialization(e.to_string()))?;
                        Ok(Some(snapshot))
                    }
                    _ => Ok(None),
                }
            }
        }
    }

    /// Loads the current snapshot and version for optimistic-concurrency
    /// writing.
    ///
    /// With `expected` supplied, a version mismatch fails here, before any
    /// append. Without it, the conflict check happens at
    /// [`WritableStream::save_changes`].
    #[instrument(skip(self), fields(projection = %self.store.registration.name, stream = %identity))]
    pub async fn fetch_for_writing(
        &self,
        identity: &StreamIdentity,
        expected: Option<StreamVersion>,
    ) -> FoldResult<WritableStream<'_, A, E, L, D>> {
        self.fetch_writable(identity, expected, None).await
    }

    /// Fetch-for-writing with an exclusive per-stream lock.
    ///
    /// Fails immediately with [`ConcurrencyError::StreamLocked`] when
    /// another session holds the lock; never blocks. The lock is released
    /// when the handle commits or is dropped.
    #[instrument(skip(self), fields(projection = %self.store.registration.name, stream = %identity))]
    pub async fn fetch_for_writing_exclusive(
        &self,
        identity: &StreamIdentity,
        expected: Option<StreamVersion>,
    ) -> FoldResult<WritableStream<'_, A, E, L, D>> {
        self.store.check_identity_scheme(identity)?;
        let lock = self
            .store
            .log
            .try_lock(&self.tenant, identity)
            .await?
            .ok_or_else(|| ConcurrencyError::StreamLocked(identity.clone()))?;
        self.fetch_writable(identity, expected, Some(lock)).await
    }

    /// Starts a brand-new stream with an initial batch.
    ///
    /// # Errors
    ///
    /// Fails with [`ConcurrencyError::StreamCollision`] when the identity
    /// already has events.
    pub async fn start_stream(
        &self,
        identity: &StreamIdentity,
        events: Vec<E>,
    ) -> FoldResult<StreamVersion> {
        self.store.check_identity_scheme(identity)?;
        let pending = events.into_iter().map(PendingEvent::new).collect();
        let appended = self
            .store
            .log
            .append(&self.tenant, identity, ExpectedVersion::NoStream, pending)
            .await
            .map_err(|err| match err {
                StorageError::VersionConflict { identity, current, .. } => {
                    FoldError::Concurrency(ConcurrencyError::StreamCollision { identity, current })
                }
                other => other.into(),
            })?;
        self.stage_inline(identity, None, StreamVersion::none(), &appended)
            .await?;
        Ok(appended
            .last()
            .map_or_else(StreamVersion::none, |env| env.version))
    }

    /// Fetch, hand the writable handle to a callback, and commit.
    pub async fn write_to_aggregate<'a, F>(
        &'a self,
        identity: &StreamIdentity,
        callback: F,
    ) -> FoldResult<StreamVersion>
    where
        F: FnOnce(&mut WritableStream<'a, A, E, L, D>),
    {
        let mut stream = self.fetch_for_writing(identity, None).await?;
        callback(&mut stream);
        stream.save_changes().await
    }

    /// Recomputes one stream's snapshot from raw events and overwrites its
    /// materialized document.
    pub async fn rebuild_single_stream(&self, identity: &StreamIdentity) -> FoldResult<Option<A>> {
        self.store.check_identity_scheme(identity)?;
        let slice = self.enriched_slice(identity).await?;

        let determination = determine_action(&self.store.folder, &slice, None).await?;
        let version = slice
            .last_event()
            .map_or_else(StreamVersion::none, |env| env.version);
        let snapshot = determination.snapshot.clone();
        self.apply_action(identity, determination, version).await?;
        self.store
            .cache
            .invalidate(&self.store.document_tenant(&self.tenant), identity);
        Ok(snapshot)
    }

    /// Marks the materialized snapshot soft-deleted without touching events.
    ///
    /// # Errors
    ///
    /// The aggregate type must expose the deleted-flag capability.
    pub async fn soft_delete_snapshot(&self, identity: &StreamIdentity) -> FoldResult<()> {
        self.store.check_identity_scheme(identity)?;
        if !self.store.folder.supports_soft_delete() {
            return Err(
                ConfigError::SoftDeleteUnsupported(self.store.folder.aggregate_type().to_string())
                    .into(),
            );
        }
        let tenant = self.store.document_tenant(&self.tenant);
        self.store
            .documents
            .soft_delete(&self.store.registration.name, &tenant, identity, Timestamp::now())
            .await?;
        self.store.cache.invalidate(&tenant, identity);
        Ok(())
    }

    async fn fetch_all(&self, identity: &StreamIdentity) -> FoldResult<Vec<EventEnvelope<E>>> {
        Ok(self
            .store
            .log
            .fetch(&self.tenant, identity, FetchOptions::all())
            .await?)
    }

    /// Fetches one stream's envelopes into a slice and runs the folder's
    /// enrichment pre-step over it.
    async fn enriched_slice(&self, identity: &StreamIdentity) -> FoldResult<EventSlice<A, E>> {
        let mut slice = EventSlice::new(identity.clone(), self.tenant.clone());
        slice.events = self.fetch_all(identity).await?;
        self.store
            .folder
            .enrich(std::slice::from_mut(&mut slice))
            .await?;
        Ok(slice)
    }

    async fn fetch_writable(
        &self,
        identity: &StreamIdentity,
        expected: Option<StreamVersion>,
        lock: Option<Box<dyn StreamLock>>,
    ) -> FoldResult<WritableStream<'_, A, E, L, D>> {
        self.store.check_identity_scheme(identity)?;
        let current = self.store.log.stream_version(&self.tenant, identity).await?;

        if let Some(expected) = expected {
            if expected != current {
                return Err(ConcurrencyError::ExpectedVersionMismatch {
                    identity: identity.clone(),
                    expected,
                    current,
                }
                .into());
            }
        }

        let snapshot = self.load_snapshot(identity, current).await?;
        debug!(version = %current, cached = snapshot.1, "fetched stream for writing");
        Ok(WritableStream {
            session: self,
            identity: identity.clone(),
            starting_version: current,
            snapshot: snapshot.0,
            pending: Vec::new(),
            lock,
        })
    }

    /// Loads the snapshot at `current`, reusing the cache when its entry is
    /// still at the stream head. A stale or missing entry falls back to a
    /// full refold, which is always semantically equivalent.
    async fn load_snapshot(
        &self,
        identity: &StreamIdentity,
        current: StreamVersion,
    ) -> FoldResult<(Option<A>, bool)> {
        let tenant = self.store.document_tenant(&self.tenant);
        if current == StreamVersion::none() {
            return Ok((None, false));
        }
        if let Some((snapshot, version)) = self.store.cache.get(&tenant, identity) {
            if version == current {
                return Ok((Some(snapshot), true));
            }
        }
        let slice = self.enriched_slice(identity).await?;
        let snapshot = snapshot_of_prefix(&self.store.folder, &slice.events, None).await?;
        if let Some(snapshot) = &snapshot {
            self.store.cache.put(&tenant, identity, snapshot.clone(), current);
        }
        Ok((snapshot, false))
    }

    /// Stages the inline projection's document changes for a freshly
    /// appended batch. A no-op for the live and async lifecycles.
    async fn stage_inline(
        &self,
        identity: &StreamIdentity,
        before: Option<A>,
        before_version: StreamVersion,
        appended: &[EventEnvelope<E>],
    ) -> FoldResult<()> {
        if self.store.registration.lifecycle != ProjectionLifecycle::Inline || appended.is_empty() {
            return Ok(());
        }
        let tenant = self.store.document_tenant(&self.tenant);
        let mut slice = EventSlice::new(identity.clone(), tenant.clone());
        slice.events = appended.to_vec();
        slice.is_new = before.is_none() && before_version == StreamVersion::none();
        if let Some(before) = before {
            slice = slice.with_aggregate(before);
        }
        self.store
            .folder
            .enrich(std::slice::from_mut(&mut slice))
            .await?;

        let determination = determine_action(&self.store.folder, &slice, None).await?;
        let version = appended
            .last()
            .map_or(before_version, |env| env.version);
        self.apply_action(identity, determination, version).await
    }

    pub(crate) async fn apply_action(
        &self,
        identity: &StreamIdentity,
        determination: Determination<A>,
        version: StreamVersion,
    ) -> FoldResult<()> {
        let tenant = self.store.document_tenant(&self.tenant);
        let name = &self.store.registration.name;
        match determination.action {
            AggregateAction::Nothing => Ok(()),
            AggregateAction::Delete => {
                self.store.documents.delete(name, &tenant, identity).await?;
                self.store.cache.invalidate(&tenant, identity);
                Ok(())
            }
            AggregateAction::Store
            | AggregateAction::StoreThenSoftDelete
            | AggregateAction::UndeleteAndStore => {
                let Some(snapshot) = determination.snapshot else {
                    warn!(stream = %identity, "store action carried no snapshot");
                    return Ok(());
                };
                if determination.action == AggregateAction::UndeleteAndStore {
                    self.store.documents.undelete(name, &tenant, identity).await?;
                }
                let document = StoredDocument {
                    body: to_body(&snapshot)?,
                    version,
                    deleted: false,
                    deleted_at: None,
                };
                self.store
                    .documents
                    .store(name, &tenant, identity, document)
                    .await?;
                if determination.action == AggregateAction::StoreThenSoftDelete {
                    self.store
                        .documents
                        .soft_delete(name, &tenant, identity, Timestamp::now())
                        .await?;
                    self.store.cache.invalidate(&tenant, identity);
                } else {
                    self.store.cache.put(&tenant, identity, snapshot, version);
                }
                Ok(())
            }
        }
    }
}

fn to_body<A: Serialize>(snapshot: &A) -> FoldResult<serde_json::Value> {
    Ok(serde_json::to_value(snapshot).map_err(StorageError::from)?)
}

/// The handle fetch-for-writing returns.
///
/// Pending events accumulate in order and become durable only when
/// [`WritableStream::save_changes`] commits them as one batch. Dropping the
/// handle without committing discards the pending events and releases any
/// exclusive lock.
pub struct WritableStream<'a, A, E, L, D> {
    session: &'a Session<'a, A, E, L, D>,
    identity: StreamIdentity,
    starting_version: StreamVersion,
    snapshot: Option<A>,
    pending: Vec<PendingEvent<E>>,
    lock: Option<Box<dyn StreamLock>>,
}

impl<A, E, L, D> WritableStream<'_, A, E, L, D>
where
    A: Aggregate,
    E: DomainEvent,
    L: EventLog<E>,
    D: DocumentStore,
{
    /// The stream's version as observed at fetch time.
    pub const fn current_version(&self) -> StreamVersion {
        self.starting_version
    }

    /// The snapshot as of fetch time.
    pub const fn snapshot(&self) -> Option<&A> {
        self.snapshot.as_ref()
    }

    /// The stream identity this handle writes to.
    pub const fn identity(&self) -> &StreamIdentity {
        &self.identity
    }

    /// Whether the handle holds the exclusive per-stream lock.
    pub fn is_exclusive(&self) -> bool {
        self.lock.is_some()
    }

    /// Queues one event for the commit batch.
    pub fn append_one(&mut self, event: E) {
        self.pending.push(PendingEvent::new(event));
    }

    /// Queues several events, preserving their order.
    pub fn append_many(&mut self, events: impl IntoIterator<Item = E>) {
        self.pending.extend(events.into_iter().map(PendingEvent::new));
    }

    /// Queues one event with headers attached.
    pub fn append_with_headers(&mut self, pending: PendingEvent<E>) {
        self.pending.push(pending);
    }

    /// Commits the pending batch.
    ///
    /// Re-validates the version observed at fetch time; another writer
    /// having advanced the stream surfaces as
    /// [`ConcurrencyError::VersionAdvanced`] here, at commit, not at fetch.
    /// On success the inline lifecycle's document changes are staged with
    /// the same append, the lock (if any) is released, and the new stream
    /// version is returned.
    pub async fn save_changes(mut self) -> FoldResult<StreamVersion> {
        let lock = self.lock.take();
        if self.pending.is_empty() {
            drop(lock);
            return Ok(self.starting_version);
        }

        let expected = ExpectedVersion::Exact(self.starting_version);
        let appended = self
            .session
            .store
            .log
            .append(
                &self.session.tenant,
                &self.identity,
                expected,
                std::mem::take(&mut self.pending),
            )
            .await
            .map_err(|err| match err {
                StorageError::VersionConflict { identity, .. } => {
                    FoldError::Concurrency(ConcurrencyError::VersionAdvanced {
                        identity,
                        fetched: self.starting_version,
                    })
                }
                other => other.into(),
            })?;

        self.session
            .stage_inline(
                &self.identity,
                self.snapshot.take(),
                self.starting_version,
                &appended,
            )
            .await?;

        let new_version = appended
            .last()
            .map_or(self.starting_version, |env| env.version);
        drop(lock);
        Ok(new_version)
    }
}

impl<A, E, L, D> std::fmt::Debug for WritableStream<'_, A, E, L, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WritableStream")
            .field("identity", &self.identity)
            .field("starting_version", &self.starting_version)
            .field("pending", &self.pending.len())
            .field("exclusive", &self.lock.is_some())
            .finish_non_exhaustive()
    }
}
