//! The async projection daemon.
//!
//! One logical worker per shard. Each worker reads its durable progress,
//! pulls event batches past it, folds them through the shard's projection,
//! and records progress transactionally with its writes. A shard whose fold
//! fails is marked faulted and stalls at its last good checkpoint while the
//! other shards continue; the failure stays visible in the daemon's
//! diagnostics until an operator intervenes.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::action::determine_action;
use crate::config::{ProjectionScope, TenancyStyle};
use crate::errors::{DaemonError, DaemonResult, FoldResult, StorageError, StorageResult};
use crate::event::{DomainEvent, EventEnvelope};
use crate::fold::Aggregate;
use crate::session::AggregateStore;
use crate::slicing::{EventSlice, Slicer};
use crate::storage::{DocumentStore, EventLog};
use crate::types::{GlobalSequence, ShardName, StreamVersion, TenantId};

/// Tuning knobs for the daemon's workers.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    /// Maximum events pulled per batch.
    pub batch_size: usize,
    /// How long a caught-up worker sleeps before polling again.
    pub poll_interval: Duration,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            batch_size: 500,
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// One independently progressed unit of async projection work.
#[async_trait]
pub trait DaemonShard: Send + Sync {
    /// The shard's stable name.
    fn name(&self) -> &ShardName;

    /// Loads the last durably recorded progress.
    async fn load_progress(&self) -> StorageResult<GlobalSequence>;

    /// Processes one batch of events with sequence greater than `after`.
    ///
    /// Returns the new durable progress, or `None` when the shard is caught
    /// up. Progress must cover every scanned event, including ones the
    /// shard's filter skipped.
    async fn process_batch(
        &self,
        after: GlobalSequence,
        limit: usize,
    ) -> FoldResult<Option<GlobalSequence>>;
}

/// The standard shard: one [`AggregateStore`] projection fed from the
/// store-wide append log.
pub struct ProjectionShard<A, E, L, D> {
    name: ShardName,
    store: Arc<AggregateStore<A, E, L, D>>,
}

impl<A, E, L, D> ProjectionShard<A, E, L, D>
where
    A: Aggregate,
    E: DomainEvent,
    L: EventLog<E>,
    D: DocumentStore,
{
    /// Wraps a store as a daemon shard named `{projection}:all`.
    pub fn new(store: Arc<AggregateStore<A, E, L, D>>) -> StorageResult<Self> {
        let name = ShardName::try_new(format!("{}:all", store.registration().name))
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(Self { name, store })
    }

    fn session_tenant(&self, event_tenant: &TenantId) -> TenantId {
        // Global projections fold under the shared tenant no matter which
        // tenant's session appended; single-tenant stores only have one.
        if self.store.registration().scope == ProjectionScope::Global
            || self.store.tenancy() == TenancyStyle::Single
        {
            TenantId::default_tenant()
        } else {
            event_tenant.clone()
        }
    }

    async fn process_slice(
        &self,
        tenant: &TenantId,
        mut slice: EventSlice<A, E>,
    ) -> FoldResult<()> {
        let session = match self.store.session_for(tenant.clone()) {
            Ok(session) => session,
            Err(err) => return Err(err.into()),
        };
        let name = &self.store.registration().name;
        let document = self
            .store
            .documents()
            .load(name, tenant, &slice.identity)
            .await?;
        if let Some(document) = document {
            slice.is_new = false;
            if !document.deleted {
                let aggregate = serde_json::from_value(document.body)
                    .map_err(|e| StorageError::Deserialization(e.to_string()))?;
                slice.aggregate = Some(aggregate);
            }
        }

        let version = slice
            .last_event()
            .map_or_else(StreamVersion::none, |env| env.version);
        let identity = slice.identity.clone();
        let determination = determine_action(self.store.folder(), &slice, None).await?;
        session.apply_action(&identity, determination, version).await
    }
}

#[async_trait]
impl<A, E, L, D> DaemonShard for ProjectionShard<A, E, L, D>
where
    A: Aggregate,
    E: DomainEvent,
    L: EventLog<E>,
    D: DocumentStore,
{
    fn name(&self) -> &ShardName {
        &self.name
    }

    async fn load_progress(&self) -> StorageResult<GlobalSequence> {
        Ok(self
            .store
            .documents()
            .load_progress(&self.name)
            .await?
            .unwrap_or_else(GlobalSequence::start))
    }

    async fn process_batch(
        &self,
        after: GlobalSequence,
        limit: usize,
    ) -> FoldResult<Option<GlobalSequence>> {
        let batch = self.store.log().fetch_since(after, limit).await?;
        let Some(last) = batch.last() else {
            return Ok(None);
        };
        let progress = last.sequence;

        let registration = self.store.registration();
        let relevant: Vec<EventEnvelope<E>> = batch
            .into_iter()
            .filter(|env| env.is_compacted() || registration.accepts(env.event_type()))
            .collect();

        // Partition by the tenant the slice's documents live under.
        let mut by_tenant: Vec<(TenantId, Vec<EventEnvelope<E>>)> = Vec::new();
        for envelope in relevant {
            let tenant = self.session_tenant(&envelope.tenant);
            match by_tenant.iter_mut().find(|(t, _)| *t == tenant) {
                Some((_, group)) => group.push(envelope),
                None => by_tenant.push((tenant, vec![envelope])),
            }
        }

        for (tenant, group) in by_tenant {
            let mut slices: Vec<EventSlice<A, E>> = self.store.slicer().slice(&group);
            self.store.folder().enrich(&mut slices).await?;
            for slice in slices {
                self.process_slice(&tenant, slice).await?;
            }
        }

        self.store
            .documents()
            .store_progress(&self.name, progress)
            .await?;
        Ok(Some(progress))
    }
}

/// A shard's lifecycle status as the daemon sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardStatus {
    /// Registered but not yet started.
    Idle,
    /// Processing or polling.
    Running,
    /// Stopped by a daemon shutdown.
    Stopped,
    /// Stalled at its last good checkpoint after a failure.
    Faulted {
        /// The failure that stalled the shard.
        reason: String,
    },
}

/// One row of [`ProjectionDaemon::diagnostics`].
#[derive(Debug, Clone)]
pub struct ShardDiagnostics {
    /// The shard.
    pub shard: ShardName,
    /// Its last reported progress.
    pub progress: GlobalSequence,
    /// Its current status.
    pub status: ShardStatus,
}

struct ShardState {
    shard: Arc<dyn DaemonShard>,
    progress_tx: watch::Sender<GlobalSequence>,
    status: Arc<Mutex<ShardStatus>>,
}

struct Running {
    cancel_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// The background daemon driving async-lifecycle projections.
pub struct ProjectionDaemon<E, L> {
    log: Arc<L>,
    options: DaemonOptions,
    shards: HashMap<ShardName, ShardState>,
    running: Mutex<Option<Running>>,
    _events: PhantomData<fn() -> E>,
}

impl<E, L> ProjectionDaemon<E, L>
where
    E: DomainEvent,
    L: EventLog<E> + 'static,
{
    /// Creates a daemon over the given append log.
    pub fn new(log: Arc<L>, options: DaemonOptions) -> Self {
        Self {
            log,
            options,
            shards: HashMap::new(),
            running: Mutex::new(None),
            _events: PhantomData,
        }
    }

    /// Registers a shard. Must happen before [`ProjectionDaemon::start`].
    pub fn register(&mut self, shard: Arc<dyn DaemonShard>) {
        let (progress_tx, _) = watch::channel(GlobalSequence::start());
        self.shards.insert(
            shard.name().clone(),
            ShardState {
                shard,
                progress_tx,
                status: Arc::new(Mutex::new(ShardStatus::Idle)),
            },
        );
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Starts one worker task per registered shard.
    pub fn start(&self) {
        let mut running = self.lock_running();
        if running.is_some() {
            return;
        }
        let (cancel_tx, _) = watch::channel(false);
        let mut handles = Vec::with_capacity(self.shards.len());

        for state in self.shards.values() {
            set_status(&state.status, ShardStatus::Running);
            handles.push(tokio::spawn(run_shard(
                Arc::clone(&state.shard),
                state.progress_tx.clone(),
                Arc::clone(&state.status),
                cancel_tx.subscribe(),
                self.options.clone(),
            )));
        }

        info!(shards = self.shards.len(), "projection daemon started");
        *running = Some(Running { cancel_tx, handles });
    }

    /// Signals every worker to stop and waits for them to drain.
    pub async fn stop(&self) {
        let taken = self.lock_running().take();
        let Some(running) = taken else {
            return;
        };
        let _ = running.cancel_tx.send(true);
        for handle in running.handles {
            if let Err(err) = handle.await {
                error!(error = %err, "shard worker panicked during shutdown");
            }
        }
        info!("projection daemon stopped");
    }

    /// Blocks until the shard's progress reaches the high-water mark that
    /// existed when this call was made, or the timeout elapses.
    pub async fn wait_for_non_stale(
        &self,
        shard: &ShardName,
        timeout: Duration,
    ) -> DaemonResult<GlobalSequence> {
        let state = self
            .shards
            .get(shard)
            .ok_or_else(|| DaemonError::UnknownShard(shard.clone()))?;
        let target = self.log.high_water_mark().await?;
        let mut progress_rx = state.progress_tx.subscribe();

        let wait = async {
            loop {
                if let ShardStatus::Faulted { reason } = get_status(&state.status) {
                    return Err(DaemonError::ShardFaulted {
                        shard: shard.clone(),
                        reason,
                    });
                }
                let progress = *progress_rx.borrow();
                if progress >= target {
                    return Ok(progress);
                }
                if progress_rx.changed().await.is_err() {
                    return Err(DaemonError::ShardFaulted {
                        shard: shard.clone(),
                        reason: "shard progress channel closed".to_string(),
                    });
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(DaemonError::WaitTimeout {
                shard: shard.clone(),
                target,
                timeout,
            }),
        }
    }

    /// A point-in-time view of every shard's progress and status.
    pub fn diagnostics(&self) -> Vec<ShardDiagnostics> {
        let mut rows: Vec<ShardDiagnostics> = self
            .shards
            .iter()
            .map(|(name, state)| ShardDiagnostics {
                shard: name.clone(),
                progress: *state.progress_tx.borrow(),
                status: get_status(&state.status),
            })
            .collect();
        rows.sort_by(|a, b| a.shard.cmp(&b.shard));
        rows
    }
}

impl<E, L> std::fmt::Debug for ProjectionDaemon<E, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionDaemon")
            .field("shards", &self.shards.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn set_status(status: &Arc<Mutex<ShardStatus>>, next: ShardStatus) {
    *status
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner) = next;
}

fn get_status(status: &Arc<Mutex<ShardStatus>>) -> ShardStatus {
    status
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clone()
}

async fn run_shard(
    shard: Arc<dyn DaemonShard>,
    progress_tx: watch::Sender<GlobalSequence>,
    status: Arc<Mutex<ShardStatus>>,
    mut cancel_rx: watch::Receiver<bool>,
    options: DaemonOptions,
) {
    let mut progress = match shard.load_progress().await {
        Ok(progress) => progress,
        Err(err) => {
            warn!(shard = %shard.name(), error = %err, "failed to load shard progress");
            set_status(&status, ShardStatus::Faulted {
                reason: err.to_string(),
            });
            return;
        }
    };
    progress_tx.send_replace(progress);

    loop {
        if *cancel_rx.borrow() {
            set_status(&status, ShardStatus::Stopped);
            return;
        }

        match shard.process_batch(progress, options.batch_size).await {
            Ok(Some(new_progress)) => {
                progress = new_progress;
                progress_tx.send_replace(progress);
            }
            Ok(None) => {
                // Caught up; poll again after the interval plus jitter so
                // shards do not thunder together.
                let jitter =
                    Duration::from_millis(rand::rng().random_range(0..=10));
                tokio::select! {
                    () = tokio::time::sleep(options.poll_interval + jitter) => {}
                    _ = cancel_rx.changed() => {}
                }
            }
            Err(err) => {
                // The shard stalls at its last good checkpoint; other
                // shards keep running.
                warn!(shard = %shard.name(), error = %err, "shard fold failed; stalling at checkpoint");
                set_status(&status, ShardStatus::Faulted {
                    reason: err.to_string(),
                });
                return;
            }
        }
    }
}
