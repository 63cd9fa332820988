//! Lifecycle tests: inline staging, live refolds, the async daemon,
//! delete/restart semantics, time travel, and tenancy routing.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snapfold::daemon::{DaemonOptions, ProjectionDaemon, ProjectionShard};
use snapfold::storage::DocumentStore;
use snapfold::{
    AggregateStore, ByEventKey, DomainEvent, FoldNext, Folder, FolderBuilder, IdentityScheme,
    ProjectionLifecycle, ProjectionRegistration, ShardName, StoreConfig, StreamIdentity,
    StreamVersion, TenantId,
};
use snapfold_memory::{InMemoryDocumentStore, InMemoryEventLog};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum TaskEvent {
    Started,
    Incremented,
    Ended,
    Restarted,
}

impl DomainEvent for TaskEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Started => "Started",
            Self::Incremented => "Incremented",
            Self::Ended => "Ended",
            Self::Restarted => "Restarted",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Task {
    count: u64,
}

fn task_folder() -> Folder<Task, TaskEvent> {
    FolderBuilder::new("tasks")
        .create("Started", |_| Task::default())
        .create("Restarted", |_| Task::default())
        .apply("Incremented", |task: &mut Task, _| task.count += 1)
        .try_apply("Ended", |_, _| Ok(FoldNext::Deleted))
        .start_when(&["Started"])
        .restart_when(&["Restarted"])
        .build()
        .unwrap()
}

type TaskStore =
    AggregateStore<Task, TaskEvent, InMemoryEventLog<TaskEvent>, InMemoryDocumentStore>;

fn task_store(
    lifecycle: ProjectionLifecycle,
) -> (Arc<TaskStore>, Arc<InMemoryEventLog<TaskEvent>>, Arc<InMemoryDocumentStore>) {
    let log = Arc::new(InMemoryEventLog::new());
    let documents = Arc::new(InMemoryDocumentStore::new());
    let store = Arc::new(
        AggregateStore::new(
            StoreConfig::new(IdentityScheme::Key),
            ProjectionRegistration::new("tasks", lifecycle),
            task_folder(),
            Arc::clone(&log),
            Arc::clone(&documents),
        )
        .unwrap(),
    );
    (store, log, documents)
}

#[tokio::test]
async fn inline_lifecycle_materializes_the_document_with_the_append() {
    use TaskEvent::{Incremented, Started};
    let (store, _, documents) = task_store(ProjectionLifecycle::Inline);
    let session = store.session();
    let identity = StreamIdentity::key("task-1").unwrap();

    session
        .start_stream(&identity, vec![Started, Incremented, Incremented])
        .await
        .unwrap();

    assert_eq!(documents.document_count(), 1);
    let task = session.fetch_latest(&identity).await.unwrap().unwrap();
    assert_eq!(task.count, 2);

    session
        .write_to_aggregate(&identity, |stream| stream.append_one(Incremented))
        .await
        .unwrap();
    let task = session.fetch_latest(&identity).await.unwrap().unwrap();
    assert_eq!(task.count, 3);
}

#[tokio::test]
async fn live_lifecycle_refolds_on_demand_and_persists_nothing() {
    use TaskEvent::{Incremented, Started};
    let (store, _, documents) = task_store(ProjectionLifecycle::Live);
    let session = store.session();
    let identity = StreamIdentity::key("task-2").unwrap();

    session
        .start_stream(&identity, vec![Started, Incremented])
        .await
        .unwrap();

    let task = session.fetch_latest(&identity).await.unwrap().unwrap();
    assert_eq!(task.count, 1);
    assert_eq!(documents.document_count(), 0);
}

#[tokio::test]
async fn inline_delete_removes_the_document() {
    use TaskEvent::{Ended, Incremented, Started};
    let (store, _, documents) = task_store(ProjectionLifecycle::Inline);
    let session = store.session();
    let identity = StreamIdentity::key("task-3").unwrap();

    session
        .start_stream(&identity, vec![Started, Incremented])
        .await
        .unwrap();
    assert_eq!(documents.document_count(), 1);

    session
        .write_to_aggregate(&identity, |stream| stream.append_one(Ended))
        .await
        .unwrap();
    assert_eq!(documents.document_count(), 0);
    assert!(session.fetch_latest(&identity).await.unwrap().is_none());
}

#[tokio::test]
async fn restart_after_end_yields_only_the_new_increments() {
    use TaskEvent::{Ended, Incremented, Restarted, Started};
    let (store, _, _) = task_store(ProjectionLifecycle::Inline);
    let session = store.session();
    let identity = StreamIdentity::key("task-4").unwrap();

    // Start, three increments, end, restart, two increments.
    session
        .start_stream(
            &identity,
            vec![
                Started,
                Incremented,
                Incremented,
                Incremented,
                Ended,
                Restarted,
                Incremented,
                Incremented,
            ],
        )
        .await
        .unwrap();

    let task = session.fetch_latest(&identity).await.unwrap().unwrap();
    assert_eq!(task.count, 2);
}

#[tokio::test]
async fn restart_in_a_separate_commit_undeletes_the_document() {
    use TaskEvent::{Ended, Incremented, Restarted, Started};
    let (store, _, _) = task_store(ProjectionLifecycle::Inline);
    let session = store.session();
    let identity = StreamIdentity::key("task-5").unwrap();

    session
        .start_stream(&identity, vec![Started, Incremented])
        .await
        .unwrap();
    session
        .write_to_aggregate(&identity, |stream| stream.append_one(Ended))
        .await
        .unwrap();
    assert!(session.fetch_latest(&identity).await.unwrap().is_none());

    session
        .write_to_aggregate(&identity, |stream| {
            stream.append_many(vec![Restarted, Incremented]);
        })
        .await
        .unwrap();

    let task = session.fetch_latest(&identity).await.unwrap().unwrap();
    assert_eq!(task.count, 1);
}

#[tokio::test]
async fn as_of_version_and_last_known_good_time_travel() {
    use TaskEvent::{Ended, Incremented, Started};
    let (store, _, _) = task_store(ProjectionLifecycle::Live);
    let session = store.session();
    let identity = StreamIdentity::key("task-6").unwrap();

    session
        .start_stream(&identity, vec![Started, Incremented, Incremented, Ended])
        .await
        .unwrap();

    let at_two = session
        .aggregate_as_of_version(&identity, StreamVersion::try_new(2).unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(at_two.count, 1);

    // The final event deleted the aggregate: tight semantics at the head.
    let at_head = session
        .aggregate_as_of_version(&identity, StreamVersion::try_new(4).unwrap())
        .await
        .unwrap();
    assert!(at_head.is_none());
    assert!(session.aggregate_stream(&identity).await.unwrap().is_none());

    let last_good = session
        .aggregate_last_known_good(&identity)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(last_good.count, 2);
}

#[tokio::test]
async fn async_daemon_catches_up_and_wait_for_non_stale_unblocks() {
    use TaskEvent::{Incremented, Started};
    let (store, log, _) = task_store(ProjectionLifecycle::Async);
    let session = store.session();
    let identity = StreamIdentity::key("task-7").unwrap();

    let mut daemon = ProjectionDaemon::new(Arc::clone(&log), DaemonOptions::default());
    let shard = Arc::new(ProjectionShard::new(Arc::clone(&store)).unwrap());
    daemon.register(shard);
    daemon.start();

    session
        .start_stream(&identity, vec![Started, Incremented, Incremented])
        .await
        .unwrap();

    let shard_name = ShardName::try_new("tasks:all").unwrap();
    daemon
        .wait_for_non_stale(&shard_name, Duration::from_secs(5))
        .await
        .unwrap();

    let task = session.fetch_latest(&identity).await.unwrap().unwrap();
    assert_eq!(task.count, 2);

    daemon.stop().await;
}

#[tokio::test]
async fn wait_for_non_stale_times_out_when_no_worker_runs() {
    use TaskEvent::Started;
    let (store, log, _) = task_store(ProjectionLifecycle::Async);
    let session = store.session();
    let identity = StreamIdentity::key("task-8").unwrap();

    let mut daemon = ProjectionDaemon::new(Arc::clone(&log), DaemonOptions::default());
    daemon.register(Arc::new(ProjectionShard::new(Arc::clone(&store)).unwrap()));
    // Deliberately not started.

    session.start_stream(&identity, vec![Started]).await.unwrap();

    let shard_name = ShardName::try_new("tasks:all").unwrap();
    let err = daemon
        .wait_for_non_stale(&shard_name, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, snapfold::DaemonError::WaitTimeout { .. }));
}

#[tokio::test]
async fn daemon_progress_survives_a_restart() {
    use TaskEvent::{Incremented, Started};
    let (store, log, documents) = task_store(ProjectionLifecycle::Async);
    let session = store.session();
    let identity = StreamIdentity::key("task-9").unwrap();
    let shard_name = ShardName::try_new("tasks:all").unwrap();

    let mut daemon = ProjectionDaemon::new(Arc::clone(&log), DaemonOptions::default());
    daemon.register(Arc::new(ProjectionShard::new(Arc::clone(&store)).unwrap()));
    daemon.start();
    session
        .start_stream(&identity, vec![Started, Incremented])
        .await
        .unwrap();
    daemon
        .wait_for_non_stale(&shard_name, Duration::from_secs(5))
        .await
        .unwrap();
    daemon.stop().await;

    let recorded = documents.load_progress(&shard_name).await.unwrap().unwrap();
    assert_eq!(recorded.value(), 2);

    // A fresh daemon resumes from the durable checkpoint.
    let mut restarted = ProjectionDaemon::new(Arc::clone(&log), DaemonOptions::default());
    restarted.register(Arc::new(ProjectionShard::new(Arc::clone(&store)).unwrap()));
    restarted.start();
    session
        .write_to_aggregate(&identity, |stream| stream.append_one(Incremented))
        .await
        .unwrap();
    restarted
        .wait_for_non_stale(&shard_name, Duration::from_secs(5))
        .await
        .unwrap();

    let task = session.fetch_latest(&identity).await.unwrap().unwrap();
    assert_eq!(task.count, 2);
    restarted.stop().await;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum AccountEvent {
    Opened,
    Closed,
}

impl DomainEvent for AccountEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Opened => "Opened",
            Self::Closed => "Closed",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Account {
    open: bool,
    deleted: bool,
}

fn account_folder() -> Folder<Account, AccountEvent> {
    FolderBuilder::new("accounts")
        .create("Opened", |_| Account {
            open: true,
            deleted: false,
        })
        .apply("Closed", |account: &mut Account, _| {
            account.open = false;
            account.deleted = true;
        })
        .soft_delete_access(
            |account: &Account| account.deleted,
            |account, deleted, _at| account.deleted = deleted,
        )
        .build()
        .unwrap()
}

#[tokio::test]
async fn soft_delete_keeps_the_row_but_hides_the_snapshot() {
    use AccountEvent::{Closed, Opened};
    let log = Arc::new(InMemoryEventLog::new());
    let documents = Arc::new(InMemoryDocumentStore::new());
    let store = AggregateStore::new(
        StoreConfig::new(IdentityScheme::Key),
        ProjectionRegistration::new("accounts", ProjectionLifecycle::Inline),
        account_folder(),
        Arc::clone(&log),
        Arc::clone(&documents),
    )
    .unwrap();
    let session = store.session();
    let identity = StreamIdentity::key("acct-1").unwrap();

    session.start_stream(&identity, vec![Opened]).await.unwrap();
    assert!(session.fetch_latest(&identity).await.unwrap().is_some());

    session
        .write_to_aggregate(&identity, |stream| stream.append_one(Closed))
        .await
        .unwrap();

    // Flagged, not removed.
    assert_eq!(documents.document_count(), 1);
    assert!(session.fetch_latest(&identity).await.unwrap().is_none());
}

#[tokio::test]
async fn rebuild_single_stream_overwrites_the_materialized_document() {
    use TaskEvent::{Incremented, Started};
    let (store, _, documents) = task_store(ProjectionLifecycle::Async);
    let session = store.session();
    let identity = StreamIdentity::key("task-10").unwrap();

    // No daemon running, so nothing is materialized yet.
    session
        .start_stream(&identity, vec![Started, Incremented, Incremented])
        .await
        .unwrap();
    assert_eq!(documents.document_count(), 0);

    let rebuilt = session
        .rebuild_single_stream(&identity)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rebuilt.count, 2);
    let task = session.fetch_latest(&identity).await.unwrap().unwrap();
    assert_eq!(task.count, 2);
}

#[tokio::test]
async fn global_projections_share_one_table_across_tenants() {
    use TaskEvent::{Incremented, Started};
    let log = Arc::new(InMemoryEventLog::new());
    let documents = Arc::new(InMemoryDocumentStore::new());
    let store = AggregateStore::new(
        StoreConfig::new(IdentityScheme::Key).conjoined(),
        ProjectionRegistration::new("tasks", ProjectionLifecycle::Inline).global(),
        task_folder(),
        Arc::clone(&log),
        Arc::clone(&documents),
    )
    .unwrap();

    let tenant_a = TenantId::try_new("tenant-a").unwrap();
    let tenant_b = TenantId::try_new("tenant-b").unwrap();
    let identity = StreamIdentity::key("task-shared").unwrap();

    store
        .session_for(tenant_a)
        .unwrap()
        .start_stream(&identity, vec![Started, Incremented])
        .await
        .unwrap();

    // The other tenant's session reads the same shared document.
    let task = store
        .session_for(tenant_b)
        .unwrap()
        .fetch_latest(&identity)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.count, 1);
}

#[tokio::test]
async fn tenanted_projections_stay_isolated() {
    use TaskEvent::{Incremented, Started};
    let log = Arc::new(InMemoryEventLog::new());
    let documents = Arc::new(InMemoryDocumentStore::new());
    let store = AggregateStore::new(
        StoreConfig::new(IdentityScheme::Key).conjoined(),
        ProjectionRegistration::new("tasks", ProjectionLifecycle::Inline),
        task_folder(),
        Arc::clone(&log),
        Arc::clone(&documents),
    )
    .unwrap();

    let tenant_a = TenantId::try_new("tenant-a").unwrap();
    let tenant_b = TenantId::try_new("tenant-b").unwrap();
    let identity = StreamIdentity::key("task-iso").unwrap();

    store
        .session_for(tenant_a)
        .unwrap()
        .start_stream(&identity, vec![Started, Incremented])
        .await
        .unwrap();

    assert!(store
        .session_for(tenant_b)
        .unwrap()
        .fetch_latest(&identity)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn single_tenant_stores_reject_foreign_tenants() {
    let (store, _, _) = task_store(ProjectionLifecycle::Live);
    let err = store
        .session_for(TenantId::try_new("other").unwrap())
        .unwrap_err();
    assert!(matches!(
        err,
        snapfold::ConfigError::InvalidRegistration { .. }
    ));
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum MeterEvent {
    Ticked { meter: String },
}

impl DomainEvent for MeterEvent {
    fn event_type(&self) -> &'static str {
        "Ticked"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct MeterTotal {
    ticks: u64,
}

#[tokio::test]
async fn daemon_partitions_batches_with_the_configured_slicer() {
    let log = Arc::new(InMemoryEventLog::new());
    let documents = Arc::new(InMemoryDocumentStore::new());
    let folder: Folder<MeterTotal, MeterEvent> = FolderBuilder::new("meter-totals")
        .default_create()
        .apply("Ticked", |total: &mut MeterTotal, _| total.ticks += 1)
        .build()
        .unwrap();
    let store = Arc::new(
        AggregateStore::new(
            StoreConfig::new(IdentityScheme::Key),
            ProjectionRegistration::new("meter-totals", ProjectionLifecycle::Async),
            folder,
            Arc::clone(&log),
            Arc::clone(&documents),
        )
        .unwrap()
        .with_slicer(ByEventKey::new(|event: &MeterEvent| {
            let MeterEvent::Ticked { meter } = event;
            StreamIdentity::key(format!("meter-{meter}")).ok()
        })),
    );
    let session = store.session();

    // Ticks for one meter arrive on two different device streams; the
    // custom key routes them into a single derived identity.
    session
        .start_stream(
            &StreamIdentity::key("device-1").unwrap(),
            vec![
                MeterEvent::Ticked { meter: "gas".to_string() },
                MeterEvent::Ticked { meter: "water".to_string() },
            ],
        )
        .await
        .unwrap();
    session
        .start_stream(
            &StreamIdentity::key("device-2").unwrap(),
            vec![MeterEvent::Ticked { meter: "gas".to_string() }],
        )
        .await
        .unwrap();

    let mut daemon = ProjectionDaemon::new(Arc::clone(&log), DaemonOptions::default());
    daemon.register(Arc::new(ProjectionShard::new(Arc::clone(&store)).unwrap()));
    daemon.start();
    let shard_name = ShardName::try_new("meter-totals:all").unwrap();
    daemon
        .wait_for_non_stale(&shard_name, Duration::from_secs(5))
        .await
        .unwrap();

    let gas = session
        .fetch_latest(&StreamIdentity::key("meter-gas").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(gas.ticks, 2);
    let water = session
        .fetch_latest(&StreamIdentity::key("meter-water").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(water.ticks, 1);

    daemon.stop().await;
}
