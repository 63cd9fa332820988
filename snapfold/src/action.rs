//! Action determination: deciding the net storage effect of one fold.
//!
//! After a slice is folded, exactly one [`AggregateAction`] describes what
//! the storage collaborator should do with the snapshot. The same policy
//! also powers the time-travel queries: as-of folds truncate the event list
//! first, and a delete at the requested point means the aggregate is absent,
//! never a tombstone.

use tokio::sync::watch;

use crate::event::{DomainEvent, EventEnvelope};
use crate::errors::FoldResult;
use crate::fold::{Aggregate, Folder};
use crate::slicing::EventSlice;
use crate::types::{StreamVersion, Timestamp};

/// The net storage effect of folding one slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateAction {
    /// Upsert the folded snapshot.
    Store,
    /// Hard-delete the stored snapshot; the folded value is irrelevant.
    Delete,
    /// Upsert the snapshot, then mark it soft-deleted.
    StoreThenSoftDelete,
    /// Upsert the snapshot and clear a prior soft-delete marker.
    UndeleteAndStore,
    /// Leave storage untouched.
    Nothing,
}

/// The outcome of action determination for one slice.
#[derive(Debug, Clone)]
pub struct Determination<A> {
    /// The folded snapshot, when the action carries one.
    pub snapshot: Option<A>,
    /// What the storage collaborator should do.
    pub action: AggregateAction,
}

impl<A> Determination<A> {
    const fn nothing() -> Self {
        Self {
            snapshot: None,
            action: AggregateAction::Nothing,
        }
    }
}

/// Folds a slice and decides its net storage action.
///
/// The default policy: a non-null fold result stores; a fold that nulled the
/// snapshot deletes; a soft-delete-capable snapshot whose deleted flag was
/// raised stores-then-soft-deletes; recreation after a delete undeletes. The
/// author's `should_delete` predicate, checked against the last domain
/// event, forces a hard delete over whatever the fold produced.
pub async fn determine_action<A: Aggregate, E: DomainEvent>(
    folder: &Folder<A, E>,
    slice: &EventSlice<A, E>,
    cancel: Option<&watch::Receiver<bool>>,
) -> FoldResult<Determination<A>> {
    let started_without_snapshot = slice.aggregate.is_none();

    // First-event guard: only projections that declare explicit start types
    // refuse to materialize from update-only events.
    if started_without_snapshot && folder.has_start_types() {
        let has_start = slice
            .events
            .iter()
            .filter(|env| !env.is_compacted())
            .any(|env| folder.is_start_type(env.event_type()));
        if !has_start {
            return Ok(Determination::nothing());
        }
    }

    let outcome = folder
        .fold(slice.aggregate.clone(), &slice.events, cancel)
        .await?;

    if let Some(event) = slice.events.iter().rev().find_map(EventEnvelope::domain_event) {
        if folder.should_delete_on(event) {
            return Ok(Determination {
                snapshot: None,
                action: AggregateAction::Delete,
            });
        }
    }

    let Some(snapshot) = outcome.snapshot else {
        if outcome.deleted {
            return Ok(Determination {
                snapshot: None,
                action: AggregateAction::Delete,
            });
        }
        return Ok(Determination::nothing());
    };

    // Recreation across folds: the document existed but was deleted before
    // this batch, and a restart-marked event brought it back.
    let restarted_across_folds = started_without_snapshot
        && !slice.is_new
        && slice
            .events
            .iter()
            .any(|env| folder.is_restart_type(env.event_type()));

    let action = if outcome.restarted || restarted_across_folds {
        AggregateAction::UndeleteAndStore
    } else if folder.supports_soft_delete() && folder.is_soft_deleted(&snapshot) {
        AggregateAction::StoreThenSoftDelete
    } else {
        AggregateAction::Store
    };

    Ok(Determination {
        snapshot: Some(snapshot),
        action,
    })
}

/// Folds a stream truncated to `through` and returns the snapshot as of that
/// version.
///
/// Tight semantics: if the truncated history's net action is a delete, the
/// result is `None`.
pub async fn snapshot_as_of_version<A: Aggregate, E: DomainEvent>(
    folder: &Folder<A, E>,
    events: &[EventEnvelope<E>],
    through: StreamVersion,
    cancel: Option<&watch::Receiver<bool>>,
) -> FoldResult<Option<A>> {
    let truncated: Vec<EventEnvelope<E>> = events
        .iter()
        .filter(|env| env.version <= through)
        .cloned()
        .collect();
    snapshot_of_prefix(folder, &truncated, cancel).await
}

/// Folds a stream truncated to events at or before `at` and returns the
/// snapshot as of that timestamp, with the same tight-delete semantics as
/// [`snapshot_as_of_version`].
pub async fn snapshot_as_of_time<A: Aggregate, E: DomainEvent>(
    folder: &Folder<A, E>,
    events: &[EventEnvelope<E>],
    at: Timestamp,
    cancel: Option<&watch::Receiver<bool>>,
) -> FoldResult<Option<A>> {
    let truncated: Vec<EventEnvelope<E>> = events
        .iter()
        .filter(|env| env.timestamp <= at)
        .cloned()
        .collect();
    snapshot_of_prefix(folder, &truncated, cancel).await
}

/// Returns the last snapshot state that was not deleted, ignoring a
/// trailing delete.
///
/// Implemented as a forward fold that retains the last non-null state. A
/// stream that was deleted from its very first applicable event yields
/// `Ok(None)`.
pub async fn last_known_good<A: Aggregate, E: DomainEvent>(
    folder: &Folder<A, E>,
    events: &[EventEnvelope<E>],
    cancel: Option<&watch::Receiver<bool>>,
) -> FoldResult<Option<A>> {
    let mut current: Option<A> = None;
    let mut last_good: Option<A> = None;

    for envelope in events {
        let step = std::slice::from_ref(envelope);
        let outcome = folder.fold(current.take(), step, cancel).await?;
        current = outcome.snapshot;

        let hard_deleted = envelope
            .domain_event()
            .is_some_and(|event| folder.should_delete_on(event));
        if hard_deleted {
            current = None;
            continue;
        }
        if let Some(snapshot) = &current {
            if !(folder.supports_soft_delete() && folder.is_soft_deleted(snapshot)) {
                last_good = Some(snapshot.clone());
            }
        }
    }

    Ok(last_good)
}

pub(crate) async fn snapshot_of_prefix<A: Aggregate, E: DomainEvent>(
    folder: &Folder<A, E>,
    events: &[EventEnvelope<E>],
    cancel: Option<&watch::Receiver<bool>>,
) -> FoldResult<Option<A>> {
    if events.is_empty() {
        return Ok(None);
    }
    let outcome = folder.fold(None, events, cancel).await?;

    if let Some(event) = events.iter().rev().find_map(EventEnvelope::domain_event) {
        if folder.should_delete_on(event) {
            return Ok(None);
        }
    }
    if outcome.deleted {
        return Ok(None);
    }
    Ok(outcome.snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Stored;
    use crate::fold::{FolderBuilder, FoldNext};
    use crate::types::{EventId, GlobalSequence, StreamIdentity, TenantId};
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    enum TaskEvent {
        Started,
        Incremented,
        Ended,
        Restarted,
        Noted,
    }

    impl DomainEvent for TaskEvent {
        fn event_type(&self) -> &'static str {
            match self {
                Self::Started => "Started",
                Self::Incremented => "Incremented",
                Self::Ended => "Ended",
                Self::Restarted => "Restarted",
                Self::Noted => "Noted",
            }
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    struct Task {
        count: u64,
        deleted: bool,
    }

    fn lifecycle_folder() -> Folder<Task, TaskEvent> {
        FolderBuilder::new("tasks")
            .create("Started", |_| Task::default())
            .create("Restarted", |_| Task::default())
            .apply("Incremented", |task: &mut Task, _| task.count += 1)
            .try_apply("Ended", |_, _| Ok(FoldNext::Deleted))
            .ignore("Noted")
            .start_when(&["Started"])
            .restart_when(&["Restarted"])
            .build()
            .unwrap()
    }

    fn envelope(version: u64, payload: TaskEvent) -> EventEnvelope<TaskEvent> {
        EventEnvelope {
            id: EventId::new(),
            sequence: GlobalSequence::try_new(version).unwrap(),
            version: StreamVersion::try_new(version).unwrap(),
            identity: StreamIdentity::key("task-1").unwrap(),
            tenant: TenantId::default_tenant(),
            timestamp: Timestamp::now(),
            headers: HashMap::new(),
            payload: Stored::Domain(payload),
        }
    }

    fn stream(events: &[TaskEvent]) -> Vec<EventEnvelope<TaskEvent>> {
        events
            .iter()
            .enumerate()
            .map(|(i, e)| envelope(i as u64 + 1, e.clone()))
            .collect()
    }

    fn slice_of(events: Vec<EventEnvelope<TaskEvent>>) -> EventSlice<Task, TaskEvent> {
        let mut slice = EventSlice::new(
            StreamIdentity::key("task-1").unwrap(),
            TenantId::default_tenant(),
        );
        slice.events = events;
        slice
    }

    #[tokio::test]
    async fn plain_fold_to_non_null_snapshot_stores() {
        use TaskEvent::{Incremented, Started};
        let folder = lifecycle_folder();
        let slice = slice_of(stream(&[Started, Incremented, Incremented]));

        let result = determine_action(&folder, &slice, None).await.unwrap();
        assert_eq!(result.action, AggregateAction::Store);
        assert_eq!(result.snapshot.unwrap().count, 2);
    }

    #[tokio::test]
    async fn fold_that_nulls_the_snapshot_deletes() {
        use TaskEvent::{Ended, Incremented, Started};
        let folder = lifecycle_folder();
        let slice = slice_of(stream(&[Started, Incremented, Ended]));

        let result = determine_action(&folder, &slice, None).await.unwrap();
        assert_eq!(result.action, AggregateAction::Delete);
        assert!(result.snapshot.is_none());
    }

    #[tokio::test]
    async fn update_only_events_on_a_nonexistent_aggregate_do_nothing() {
        use TaskEvent::Incremented;
        let folder = lifecycle_folder();
        let slice = slice_of(stream(&[Incremented, Incremented]));

        let result = determine_action(&folder, &slice, None).await.unwrap();
        assert_eq!(result.action, AggregateAction::Nothing);
        assert!(result.snapshot.is_none());
    }

    #[tokio::test]
    async fn projections_without_start_types_materialize_from_the_first_event() {
        use TaskEvent::Incremented;
        let folder: Folder<Task, TaskEvent> = FolderBuilder::new("plain")
            .default_create()
            .apply("Incremented", |task: &mut Task, _| task.count += 1)
            .build()
            .unwrap();
        let slice = slice_of(stream(&[Incremented]));

        let result = determine_action(&folder, &slice, None).await.unwrap();
        assert_eq!(result.action, AggregateAction::Store);
        assert_eq!(result.snapshot.unwrap().count, 1);
    }

    #[tokio::test]
    async fn restart_after_delete_resolves_to_undelete_and_store() {
        use TaskEvent::{Ended, Incremented, Restarted, Started};
        let folder = lifecycle_folder();
        let slice = slice_of(stream(&[
            Started,
            Incremented,
            Incremented,
            Incremented,
            Ended,
            Restarted,
            Incremented,
            Incremented,
        ]));

        let result = determine_action(&folder, &slice, None).await.unwrap();
        assert_eq!(result.action, AggregateAction::UndeleteAndStore);
        // Count restarts from zero after the delete.
        assert_eq!(result.snapshot.unwrap().count, 2);
    }

    #[tokio::test]
    async fn restart_in_a_later_batch_still_undeletes() {
        use TaskEvent::{Incremented, Restarted};
        let folder = lifecycle_folder();
        // The document existed (is_new = false) but was deleted, so the
        // batch starts with no snapshot.
        let mut slice = slice_of(stream(&[Restarted, Incremented]));
        slice.is_new = false;

        let result = determine_action(&folder, &slice, None).await.unwrap();
        assert_eq!(result.action, AggregateAction::UndeleteAndStore);
        assert_eq!(result.snapshot.unwrap().count, 1);
    }

    #[tokio::test]
    async fn should_delete_predicate_forces_hard_delete() {
        use TaskEvent::{Incremented, Noted, Started};
        let folder: Folder<Task, TaskEvent> = FolderBuilder::new("pred")
            .create("Started", |_| Task::default())
            .apply("Incremented", |task: &mut Task, _| task.count += 1)
            .ignore("Noted")
            .should_delete_when(|event| matches!(event, TaskEvent::Noted))
            .build()
            .unwrap();

        let slice = slice_of(stream(&[Started, Incremented, Noted]));
        let result = determine_action(&folder, &slice, None).await.unwrap();
        assert_eq!(result.action, AggregateAction::Delete);
        assert!(result.snapshot.is_none());
    }

    #[tokio::test]
    async fn soft_delete_flag_turns_store_into_store_then_soft_delete() {
        use TaskEvent::{Ended, Started};
        let folder: Folder<Task, TaskEvent> = FolderBuilder::new("soft")
            .create("Started", |_| Task::default())
            .apply("Ended", |task: &mut Task, _| task.deleted = true)
            .soft_delete_access(
                |task: &Task| task.deleted,
                |task, deleted, _at| task.deleted = deleted,
            )
            .build()
            .unwrap();

        let slice = slice_of(stream(&[Started, Ended]));
        let result = determine_action(&folder, &slice, None).await.unwrap();
        assert_eq!(result.action, AggregateAction::StoreThenSoftDelete);
        assert!(result.snapshot.unwrap().deleted);
    }

    #[tokio::test]
    async fn as_of_version_truncates_before_folding() {
        use TaskEvent::{Incremented, Started};
        let folder = lifecycle_folder();
        let events = stream(&[Started, Incremented, Incremented, Incremented]);

        let snapshot = snapshot_as_of_version(
            &folder,
            &events,
            StreamVersion::try_new(2).unwrap(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(snapshot.unwrap().count, 1);
    }

    #[tokio::test]
    async fn as_of_a_deleted_version_is_absent_not_a_tombstone() {
        use TaskEvent::{Ended, Incremented, Restarted, Started};
        let folder = lifecycle_folder();
        let events = stream(&[Started, Incremented, Ended, Restarted]);

        let at_delete = snapshot_as_of_version(
            &folder,
            &events,
            StreamVersion::try_new(3).unwrap(),
            None,
        )
        .await
        .unwrap();
        assert!(at_delete.is_none());

        let after_restart = snapshot_as_of_version(
            &folder,
            &events,
            StreamVersion::try_new(4).unwrap(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(after_restart.unwrap().count, 0);
    }

    #[tokio::test]
    async fn last_known_good_ignores_a_trailing_delete() {
        use TaskEvent::{Ended, Incremented, Started};
        let folder = lifecycle_folder();
        let events = stream(&[Started, Incremented, Incremented, Ended]);

        let snapshot = last_known_good(&folder, &events, None).await.unwrap();
        assert_eq!(snapshot.unwrap().count, 2);
    }

    #[tokio::test]
    async fn last_known_good_is_none_when_no_good_state_ever_existed() {
        use TaskEvent::Ended;
        let folder: Folder<Task, TaskEvent> = FolderBuilder::new("doomed")
            .default_create()
            .try_apply("Ended", |_, _| Ok(FoldNext::Deleted))
            .build()
            .unwrap();
        let events = stream(&[Ended]);

        let snapshot = last_known_good(&folder, &events, None).await.unwrap();
        assert!(snapshot.is_none());
    }

    #[tokio::test]
    async fn empty_prefix_yields_no_snapshot() {
        let folder = lifecycle_folder();
        let snapshot = snapshot_as_of_version(
            &folder,
            &[],
            StreamVersion::try_new(5).unwrap(),
            None,
        )
        .await
        .unwrap();
        assert!(snapshot.is_none());
    }
}
