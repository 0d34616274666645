//! Behaviour every `TaskStore` must share, run against each implementation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use rstest::rstest;
use ulid::Ulid;

use super::{InMemoryTaskStore, SqliteTaskStore};
use crate::domain::{
    ClaimOutcome, ReclaimOutcome, TaskEnvelope, TaskId, TaskStatus, TaskType, UpdateOutcome,
};
use crate::ports::{Clock, FixedClock, StoreError, TaskStore};

#[derive(Debug, Clone, Copy)]
enum Backend {
    Memory,
    Sqlite,
}

impl Backend {
    async fn store(self, clock: Arc<FixedClock>) -> Arc<dyn TaskStore> {
        match self {
            Backend::Memory => Arc::new(InMemoryTaskStore::new().with_clock(clock)),
            Backend::Sqlite => Arc::new(
                SqliteTaskStore::in_memory()
                    .await
                    .unwrap()
                    .with_clock(clock),
            ),
        }
    }
}

fn clock() -> Arc<FixedClock> {
    Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
    ))
}

fn envelope(task_type: &str) -> TaskEnvelope {
    TaskEnvelope::new(
        TaskId::from_ulid(Ulid::new()),
        TaskType::new(task_type),
        br#"{"n":1}"#.to_vec(),
    )
}

async fn claimed(store: &dyn TaskStore, env: &TaskEnvelope) -> crate::domain::TaskRecord {
    store.save_task(env).await.unwrap();
    match store.claim_task(env.task_id()).await.unwrap() {
        ClaimOutcome::Claimed(record) => record,
        other => panic!("expected claim, got {other:?}"),
    }
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn save_starts_pending(#[case] backend: Backend) {
    let clock = clock();
    let store = backend.store(clock.clone()).await;
    let env = envelope("echo");

    let saved = store.save_task(&env).await.unwrap();
    assert_eq!(saved.status, TaskStatus::Pending);
    assert_eq!(saved.attempts, 0);
    assert_eq!(saved.created_at, clock.now());
    assert_eq!(saved.created_at, saved.updated_at);

    let loaded = store.get_task(env.task_id()).await.unwrap().unwrap();
    assert_eq!(loaded, saved);
    assert_eq!(loaded.envelope.payload(), br#"{"n":1}"#);
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn duplicate_id_is_refused(#[case] backend: Backend) {
    let store = backend.store(clock()).await;
    let env = envelope("echo");

    store.save_task(&env).await.unwrap();
    let err = store.save_task(&env).await.unwrap_err();
    assert!(matches!(err, StoreError::DuplicateId(id) if id == env.task_id()));
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn pending_tasks_come_oldest_first(#[case] backend: Backend) {
    let clock = clock();
    let store = backend.store(clock.clone()).await;

    let first = envelope("a");
    let second = envelope("b");
    let third = envelope("c");
    store.save_task(&first).await.unwrap();
    clock.advance(chrono::Duration::seconds(1));
    store.save_task(&second).await.unwrap();
    // same timestamp as `second`: insertion order breaks the tie
    store.save_task(&third).await.unwrap();

    let ids: Vec<TaskId> = store
        .get_pending_tasks()
        .await
        .unwrap()
        .iter()
        .map(|r| r.id())
        .collect();
    assert_eq!(ids, vec![first.task_id(), second.task_id(), third.task_id()]);
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn claim_counts_an_attempt(#[case] backend: Backend) {
    let clock = clock();
    let store = backend.store(clock.clone()).await;
    let env = envelope("echo");
    store.save_task(&env).await.unwrap();

    clock.advance(chrono::Duration::seconds(5));
    let record = match store.claim_task(env.task_id()).await.unwrap() {
        ClaimOutcome::Claimed(record) => record,
        other => panic!("expected claim, got {other:?}"),
    };
    assert_eq!(record.status, TaskStatus::Processing);
    assert_eq!(record.attempts, 1);
    assert_eq!(record.updated_at, clock.now());

    let again = store.claim_task(env.task_id()).await.unwrap();
    assert_eq!(
        again,
        ClaimOutcome::AlreadyTaken {
            current: TaskStatus::Processing
        }
    );

    let missing = store
        .claim_task(TaskId::from_ulid(Ulid::new()))
        .await
        .unwrap();
    assert_eq!(missing, ClaimOutcome::NotFound);
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_have_one_winner(#[case] backend: Backend) {
    let store = backend.store(clock()).await;
    let env = envelope("echo");
    store.save_task(&env).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let store = Arc::clone(&store);
        let id = env.task_id();
        handles.push(tokio::spawn(async move { store.claim_task(id).await.unwrap() }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            ClaimOutcome::Claimed(_) => winners += 1,
            ClaimOutcome::AlreadyTaken { current } => {
                assert_eq!(current, TaskStatus::Processing)
            }
            ClaimOutcome::NotFound => panic!("task vanished"),
        }
    }
    assert_eq!(winners, 1);

    let record = store.get_task(env.task_id()).await.unwrap().unwrap();
    assert_eq!(record.attempts, 1);
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn update_follows_the_state_machine(#[case] backend: Backend) {
    let store = backend.store(clock()).await;
    let env = envelope("echo");
    store.save_task(&env).await.unwrap();
    let id = env.task_id();

    // pending cannot jump to a terminal state
    let outcome = store
        .update_task_status(id, TaskStatus::Completed, None)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        UpdateOutcome::Rejected {
            current: TaskStatus::Pending,
            requested: TaskStatus::Completed
        }
    );

    // processing is only reachable through a claim
    let outcome = store
        .update_task_status(id, TaskStatus::Processing, None)
        .await
        .unwrap();
    assert!(matches!(outcome, UpdateOutcome::Rejected { .. }));

    store.claim_task(id).await.unwrap();
    let outcome = store
        .update_task_status(id, TaskStatus::Failed, Some("boom"))
        .await
        .unwrap();
    let UpdateOutcome::Updated(record) = outcome else {
        panic!("expected update, got {outcome:?}");
    };
    assert_eq!(record.status, TaskStatus::Failed);
    assert_eq!(record.error_message.as_deref(), Some("boom"));
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn error_message_is_dropped_unless_failed(#[case] backend: Backend) {
    let store = backend.store(clock()).await;
    let env = envelope("echo");
    claimed(store.as_ref(), &env).await;

    let outcome = store
        .update_task_status(env.task_id(), TaskStatus::Completed, Some("ignored"))
        .await
        .unwrap();
    let UpdateOutcome::Updated(record) = outcome else {
        panic!("expected update, got {outcome:?}");
    };
    assert_eq!(record.error_message, None);
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn update_of_unknown_task_is_not_found(#[case] backend: Backend) {
    let store = backend.store(clock()).await;

    let outcome = store
        .update_task_status(TaskId::from_ulid(Ulid::new()), TaskStatus::Completed, None)
        .await
        .unwrap();
    assert_eq!(outcome, UpdateOutcome::NotFound);
}

#[rstest]
#[case::memory(Backend::Memory, TaskStatus::Completed)]
#[case::memory_failed(Backend::Memory, TaskStatus::Failed)]
#[case::sqlite(Backend::Sqlite, TaskStatus::Completed)]
#[case::sqlite_failed(Backend::Sqlite, TaskStatus::Failed)]
#[tokio::test]
async fn terminal_tasks_stay_terminal(#[case] backend: Backend, #[case] terminal: TaskStatus) {
    let clock = clock();
    let store = backend.store(clock.clone()).await;
    let env = envelope("echo");
    let id = env.task_id();
    claimed(store.as_ref(), &env).await;
    store.update_task_status(id, terminal, Some("x")).await.unwrap();

    for next in TaskStatus::ALL {
        let outcome = store.update_task_status(id, next, None).await.unwrap();
        assert!(
            matches!(outcome, UpdateOutcome::Rejected { current, .. } if current == terminal),
            "{terminal} -> {next} must be rejected, got {outcome:?}"
        );
    }
    assert!(!store.claim_task(id).await.unwrap().is_claimed());

    clock.advance(chrono::Duration::hours(1));
    assert!(store.get_processing_tasks(Duration::ZERO).await.unwrap().is_empty());
    assert_eq!(store.get_task(id).await.unwrap().unwrap().status, terminal);
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn only_stale_processing_tasks_are_listed(#[case] backend: Backend) {
    let clock = clock();
    let store = backend.store(clock.clone()).await;

    let old = envelope("old");
    claimed(store.as_ref(), &old).await;
    clock.advance(chrono::Duration::minutes(13));
    let fresh = envelope("fresh");
    claimed(store.as_ref(), &fresh).await;
    clock.advance(chrono::Duration::minutes(2));

    // old: 15 minutes idle, fresh: 2 minutes idle
    let stale = store
        .get_processing_tasks(Duration::from_secs(10 * 60))
        .await
        .unwrap();
    let ids: Vec<TaskId> = stale.iter().map(|r| r.id()).collect();
    assert_eq!(ids, vec![old.task_id()]);

    let all = store.get_processing_tasks(Duration::ZERO).await.unwrap();
    assert_eq!(all.len(), 2);
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn reclaim_requeues_stale_task(#[case] backend: Backend) {
    let clock = clock();
    let store = backend.store(clock.clone()).await;
    let env = envelope("echo");
    let record = claimed(store.as_ref(), &env).await;

    clock.advance(chrono::Duration::minutes(30));
    let outcome = store
        .reclaim_task(env.task_id(), record.updated_at, Some(5))
        .await
        .unwrap();
    let ReclaimOutcome::Requeued(requeued) = outcome else {
        panic!("expected requeue, got {outcome:?}");
    };
    assert_eq!(requeued.status, TaskStatus::Pending);
    assert_eq!(requeued.attempts, 1);
    assert_eq!(requeued.error_message, None);
    assert!(requeued.updated_at > record.updated_at);

    // and it can be claimed again, once
    let again = store.claim_task(env.task_id()).await.unwrap();
    let ClaimOutcome::Claimed(again) = again else {
        panic!("expected claim, got {again:?}");
    };
    assert_eq!(again.attempts, 2);
    assert_eq!(
        store.claim_task(env.task_id()).await.unwrap(),
        ClaimOutcome::AlreadyTaken {
            current: TaskStatus::Processing
        }
    );
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn requeued_task_has_one_concurrent_winner(#[case] backend: Backend) {
    let clock = clock();
    let store = backend.store(clock.clone()).await;
    let env = envelope("echo");
    let record = claimed(store.as_ref(), &env).await;

    clock.advance(chrono::Duration::minutes(31));
    let outcome = store
        .reclaim_task(env.task_id(), record.updated_at, None)
        .await
        .unwrap();
    assert!(matches!(outcome, ReclaimOutcome::Requeued(_)));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let store = Arc::clone(&store);
        let id = env.task_id();
        handles.push(tokio::spawn(async move { store.claim_task(id).await.unwrap() }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        if let ClaimOutcome::Claimed(record) = handle.await.unwrap() {
            winners.push(record.attempts);
        }
    }
    assert_eq!(winners, vec![2]);
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn stale_owner_cannot_finish_a_newer_claim(#[case] backend: Backend) {
    let clock = clock();
    let store = backend.store(clock.clone()).await;
    let env = envelope("echo");
    let id = env.task_id();
    let first = claimed(store.as_ref(), &env).await;

    // first owner stalls, the reaper requeues, a second worker claims
    clock.advance(chrono::Duration::minutes(31));
    store.reclaim_task(id, first.updated_at, None).await.unwrap();
    let ClaimOutcome::Claimed(second) = store.claim_task(id).await.unwrap() else {
        panic!("second claim failed");
    };
    assert_eq!(second.attempts, 2);

    for status in [TaskStatus::Pending, TaskStatus::Completed, TaskStatus::Failed] {
        let outcome = store
            .finish_claim(id, first.attempts, status, Some("late"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            UpdateOutcome::Superseded {
                current: TaskStatus::Processing,
                attempts: 2
            },
            "{status}"
        );
    }

    // the second owner's claim is intact
    assert!(!store.claim_task(id).await.unwrap().is_claimed());
    let record = store.get_task(id).await.unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::Processing);
    assert_eq!(record.error_message, None);

    let outcome = store
        .finish_claim(id, second.attempts, TaskStatus::Completed, None)
        .await
        .unwrap();
    assert!(outcome.is_updated());

    // finished claims stay finished
    let outcome = store
        .finish_claim(id, second.attempts, TaskStatus::Pending, None)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        UpdateOutcome::Superseded {
            current: TaskStatus::Completed,
            attempts: 2
        }
    );
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn finish_claim_records_the_owners_result(#[case] backend: Backend) {
    let store = backend.store(clock()).await;
    let env = envelope("echo");
    let id = env.task_id();
    let record = claimed(store.as_ref(), &env).await;

    let outcome = store
        .finish_claim(id, record.attempts, TaskStatus::Processing, None)
        .await
        .unwrap();
    assert!(matches!(outcome, UpdateOutcome::Rejected { .. }));

    let outcome = store
        .finish_claim(id, record.attempts, TaskStatus::Failed, Some("boom"))
        .await
        .unwrap();
    let UpdateOutcome::Updated(failed) = outcome else {
        panic!("expected update, got {outcome:?}");
    };
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("boom"));

    let missing = store
        .finish_claim(TaskId::from_ulid(Ulid::new()), 1, TaskStatus::Completed, None)
        .await
        .unwrap();
    assert_eq!(missing, UpdateOutcome::NotFound);
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn reclaim_skips_when_snapshot_is_outdated(#[case] backend: Backend) {
    let clock = clock();
    let store = backend.store(clock.clone()).await;
    let env = envelope("echo");
    let record = claimed(store.as_ref(), &env).await;

    // the worker finished between the scan and the reclaim
    clock.advance(chrono::Duration::seconds(1));
    store
        .update_task_status(env.task_id(), TaskStatus::Completed, None)
        .await
        .unwrap();

    let outcome = store
        .reclaim_task(env.task_id(), record.updated_at, None)
        .await
        .unwrap();
    assert_eq!(outcome, ReclaimOutcome::Skipped);
    assert_eq!(
        store.get_task(env.task_id()).await.unwrap().unwrap().status,
        TaskStatus::Completed
    );

    let missing = store
        .reclaim_task(TaskId::from_ulid(Ulid::new()), record.updated_at, None)
        .await
        .unwrap();
    assert_eq!(missing, ReclaimOutcome::Skipped);
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn reclaim_fails_task_after_max_attempts(#[case] backend: Backend) {
    let clock = clock();
    let store = backend.store(clock.clone()).await;
    let env = envelope("echo");
    let id = env.task_id();
    store.save_task(&env).await.unwrap();

    let mut last = None;
    for _ in 0..2 {
        let ClaimOutcome::Claimed(record) = store.claim_task(id).await.unwrap() else {
            panic!("claim failed");
        };
        clock.advance(chrono::Duration::minutes(31));
        last = Some(store.reclaim_task(id, record.updated_at, Some(2)).await.unwrap());
    }

    let Some(ReclaimOutcome::Exhausted(record)) = last else {
        panic!("expected exhaustion, got {last:?}");
    };
    assert_eq!(record.status, TaskStatus::Failed);
    assert_eq!(record.attempts, 2);
    assert!(
        record
            .error_message
            .as_deref()
            .unwrap_or_default()
            .contains("exceeded max attempts")
    );
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn worker_can_release_a_claim(#[case] backend: Backend) {
    let store = backend.store(clock()).await;
    let env = envelope("echo");
    let record = claimed(store.as_ref(), &env).await;

    let outcome = store
        .finish_claim(env.task_id(), record.attempts, TaskStatus::Pending, None)
        .await
        .unwrap();
    assert!(outcome.is_updated());
    assert_eq!(store.get_pending_tasks().await.unwrap().len(), 1);
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn updated_at_never_goes_backwards(#[case] backend: Backend) {
    let clock = clock();
    let store = backend.store(clock.clone()).await;
    let env = envelope("echo");
    let record = claimed(store.as_ref(), &env).await;

    clock.advance(chrono::Duration::minutes(-10));
    let outcome = store
        .update_task_status(env.task_id(), TaskStatus::Completed, None)
        .await
        .unwrap();
    let UpdateOutcome::Updated(done) = outcome else {
        panic!("expected update, got {outcome:?}");
    };
    assert_eq!(done.updated_at, record.updated_at);
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn counts_by_status(#[case] backend: Backend) {
    let store = backend.store(clock()).await;

    for _ in 0..3 {
        store.save_task(&envelope("echo")).await.unwrap();
    }
    let running = envelope("echo");
    claimed(store.as_ref(), &running).await;

    let counts = store.count_by_status().await.unwrap();
    assert_eq!(counts.pending, 3);
    assert_eq!(counts.processing, 1);
    assert_eq!(counts.total(), 4);
}
