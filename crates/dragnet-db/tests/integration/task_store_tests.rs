use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use dragnet_core::clock::{Clock, ManualClock};
use dragnet_core::config::QueueConfig;
use dragnet_core::rate_limit::{RateLimitPolicy, Reservation};
use dragnet_core::store::{HeartbeatStore, QueueStore, RateLimitStore};
use dragnet_core::worker::{WorkerHeartbeat, WorkerState};
use dragnet_core::{AppError, Enqueued, NewTask, QueueCounts, TaskId, TaskManager, TaskState};
use dragnet_db::PgTaskStore;

use crate::integration::common::setup_test_db;

fn manager(store: PgTaskStore, max_attempts: u32) -> (TaskManager<PgTaskStore>, ManualClock) {
    let clock = ManualClock::default();
    let config = QueueConfig::default()
        .with_max_attempts(max_attempts)
        .with_lease_timeout(Duration::from_secs(300));
    (
        TaskManager::with_clock(store, Arc::new(clock.clone()), config),
        clock,
    )
}

fn payload(key: &str) -> serde_json::Value {
    serde_json::json!({"company": key})
}

fn id(key: &str) -> TaskId {
    TaskId::new(key).unwrap()
}

#[tokio::test]
async fn insert_and_read_back() {
    let (pool, _container) = setup_test_db().await;
    let (tm, clock) = manager(PgTaskStore::new(pool), 3);

    assert!(tm.enqueue("acme", payload("acme")).await.unwrap());

    let task = tm.get(&id("acme")).await.unwrap().expect("task exists");
    assert_eq!(task.state, TaskState::Pending);
    assert_eq!(task.payload, payload("acme"));
    assert_eq!(task.attempts, 0);
    assert_eq!(task.max_attempts, 3);
    assert!(task.claimed_by.is_none());
    assert_eq!(task.created_at.timestamp(), clock.now().timestamp());
}

#[tokio::test]
async fn enqueue_is_idempotent() {
    let (pool, _container) = setup_test_db().await;
    let (tm, _) = manager(PgTaskStore::new(pool), 3);

    assert!(tm.enqueue("a", payload("a")).await.unwrap());
    assert!(!tm.enqueue("a", payload("other")).await.unwrap());

    let claimed = tm.claim("w1").await.unwrap().unwrap();
    assert!(!tm.enqueue("a", payload("other")).await.unwrap());
    tm.ack_success(&claimed.id).await.unwrap();
    assert!(!tm.enqueue("a", payload("other")).await.unwrap());

    let counts = tm.counts().await.unwrap();
    assert_eq!(counts.total(), 1);
    assert_eq!(counts.done, 1);
    assert_eq!(tm.get(&id("a")).await.unwrap().unwrap().payload, payload("a"));
}

#[tokio::test]
async fn claim_is_fifo_and_requeue_goes_to_the_back() {
    let (pool, _container) = setup_test_db().await;
    let (tm, _) = manager(PgTaskStore::new(pool), 3);
    for key in ["a", "b", "c"] {
        tm.enqueue(key, payload(key)).await.unwrap();
    }

    let a = tm.claim("w1").await.unwrap().unwrap();
    assert_eq!(a.id, id("a"));
    assert_eq!(a.attempts, 1);
    assert_eq!(a.claimed_by.as_deref(), Some("w1"));

    let next = tm
        .ack_failure(&a.id, &AppError::NetworkError("reset".into()))
        .await
        .unwrap();
    assert_eq!(next, Some(TaskState::Pending));

    let order: Vec<String> = [
        tm.claim("w1").await.unwrap().unwrap(),
        tm.claim("w1").await.unwrap().unwrap(),
        tm.claim("w1").await.unwrap().unwrap(),
    ]
    .into_iter()
    .map(|t| t.id.to_string())
    .collect();
    assert_eq!(order, vec!["b", "c", "a"]);
    assert!(tm.claim("w1").await.unwrap().is_none());
}

#[tokio::test]
async fn concurrent_claims_never_share_a_task() {
    let (pool, _container) = setup_test_db().await;
    let store = PgTaskStore::new(pool);
    let (tm, _) = manager(store.clone(), 3);
    for i in 0..20 {
        tm.enqueue(&format!("t{i}"), payload("x")).await.unwrap();
    }

    let mut handles = Vec::new();
    for w in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            while let Some(task) = store.claim(&format!("w{w}"), Utc::now()).await.unwrap() {
                mine.push(task.id);
            }
            mine
        }));
    }

    let mut all = Vec::new();
    for h in handles {
        all.extend(h.await.unwrap());
    }
    let distinct: HashSet<_> = all.iter().cloned().collect();
    assert_eq!(all.len(), 20);
    assert_eq!(distinct.len(), 20);
}

#[tokio::test]
async fn retry_ceiling_and_permanent_failures() {
    let (pool, _container) = setup_test_db().await;
    let (tm, _) = manager(PgTaskStore::new(pool), 2);
    tm.enqueue("flaky", payload("f")).await.unwrap();
    tm.enqueue("broken", payload("b")).await.unwrap();

    let err = AppError::Timeout(30);
    let flaky = tm.claim("w1").await.unwrap().unwrap();
    assert_eq!(tm.ack_failure(&flaky.id, &err).await.unwrap(), Some(TaskState::Pending));

    let broken = tm.claim("w1").await.unwrap().unwrap();
    let state = tm
        .ack_failure(&broken.id, &AppError::permanent("no website"))
        .await
        .unwrap();
    assert_eq!(state, Some(TaskState::Failed));

    let flaky = tm.claim("w1").await.unwrap().unwrap();
    assert_eq!(flaky.attempts, 2);
    assert_eq!(tm.ack_failure(&flaky.id, &err).await.unwrap(), Some(TaskState::Dead));

    // Stale acks change nothing.
    assert_eq!(tm.ack_failure(&flaky.id, &err).await.unwrap(), None);
    assert!(!tm.ack_success(&flaky.id).await.unwrap());

    let dead = tm.get(&flaky.id).await.unwrap().unwrap();
    assert_eq!(dead.last_error.as_deref(), Some("Timed out after 30 seconds"));
    assert!(dead.completed_at.is_some());
    assert_eq!(
        tm.counts().await.unwrap(),
        QueueCounts {
            failed: 1,
            dead: 1,
            ..Default::default()
        }
    );
}

#[tokio::test]
async fn reclaim_respects_the_lease_boundary() {
    let (pool, _container) = setup_test_db().await;
    let store = PgTaskStore::new(pool);
    let (tm, clock) = manager(store, 3);
    tm.enqueue("a", payload("a")).await.unwrap();
    tm.claim("crashed").await.unwrap().unwrap();

    clock.advance(TimeDelta::seconds(299));
    assert!(tm.reclaim_expired(Duration::from_secs(300)).await.unwrap().is_empty());

    clock.advance(TimeDelta::seconds(1));
    let reclaimed = tm.reclaim_expired(Duration::from_secs(300)).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].previous_owner.as_deref(), Some("crashed"));
    assert_eq!(reclaimed[0].state, TaskState::Pending);

    let task = tm.get(&id("a")).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Pending);
    assert_eq!(task.attempts, 1);
    assert_eq!(task.last_error.as_deref(), Some("lease held by crashed expired"));
}

#[tokio::test]
async fn reclaim_of_exhausted_task_requeues_it() {
    let (pool, _container) = setup_test_db().await;
    let (tm, clock) = manager(PgTaskStore::new(pool), 1);
    tm.enqueue("a", payload("a")).await.unwrap();
    tm.claim("crashed").await.unwrap().unwrap();

    clock.advance(TimeDelta::minutes(10));
    let reclaimed = tm.sweep().await.unwrap();
    assert_eq!(reclaimed[0].state, TaskState::Pending);
    assert_eq!(tm.counts().await.unwrap().pending, 1);

    let retry = tm.claim("w2").await.unwrap().unwrap();
    assert_eq!(retry.attempts, 2);
    let err = AppError::Timeout(5);
    assert_eq!(tm.ack_failure(&retry.id, &err).await.unwrap(), Some(TaskState::Dead));
}

#[tokio::test]
async fn insert_revives_dead_ids_and_revive_all_filters_by_state() {
    let (pool, _container) = setup_test_db().await;
    let store = PgTaskStore::new(pool);
    let (tm, _) = manager(store.clone(), 1);
    for key in ["a", "b"] {
        tm.enqueue(key, payload(key)).await.unwrap();
    }
    let a = tm.claim("w1").await.unwrap().unwrap();
    tm.ack_failure(&a.id, &AppError::Timeout(5)).await.unwrap();
    let b = tm.claim("w1").await.unwrap().unwrap();
    tm.ack_failure(&b.id, &AppError::permanent("bad")).await.unwrap();

    let outcome = tm
        .submit(NewTask::new("a", payload("a2")).unwrap())
        .await
        .unwrap();
    assert_eq!(outcome, Enqueued::Revived);
    let a = tm.get(&id("a")).await.unwrap().unwrap();
    assert_eq!(a.state, TaskState::Pending);
    assert_eq!(a.max_attempts, 2);
    assert_eq!(a.payload, payload("a2"));
    assert!(a.last_error.is_none());

    assert!(matches!(
        store.revive_all(TaskState::Pending, 1, Utc::now()).await,
        Err(AppError::Validation(_))
    ));
    assert_eq!(tm.revive_all(TaskState::Failed).await.unwrap(), 1);
    assert_eq!(tm.counts().await.unwrap().pending, 2);
}

#[tokio::test]
async fn list_orders_pending_by_queue_position() {
    let (pool, _container) = setup_test_db().await;
    let (tm, _) = manager(PgTaskStore::new(pool), 3);
    for key in ["c", "a", "b"] {
        tm.enqueue(key, payload(key)).await.unwrap();
    }

    let pending = tm.list(Some(TaskState::Pending), 10).await.unwrap();
    let ids: Vec<_> = pending.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["c", "a", "b"]);
    assert_eq!(tm.list(None, 2).await.unwrap().len(), 2);
    assert!(tm.list(Some(TaskState::Done), 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn purge_removes_every_task() {
    let (pool, _container) = setup_test_db().await;
    let (tm, _) = manager(PgTaskStore::new(pool), 3);
    tm.enqueue("a", payload("a")).await.unwrap();
    tm.enqueue("b", payload("b")).await.unwrap();
    tm.claim("w1").await.unwrap();

    assert_eq!(tm.purge().await.unwrap(), 2);
    assert_eq!(tm.counts().await.unwrap().total(), 0);
}

#[tokio::test]
async fn rate_limit_state_is_shared_through_the_database() {
    let (pool, _container) = setup_test_db().await;
    let a = PgTaskStore::new(pool.clone());
    let b = PgTaskStore::new(pool);
    let policy = RateLimitPolicy::new(2, Duration::from_secs(60)).unwrap();
    let now = Utc::now();

    assert_eq!(a.reserve("scrape", policy, now).await.unwrap(), Reservation::Granted);
    assert_eq!(b.reserve("scrape", policy, now).await.unwrap(), Reservation::Granted);
    assert!(matches!(
        a.reserve("scrape", policy, now).await.unwrap(),
        Reservation::Wait(_)
    ));
    // Other keys have their own budget.
    assert_eq!(b.reserve("other", policy, now).await.unwrap(), Reservation::Granted);

    assert!(a.load_policy("scrape").await.unwrap().is_none());
    b.save_policy("scrape", policy).await.unwrap();
    assert_eq!(a.load_policy("scrape").await.unwrap(), Some(policy));
}

#[tokio::test]
async fn heartbeats_upsert_by_worker() {
    let (pool, _container) = setup_test_db().await;
    let store = PgTaskStore::new(pool);
    let now = Utc::now();

    let mut hb = WorkerHeartbeat::new("w1", now);
    store.beat(&hb).await.unwrap();
    hb.state = WorkerState::IdleWait;
    hb.tasks_done = 7;
    hb.current_task = Some(id("acme"));
    store.beat(&hb).await.unwrap();
    store.beat(&WorkerHeartbeat::new("w2", now)).await.unwrap();

    let beats = store.heartbeats().await.unwrap();
    assert_eq!(beats.len(), 2);
    assert_eq!(beats[0].worker_id, "w1");
    assert_eq!(beats[0].state, WorkerState::IdleWait);
    assert_eq!(beats[0].tasks_done, 7);
    assert_eq!(beats[0].current_task, Some(id("acme")));
    assert_eq!(beats[1].state, WorkerState::Starting);
}
