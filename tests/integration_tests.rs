use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use serde_json::json;

use labtasker_queue::clock::mock::MockClock;
use labtasker_queue::config::{DatabaseConfig, SecurityConfig};
use labtasker_queue::domain::{Cmd, NewTask, Priority, WorkerStatus};
use labtasker_queue::errors::AppError;
use labtasker_queue::infrastructure::SqliteStore;
use labtasker_queue::models::ListParams;
use labtasker_queue::services::{FetchOptions, QueueService, ReportStatus, TaskService, TimeoutSweeper, WorkerService};

async fn new_store() -> Arc<SqliteStore> {
    let file = tempfile::NamedTempFile::new().expect("create temp db file");
    let url = format!("sqlite://{}", file.path().display());
    // keep the backing file alive for the test; the OS reclaims it on exit.
    std::mem::forget(file);
    let config = DatabaseConfig { url, ..Default::default() };
    Arc::new(SqliteStore::new(&config).await.expect("open sqlite store"))
}

fn new_task(priority: Priority) -> NewTask {
    NewTask {
        task_name: Some("demo".to_string()),
        args: json!({}),
        metadata: HashMap::new(),
        cmd: None,
        heartbeat_timeout: Some(60),
        task_timeout: None,
        max_retries: 3,
        priority,
    }
}

#[tokio::test]
async fn queue_and_task_lifecycle_round_trips() {
    let store = new_store().await;
    let clock = Arc::new(MockClock::new(chrono::Utc::now()));
    let queues = QueueService::new(store.clone(), clock.clone(), SecurityConfig::default());
    let tasks = TaskService::new(store.clone(), clock.clone(), 50);

    let queue_id = queues.create_queue("exp-1", "hunter2", HashMap::new()).await.unwrap();
    let queue = queues.get_queue_by_id(queue_id).await.unwrap();

    let task_id = tasks.submit_task(&queue, new_task(Priority::MEDIUM)).await.unwrap();
    let fetched = tasks
        .fetch_task(&queue, None, FetchOptions::default())
        .await
        .unwrap()
        .expect("one pending task should be claimable");
    assert_eq!(fetched.id, task_id);

    let completed = tasks
        .report_task_status(&queue, task_id, ReportStatus::Success, Some(json!({"result": {"accuracy": 0.9}})))
        .await
        .unwrap();
    assert_eq!(completed.status.to_string(), "success");
    assert_eq!(completed.summary.get("result").unwrap()["accuracy"], json!(0.9));

    assert!(queues.authenticate("exp-1", "wrong-password").await.is_err());
    assert!(queues.authenticate("exp-1", "hunter2").await.is_ok());
}

#[tokio::test]
async fn queue_rename_persists_to_the_store() {
    let store = new_store().await;
    let clock = Arc::new(MockClock::new(chrono::Utc::now()));
    let queues = QueueService::new(store.clone(), clock.clone(), SecurityConfig::default());

    queues.create_queue("exp-old", "hunter2", HashMap::new()).await.unwrap();
    queues
        .update_queue("exp-old", Some("exp-new".to_string()), None, None)
        .await
        .unwrap();

    assert!(queues.get_queue_by_name("exp-old").await.is_err(), "old name should no longer resolve");
    let renamed = queues.get_queue_by_name("exp-new").await.unwrap();
    assert_eq!(renamed.name.as_str(), "exp-new");
}

#[tokio::test]
async fn fetch_orders_candidates_by_priority_then_age() {
    let store = new_store().await;
    let clock = Arc::new(MockClock::new(chrono::Utc::now()));
    let queues = QueueService::new(store.clone(), clock.clone(), SecurityConfig::default());
    let tasks = TaskService::new(store.clone(), clock.clone(), 50);

    let queue_id = queues.create_queue("prio", "pw", HashMap::new()).await.unwrap();
    let queue = queues.get_queue_by_id(queue_id).await.unwrap();

    let low = tasks.submit_task(&queue, new_task(Priority::LOW)).await.unwrap();
    clock.advance(ChronoDuration::seconds(1));
    let high_older = tasks.submit_task(&queue, new_task(Priority::HIGH)).await.unwrap();
    clock.advance(ChronoDuration::seconds(1));
    let _high_newer = tasks.submit_task(&queue, new_task(Priority::HIGH)).await.unwrap();

    let first = tasks.fetch_task(&queue, None, FetchOptions::default()).await.unwrap().unwrap();
    assert_eq!(first.id, high_older, "older high-priority task should be claimed before the newer one");
    assert_ne!(first.id, low);
}

#[tokio::test]
async fn sweeper_retries_then_fails_a_heartbeat_timed_out_task() {
    let store = new_store().await;
    let clock = Arc::new(MockClock::new(chrono::Utc::now()));
    let queues = QueueService::new(store.clone(), clock.clone(), SecurityConfig::default());
    let tasks = TaskService::new(store.clone(), clock.clone(), 50);
    let sweeper = TimeoutSweeper::new(store.clone(), clock.clone());

    let queue_id = queues.create_queue("sweep", "pw", HashMap::new()).await.unwrap();
    let queue = queues.get_queue_by_id(queue_id).await.unwrap();

    let mut spec = new_task(Priority::MEDIUM);
    spec.heartbeat_timeout = Some(5);
    spec.max_retries = 1;
    let task_id = tasks.submit_task(&queue, spec).await.unwrap();
    tasks.fetch_task(&queue, None, FetchOptions::default()).await.unwrap().unwrap();

    clock.advance(ChronoDuration::seconds(6));
    let swept = sweeper.sweep_once().await.unwrap();
    assert_eq!(swept, vec![task_id]);
    let retried = tasks.get_task(queue.id, task_id).await.unwrap();
    assert_eq!(retried.status.to_string(), "pending", "one retry remains, task should return to pending");

    tasks.fetch_task(&queue, None, FetchOptions::default()).await.unwrap().unwrap();
    clock.advance(ChronoDuration::seconds(6));
    let swept_again = sweeper.sweep_once().await.unwrap();
    assert_eq!(swept_again, vec![task_id]);
    let failed = tasks.get_task(queue.id, task_id).await.unwrap();
    assert_eq!(failed.status.to_string(), "failed", "retries exhausted, task should be terminally failed");
}

#[tokio::test]
async fn cancel_is_permissive_from_any_state_but_report_after_terminal_is_rejected() {
    let store = new_store().await;
    let clock = Arc::new(MockClock::new(chrono::Utc::now()));
    let queues = QueueService::new(store.clone(), clock.clone(), SecurityConfig::default());
    let tasks = TaskService::new(store.clone(), clock.clone(), 50);

    let queue_id = queues.create_queue("cancel", "pw", HashMap::new()).await.unwrap();
    let queue = queues.get_queue_by_id(queue_id).await.unwrap();

    let task_id = tasks.submit_task(&queue, new_task(Priority::MEDIUM)).await.unwrap();
    tasks.fetch_task(&queue, None, FetchOptions::default()).await.unwrap().unwrap();
    tasks.report_task_status(&queue, task_id, ReportStatus::Success, None).await.unwrap();

    let cancelled = tasks.cancel_task(&queue, task_id).await.unwrap();
    assert_eq!(cancelled.status.to_string(), "cancelled");

    let err = tasks.report_task_status(&queue, task_id, ReportStatus::Success, None).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition(_)));
}

#[tokio::test]
async fn suspended_worker_cannot_fetch_and_cascade_delete_unbinds_its_task() {
    let store = new_store().await;
    let clock = Arc::new(MockClock::new(chrono::Utc::now()));
    let queues = QueueService::new(store.clone(), clock.clone(), SecurityConfig::default());
    let workers = WorkerService::new(store.clone(), clock.clone());
    let tasks = TaskService::new(store.clone(), clock.clone(), 50);

    let queue_id = queues.create_queue("workers", "pw", HashMap::new()).await.unwrap();
    let queue = queues.get_queue_by_id(queue_id).await.unwrap();

    let worker_id = workers.create_worker(&queue, Some("w1".to_string()), HashMap::new(), 3).await.unwrap();
    workers.set_worker_status(queue.id, worker_id, WorkerStatus::Suspended).await.unwrap();
    let worker = workers.get_worker(queue.id, worker_id).await.unwrap();

    tasks.submit_task(&queue, new_task(Priority::MEDIUM)).await.unwrap();
    let opts = FetchOptions { worker_id: Some(worker_id), ..Default::default() };
    let err = tasks.fetch_task(&queue, Some(&worker), opts).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition(_)));

    workers.set_worker_status(queue.id, worker_id, WorkerStatus::Active).await.unwrap();
    let worker = workers.get_worker(queue.id, worker_id).await.unwrap();
    let opts = FetchOptions { worker_id: Some(worker_id), ..Default::default() };
    let claimed = tasks.fetch_task(&queue, Some(&worker), opts).await.unwrap().unwrap();
    assert_eq!(claimed.worker_id, Some(worker_id));

    workers.delete_worker(queue.id, worker_id, true).await.unwrap();
    let unbound = tasks.get_task(queue.id, claimed.id).await.unwrap();
    assert_eq!(unbound.worker_id, None);
    assert_eq!(unbound.status.to_string(), "running", "cascade delete unbinds the worker but leaves the task running");
}

#[tokio::test]
async fn query_matches_tasks_via_structural_arg_match() {
    let store = new_store().await;
    let clock = Arc::new(MockClock::new(chrono::Utc::now()));
    let queues = QueueService::new(store.clone(), clock.clone(), SecurityConfig::default());
    let tasks = TaskService::new(store.clone(), clock.clone(), 50);

    let queue_id = queues.create_queue("query", "pw", HashMap::new()).await.unwrap();
    let queue = queues.get_queue_by_id(queue_id).await.unwrap();

    let mut matching = new_task(Priority::MEDIUM);
    matching.args = json!({"dataset": "cifar10", "epochs": 5});
    matching.cmd = Some(Cmd::Single("train.sh".to_string()));
    tasks.submit_task(&queue, matching).await.unwrap();

    let mut other = new_task(Priority::MEDIUM);
    other.args = json!({"dataset": "mnist"});
    tasks.submit_task(&queue, other).await.unwrap();

    let found = tasks
        .query(&queue, json!({"dataset": "cifar10", "epochs": 5}))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].args.get("dataset").unwrap(), &json!("cifar10"));

    let all = tasks.list_tasks(queue.id, &Default::default(), ListParams::default()).await.unwrap();
    assert_eq!(all.len(), 2);
}
