//! Business logic: queue/worker/task lifecycle operations and the timeout
//! sweeper. Grounded on the teacher's `TaskService`/`TaskScheduler` shape
//! (`Arc<dyn Store>`-held service struct, async methods returning
//! `AppResult<T>`, a background `tokio::time::interval` loop spawned from a
//! small scheduler type) but generalized to the three-entity, queue-scoped
//! model and the FSM this crate implements.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::clock::Clock;
use crate::config::SecurityConfig;
use crate::domain::{
    Cmd, NewTask, Priority, Queue, QueueId, QueueName, Task, TaskId, TaskStatus, Worker, WorkerId,
    WorkerStatus,
};
use crate::errors::{AppError, AppResult};
use crate::fsm::TaskFsm;
use crate::infrastructure::Store;
use crate::models::{ListParams, TaskQueryFilter};
use crate::sanitizer::{self, KeysMode, RESERVED_FIELDS};
use crate::security;
use crate::utils::logging::{MetricsCollector, StructuredLogger};

/// Sets `root[path] = value`, creating intermediate objects as needed and
/// overwriting a non-object encountered along the way. The dotted-path
/// counterpart to [`sanitizer::flatten`], used to apply a flattened patch
/// back onto a JSON object without clobbering sibling keys.
fn apply_dotted(root: &mut serde_json::Map<String, Value>, path: &str, value: Value) {
    let mut parts = path.split('.').peekable();
    let mut current = root;
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            current.insert(part.to_string(), value);
            return;
        }
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(serde_json::Map::new());
        }
        current = entry.as_object_mut().expect("just forced to Object above");
    }
}

/// Deep-merges a flattened `patch` into `existing` using dotted paths,
/// preserving keys the patch doesn't name. Used for `summary` patching in
/// [`TaskService::report_task_status`] (SPEC_FULL §4.5).
fn merge_flattened(existing: &mut HashMap<String, Value>, patch: &Value) {
    let flat = sanitizer::flatten(patch, "");
    let mut root: serde_json::Map<String, Value> = existing.drain().collect();
    for (path, value) in flat.into_pairs() {
        apply_dotted(&mut root, &path, value);
    }
    *existing = root.into_iter().collect();
}

/// Applies a sanitized, caller-supplied JSON patch onto a `Task` by
/// round-tripping through `serde_json::Value`: flatten the patch to dotted
/// paths, apply them onto the task's own serialization, then deserialize
/// back. This is the "small algebraic type" SPEC_FULL §9 calls for, backed
/// by `serde_json::Value` rather than a bespoke `Set`/`Inc` enum, since every
/// field this service ever patches is already `Serialize`/`Deserialize`.
fn apply_task_patch(task: &Task, patch: &Value) -> AppResult<Task> {
    sanitizer::sanitize_update(patch, RESERVED_FIELDS)?;
    sanitizer::sanitize_dict(patch)?;

    let mut value = serde_json::to_value(task)?;
    let flat = sanitizer::flatten(patch, "");
    if let Value::Object(ref mut root) = value {
        for (path, v) in flat.into_pairs() {
            apply_dotted(root, &path, v);
        }
    }
    serde_json::from_value(value).map_err(AppError::from)
}

// ---------------------------------------------------------------------------
// Queue service
// ---------------------------------------------------------------------------

/// Create/update/delete queues (SPEC_FULL §4.3).
pub struct QueueService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    security: SecurityConfig,
}

impl QueueService {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, security: SecurityConfig) -> Self {
        Self { store, clock, security }
    }

    pub async fn create_queue(
        &self,
        name: &str,
        password: &str,
        metadata: HashMap<String, Value>,
    ) -> AppResult<QueueId> {
        let name = QueueName::new(name)?;
        if self.store.find_queue_by_name(&name).await?.is_some() {
            return Err(AppError::conflict(format!("queue '{name}' already exists")));
        }
        let password_hash = security::hash_password(&self.security, password)?;
        let queue = Queue::new(name, password_hash, metadata, self.clock.now());
        let id = queue.id;
        self.store.insert_queue(&queue).await?;
        Ok(id)
    }

    pub async fn get_queue_by_name(&self, name: &str) -> AppResult<Queue> {
        let name = QueueName::new(name)?;
        self.store
            .find_queue_by_name(&name)
            .await?
            .ok_or_else(|| AppError::not_found(format!("queue '{name}' not found")))
    }

    pub async fn get_queue_by_id(&self, id: QueueId) -> AppResult<Queue> {
        self.store
            .find_queue_by_id(id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("queue {id} not found")))
    }

    /// Verifies `password` against the queue named `name`'s stored hash.
    pub async fn authenticate(&self, name: &str, password: &str) -> AppResult<Queue> {
        let queue = self.get_queue_by_name(name).await?;
        if !security::verify_password(&self.security, password, &queue.password_hash)? {
            return Err(AppError::bad_request(format!("incorrect password for queue '{name}'")));
        }
        Ok(queue)
    }

    /// `new_name`/`new_password` replace; `metadata_update` is a **shallow**
    /// merge into the existing metadata (SPEC_FULL §9 Open Question (b) — the
    /// source discards the merge's return value, this implements the
    /// intended shallow-merge semantics explicitly).
    pub async fn update_queue(
        &self,
        name: &str,
        new_name: Option<String>,
        new_password: Option<String>,
        metadata_update: Option<HashMap<String, Value>>,
    ) -> AppResult<Queue> {
        let mut queue = self.get_queue_by_name(name).await?;

        if let Some(new_name) = new_name {
            queue.name = QueueName::new(new_name)?;
        }
        if let Some(new_password) = new_password {
            queue.password_hash = security::hash_password(&self.security, &new_password)?;
        }
        if let Some(update) = metadata_update {
            for (k, v) in update {
                queue.metadata.insert(k, v);
            }
        }
        queue.last_modified = self.clock.now();
        self.store.update_queue(&queue).await?;
        Ok(queue)
    }

    /// If `cascade`, deletes every task and worker owned by the queue before
    /// removing the queue record itself; otherwise only the queue record is
    /// removed and orphan prevention is the caller's responsibility
    /// (SPEC_FULL §3 Ownership).
    pub async fn delete_queue(&self, name: &str, cascade: bool) -> AppResult<()> {
        let queue = self.get_queue_by_name(name).await?;
        if cascade {
            self.store.delete_tasks_by_queue(queue.id).await?;
            self.store.delete_workers_by_queue(queue.id).await?;
        }
        self.store.delete_queue(queue.id).await
    }
}

// ---------------------------------------------------------------------------
// Worker service
// ---------------------------------------------------------------------------

/// Register and manage workers within a queue (SPEC_FULL §4.4).
pub struct WorkerService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl WorkerService {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn create_worker(
        &self,
        queue: &Queue,
        worker_name: Option<String>,
        metadata: HashMap<String, Value>,
        max_retries: i64,
    ) -> AppResult<WorkerId> {
        let worker = Worker::new(queue.id, worker_name, metadata, max_retries, self.clock.now())?;
        let id = worker.id;
        self.store.insert_worker(&worker).await?;
        Ok(id)
    }

    pub async fn get_worker(&self, queue_id: QueueId, worker_id: WorkerId) -> AppResult<Worker> {
        self.store
            .find_worker(queue_id, worker_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("worker {worker_id} not found")))
    }

    pub async fn list_workers(&self, queue_id: QueueId, params: ListParams) -> AppResult<Vec<Worker>> {
        self.store.list_workers(queue_id, params).await
    }

    pub async fn set_worker_status(
        &self,
        queue_id: QueueId,
        worker_id: WorkerId,
        status: WorkerStatus,
    ) -> AppResult<Worker> {
        let mut worker = self.get_worker(queue_id, worker_id).await?;
        worker.status = status;
        worker.last_modified = self.clock.now();
        self.store.update_worker(&worker).await?;
        Ok(worker)
    }

    /// Deletes the worker; if `cascade_update`, nulls `worker_id` on every
    /// task currently bound to it. Deliberately does **not** transition those
    /// tasks' states — a `RUNNING` task whose worker vanished stays `RUNNING`
    /// until the sweeper reclaims it on the next heartbeat timeout
    /// (SPEC_FULL §9 "Cascade semantics on worker delete").
    pub async fn delete_worker(&self, queue_id: QueueId, worker_id: WorkerId, cascade_update: bool) -> AppResult<()> {
        self.get_worker(queue_id, worker_id).await?;
        if cascade_update {
            self.store
                .unassign_worker_from_tasks(queue_id, worker_id, self.clock.now())
                .await?;
        }
        self.store.delete_worker(queue_id, worker_id).await
    }
}

// ---------------------------------------------------------------------------
// Task service
// ---------------------------------------------------------------------------

/// The outcome reported through `ReportTaskStatus` (SPEC_FULL §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStatus {
    Success,
    Failed,
    Cancelled,
}

/// Parameters accepted by `FetchTask`.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub worker_id: Option<WorkerId>,
    pub eta_max: Option<i64>,
    pub extra_filter: Option<Value>,
}

pub struct TaskService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    fetch_candidate_limit: i64,
    logger: Option<StructuredLogger>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl TaskService {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, fetch_candidate_limit: i64) -> Self {
        Self { store, clock, fetch_candidate_limit, logger: None, metrics: None }
    }

    pub fn with_observability(mut self, logger: StructuredLogger, metrics: Arc<MetricsCollector>) -> Self {
        self.logger = Some(logger);
        self.metrics = Some(metrics);
        self
    }

    pub async fn submit_task(&self, queue: &Queue, spec: NewTask) -> AppResult<TaskId> {
        let task = Task::new(queue.id, spec, self.clock.now())?;
        let id = task.id;
        self.store.insert_task(&task).await?;
        if let Some(logger) = &self.logger {
            logger.log_task_submitted(queue.name.as_str(), &id.to_string(), task.priority.value(), &task.status.to_string());
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_task_submitted(queue.name.as_str());
        }
        Ok(id)
    }

    pub async fn get_task(&self, queue_id: QueueId, task_id: TaskId) -> AppResult<Task> {
        self.store
            .find_task(queue_id, task_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("task {task_id} not found")))
    }

    pub async fn list_tasks(&self, queue_id: QueueId, filter: &TaskQueryFilter, params: ListParams) -> AppResult<Vec<Task>> {
        self.store.list_tasks(queue_id, filter, params).await
    }

    /// Atomically claims the highest-priority, oldest-eligible `PENDING`
    /// task and transitions it to `RUNNING`. Returns `Ok(None)` when nothing
    /// matches — this is not an error (SPEC_FULL §8 boundary behavior).
    pub async fn fetch_task(&self, queue: &Queue, worker: Option<&Worker>, options: FetchOptions) -> AppResult<Option<Task>> {
        let started = std::time::Instant::now();

        if let (Some(requested), Some(worker)) = (options.worker_id, worker) {
            if requested != worker.id {
                return Err(AppError::bad_request("worker_id does not match the resolved worker"));
            }
            if !worker.is_active() {
                return Err(AppError::invalid_transition(format!(
                    "worker {} is {:?}, not active",
                    worker.id, worker.status
                )));
            }
        } else if options.worker_id.is_some() && worker.is_none() {
            return Err(AppError::not_found("worker not found in this queue"));
        }

        let now = self.clock.now();
        let mut task = self
            .store
            .claim_next_task(queue.id, options.worker_id, options.extra_filter.as_ref(), now, self.fetch_candidate_limit)
            .await?;

        if let Some(eta_max) = options.eta_max {
            if let Some(t) = task.as_mut() {
                t.task_timeout = Some(eta_max);
                self.store.save_task(t).await?;
            }
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if let Some(logger) = &self.logger {
            logger.log_task_fetched(
                queue.name.as_str(),
                task.as_ref().map(|t| t.id.to_string()).as_deref(),
                options.worker_id.map(|w| w.to_string()).as_deref(),
                elapsed_ms,
            );
        }
        if task.is_some() {
            if let Some(metrics) = &self.metrics {
                metrics.record_task_fetched(queue.name.as_str());
            }
        }

        Ok(task)
    }

    /// Applies `status` to the task's FSM and persists the result. `summary`
    /// is deep-merged into the task's existing summary via dotted paths
    /// (SPEC_FULL §4.5) rather than replacing it wholesale.
    pub async fn report_task_status(
        &self,
        queue: &Queue,
        task_id: TaskId,
        status: ReportStatus,
        summary: Option<Value>,
    ) -> AppResult<Task> {
        let mut task = self.get_task(queue.id, task_id).await?;
        let fsm = TaskFsm::new(task.status, task.retries, task.max_retries);
        let from = task.status;

        let transitioned = match status {
            ReportStatus::Success => fsm.complete()?,
            ReportStatus::Failed => fsm.fail()?,
            ReportStatus::Cancelled => fsm.cancel()?,
        };

        let now = self.clock.now();
        task.apply_transition(transitioned, None, now);
        if let Some(summary) = summary {
            merge_flattened(&mut task.summary, &summary);
        }
        self.store.save_task(&task).await?;

        if let Some(logger) = &self.logger {
            let event = match status {
                ReportStatus::Success => "complete",
                ReportStatus::Failed => "fail",
                ReportStatus::Cancelled => "cancel",
            };
            logger.log_task_transitioned(queue.name.as_str(), &task_id.to_string(), &from.to_string(), &task.status.to_string(), event);
        }
        if let Some(metrics) = &self.metrics {
            match status {
                ReportStatus::Success => metrics.record_task_completed(queue.name.as_str()),
                ReportStatus::Failed => metrics.record_task_failed(queue.name.as_str()),
                ReportStatus::Cancelled => metrics.record_task_cancelled(queue.name.as_str()),
            }
        }

        Ok(task)
    }

    /// Administrative: forces the task back to `PENDING`/`retries=0`
    /// regardless of current state, after applying a sanitized patch of
    /// task settings. Used to manually restart tasks stuck past
    /// `max_retries` (SPEC_FULL §4.5).
    pub async fn reset_task_to_pending(&self, queue: &Queue, task_id: TaskId, task_setting_update: Option<Value>) -> AppResult<Task> {
        let mut task = self.get_task(queue.id, task_id).await?;
        let from = task.status;

        if let Some(update) = task_setting_update {
            task = apply_task_patch(&task, &update)?;
        }

        let fsm = TaskFsm::new(task.status, task.retries, task.max_retries);
        let transitioned = fsm.reset();
        let now = self.clock.now();
        task.apply_transition(transitioned, None, now);
        self.store.save_task(&task).await?;

        if let Some(logger) = &self.logger {
            logger.log_task_transitioned(queue.name.as_str(), &task_id.to_string(), &from.to_string(), &task.status.to_string(), "reset");
        }
        Ok(task)
    }

    /// Unconditional cancel: succeeds from any state, including terminal
    /// ones, bypassing the FSM entirely (SPEC_FULL §4.5 "permissive by
    /// design").
    pub async fn cancel_task(&self, queue: &Queue, task_id: TaskId) -> AppResult<Task> {
        let mut task = self.get_task(queue.id, task_id).await?;
        task.force_cancel(self.clock.now());
        self.store.save_task(&task).await?;
        if let Some(metrics) = &self.metrics {
            metrics.record_task_cancelled(queue.name.as_str());
        }
        Ok(task)
    }

    /// The administrative "query" operation (SPEC_FULL §9): a raw filter,
    /// scoped to `queue` by the sanitizer and matched against `args` via
    /// `arg_match` when `filter` carries an object value. Retained behind the
    /// sanitizer per SPEC_FULL §9's explicit caution against these two
    /// "too versatile" operations.
    pub async fn query(&self, queue: &Queue, filter: Value) -> AppResult<Vec<Task>> {
        sanitizer::sanitize_query(queue.id, &filter)?;
        sanitizer::sanitize_dict(&filter)?;
        let query_filter = TaskQueryFilter { extra_filter: Some(filter), ..Default::default() };
        self.store.list_tasks(queue.id, &query_filter, ListParams::default()).await
    }

    /// The administrative "update" operation (SPEC_FULL §9): a sanitized,
    /// flattened patch applied directly to one task's document.
    pub async fn update(&self, queue: &Queue, task_id: TaskId, update: Value) -> AppResult<Task> {
        let task = self.get_task(queue.id, task_id).await?;
        let mut patched = apply_task_patch(&task, &update)?;
        patched.last_modified = self.clock.now();
        self.store.save_task(&patched).await?;
        Ok(patched)
    }
}

/// Builds a `{keys: null-tree}` selector via [`sanitizer::keys_to_query_dict`]
/// suitable for use as `FetchOptions::extra_filter`, matching the source's
/// `keys_to_query_dict`/`arg_match` combination for selective task claims.
pub fn keys_filter(keys: &[String], mode: KeysMode) -> AppResult<Value> {
    sanitizer::keys_to_query_dict(keys, mode).map_err(AppError::from)
}

// ---------------------------------------------------------------------------
// Timeout sweeper
// ---------------------------------------------------------------------------

/// Periodic reclamation of `RUNNING` tasks whose heartbeat or wall-time
/// budget expired (SPEC_FULL §4.6). Runs independently of request handlers,
/// driving the same FSM and store paths.
pub struct TimeoutSweeper {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    logger: Option<StructuredLogger>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl TimeoutSweeper {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock, logger: None, metrics: None }
    }

    pub fn with_observability(mut self, logger: StructuredLogger, metrics: Arc<MetricsCollector>) -> Self {
        self.logger = Some(logger);
        self.metrics = Some(metrics);
        self
    }

    /// Runs one sweep and returns the ids of every task it transitioned.
    /// Errors on individual tasks are logged and do not abort the sweep
    /// (SPEC_FULL §4.6).
    pub async fn sweep_once(&self) -> AppResult<Vec<TaskId>> {
        let started = std::time::Instant::now();
        let now = self.clock.now();
        let running = self.store.list_running_tasks().await?;

        let mut transitioned = Vec::new();
        let mut failures = 0usize;

        for mut task in running {
            if !task.is_timed_out(now) {
                continue;
            }

            let fsm = TaskFsm::new(task.status, task.retries, task.max_retries);
            let result = match fsm.fail() {
                Ok(result) => result,
                Err(err) => {
                    failures += 1;
                    if let Some(logger) = &self.logger {
                        logger.log_error("sweeper_invalid_transition", &err.to_string(), Some(&task.id.to_string()));
                    }
                    continue;
                }
            };

            task.apply_transition(result, None, now);
            task.summary.insert(
                "labtasker_error".to_string(),
                Value::String("Either heartbeat or task execution timed out".to_string()),
            );

            match self.store.save_task(&task).await {
                Ok(()) => transitioned.push(task.id),
                Err(err) => {
                    failures += 1;
                    if let Some(logger) = &self.logger {
                        logger.log_error("sweeper_save_failed", &err.to_string(), Some(&task.id.to_string()));
                    }
                }
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        if let Some(logger) = &self.logger {
            logger.log_sweep_completed(transitioned.len(), failures, duration_ms);
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_sweep(transitioned.len(), started.elapsed().as_secs_f64());
        }

        Ok(transitioned)
    }

    /// Spawns the sweeper on a fixed interval, matching the teacher's
    /// `TaskScheduler::start` shape (a detached `tokio::spawn` loop that logs
    /// and continues on error rather than propagating it).
    pub fn start(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = self.sweep_once().await {
                    if let Some(logger) = &self.logger {
                        logger.log_error("sweeper_tick_failed", &err.to_string(), None);
                    } else {
                        tracing::error!("timeout sweeper tick failed: {err}");
                    }
                }
            }
        })
    }
}

/// Accepts an argv-or-single-string `cmd` payload from a request DTO and
/// turns it into the domain [`Cmd`], matching `NewTask::cmd`'s shape.
pub fn cmd_from_value(value: Option<Value>) -> AppResult<Option<Cmd>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(Cmd::Single(s))),
        Some(Value::Array(items)) => {
            let argv = items
                .into_iter()
                .map(|v| match v {
                    Value::String(s) => Ok(s),
                    other => Err(AppError::bad_request(format!("cmd entries must be strings, got {other}"))),
                })
                .collect::<AppResult<Vec<_>>>()?;
            Ok(Some(Cmd::Argv(argv)))
        }
        Some(other) => Err(AppError::bad_request(format!("cmd must be a string or list of strings, got {other}"))),
    }
}

/// Default `max_retries`/`priority`/`heartbeat_timeout` applied to a new task
/// when the caller omits them, sourced from `TaskConfig` (SPEC_FULL §6's
/// documented convention: low=0, medium=10, high=20; this crate's default is
/// `Priority::MEDIUM` unless a queue-level override is configured).
pub fn default_priority() -> Priority {
    Priority::MEDIUM
}
