//! HTTP surface: one handler per route, each deserializing a DTO, calling
//! exactly one service method, and mapping the result to a response. Routes
//! are scoped under `/queues/:name`; queue-scoped writes require the queue's
//! password in the `X-Queue-Password` header (this service's only auth
//! surface, per `security`).

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, patch, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{Cmd, NewTask, Priority, Queue, QueueId, TaskId, TaskStatus, WorkerId, WorkerStatus};
use crate::errors::{AppError, AppResult, ApiResponse};
use crate::models::{ListParams, TaskQueryFilter};
use crate::sanitizer::KeysMode;
use crate::services::{cmd_from_value, FetchOptions, QueueService, ReportStatus, TaskService, TimeoutSweeper, WorkerService};
use crate::utils::logging::{HealthChecker, MetricsCollector, StructuredLogger};

#[derive(Clone)]
pub struct AppState {
    pub queues: Arc<QueueService>,
    pub workers: Arc<WorkerService>,
    pub tasks: Arc<TaskService>,
    pub health: Arc<HealthChecker>,
    pub metrics: Arc<MetricsCollector>,
    pub logger: StructuredLogger,
}

fn queue_password(headers: &HeaderMap) -> AppResult<&str> {
    headers
        .get("x-queue-password")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::bad_request("missing X-Queue-Password header"))
}

async fn authenticated_queue(state: &AppState, name: &str, headers: &HeaderMap) -> AppResult<Queue> {
    let password = queue_password(headers)?;
    state.queues.authenticate(name, password).await
}

// ---------------------------------------------------------------------------
// Queues
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateQueueRequest {
    pub name: String,
    pub password: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

#[derive(Debug, Serialize)]
pub struct CreateQueueResponse {
    pub queue_id: String,
}

pub async fn create_queue(State(state): State<AppState>, Json(req): Json<CreateQueueRequest>) -> AppResult<impl IntoResponse> {
    let id = state.queues.create_queue(&req.name, &req.password, req.metadata).await?;
    state.logger.log_info("queue created", Some(&req.name));
    Ok((StatusCode::CREATED, Json(ApiResponse::success(CreateQueueResponse { queue_id: id.to_string() }))))
}

#[derive(Debug, Serialize)]
pub struct QueueResponse {
    pub id: String,
    pub name: String,
    pub metadata: HashMap<String, Value>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_modified: chrono::DateTime<chrono::Utc>,
}

impl From<Queue> for QueueResponse {
    fn from(q: Queue) -> Self {
        Self {
            id: q.id.to_string(),
            name: q.name.as_str().to_string(),
            metadata: q.metadata,
            created_at: q.created_at,
            last_modified: q.last_modified,
        }
    }
}

pub async fn get_queue(State(state): State<AppState>, Path(name): Path<String>, headers: HeaderMap) -> AppResult<impl IntoResponse> {
    let queue = authenticated_queue(&state, &name, &headers).await?;
    Ok(Json(ApiResponse::success(QueueResponse::from(queue))))
}

#[derive(Debug, Deserialize)]
pub struct UpdateQueueRequest {
    pub new_name: Option<String>,
    pub new_password: Option<String>,
    pub metadata_update: Option<HashMap<String, Value>>,
}

pub async fn update_queue(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(req): Json<UpdateQueueRequest>,
) -> AppResult<impl IntoResponse> {
    authenticated_queue(&state, &name, &headers).await?;
    let queue = state
        .queues
        .update_queue(&name, req.new_name, req.new_password, req.metadata_update)
        .await?;
    Ok(Json(ApiResponse::success(QueueResponse::from(queue))))
}

#[derive(Debug, Deserialize, Default)]
pub struct DeleteQueueQuery {
    #[serde(default)]
    pub cascade: bool,
}

pub async fn delete_queue(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Query(query): Query<DeleteQueueQuery>,
) -> AppResult<impl IntoResponse> {
    authenticated_queue(&state, &name, &headers).await?;
    state.queues.delete_queue(&name, query.cascade).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateWorkerRequest {
    pub worker_name: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default = "default_worker_max_retries")]
    pub max_retries: i64,
}

fn default_worker_max_retries() -> i64 {
    3
}

#[derive(Debug, Serialize)]
pub struct CreateWorkerResponse {
    pub worker_id: String,
}

pub async fn create_worker(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CreateWorkerRequest>,
) -> AppResult<impl IntoResponse> {
    let queue = authenticated_queue(&state, &name, &headers).await?;
    let id = state.workers.create_worker(&queue, req.worker_name, req.metadata, req.max_retries).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(CreateWorkerResponse { worker_id: id.to_string() }))))
}

#[derive(Debug, Serialize)]
pub struct WorkerResponse {
    pub id: String,
    pub status: String,
    pub worker_name: Option<String>,
    pub metadata: HashMap<String, Value>,
    pub retries: i64,
    pub max_retries: i64,
}

impl From<crate::domain::Worker> for WorkerResponse {
    fn from(w: crate::domain::Worker) -> Self {
        Self {
            id: w.id.to_string(),
            status: w.status.to_string(),
            worker_name: w.worker_name,
            metadata: w.metadata,
            retries: w.retries,
            max_retries: w.max_retries,
        }
    }
}

pub async fn get_worker(
    State(state): State<AppState>,
    Path((name, worker_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    let queue = authenticated_queue(&state, &name, &headers).await?;
    let worker_id: WorkerId = worker_id.parse().map_err(|_| AppError::bad_request("invalid worker id"))?;
    let worker = state.workers.get_worker(queue.id, worker_id).await?;
    Ok(Json(ApiResponse::success(WorkerResponse::from(worker))))
}

#[derive(Debug, Deserialize, Default)]
pub struct ListWorkersQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_workers(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Query(query): Query<ListWorkersQuery>,
) -> AppResult<impl IntoResponse> {
    let queue = authenticated_queue(&state, &name, &headers).await?;
    let params = ListParams { limit: query.limit.unwrap_or(100), offset: query.offset.unwrap_or(0) };
    let workers = state.workers.list_workers(queue.id, params).await?;
    let workers: Vec<WorkerResponse> = workers.into_iter().map(WorkerResponse::from).collect();
    Ok(Json(ApiResponse::success(workers)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateWorkerStatusRequest {
    pub status: String,
}

pub async fn set_worker_status(
    State(state): State<AppState>,
    Path((name, worker_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(req): Json<UpdateWorkerStatusRequest>,
) -> AppResult<impl IntoResponse> {
    let queue = authenticated_queue(&state, &name, &headers).await?;
    let worker_id: WorkerId = worker_id.parse().map_err(|_| AppError::bad_request("invalid worker id"))?;
    let status = WorkerStatus::parse(&req.status).map_err(AppError::from)?;
    let worker = state.workers.set_worker_status(queue.id, worker_id, status).await?;
    Ok(Json(ApiResponse::success(WorkerResponse::from(worker))))
}

#[derive(Debug, Deserialize, Default)]
pub struct DeleteWorkerQuery {
    #[serde(default = "default_true")]
    pub cascade_update: bool,
}

fn default_true() -> bool {
    true
}

pub async fn delete_worker(
    State(state): State<AppState>,
    Path((name, worker_id)): Path<(String, String)>,
    headers: HeaderMap,
    Query(query): Query<DeleteWorkerQuery>,
) -> AppResult<impl IntoResponse> {
    let queue = authenticated_queue(&state, &name, &headers).await?;
    let worker_id: WorkerId = worker_id.parse().map_err(|_| AppError::bad_request("invalid worker id"))?;
    state.workers.delete_worker(queue.id, worker_id, query.cascade_update).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitTaskRequest {
    pub task_name: Option<String>,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub cmd: Option<Value>,
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout: Option<i64>,
    pub task_timeout: Option<i64>,
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,
    #[serde(default = "default_priority_value")]
    pub priority: i64,
}

fn default_heartbeat_timeout() -> Option<i64> {
    Some(60)
}

fn default_max_retries() -> i64 {
    3
}

fn default_priority_value() -> i64 {
    Priority::MEDIUM.value()
}

#[derive(Debug, Serialize)]
pub struct SubmitTaskResponse {
    pub task_id: String,
}

pub async fn submit_task(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(req): Json<SubmitTaskRequest>,
) -> AppResult<impl IntoResponse> {
    let queue = authenticated_queue(&state, &name, &headers).await?;
    let cmd: Option<Cmd> = cmd_from_value(req.cmd)?;
    let spec = NewTask {
        task_name: req.task_name,
        args: req.args,
        metadata: req.metadata,
        cmd,
        heartbeat_timeout: req.heartbeat_timeout,
        task_timeout: req.task_timeout,
        max_retries: req.max_retries,
        priority: Priority::from(req.priority),
    };
    let id = state.tasks.submit_task(&queue, spec).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(SubmitTaskResponse { task_id: id.to_string() }))))
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub id: String,
    pub status: String,
    pub task_name: Option<String>,
    pub args: HashMap<String, Value>,
    pub metadata: HashMap<String, Value>,
    pub cmd: Option<Cmd>,
    pub priority: i64,
    pub max_retries: i64,
    pub retries: i64,
    pub heartbeat_timeout: Option<i64>,
    pub task_timeout: Option<i64>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub start_time: Option<chrono::DateTime<chrono::Utc>>,
    pub last_heartbeat: Option<chrono::DateTime<chrono::Utc>>,
    pub last_modified: chrono::DateTime<chrono::Utc>,
    pub worker_id: Option<String>,
    pub summary: HashMap<String, Value>,
}

impl From<crate::domain::Task> for TaskResponse {
    fn from(t: crate::domain::Task) -> Self {
        Self {
            id: t.id.to_string(),
            status: t.status.to_string(),
            task_name: t.task_name,
            args: t.args,
            metadata: t.metadata,
            cmd: t.cmd,
            priority: t.priority.value(),
            max_retries: t.max_retries,
            retries: t.retries,
            heartbeat_timeout: t.heartbeat_timeout,
            task_timeout: t.task_timeout,
            created_at: t.created_at,
            start_time: t.start_time,
            last_heartbeat: t.last_heartbeat,
            last_modified: t.last_modified,
            worker_id: t.worker_id.map(|w| w.to_string()),
            summary: t.summary,
        }
    }
}

pub async fn get_task(
    State(state): State<AppState>,
    Path((name, task_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    let queue = authenticated_queue(&state, &name, &headers).await?;
    let task_id: TaskId = task_id.parse().map_err(|_| AppError::bad_request("invalid task id"))?;
    let task = state.tasks.get_task(queue.id, task_id).await?;
    Ok(Json(ApiResponse::success(TaskResponse::from(task))))
}

#[derive(Debug, Deserialize, Default)]
pub struct ListTasksQuery {
    pub status: Option<String>,
    pub task_name: Option<String>,
    pub extra_filter: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Query(query): Query<ListTasksQuery>,
) -> AppResult<impl IntoResponse> {
    let queue = authenticated_queue(&state, &name, &headers).await?;
    let status = query.status.as_deref().map(TaskStatus::parse).transpose().map_err(AppError::from)?;
    let extra_filter = query
        .extra_filter
        .as_deref()
        .map(serde_json::from_str::<Value>)
        .transpose()
        .map_err(|_| AppError::bad_request("extra_filter must be valid JSON"))?;
    let filter = TaskQueryFilter { status, task_name: query.task_name, extra_filter };
    let params = ListParams { limit: query.limit.unwrap_or(100), offset: query.offset.unwrap_or(0) };
    let tasks = state.tasks.list_tasks(queue.id, &filter, params).await?;
    let tasks: Vec<TaskResponse> = tasks.into_iter().map(TaskResponse::from).collect();
    Ok(Json(ApiResponse::success(tasks)))
}

#[derive(Debug, Deserialize, Default)]
pub struct FetchTaskQuery {
    pub worker_id: Option<String>,
    pub eta_max: Option<i64>,
    pub extra_filter: Option<String>,
    /// Comma-separated dotted key paths; mutually exclusive with `extra_filter`,
    /// built into a null-tree selector via `keys_to_query_dict` (SPEC_FULL §9).
    pub required_fields: Option<String>,
    #[serde(default)]
    pub keys_mode_deepest: bool,
}

pub async fn fetch_task(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Query(query): Query<FetchTaskQuery>,
) -> AppResult<impl IntoResponse> {
    let queue = authenticated_queue(&state, &name, &headers).await?;

    let worker_id = query
        .worker_id
        .as_deref()
        .map(|s| s.parse::<WorkerId>())
        .transpose()
        .map_err(|_| AppError::bad_request("invalid worker id"))?;

    let worker = match worker_id {
        Some(id) => Some(state.workers.get_worker(queue.id, id).await?),
        None => None,
    };

    let extra_filter = if let Some(raw) = &query.extra_filter {
        Some(serde_json::from_str::<Value>(raw).map_err(|_| AppError::bad_request("extra_filter must be valid JSON"))?)
    } else if let Some(raw) = &query.required_fields {
        let keys: Vec<String> = raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        let mode = if query.keys_mode_deepest { KeysMode::Deepest } else { KeysMode::Topmost };
        Some(crate::services::keys_filter(&keys, mode)?)
    } else {
        None
    };

    let options = FetchOptions { worker_id, eta_max: query.eta_max, extra_filter };
    let task = state.tasks.fetch_task(&queue, worker.as_ref(), options).await?;
    Ok(Json(ApiResponse::success(task.map(TaskResponse::from))))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    Success,
    Failed,
    Cancelled,
}

impl From<ReportedStatus> for ReportStatus {
    fn from(s: ReportedStatus) -> Self {
        match s {
            ReportedStatus::Success => ReportStatus::Success,
            ReportedStatus::Failed => ReportStatus::Failed,
            ReportedStatus::Cancelled => ReportStatus::Cancelled,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ReportTaskStatusRequest {
    pub status: ReportedStatus,
    pub summary: Option<Value>,
}

pub async fn report_task_status(
    State(state): State<AppState>,
    Path((name, task_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(req): Json<ReportTaskStatusRequest>,
) -> AppResult<impl IntoResponse> {
    let queue = authenticated_queue(&state, &name, &headers).await?;
    let task_id: TaskId = task_id.parse().map_err(|_| AppError::bad_request("invalid task id"))?;
    let task = state.tasks.report_task_status(&queue, task_id, req.status.into(), req.summary).await?;
    Ok(Json(ApiResponse::success(TaskResponse::from(task))))
}

#[derive(Debug, Deserialize, Default)]
pub struct ResetTaskRequest {
    pub task_setting_update: Option<Value>,
}

pub async fn reset_task(
    State(state): State<AppState>,
    Path((name, task_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(req): Json<ResetTaskRequest>,
) -> AppResult<impl IntoResponse> {
    let queue = authenticated_queue(&state, &name, &headers).await?;
    let task_id: TaskId = task_id.parse().map_err(|_| AppError::bad_request("invalid task id"))?;
    let task = state.tasks.reset_task_to_pending(&queue, task_id, req.task_setting_update).await?;
    Ok(Json(ApiResponse::success(TaskResponse::from(task))))
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Path((name, task_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    let queue = authenticated_queue(&state, &name, &headers).await?;
    let task_id: TaskId = task_id.parse().map_err(|_| AppError::bad_request("invalid task id"))?;
    let task = state.tasks.cancel_task(&queue, task_id).await?;
    Ok(Json(ApiResponse::success(TaskResponse::from(task))))
}

// ---------------------------------------------------------------------------
// Health / metrics
// ---------------------------------------------------------------------------

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.health.check_health().await;
    let code = if status.status == "healthy" { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(status))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, state.metrics.gather_metrics())
}

/// Assembles the full router; `main.rs` layers tracing/CORS/compression/
/// timeout middleware on top and spawns the [`TimeoutSweeper`] separately.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/queues", post(create_queue))
        .route("/queues/:name", get(get_queue).patch(update_queue).delete(delete_queue))
        .route("/queues/:name/workers", post(create_worker).get(list_workers))
        .route("/queues/:name/workers/:worker_id", get(get_worker).delete(delete_worker))
        .route("/queues/:name/workers/:worker_id/status", patch(set_worker_status))
        .route("/queues/:name/tasks", post(submit_task).get(list_tasks))
        .route("/queues/:name/tasks/next", get(fetch_task))
        .route("/queues/:name/tasks/:task_id", get(get_task))
        .route("/queues/:name/tasks/:task_id/status", post(report_task_status))
        .route("/queues/:name/tasks/:task_id/reset", post(reset_task))
        .route("/queues/:name/tasks/:task_id/cancel", post(cancel_task))
        .route("/healthz", get(health_check))
        .route("/metrics", get(metrics))
        .with_state(state)
}
