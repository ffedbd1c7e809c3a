//! Row-shaped DTOs mirroring the `queues`, `tasks`, and `workers` tables.
//!
//! These exist only at the persistence boundary: `sqlx::FromRow` maps a
//! result row onto one of these structs, `to_domain`/`from_domain` convert
//! to and from the rich domain types the rest of the service works with.
//! JSON-valued columns (`args`, `metadata`, `summary`, `cmd`) are stored as
//! TEXT and (de)serialized here rather than leaking `serde_json::Value`
//! parsing into the store layer.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;

use crate::domain::{
    Cmd, Priority, Queue, QueueId, QueueName, Task, TaskId, TaskStatus, Worker, WorkerId,
    WorkerStatus,
};
use crate::errors::{AppError, AppResult};

fn parse_json_map(raw: &str, column: &str) -> AppResult<HashMap<String, Value>> {
    if raw.is_empty() {
        return Ok(HashMap::new());
    }
    serde_json::from_str(raw).map_err(|err| AppError::internal(format!("corrupt {column} column: {err}")))
}

fn encode_json_map(map: &HashMap<String, Value>) -> AppResult<String> {
    serde_json::to_string(map).map_err(AppError::from)
}

#[derive(Debug, Clone, FromRow)]
pub struct QueueRow {
    pub id: String,
    pub name: String,
    pub password_hash: String,
    pub metadata: String,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub version: i64,
}

impl QueueRow {
    pub fn to_domain(&self) -> AppResult<Queue> {
        Ok(Queue {
            id: QueueId::from_str(&self.id).map_err(AppError::from)?,
            name: QueueName::new(&self.name).map_err(AppError::from)?,
            password_hash: self.password_hash.clone(),
            metadata: parse_json_map(&self.metadata, "queues.metadata")?,
            created_at: self.created_at,
            last_modified: self.last_modified,
        })
    }

    pub fn from_domain(queue: &Queue, version: i64) -> AppResult<Self> {
        Ok(Self {
            id: queue.id.to_string(),
            name: queue.name.as_str().to_string(),
            password_hash: queue.password_hash.clone(),
            metadata: encode_json_map(&queue.metadata)?,
            created_at: queue.created_at,
            last_modified: queue.last_modified,
            version,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct WorkerRow {
    pub id: String,
    pub queue_id: String,
    pub status: String,
    pub worker_name: Option<String>,
    pub metadata: String,
    pub retries: i64,
    pub max_retries: i64,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub version: i64,
}

impl WorkerRow {
    pub fn to_domain(&self) -> AppResult<Worker> {
        Ok(Worker {
            id: WorkerId::from_str(&self.id).map_err(AppError::from)?,
            queue_id: QueueId::from_str(&self.queue_id).map_err(AppError::from)?,
            status: WorkerStatus::parse(&self.status).map_err(AppError::from)?,
            worker_name: self.worker_name.clone(),
            metadata: parse_json_map(&self.metadata, "workers.metadata")?,
            retries: self.retries,
            max_retries: self.max_retries,
            created_at: self.created_at,
            last_modified: self.last_modified,
        })
    }

    pub fn from_domain(worker: &Worker, version: i64) -> AppResult<Self> {
        Ok(Self {
            id: worker.id.to_string(),
            queue_id: worker.queue_id.to_string(),
            status: worker.status.to_string(),
            worker_name: worker.worker_name.clone(),
            metadata: encode_json_map(&worker.metadata)?,
            retries: worker.retries,
            max_retries: worker.max_retries,
            created_at: worker.created_at,
            last_modified: worker.last_modified,
            version,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
    pub id: String,
    pub queue_id: String,
    pub status: String,
    pub task_name: Option<String>,
    pub args: String,
    pub metadata: String,
    pub cmd: Option<String>,
    pub priority: i64,
    pub max_retries: i64,
    pub retries: i64,
    pub heartbeat_timeout: Option<i64>,
    pub task_timeout: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_modified: DateTime<Utc>,
    pub worker_id: Option<String>,
    pub summary: String,
    pub version: i64,
}

impl TaskRow {
    pub fn to_domain(&self) -> AppResult<Task> {
        let cmd = match &self.cmd {
            Some(raw) if !raw.is_empty() => Some(
                serde_json::from_str::<Cmd>(raw)
                    .map_err(|err| AppError::internal(format!("corrupt tasks.cmd column: {err}")))?,
            ),
            _ => None,
        };

        let worker_id = match &self.worker_id {
            Some(raw) => Some(WorkerId::from_str(raw).map_err(AppError::from)?),
            None => None,
        };

        Ok(Task {
            id: TaskId::from_str(&self.id).map_err(AppError::from)?,
            queue_id: QueueId::from_str(&self.queue_id).map_err(AppError::from)?,
            status: TaskStatus::parse(&self.status).map_err(AppError::from)?,
            task_name: self.task_name.clone(),
            args: parse_json_map(&self.args, "tasks.args")?,
            metadata: parse_json_map(&self.metadata, "tasks.metadata")?,
            cmd,
            priority: Priority::from(self.priority),
            max_retries: self.max_retries,
            retries: self.retries,
            heartbeat_timeout: self.heartbeat_timeout,
            task_timeout: self.task_timeout,
            created_at: self.created_at,
            start_time: self.start_time,
            last_heartbeat: self.last_heartbeat,
            last_modified: self.last_modified,
            worker_id,
            summary: parse_json_map(&self.summary, "tasks.summary")?,
            version: self.version,
        })
    }

    pub fn from_domain(task: &Task) -> AppResult<Self> {
        let cmd = match &task.cmd {
            Some(cmd) => Some(serde_json::to_string(cmd).map_err(AppError::from)?),
            None => None,
        };

        Ok(Self {
            id: task.id.to_string(),
            queue_id: task.queue_id.to_string(),
            status: task.status.to_string(),
            task_name: task.task_name.clone(),
            args: encode_json_map(&task.args)?,
            metadata: encode_json_map(&task.metadata)?,
            cmd,
            priority: task.priority.value(),
            max_retries: task.max_retries,
            retries: task.retries,
            heartbeat_timeout: task.heartbeat_timeout,
            task_timeout: task.task_timeout,
            created_at: task.created_at,
            start_time: task.start_time,
            last_heartbeat: task.last_heartbeat,
            last_modified: task.last_modified,
            worker_id: task.worker_id.map(|w| w.to_string()),
            summary: encode_json_map(&task.summary)?,
            version: task.version,
        })
    }
}

/// Requested limit/offset for a listing endpoint; the store clamps `limit`.
#[derive(Debug, Clone, Copy)]
pub struct ListParams {
    pub limit: i64,
    pub offset: i64,
}

impl Default for ListParams {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

/// Narrowing predicate applied by `Store::list_tasks`. `extra_filter`, when
/// present, is matched structurally against each candidate's `args` using
/// the same `arg_match` semantics the fetch path uses.
#[derive(Debug, Clone, Default)]
pub struct TaskQueryFilter {
    pub status: Option<TaskStatus>,
    pub task_name: Option<String>,
    pub extra_filter: Option<Value>,
}
