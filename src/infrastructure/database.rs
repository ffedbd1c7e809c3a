//! Persistence boundary: a `Store` trait plus a `SqliteStore` implementation.
//!
//! Grounded on the teacher's `SqliteTaskRepository` for pool setup (WAL mode,
//! busy timeout, mmap/cache pragmas) and migration running, generalized from
//! a single `tasks` table to the three-entity `queues`/`tasks`/`workers`
//! model and strengthened from the teacher's select-then-update claim into a
//! single atomic statement.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{sqlite::SqliteConnectOptions, ConnectOptions, Pool, Sqlite};

use crate::config::DatabaseConfig;
use crate::domain::{Queue, QueueId, QueueName, Task, TaskId, Worker, WorkerId};
use crate::errors::{AppError, AppResult};
use crate::models::{ListParams, QueueRow, TaskQueryFilter, TaskRow, WorkerRow};
use crate::sanitizer::arg_match;

/// Every persistence operation the services layer needs. A trait rather than
/// a concrete `SqliteStore` so tests can swap in an in-memory fake without
/// touching a real database.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    // Queues
    async fn insert_queue(&self, queue: &Queue) -> AppResult<()>;
    async fn find_queue_by_name(&self, name: &QueueName) -> AppResult<Option<Queue>>;
    async fn find_queue_by_id(&self, id: QueueId) -> AppResult<Option<Queue>>;
    async fn update_queue(&self, queue: &Queue) -> AppResult<()>;
    async fn delete_queue(&self, id: QueueId) -> AppResult<()>;

    // Workers
    async fn insert_worker(&self, worker: &Worker) -> AppResult<()>;
    async fn find_worker(&self, queue_id: QueueId, id: WorkerId) -> AppResult<Option<Worker>>;
    async fn list_workers(&self, queue_id: QueueId, params: ListParams) -> AppResult<Vec<Worker>>;
    async fn update_worker(&self, worker: &Worker) -> AppResult<()>;
    async fn delete_worker(&self, queue_id: QueueId, id: WorkerId) -> AppResult<()>;
    /// Clears `worker_id` on every task currently claimed by this worker,
    /// used when a worker is deleted (SPEC_FULL §5 worker deletion cascade).
    async fn unassign_worker_from_tasks(&self, queue_id: QueueId, worker_id: WorkerId, now: DateTime<Utc>) -> AppResult<u64>;

    // Tasks
    async fn insert_task(&self, task: &Task) -> AppResult<()>;
    async fn find_task(&self, queue_id: QueueId, id: TaskId) -> AppResult<Option<Task>>;
    async fn list_tasks(&self, queue_id: QueueId, filter: &TaskQueryFilter, params: ListParams) -> AppResult<Vec<Task>>;
    /// Atomically claims the highest-priority, oldest eligible pending task in
    /// `queue_id` matching `extra_filter` (if any), flipping it to `Running`
    /// and stamping `worker_id`/`start_time`/`last_heartbeat`. Returns `Ok(None)`
    /// when nothing matches; never returns a task another caller also claimed.
    async fn claim_next_task(
        &self,
        queue_id: QueueId,
        worker_id: Option<WorkerId>,
        extra_filter: Option<&Value>,
        now: DateTime<Utc>,
        candidate_limit: i64,
    ) -> AppResult<Option<Task>>;
    /// Persists a task whose in-memory state already reflects the desired
    /// transition, using `version` as an optimistic-concurrency guard.
    async fn save_task(&self, task: &Task) -> AppResult<()>;
    async fn delete_tasks_by_queue(&self, queue_id: QueueId) -> AppResult<u64>;
    async fn delete_workers_by_queue(&self, queue_id: QueueId) -> AppResult<u64>;
    /// All `Running` tasks across every queue, for the timeout sweeper.
    async fn list_running_tasks(&self) -> AppResult<Vec<Task>>;

    /// Round-trips a trivial statement against the backing store; used by the
    /// health check so `/healthz` reports unhealthy instead of blocking
    /// forever on a dead connection.
    async fn ping(&self) -> AppResult<()>;
}

pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    pub async fn new(config: &DatabaseConfig) -> AppResult<Self> {
        let pool = Self::create_pool(config).await?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn with_pool(pool: Pool<Sqlite>) -> AppResult<Self> {
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    async fn create_pool(config: &DatabaseConfig) -> AppResult<Pool<Sqlite>> {
        let mut options = SqliteConnectOptions::from_str(&config.url)?;

        options = options
            .create_if_missing(true)
            .journal_mode(if config.enable_wal_mode {
                sqlx::sqlite::SqliteJournalMode::Wal
            } else {
                sqlx::sqlite::SqliteJournalMode::Delete
            })
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(config.busy_timeout));

        if config.enable_foreign_keys {
            options = options.pragma("foreign_keys", "on");
        }

        options = options
            .pragma("temp_store", "memory")
            .pragma("mmap_size", config.mmap_size.to_string())
            .pragma("cache_size", config.cache_size.to_string())
            .pragma("page_size", config.page_size.to_string());

        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(std::time::Duration::from_secs(config.connection_timeout))
            .idle_timeout(std::time::Duration::from_secs(config.idle_timeout))
            .max_lifetime(std::time::Duration::from_secs(config.max_lifetime))
            .connect_with(options)
            .await?;

        Ok(pool)
    }

    async fn run_migrations(pool: &Pool<Sqlite>) -> AppResult<()> {
        sqlx::migrate!("./migrations").run(pool).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Store for SqliteStore {
    async fn insert_queue(&self, queue: &Queue) -> AppResult<()> {
        let row = QueueRow::from_domain(queue, 1)?;
        sqlx::query(
            "INSERT INTO queues (id, name, password_hash, metadata, created_at, last_modified, version)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.id)
        .bind(&row.name)
        .bind(&row.password_hash)
        .bind(&row.metadata)
        .bind(row.created_at)
        .bind(row.last_modified)
        .bind(row.version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_queue_by_name(&self, name: &QueueName) -> AppResult<Option<Queue>> {
        let row = sqlx::query_as::<_, QueueRow>("SELECT * FROM queues WHERE name = ?")
            .bind(name.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.to_domain()).transpose()
    }

    async fn find_queue_by_id(&self, id: QueueId) -> AppResult<Option<Queue>> {
        let row = sqlx::query_as::<_, QueueRow>("SELECT * FROM queues WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.to_domain()).transpose()
    }

    async fn update_queue(&self, queue: &Queue) -> AppResult<()> {
        let row = QueueRow::from_domain(queue, 0)?;
        let result = sqlx::query(
            "UPDATE queues SET name = ?, password_hash = ?, metadata = ?, last_modified = ?, version = version + 1
             WHERE id = ?",
        )
        .bind(&row.name)
        .bind(&row.password_hash)
        .bind(&row.metadata)
        .bind(row.last_modified)
        .bind(&row.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found(format!("queue {} not found", queue.id)));
        }
        Ok(())
    }

    async fn delete_queue(&self, id: QueueId) -> AppResult<()> {
        let result = sqlx::query("DELETE FROM queues WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::not_found(format!("queue {id} not found")));
        }
        Ok(())
    }

    async fn insert_worker(&self, worker: &Worker) -> AppResult<()> {
        let row = WorkerRow::from_domain(worker, 1)?;
        sqlx::query(
            "INSERT INTO workers (id, queue_id, status, worker_name, metadata, retries, max_retries, created_at, last_modified, version)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.id)
        .bind(&row.queue_id)
        .bind(&row.status)
        .bind(&row.worker_name)
        .bind(&row.metadata)
        .bind(row.retries)
        .bind(row.max_retries)
        .bind(row.created_at)
        .bind(row.last_modified)
        .bind(row.version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_worker(&self, queue_id: QueueId, id: WorkerId) -> AppResult<Option<Worker>> {
        let row = sqlx::query_as::<_, WorkerRow>("SELECT * FROM workers WHERE queue_id = ? AND id = ?")
            .bind(queue_id.to_string())
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.to_domain()).transpose()
    }

    async fn list_workers(&self, queue_id: QueueId, params: ListParams) -> AppResult<Vec<Worker>> {
        let rows = sqlx::query_as::<_, WorkerRow>(
            "SELECT * FROM workers WHERE queue_id = ? ORDER BY created_at ASC LIMIT ? OFFSET ?",
        )
        .bind(queue_id.to_string())
        .bind(params.limit)
        .bind(params.offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| r.to_domain()).collect()
    }

    async fn update_worker(&self, worker: &Worker) -> AppResult<()> {
        let row = WorkerRow::from_domain(worker, 0)?;
        let result = sqlx::query(
            "UPDATE workers SET status = ?, worker_name = ?, metadata = ?, retries = ?, max_retries = ?, last_modified = ?, version = version + 1
             WHERE id = ? AND queue_id = ?",
        )
        .bind(&row.status)
        .bind(&row.worker_name)
        .bind(&row.metadata)
        .bind(row.retries)
        .bind(row.max_retries)
        .bind(row.last_modified)
        .bind(&row.id)
        .bind(&row.queue_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found(format!("worker {} not found", worker.id)));
        }
        Ok(())
    }

    async fn delete_worker(&self, queue_id: QueueId, id: WorkerId) -> AppResult<()> {
        let result = sqlx::query("DELETE FROM workers WHERE queue_id = ? AND id = ?")
            .bind(queue_id.to_string())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::not_found(format!("worker {id} not found")));
        }
        Ok(())
    }

    async fn unassign_worker_from_tasks(&self, queue_id: QueueId, worker_id: WorkerId, now: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE tasks SET worker_id = NULL, last_modified = ?, version = version + 1
             WHERE queue_id = ? AND worker_id = ?",
        )
        .bind(now)
        .bind(queue_id.to_string())
        .bind(worker_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_task(&self, task: &Task) -> AppResult<()> {
        let row = TaskRow::from_domain(task)?;
        sqlx::query(
            "INSERT INTO tasks (id, queue_id, status, task_name, args, metadata, cmd, priority, max_retries, retries,
                                 heartbeat_timeout, task_timeout, created_at, start_time, last_heartbeat, last_modified,
                                 worker_id, summary, version)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.id)
        .bind(&row.queue_id)
        .bind(&row.status)
        .bind(&row.task_name)
        .bind(&row.args)
        .bind(&row.metadata)
        .bind(&row.cmd)
        .bind(row.priority)
        .bind(row.max_retries)
        .bind(row.retries)
        .bind(row.heartbeat_timeout)
        .bind(row.task_timeout)
        .bind(row.created_at)
        .bind(row.start_time)
        .bind(row.last_heartbeat)
        .bind(row.last_modified)
        .bind(&row.worker_id)
        .bind(&row.summary)
        .bind(row.version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_task(&self, queue_id: QueueId, id: TaskId) -> AppResult<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE queue_id = ? AND id = ?")
            .bind(queue_id.to_string())
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.to_domain()).transpose()
    }

    async fn list_tasks(&self, queue_id: QueueId, filter: &TaskQueryFilter, params: ListParams) -> AppResult<Vec<Task>> {
        let mut sql = String::from("SELECT * FROM tasks WHERE queue_id = ?");
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.task_name.is_some() {
            sql.push_str(" AND task_name = ?");
        }
        sql.push_str(" ORDER BY priority DESC, created_at ASC");

        let mut query = sqlx::query_as::<_, TaskRow>(&sql).bind(queue_id.to_string());
        if let Some(status) = filter.status {
            query = query.bind(status.to_string());
        }
        if let Some(task_name) = &filter.task_name {
            query = query.bind(task_name.clone());
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut tasks = rows
            .iter()
            .map(|r| r.to_domain())
            .collect::<AppResult<Vec<_>>>()?;

        if let Some(required) = &filter.extra_filter {
            tasks.retain(|task| arg_match(required, &serde_json::to_value(&task.args).unwrap_or(Value::Null)));
        }

        let offset = params.offset.max(0) as usize;
        let limit = params.limit.max(0) as usize;
        Ok(tasks.into_iter().skip(offset).take(limit).collect())
    }

    async fn claim_next_task(
        &self,
        queue_id: QueueId,
        worker_id: Option<WorkerId>,
        extra_filter: Option<&Value>,
        now: DateTime<Utc>,
        candidate_limit: i64,
    ) -> AppResult<Option<Task>> {
        let worker_id_str = worker_id.map(|w| w.to_string());

        if extra_filter.is_none() {
            // No structural arg match needed: a single atomic statement picks and
            // claims the oldest, highest-priority pending task in one round trip.
            let row = sqlx::query_as::<_, TaskRow>(
                "UPDATE tasks
                 SET status = 'running', worker_id = ?, start_time = ?, last_heartbeat = ?, last_modified = ?, version = version + 1
                 WHERE id = (
                     SELECT id FROM tasks
                     WHERE queue_id = ? AND status = 'pending'
                     ORDER BY priority DESC, created_at ASC
                     LIMIT 1
                 )
                 RETURNING *",
            )
            .bind(&worker_id_str)
            .bind(now)
            .bind(now)
            .bind(now)
            .bind(queue_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
            return row.map(|r| r.to_domain()).transpose();
        }

        let required = extra_filter.unwrap();
        let candidates = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM tasks WHERE queue_id = ? AND status = 'pending'
             ORDER BY priority DESC, created_at ASC LIMIT ?",
        )
        .bind(queue_id.to_string())
        .bind(candidate_limit)
        .fetch_all(&self.pool)
        .await?;

        for candidate in candidates {
            let task = candidate.to_domain()?;
            let args_value = serde_json::to_value(&task.args).unwrap_or(Value::Null);
            if !arg_match(required, &args_value) {
                continue;
            }
            let claimed = sqlx::query_as::<_, TaskRow>(
                "UPDATE tasks
                 SET status = 'running', worker_id = ?, start_time = ?, last_heartbeat = ?, last_modified = ?, version = version + 1
                 WHERE id = ? AND status = 'pending'
                 RETURNING *",
            )
            .bind(&worker_id_str)
            .bind(now)
            .bind(now)
            .bind(now)
            .bind(candidate.id)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(claimed) = claimed {
                return Ok(Some(claimed.to_domain()?));
            }
            // another caller claimed it first; fall through to the next candidate
        }
        Ok(None)
    }

    async fn save_task(&self, task: &Task) -> AppResult<()> {
        let row = TaskRow::from_domain(task)?;
        let result = sqlx::query(
            "UPDATE tasks
             SET status = ?, task_name = ?, args = ?, metadata = ?, cmd = ?, priority = ?, max_retries = ?, retries = ?,
                 heartbeat_timeout = ?, task_timeout = ?, start_time = ?, last_heartbeat = ?, last_modified = ?,
                 worker_id = ?, summary = ?, version = version + 1
             WHERE id = ? AND version = ?",
        )
        .bind(&row.status)
        .bind(&row.task_name)
        .bind(&row.args)
        .bind(&row.metadata)
        .bind(&row.cmd)
        .bind(row.priority)
        .bind(row.max_retries)
        .bind(row.retries)
        .bind(row.heartbeat_timeout)
        .bind(row.task_timeout)
        .bind(row.start_time)
        .bind(row.last_heartbeat)
        .bind(row.last_modified)
        .bind(&row.worker_id)
        .bind(&row.summary)
        .bind(&row.id)
        .bind(row.version - 1)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::internal(format!(
                "task {} was modified concurrently (expected version {})",
                task.id,
                row.version - 1
            )));
        }
        Ok(())
    }

    async fn delete_tasks_by_queue(&self, queue_id: QueueId) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM tasks WHERE queue_id = ?")
            .bind(queue_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_workers_by_queue(&self, queue_id: QueueId) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM workers WHERE queue_id = ?")
            .bind(queue_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn list_running_tasks(&self) -> AppResult<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE status = 'running'")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|r| r.to_domain()).collect()
    }

    async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

pub type DynStore = Arc<dyn Store>;
