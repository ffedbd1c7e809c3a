use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::DomainError;
use super::ids::{QueueId, TaskId, WorkerId};
use super::priority::Priority;
use super::status::TaskStatus;
use crate::fsm::Transitioned;

/// A task's `cmd` field: either a single shell-ish string or an argv-style list.
/// The core never executes it — it's opaque data the worker interprets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cmd {
    Single(String),
    Argv(Vec<String>),
}

/// A unit of work described by args/cmd, progressing through the [`crate::fsm`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub queue_id: QueueId,
    pub status: TaskStatus,
    pub task_name: Option<String>,
    pub args: HashMap<String, serde_json::Value>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub cmd: Option<Cmd>,
    pub priority: Priority,
    pub max_retries: i64,
    pub retries: i64,
    pub heartbeat_timeout: Option<i64>,
    pub task_timeout: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_modified: DateTime<Utc>,
    pub worker_id: Option<WorkerId>,
    pub summary: HashMap<String, serde_json::Value>,
    pub version: i64,
}

/// Inputs accepted by `SubmitTask`. `args` must be a JSON object (enforced by
/// [`DomainError::ArgsNotAMapping`]), matching the source's `isinstance(args, dict)`
/// check.
pub struct NewTask {
    pub task_name: Option<String>,
    pub args: serde_json::Value,
    pub metadata: HashMap<String, serde_json::Value>,
    pub cmd: Option<Cmd>,
    pub heartbeat_timeout: Option<i64>,
    pub task_timeout: Option<i64>,
    pub max_retries: i64,
    pub priority: Priority,
}

impl Task {
    pub fn new(queue_id: QueueId, spec: NewTask, now: DateTime<Utc>) -> Result<Self, DomainError> {
        let args = match spec.args {
            serde_json::Value::Object(map) => map.into_iter().collect(),
            serde_json::Value::Null => HashMap::new(),
            _ => return Err(DomainError::ArgsNotAMapping),
        };
        Ok(Self {
            id: TaskId::new(),
            queue_id,
            status: TaskStatus::Pending,
            task_name: spec.task_name,
            args,
            metadata: spec.metadata,
            cmd: spec.cmd,
            priority: spec.priority,
            max_retries: spec.max_retries,
            retries: 0,
            heartbeat_timeout: spec.heartbeat_timeout,
            task_timeout: spec.task_timeout,
            created_at: now,
            start_time: None,
            last_heartbeat: None,
            last_modified: now,
            worker_id: None,
            summary: HashMap::new(),
            version: 1,
        })
    }

    /// Applies the effects of an FSM transition, stamping `worker_id` when the
    /// transition sets `start_time` (i.e. a successful `fetch`). `worker_id` is
    /// `None` for transitions that don't claim the task (complete/fail/cancel/reset).
    pub fn apply_transition(&mut self, transitioned: Transitioned, worker_id: Option<WorkerId>, now: DateTime<Utc>) {
        let Transitioned { fsm, effects } = transitioned;
        self.status = fsm.status;
        self.retries = fsm.retries;

        if effects.set_started {
            self.start_time = Some(now);
            self.last_heartbeat = Some(now);
            self.worker_id = worker_id;
        }
        if effects.clear_worker_id {
            self.worker_id = None;
        }
        if effects.clear_started {
            self.start_time = None;
            self.last_heartbeat = None;
        }
        if effects.reset_retries {
            self.retries = 0;
        }

        self.last_modified = now;
        self.version += 1;
    }

    /// Unconditional cancel used by the administrative `CancelTask` operation —
    /// bypasses the FSM entirely, matching the source's permissive `cancel_task`.
    /// Still clears `worker_id`: a non-`Running` task must never hold one.
    pub fn force_cancel(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Cancelled;
        self.worker_id = None;
        self.last_modified = now;
        self.version += 1;
    }

    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        if self.status != TaskStatus::Running {
            return false;
        }
        let heartbeat_expired = match (self.last_heartbeat, self.heartbeat_timeout) {
            (Some(last), Some(timeout)) => (now - last).num_seconds() > timeout,
            _ => false,
        };
        let task_expired = match (self.start_time, self.task_timeout) {
            (Some(start), Some(timeout)) => (now - start).num_seconds() > timeout,
            _ => false,
        };
        heartbeat_expired || task_expired
    }
}
