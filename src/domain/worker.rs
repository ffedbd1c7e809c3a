use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::DomainError;
use super::ids::{QueueId, WorkerId};
use super::status::WorkerStatus;

/// A registered executor that claims and heartbeats tasks within one queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub queue_id: QueueId,
    pub status: WorkerStatus,
    pub worker_name: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub retries: i64,
    pub max_retries: i64,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl Worker {
    pub fn new(
        queue_id: QueueId,
        worker_name: Option<String>,
        metadata: HashMap<String, serde_json::Value>,
        max_retries: i64,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        if let Some(name) = &worker_name {
            if name.len() > 100 {
                return Err(DomainError::WorkerNameTooLong);
            }
        }
        Ok(Self {
            id: WorkerId::new(),
            queue_id,
            status: WorkerStatus::Active,
            worker_name,
            metadata,
            retries: 0,
            max_retries,
            created_at: now,
            last_modified: now,
        })
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, WorkerStatus::Active)
    }
}
