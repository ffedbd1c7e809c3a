use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::QueueId;
use super::QueueName;

/// A named, password-protected namespace that owns tasks and workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Queue {
    pub id: QueueId,
    pub name: QueueName,
    pub password_hash: String,
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl Queue {
    pub fn new(name: QueueName, password_hash: String, metadata: HashMap<String, serde_json::Value>, now: DateTime<Utc>) -> Self {
        Self {
            id: QueueId::new(),
            name,
            password_hash,
            metadata,
            created_at: now,
            last_modified: now,
        }
    }
}
