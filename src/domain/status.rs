use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::error::DomainError;

/// A task's lifecycle state. `Success`, `Failed`, and `Cancelled` are terminal
/// except for the explicit administrative `reset` action (see [`crate::fsm`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Total parse from a persisted status string. Unlike a `From<&str>` that
    /// defaults on unrecognized input, an unknown string here is always an
    /// error — callers at the service layer turn that into `Internal`, never
    /// into a silently-assumed `Pending`.
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        Self::from_str(s).map_err(|_| DomainError::InvalidTaskStatus(s.to_string()))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

/// A worker's availability. Only `Active` workers may claim tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    Suspended,
    Failed,
}

impl WorkerStatus {
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        Self::from_str(s).map_err(|_| DomainError::InvalidWorkerStatus(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_round_trips() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Success,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::parse(&s.to_string()).unwrap(), s);
        }
    }

    #[test]
    fn task_status_parse_rejects_garbage() {
        assert!(TaskStatus::parse("not_a_status").is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Success.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn worker_status_parse_rejects_garbage() {
        assert!(WorkerStatus::parse("wandering").is_err());
    }
}
