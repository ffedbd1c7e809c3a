use thiserror::Error;

/// Errors raised while constructing or validating value objects, independent of
/// any store or service-layer concern.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid id format: {0}")]
    InvalidId(#[from] uuid::Error),

    #[error("queue name must match ^[A-Za-z0-9_-]{{1,100}}$, got: {0}")]
    InvalidQueueName(String),

    #[error("worker name too long (max 100 characters)")]
    WorkerNameTooLong,

    #[error("task args must be a JSON object")]
    ArgsNotAMapping,

    #[error("invalid task status: {0}")]
    InvalidTaskStatus(String),

    #[error("invalid worker status: {0}")]
    InvalidWorkerStatus(String),
}
