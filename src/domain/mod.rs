//! Domain model: the `Queue`/`Task`/`Worker` entities and the value objects that
//! guard their invariants. Follows the DDD style of the codebase this crate
//! grew out of — newtype value objects with `Result`-returning constructors,
//! aggregate structs with `serde` derives — generalized from a single `Task`
//! entity to the three-entity, queue-scoped model this service implements.

mod error;
mod ids;
mod priority;
mod queue;
mod status;
mod task;
mod worker;

pub use error::DomainError;
pub use ids::{QueueId, QueueName, TaskId, WorkerId};
pub use priority::Priority;
pub use queue::Queue;
pub use status::{TaskStatus, WorkerStatus};
pub use task::{Cmd, NewTask, Task};
pub use worker::Worker;
