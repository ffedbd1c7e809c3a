use serde::{Deserialize, Serialize};

/// A task's scheduling priority: a free integer, not a closed enum. Fetch orders
/// by this value descending, so any caller convention sorts correctly — the
/// `low`/`medium`/`high` constants below are just the documented convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub i64);

impl Priority {
    pub const LOW: Priority = Priority(0);
    pub const MEDIUM: Priority = Priority(10);
    pub const HIGH: Priority = Priority(20);

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::MEDIUM
    }
}

impl From<i64> for Priority {
    fn from(value: i64) -> Self {
        Priority(value)
    }
}
