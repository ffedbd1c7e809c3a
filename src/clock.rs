//! Injectable wall-clock source.
//!
//! Every service that needs "now" takes a `Arc<dyn Clock>` instead of calling
//! `Utc::now()` directly, so the sweeper and FSM-driven transitions can be
//! exercised deterministically in tests.

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// A clock whose `now()` is set explicitly, used by sweeper and timeout tests
    /// that need to advance time without sleeping.
    pub struct MockClock {
        micros: AtomicI64,
    }

    impl MockClock {
        pub fn new(start: DateTime<Utc>) -> Self {
            Self {
                micros: AtomicI64::new(start.timestamp_micros()),
            }
        }

        pub fn set(&self, now: DateTime<Utc>) {
            self.micros.store(now.timestamp_micros(), Ordering::SeqCst);
        }

        pub fn advance(&self, duration: chrono::Duration) {
            self.micros
                .fetch_add(duration.num_microseconds().unwrap_or(0), Ordering::SeqCst);
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> DateTime<Utc> {
            DateTime::from_timestamp_micros(self.micros.load(Ordering::SeqCst))
                .expect("mock clock micros always in range")
        }
    }

    #[test]
    fn mock_clock_advances_deterministically() {
        let start = Utc::now();
        let clock = MockClock::new(start);
        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(30));
    }
}
