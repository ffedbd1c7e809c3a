pub mod logging;

pub use logging::{HealthChecker, LogManager, MetricsCollector, StructuredLogger};
