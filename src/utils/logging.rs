use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn, Span};
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::infrastructure::database::Store;

/// Initializes the global `tracing` subscriber from the logging config.
pub struct LogManager {
    config: LoggingConfig,
}

impl LogManager {
    pub fn new(config: LoggingConfig) -> Self {
        Self { config }
    }

    pub fn init(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(&self.config.level)
                .add_directive("tower_http=debug".parse().unwrap())
                .add_directive("labtasker_queue=info".parse().unwrap())
        });

        tracing_subscriber::fmt().with_env_filter(env_filter).init();

        info!("Logging system initialized with level: {}", self.config.level);
        Ok(())
    }

    pub fn structured_logger(&self) -> StructuredLogger {
        StructuredLogger::new(&self.config)
    }
}

/// Named log call sites for every notable lifecycle event, one per §10.2
/// category, rather than ad hoc `tracing::info!` calls scattered through the
/// services layer.
#[derive(Clone)]
pub struct StructuredLogger {
    config: LoggingConfig,
}

impl StructuredLogger {
    pub fn new(config: &LoggingConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    pub fn log_info(&self, message: &str, context: Option<&str>) {
        if let Some(ctx) = context {
            info!(message = %message, context = %ctx, "Info");
        } else {
            info!(message = %message, "Info");
        }
    }

    #[instrument(skip_all, fields(queue, task_id, priority, status))]
    pub fn log_task_submitted(&self, queue: &str, task_id: &str, priority: i64, status: &str) {
        let span = Span::current();
        span.record("queue", queue);
        span.record("task_id", task_id);
        span.record("priority", priority);
        span.record("status", status);

        info!(queue, task_id, priority, status, "task submitted");
    }

    #[instrument(skip_all, fields(queue, task_id, worker_id, acquisition_time_ms))]
    pub fn log_task_fetched(&self, queue: &str, task_id: Option<&str>, worker_id: Option<&str>, acquisition_time_ms: u64) {
        let span = Span::current();
        span.record("queue", queue);
        if let Some(task_id) = task_id {
            span.record("task_id", task_id);
        }
        if let Some(worker_id) = worker_id {
            span.record("worker_id", worker_id);
        }
        span.record("acquisition_time_ms", acquisition_time_ms);

        info!(queue, task_id, worker_id, acquisition_time_ms, "task fetch attempted");
    }

    #[instrument(skip_all, fields(queue, task_id, from, to, event))]
    pub fn log_task_transitioned(&self, queue: &str, task_id: &str, from: &str, to: &str, event: &str) {
        let span = Span::current();
        span.record("queue", queue);
        span.record("task_id", task_id);
        span.record("from", from);
        span.record("to", to);
        span.record("event", event);

        info!(queue, task_id, from, to, event, "task transitioned");
    }

    #[instrument(skip_all, fields(swept, failed_tasks, duration_ms))]
    pub fn log_sweep_completed(&self, swept: usize, failed_tasks: usize, duration_ms: u64) {
        let span = Span::current();
        span.record("swept", swept);
        span.record("failed_tasks", failed_tasks);
        span.record("duration_ms", duration_ms);

        info!(swept, failed_tasks, duration_ms, "timeout sweep completed");
    }

    #[instrument(skip_all, fields(queue, reason))]
    pub fn log_sanitizer_rejected(&self, queue: &str, reason: &str) {
        let span = Span::current();
        span.record("queue", queue);
        span.record("reason", reason);

        warn!(queue, reason, "sanitizer rejected request");
    }

    #[instrument(skip_all, fields(method, path, status_code, response_time_ms, user_agent, client_ip))]
    pub fn log_api_request(&self, method: &str, path: &str, status_code: u16, response_time_ms: u64, user_agent: Option<&str>, client_ip: Option<&str>) {
        let span = Span::current();
        span.record("method", method);
        span.record("path", path);
        span.record("status_code", status_code);
        span.record("response_time_ms", response_time_ms);
        if let Some(ua) = user_agent {
            span.record("user_agent", ua);
        }
        if let Some(ip) = client_ip {
            span.record("client_ip", ip);
        }

        info!(method, path, status_code, response_time_ms, user_agent, client_ip, "API request processed");
    }

    #[instrument(skip_all, fields(operation, table, execution_time_ms, rows_affected))]
    pub fn log_database_operation(&self, operation: &str, table: &str, execution_time_ms: u64, rows_affected: Option<u64>) {
        let span = Span::current();
        span.record("operation", operation);
        span.record("table", table);
        span.record("execution_time_ms", execution_time_ms);
        if let Some(rows) = rows_affected {
            span.record("rows_affected", rows);
        }

        debug!(operation, table, execution_time_ms, rows_affected, "database operation completed");
    }

    #[instrument(skip_all, fields(error_type, error_message, context))]
    pub fn log_error(&self, error_type: &str, error_message: &str, context: Option<&str>) {
        let span = Span::current();
        span.record("error_type", error_type);
        span.record("error_message", error_message);
        if let Some(ctx) = context {
            span.record("context", ctx);
        }

        error!(error_type, error_message, context, "error occurred");
    }
}

/// `MakeSpan` for `tower_http::trace::TraceLayer`, correlating each HTTP
/// request's span with the structured-logging events it triggers.
pub struct LoggingMiddleware {
    #[allow(dead_code)]
    logger: StructuredLogger,
}

impl LoggingMiddleware {
    pub fn new(logger: StructuredLogger) -> Self {
        Self { logger }
    }
}

impl tower_http::trace::MakeSpan<axum::body::Body> for LoggingMiddleware {
    fn make_span(&mut self, request: &axum::http::Request<axum::body::Body>) -> Span {
        let user_agent = request
            .headers()
            .get("user-agent")
            .and_then(|h| h.to_str().ok())
            .unwrap_or("unknown");

        let client_ip = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|h| h.to_str().ok())
            .or_else(|| request.headers().get("x-real-ip").and_then(|h| h.to_str().ok()))
            .unwrap_or("unknown");

        tracing::info_span!(
            "http_request",
            method = %request.method(),
            uri = %request.uri(),
            version = ?request.version(),
            user_agent = %user_agent,
            client_ip = %client_ip,
        )
    }
}

/// Prometheus counters/histograms/gauges for task/queue/worker lifecycle
/// events, labeled by queue name where the spec calls for it (§10.3).
pub struct MetricsCollector {
    tasks_submitted: prometheus::CounterVec,
    tasks_fetched: prometheus::CounterVec,
    tasks_completed: prometheus::CounterVec,
    tasks_failed: prometheus::CounterVec,
    tasks_cancelled: prometheus::CounterVec,
    sweeper_tasks_timed_out: prometheus::Counter,
    sweeper_duration: prometheus::Histogram,
    store_operation_duration: prometheus::Histogram,
    active_queues: prometheus::Gauge,
    active_workers: prometheus::Gauge,
    errors_total: prometheus::CounterVec,
}

impl MetricsCollector {
    pub fn new() -> Result<Self, prometheus::Error> {
        Ok(Self {
            tasks_submitted: prometheus::CounterVec::new(
                prometheus::Opts::new("tasks_submitted_total", "Total number of tasks submitted"),
                &["queue"],
            )?,
            tasks_fetched: prometheus::CounterVec::new(
                prometheus::Opts::new("tasks_fetched_total", "Total number of tasks fetched"),
                &["queue"],
            )?,
            tasks_completed: prometheus::CounterVec::new(
                prometheus::Opts::new("tasks_completed_total", "Total number of tasks completed"),
                &["queue"],
            )?,
            tasks_failed: prometheus::CounterVec::new(
                prometheus::Opts::new("tasks_failed_total", "Total number of tasks failed"),
                &["queue"],
            )?,
            tasks_cancelled: prometheus::CounterVec::new(
                prometheus::Opts::new("tasks_cancelled_total", "Total number of tasks cancelled"),
                &["queue"],
            )?,
            sweeper_tasks_timed_out: prometheus::Counter::with_opts(prometheus::Opts::new(
                "sweeper_tasks_timed_out_total",
                "Total number of tasks the timeout sweeper has failed",
            ))?,
            sweeper_duration: prometheus::Histogram::with_opts(
                prometheus::HistogramOpts::new("sweeper_duration_seconds", "Timeout sweep duration")
                    .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0]),
            )?,
            store_operation_duration: prometheus::Histogram::with_opts(
                prometheus::HistogramOpts::new("store_operation_duration_seconds", "Store operation duration")
                    .buckets(vec![0.001, 0.01, 0.1, 1.0]),
            )?,
            active_queues: prometheus::Gauge::with_opts(prometheus::Opts::new("active_queues", "Number of known queues"))?,
            active_workers: prometheus::Gauge::with_opts(prometheus::Opts::new("active_workers", "Number of active workers"))?,
            errors_total: prometheus::CounterVec::new(
                prometheus::Opts::new("errors_total", "Total number of service errors"),
                &["kind"],
            )?,
        })
    }

    pub fn record_task_submitted(&self, queue: &str) {
        self.tasks_submitted.with_label_values(&[queue]).inc();
    }

    pub fn record_task_fetched(&self, queue: &str) {
        self.tasks_fetched.with_label_values(&[queue]).inc();
    }

    pub fn record_task_completed(&self, queue: &str) {
        self.tasks_completed.with_label_values(&[queue]).inc();
    }

    pub fn record_task_failed(&self, queue: &str) {
        self.tasks_failed.with_label_values(&[queue]).inc();
    }

    pub fn record_task_cancelled(&self, queue: &str) {
        self.tasks_cancelled.with_label_values(&[queue]).inc();
    }

    pub fn record_sweep(&self, timed_out: usize, duration_seconds: f64) {
        self.sweeper_tasks_timed_out.inc_by(timed_out as f64);
        self.sweeper_duration.observe(duration_seconds);
    }

    pub fn record_store_operation(&self, duration_seconds: f64) {
        self.store_operation_duration.observe(duration_seconds);
    }

    pub fn set_active_queues(&self, count: u64) {
        self.active_queues.set(count as f64);
    }

    pub fn set_active_workers(&self, count: u64) {
        self.active_workers.set(count as f64);
    }

    pub fn record_error(&self, kind: &str) {
        self.errors_total.with_label_values(&[kind]).inc();
    }

    pub fn gather_metrics(&self) -> String {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let registry = prometheus::Registry::new();
        let _ = registry.register(Box::new(self.tasks_submitted.clone()));
        let _ = registry.register(Box::new(self.tasks_fetched.clone()));
        let _ = registry.register(Box::new(self.tasks_completed.clone()));
        let _ = registry.register(Box::new(self.tasks_failed.clone()));
        let _ = registry.register(Box::new(self.tasks_cancelled.clone()));
        let _ = registry.register(Box::new(self.sweeper_tasks_timed_out.clone()));
        let _ = registry.register(Box::new(self.sweeper_duration.clone()));
        let _ = registry.register(Box::new(self.store_operation_duration.clone()));
        let _ = registry.register(Box::new(self.active_queues.clone()));
        let _ = registry.register(Box::new(self.active_workers.clone()));
        let _ = registry.register(Box::new(self.errors_total.clone()));

        let metric_families = registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Liveness/readiness check: reports unhealthy, rather than panicking or
/// hanging, when the store cannot be reached (SPEC_FULL §8 scenario 8).
pub struct HealthChecker {
    store: Arc<dyn Store>,
}

impl HealthChecker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn check_health(&self) -> HealthStatus {
        let started = std::time::Instant::now();
        let store_healthy = self.store.ping().await.is_ok();
        let response_time_ms = started.elapsed().as_secs_f64() * 1000.0;

        let mut components = std::collections::HashMap::new();
        components.insert(
            "store".to_string(),
            ComponentHealth {
                healthy: store_healthy,
                response_time_ms: Some(response_time_ms),
                last_checked: chrono::Utc::now(),
            },
        );

        HealthStatus {
            status: if store_healthy { "healthy" } else { "unhealthy" }.to_string(),
            timestamp: chrono::Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            components,
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: String,
    pub components: std::collections::HashMap<String, ComponentHealth>,
}

#[derive(Debug, serde::Serialize)]
pub struct ComponentHealth {
    pub healthy: bool,
    pub response_time_ms: Option<f64>,
    pub last_checked: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysUpStore;
    struct AlwaysDownStore;

    #[async_trait::async_trait]
    impl Store for AlwaysUpStore {
        async fn insert_queue(&self, _: &crate::domain::Queue) -> AppResultShim { Ok(()) }
        async fn find_queue_by_name(&self, _: &crate::domain::QueueName) -> AppResultShimOpt<crate::domain::Queue> { Ok(None) }
        async fn find_queue_by_id(&self, _: crate::domain::QueueId) -> AppResultShimOpt<crate::domain::Queue> { Ok(None) }
        async fn update_queue(&self, _: &crate::domain::Queue) -> AppResultShim { Ok(()) }
        async fn delete_queue(&self, _: crate::domain::QueueId) -> AppResultShim { Ok(()) }
        async fn insert_worker(&self, _: &crate::domain::Worker) -> AppResultShim { Ok(()) }
        async fn find_worker(&self, _: crate::domain::QueueId, _: crate::domain::WorkerId) -> AppResultShimOpt<crate::domain::Worker> { Ok(None) }
        async fn list_workers(&self, _: crate::domain::QueueId, _: crate::models::ListParams) -> AppResultShimVec<crate::domain::Worker> { Ok(vec![]) }
        async fn update_worker(&self, _: &crate::domain::Worker) -> AppResultShim { Ok(()) }
        async fn delete_worker(&self, _: crate::domain::QueueId, _: crate::domain::WorkerId) -> AppResultShim { Ok(()) }
        async fn unassign_worker_from_tasks(&self, _: crate::domain::QueueId, _: crate::domain::WorkerId, _: chrono::DateTime<chrono::Utc>) -> AppResultShimU64 { Ok(0) }
        async fn insert_task(&self, _: &crate::domain::Task) -> AppResultShim { Ok(()) }
        async fn find_task(&self, _: crate::domain::QueueId, _: crate::domain::TaskId) -> AppResultShimOpt<crate::domain::Task> { Ok(None) }
        async fn list_tasks(&self, _: crate::domain::QueueId, _: &crate::models::TaskQueryFilter, _: crate::models::ListParams) -> AppResultShimVec<crate::domain::Task> { Ok(vec![]) }
        async fn claim_next_task(&self, _: crate::domain::QueueId, _: Option<crate::domain::WorkerId>, _: Option<&serde_json::Value>, _: chrono::DateTime<chrono::Utc>, _: i64) -> AppResultShimOpt<crate::domain::Task> { Ok(None) }
        async fn save_task(&self, _: &crate::domain::Task) -> AppResultShim { Ok(()) }
        async fn delete_tasks_by_queue(&self, _: crate::domain::QueueId) -> AppResultShimU64 { Ok(0) }
        async fn delete_workers_by_queue(&self, _: crate::domain::QueueId) -> AppResultShimU64 { Ok(0) }
        async fn list_running_tasks(&self) -> AppResultShimVec<crate::domain::Task> { Ok(vec![]) }
        async fn ping(&self) -> AppResultShim { Ok(()) }
    }

    #[async_trait::async_trait]
    impl Store for AlwaysDownStore {
        async fn insert_queue(&self, _: &crate::domain::Queue) -> AppResultShim { Ok(()) }
        async fn find_queue_by_name(&self, _: &crate::domain::QueueName) -> AppResultShimOpt<crate::domain::Queue> { Ok(None) }
        async fn find_queue_by_id(&self, _: crate::domain::QueueId) -> AppResultShimOpt<crate::domain::Queue> { Ok(None) }
        async fn update_queue(&self, _: &crate::domain::Queue) -> AppResultShim { Ok(()) }
        async fn delete_queue(&self, _: crate::domain::QueueId) -> AppResultShim { Ok(()) }
        async fn insert_worker(&self, _: &crate::domain::Worker) -> AppResultShim { Ok(()) }
        async fn find_worker(&self, _: crate::domain::QueueId, _: crate::domain::WorkerId) -> AppResultShimOpt<crate::domain::Worker> { Ok(None) }
        async fn list_workers(&self, _: crate::domain::QueueId, _: crate::models::ListParams) -> AppResultShimVec<crate::domain::Worker> { Ok(vec![]) }
        async fn update_worker(&self, _: &crate::domain::Worker) -> AppResultShim { Ok(()) }
        async fn delete_worker(&self, _: crate::domain::QueueId, _: crate::domain::WorkerId) -> AppResultShim { Ok(()) }
        async fn unassign_worker_from_tasks(&self, _: crate::domain::QueueId, _: crate::domain::WorkerId, _: chrono::DateTime<chrono::Utc>) -> AppResultShimU64 { Ok(0) }
        async fn insert_task(&self, _: &crate::domain::Task) -> AppResultShim { Ok(()) }
        async fn find_task(&self, _: crate::domain::QueueId, _: crate::domain::TaskId) -> AppResultShimOpt<crate::domain::Task> { Ok(None) }
        async fn list_tasks(&self, _: crate::domain::QueueId, _: &crate::models::TaskQueryFilter, _: crate::models::ListParams) -> AppResultShimVec<crate::domain::Task> { Ok(vec![]) }
        async fn claim_next_task(&self, _: crate::domain::QueueId, _: Option<crate::domain::WorkerId>, _: Option<&serde_json::Value>, _: chrono::DateTime<chrono::Utc>, _: i64) -> AppResultShimOpt<crate::domain::Task> { Ok(None) }
        async fn save_task(&self, _: &crate::domain::Task) -> AppResultShim { Ok(()) }
        async fn delete_tasks_by_queue(&self, _: crate::domain::QueueId) -> AppResultShimU64 { Ok(0) }
        async fn delete_workers_by_queue(&self, _: crate::domain::QueueId) -> AppResultShimU64 { Ok(0) }
        async fn list_running_tasks(&self) -> AppResultShimVec<crate::domain::Task> { Ok(vec![]) }
        async fn ping(&self) -> AppResultShim { Err(crate::errors::AppError::internal("store unreachable")) }
    }

    type AppResultShim = crate::errors::AppResult<()>;
    type AppResultShimU64 = crate::errors::AppResult<u64>;
    type AppResultShimOpt<T> = crate::errors::AppResult<Option<T>>;
    type AppResultShimVec<T> = crate::errors::AppResult<Vec<T>>;

    #[test]
    fn test_structured_logger_creation() {
        let config = LoggingConfig::default();
        let logger = StructuredLogger::new(&config);
        assert!(logger.config.enable_json);
    }

    #[test]
    fn test_metrics_collector_creation() {
        let collector = MetricsCollector::new();
        assert!(collector.is_ok());
    }

    #[tokio::test]
    async fn health_check_reports_healthy_when_store_reachable() {
        let checker = HealthChecker::new(Arc::new(AlwaysUpStore));
        let status = checker.check_health().await;
        assert_eq!(status.status, "healthy");
    }

    #[tokio::test]
    async fn health_check_reports_unhealthy_when_store_unreachable() {
        let checker = HealthChecker::new(Arc::new(AlwaysDownStore));
        let status = checker.check_health().await;
        assert_eq!(status.status, "unhealthy");
        assert!(!status.components["store"].healthy);
    }
}
