//! Task queue service binary: wires configuration, logging, the SQLite
//! store, the queue/worker/task services, the timeout sweeper, and the HTTP
//! router together, then serves until a shutdown signal arrives.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, request_id::MakeRequestUuid,
    timeout::TimeoutLayer, trace::TraceLayer, ServiceBuilderExt,
};

use labtasker_queue::clock::SystemClock;
use labtasker_queue::config::ConfigManager;
use labtasker_queue::handlers::{self, AppState};
use labtasker_queue::infrastructure::database::SqliteStore;
use labtasker_queue::services::{QueueService, TaskService, TimeoutSweeper, WorkerService};
use labtasker_queue::utils::{HealthChecker, LogManager, MetricsCollector};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config_manager = ConfigManager::new()?;
    let config = config_manager.config().clone();

    let log_manager = LogManager::new(config.logging.clone());
    log_manager.init()?;
    let logger = log_manager.structured_logger();
    let logger_for_shutdown = logger.clone();

    logger.log_info("starting labtasker-queue", None);
    logger.log_info(&format!("environment: {}", config.environment), None);
    logger.log_info(&format!("version: {}", config.version), None);

    let store = Arc::new(SqliteStore::new(&config.database).await?);
    let clock = Arc::new(SystemClock);
    let metrics = Arc::new(MetricsCollector::new()?);

    let queues = Arc::new(QueueService::new(store.clone(), clock.clone(), config.security.clone()));
    let workers = Arc::new(WorkerService::new(store.clone(), clock.clone()));
    let tasks = Arc::new(
        TaskService::new(store.clone(), clock.clone(), config.task.fetch_candidate_limit)
            .with_observability(logger.clone(), metrics.clone()),
    );
    let health = Arc::new(HealthChecker::new(store.clone()));

    let sweeper = Arc::new(
        TimeoutSweeper::new(store.clone(), clock.clone()).with_observability(logger.clone(), metrics.clone()),
    );
    let sweeper_handle = sweeper.start(Duration::from_secs(config.task.sweeper_interval_seconds));
    logger.log_info("timeout sweeper started", None);

    let state = AppState { queues, workers, tasks, health, metrics, logger: logger.clone() };
    let mut app = handlers::router(state);

    if config.server.enable_compression {
        app = app.layer(CompressionLayer::new());
    }
    if config.server.enable_cors {
        app = app.layer(CorsLayer::permissive());
    }
    let app = app.layer(
        ServiceBuilder::new()
            .set_x_request_id(MakeRequestUuid)
            .layer(TraceLayer::new_for_http())
            .propagate_x_request_id()
            .layer(TimeoutLayer::new(Duration::from_secs(config.server.timeout))),
    );

    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    logger.log_info(&format!("listening on {addr}"), None);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    let shutdown_signal = async move {
        let ctrl_c = async {
            signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            let mut terminate_signal =
                signal::unix::signal(signal::unix::SignalKind::terminate()).expect("failed to install SIGTERM handler");
            terminate_signal.recv().await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        logger_for_shutdown.log_info("shutdown signal received", None);
    };

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal).await?;

    sweeper_handle.abort();
    logger.log_info("server shutdown completed", None);

    Ok(())
}

#[cfg(test)]
mod tests {
    use labtasker_queue::config::AppConfig;
    use labtasker_queue::utils::LogManager;

    #[tokio::test]
    async fn config_loads_with_sane_defaults() {
        let config = AppConfig::from_env().unwrap();
        assert!(!config.database.url.is_empty());
        assert!(config.server.port > 0);
        assert!(config.server.workers > 0);
    }

    #[test]
    fn logging_initializes_from_default_config() {
        let config = AppConfig::from_env().unwrap();
        let log_manager = LogManager::new(config.logging);
        let logger = log_manager.structured_logger();
        logger.log_info("test log line", None);
    }
}
