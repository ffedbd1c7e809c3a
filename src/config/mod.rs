use crate::errors::AppError;
use config::{Config, ConfigError, Environment as ConfigEnv, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Database pool and pragma settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: u64,
    pub idle_timeout: u64,
    pub max_lifetime: u64,
    pub enable_wal_mode: bool,
    pub enable_foreign_keys: bool,
    pub busy_timeout: u64,
    pub cache_size: i64,
    pub mmap_size: i64,
    pub page_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://labtasker.db".to_string(),
            max_connections: 20,
            min_connections: 2,
            connection_timeout: 30,
            idle_timeout: 600,
            max_lifetime: 3600,
            enable_wal_mode: true,
            enable_foreign_keys: true,
            busy_timeout: 30,
            cache_size: -64000,
            mmap_size: 268_435_456,
            page_size: 4096,
        }
    }
}

/// HTTP listener and middleware switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub timeout: u64,
    pub max_request_size: u64,
    pub enable_cors: bool,
    pub enable_compression: bool,
    pub enable_request_id: bool,
    pub enable_tracing: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            workers: 4,
            timeout: 30,
            max_request_size: 10 * 1024 * 1024,
            enable_cors: true,
            enable_compression: true,
            enable_request_id: true,
            enable_tracing: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
    pub max_file_size: u64,
    pub max_backup_count: usize,
    pub enable_json: bool,
    pub enable_pretty: bool,
    pub targets: Vec<LogTarget>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
            file: None,
            max_file_size: 100 * 1024 * 1024,
            max_backup_count: 5,
            enable_json: true,
            enable_pretty: false,
            targets: vec![LogTarget::Stdout],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogTarget {
    Stdout,
    Stderr,
    File,
}

/// Security settings scoped to the queue password contract — no auth
/// middleware, CORS policy, or TLS termination lives here; those are
/// infrastructure concerns outside this service's boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub argon2_memory_kib: u32,
    pub argon2_iterations: u32,
    pub argon2_parallelism: u32,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            argon2_memory_kib: 19_456,
            argon2_iterations: 2,
            argon2_parallelism: 1,
        }
    }
}

/// Scheduling defaults applied when a queue or task omits them, plus the
/// timeout sweeper's poll interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub default_max_retries: i64,
    pub default_heartbeat_timeout: i64,
    pub default_task_timeout: Option<i64>,
    pub sweeper_interval_seconds: u64,
    pub fetch_candidate_limit: i64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            default_heartbeat_timeout: 300,
            default_task_timeout: None,
            sweeper_interval_seconds: 30,
            fetch_candidate_limit: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub enable_metrics: bool,
    pub metrics_endpoint: String,
    pub enable_health_check: bool,
    pub health_check_endpoint: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_metrics: true,
            metrics_endpoint: "/metrics".to_string(),
            enable_health_check: true,
            health_check_endpoint: "/healthz".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub security: SecurityConfig,
    pub task: TaskConfig,
    pub monitoring: MonitoringConfig,
    pub environment: Environment,
    pub debug: bool,
    pub version: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            security: SecurityConfig::default(),
            task: TaskConfig::default(),
            monitoring: MonitoringConfig::default(),
            environment: Environment::default(),
            debug: matches!(Environment::default(), Environment::Development),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = match std::env::var("APP_ENV")
            .unwrap_or_else(|_| "development".to_string())
            .as_str()
        {
            "production" => Environment::Production,
            "staging" => Environment::Staging,
            "test" => Environment::Test,
            _ => Environment::Development,
        };

        // Layer the struct defaults in first, serialized to TOML, so
        // `try_deserialize` always has a complete document to fill from even
        // with no config/*.toml present; later sources override individual
        // leaves.
        let defaults_toml = toml::to_string(&AppConfig::default())
            .map_err(|err| ConfigError::Message(format!("failed to serialize config defaults: {err}")))?;
        let config = Config::builder()
            .add_source(File::from_str(&defaults_toml, FileFormat::Toml))
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(File::with_name("config/production").required(false))
            .add_source(ConfigEnv::with_prefix("APP").separator("_"))
            .set_default("environment", environment.to_string())?
            .set_default("debug", matches!(environment, Environment::Development))?
            .set_default("version", env!("CARGO_PKG_VERSION"))?
            .build()?;

        config.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.database.url.is_empty() {
            return Err(AppError::internal("database URL cannot be empty"));
        }

        if self.database.max_connections < self.database.min_connections {
            return Err(AppError::internal(
                "max connections must be >= min connections",
            ));
        }

        if self.server.port == 0 {
            return Err(AppError::internal("server port cannot be zero"));
        }

        if self.server.workers == 0 {
            return Err(AppError::internal("server workers cannot be zero"));
        }

        if self.task.default_max_retries < 0 {
            return Err(AppError::internal("default max retries cannot be negative"));
        }

        if self.task.default_heartbeat_timeout <= 0 {
            return Err(AppError::internal(
                "default heartbeat timeout must be positive",
            ));
        }

        if self.task.sweeper_interval_seconds == 0 {
            return Err(AppError::internal("sweeper interval cannot be zero"));
        }

        Ok(())
    }

    pub fn database_url(&self) -> &str {
        &self.database.url
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn is_development(&self) -> bool {
        matches!(self.environment, Environment::Development)
    }

    pub fn is_production(&self) -> bool {
        matches!(self.environment, Environment::Production)
    }

    pub fn is_test(&self) -> bool {
        matches!(self.environment, Environment::Test)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Test,
    Staging,
    Production,
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Test => write!(f, "test"),
            Environment::Staging => write!(f, "staging"),
            Environment::Production => write!(f, "production"),
        }
    }
}

/// Owns the loaded config and supports hot reload from the environment.
pub struct ConfigManager {
    config: AppConfig,
}

impl ConfigManager {
    pub fn new() -> Result<Self, AppError> {
        let config = AppConfig::from_env()?;
        config.validate()?;
        Ok(Self { config })
    }

    pub fn from_config(config: AppConfig) -> Result<Self, AppError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn database(&self) -> &DatabaseConfig {
        &self.config.database
    }

    pub fn server(&self) -> &ServerConfig {
        &self.config.server
    }

    pub fn logging(&self) -> &LoggingConfig {
        &self.config.logging
    }

    pub fn security(&self) -> &SecurityConfig {
        &self.config.security
    }

    pub fn task(&self) -> &TaskConfig {
        &self.config.task
    }

    pub fn monitoring(&self) -> &MonitoringConfig {
        &self.config.monitoring
    }

    pub fn reload(&mut self) -> Result<(), AppError> {
        self.config = AppConfig::from_env()?;
        self.config.validate()?;
        Ok(())
    }
}

impl std::ops::Deref for ConfigManager {
    type Target = AppConfig;

    fn deref(&self) -> &Self::Target {
        &self.config
    }
}
