//! # Configuration Management
//!
//! Typed configuration for the bridge, loaded from a TOML file with
//! `BRIDGE_*` environment overrides layered on top, then validated as a
//! whole. Every group has complete defaults so an empty file (or no file)
//! yields a runnable development setup.
//!
//! ## Groups
//!
//! - `server`: bind address, mode, timeouts, CORS
//! - `executor`: where the plugin executor listens and its call deadline
//! - `runtime`: interpreter and plugin directories handed to the executor
//!   process manager (opaque to the core)
//! - `logging`: level, format, optional log file, ring size
//! - `storage`: SQLite file, pool size, journaling flags, retention
//! - `tracking`: capture budgets, failure policy, intervals
//! - `workers`: pool sizing
//! - `directories`: working/log/data roots (relative paths resolve
//!   against the working directory)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {message}")]
    Validation { message: String },

    #[error("invalid duration {value:?}: expected forms like \"500ms\", \"30s\", \"5m\", \"2h\"")]
    Duration { value: String },
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub server: ServerConfig,
    pub executor: ExecutorSection,
    pub runtime: RuntimeConfig,
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub tracking: TrackingSection,
    pub workers: WorkersSection,
    pub directories: DirectoriesConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// 0 asks the OS for a free port.
    pub port: u16,
    /// `debug` or `release`; release enables rate limiting and HSTS.
    pub mode: String,
    pub read_timeout: String,
    pub write_timeout: String,
    pub header_timeout: String,
    pub idle_timeout: String,
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            mode: "debug".to_string(),
            read_timeout: "30s".to_string(),
            write_timeout: "30s".to_string(),
            header_timeout: "10s".to_string(),
            idle_timeout: "120s".to_string(),
            cors: CorsConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn is_release(&self) -> bool {
        self.mode == "release"
    }
}

/// CORS settings applied by the middleware stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub expose_headers: Vec<String>,
    pub allow_credentials: bool,
    pub max_age_s: Option<u64>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_origins: vec!["*".to_string()],
            allowed_methods: vec![
                "GET".to_string(),
                "POST".to_string(),
                "PUT".to_string(),
                "DELETE".to_string(),
                "OPTIONS".to_string(),
            ],
            allowed_headers: vec!["Content-Type".to_string(), "X-Request-ID".to_string()],
            expose_headers: vec!["X-Request-ID".to_string(), "X-Execution-Time".to_string()],
            allow_credentials: false,
            max_age_s: Some(3600),
        }
    }
}

/// Where the plugin executor listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub host: String,
    pub port: u16,
    /// Per-call deadline for plugin invocations, seconds.
    pub timeout_s: u64,
    /// Health probe cadence, seconds.
    pub health_interval_s: u64,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 50051,
            timeout_s: 30,
            health_interval_s: 30,
        }
    }
}

impl ExecutorSection {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_s.max(1))
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_s.max(1))
    }
}

/// Plugin runtime selection, passed through to the executor's process
/// manager. The core never reads plugin sources itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub interpreter: String,
    pub plugin_dirs: Vec<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            plugin_dirs: vec![PathBuf::from("plugins")],
        }
    }
}

/// Logging and log-ring settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// tracing filter directive, e.g. `info` or `webhook_bridge=debug`.
    pub level: String,
    /// `text` or `json`.
    pub format: String,
    /// Shadow file name under the log directory.
    pub file: String,
    /// Rotation policy applied by the log shipper (`daily`, `size`, or
    /// `none`); the bridge only appends.
    pub rotation: String,
    /// Maximum entries kept in the in-memory ring.
    pub max_ring_size: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            file: "bridge.log.jsonl".to_string(),
            rotation: "daily".to_string(),
            max_ring_size: 1000,
        }
    }
}

/// Execution store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Only `sqlite` is supported.
    pub backend: String,
    pub sqlite: SqliteSection,
    /// Execution records older than this are swept.
    pub retention_days: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            sqlite: SqliteSection::default(),
            retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteSection {
    pub path: PathBuf,
    pub max_connections: u32,
    pub wal: bool,
    pub foreign_keys: bool,
}

impl Default for SqliteSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("webhook_bridge.db"),
            max_connections: 4,
            wal: true,
            foreign_keys: true,
        }
    }
}

/// Execution tracking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingSection {
    pub enabled: bool,
    /// When true, storage failures fail the webhook request.
    pub fail_requests_on_storage_error: bool,
    pub max_input_bytes: usize,
    pub max_output_bytes: usize,
    pub cleanup_interval_s: u64,
    pub stats_flush_interval_s: u64,
}

impl Default for TrackingSection {
    fn default() -> Self {
        Self {
            enabled: true,
            fail_requests_on_storage_error: false,
            max_input_bytes: 64 * 1024,
            max_output_bytes: 64 * 1024,
            cleanup_interval_s: 3600,
            stats_flush_interval_s: 60,
        }
    }
}

/// Worker pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersSection {
    pub count: usize,
    pub queue_capacity: usize,
    pub default_max_retry: u32,
}

impl Default for WorkersSection {
    fn default() -> Self {
        Self {
            count: 4,
            queue_capacity: 256,
            default_max_retry: 0,
        }
    }
}

/// Directory roots. Relative `log`/`data` paths resolve against `working`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoriesConfig {
    pub working: PathBuf,
    pub log: PathBuf,
    pub data: PathBuf,
}

impl Default for DirectoriesConfig {
    fn default() -> Self {
        Self {
            working: PathBuf::from("."),
            log: PathBuf::from("logs"),
            data: PathBuf::from("data"),
        }
    }
}

impl BridgeConfig {
    /// Load configuration: file (optional) layered under `BRIDGE_*`
    /// environment overrides, e.g. `BRIDGE_SERVER__PORT=9090`.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("BRIDGE")
                .separator("__")
                .try_parsing(true),
        );

        let loaded: BridgeConfig = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Cross-field validation. Called by [`Self::load`]; call again after
    /// mutating a loaded config in place.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.mode != "debug" && self.server.mode != "release" {
            return Err(ConfigError::Validation {
                message: format!("server.mode must be debug or release, got {:?}", self.server.mode),
            });
        }
        if self.storage.backend != "sqlite" {
            return Err(ConfigError::Validation {
                message: format!("storage.backend must be sqlite, got {:?}", self.storage.backend),
            });
        }
        if self.storage.retention_days < 1 {
            return Err(ConfigError::Validation {
                message: "storage.retention_days must be at least 1".to_string(),
            });
        }
        if self.tracking.max_input_bytes == 0 || self.tracking.max_output_bytes == 0 {
            return Err(ConfigError::Validation {
                message: "tracking capture budgets must be positive".to_string(),
            });
        }
        if self.workers.count == 0 {
            return Err(ConfigError::Validation {
                message: "workers.count must be at least 1".to_string(),
            });
        }
        if self.workers.queue_capacity == 0 {
            return Err(ConfigError::Validation {
                message: "workers.queue_capacity must be at least 1".to_string(),
            });
        }
        if self.logging.format != "text" && self.logging.format != "json" {
            return Err(ConfigError::Validation {
                message: format!("logging.format must be text or json, got {:?}", self.logging.format),
            });
        }
        for field in [
            &self.server.read_timeout,
            &self.server.write_timeout,
            &self.server.header_timeout,
            &self.server.idle_timeout,
        ] {
            parse_duration(field)?;
        }
        Ok(())
    }

    /// Log directory, resolved against the working directory.
    pub fn log_dir(&self) -> PathBuf {
        resolve(&self.directories.working, &self.directories.log)
    }

    /// Data directory, resolved against the working directory.
    pub fn data_dir(&self) -> PathBuf {
        resolve(&self.directories.working, &self.directories.data)
    }

    /// Full path of the log shadow file.
    pub fn log_shadow_path(&self) -> PathBuf {
        self.log_dir().join(&self.logging.file)
    }

    /// Full path of the SQLite database file.
    pub fn sqlite_path(&self) -> PathBuf {
        resolve(&self.directories.working, &self.storage.sqlite.path)
    }

    pub fn read_timeout(&self) -> Duration {
        parse_duration(&self.server.read_timeout).unwrap_or(Duration::from_secs(30))
    }
}

fn resolve(working: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        working.join(path)
    }
}

/// Parse durations in the `"500ms"` / `"30s"` / `"5m"` / `"2h"` forms.
pub fn parse_duration(value: &str) -> Result<Duration, ConfigError> {
    let value = value.trim();
    let err = || ConfigError::Duration {
        value: value.to_string(),
    };

    let (digits, unit) = value
        .find(|c: char| !c.is_ascii_digit())
        .map(|idx| value.split_at(idx))
        .ok_or_else(err)?;
    let amount: u64 = digits.parse().map_err(|_| err())?;

    match unit {
        "ms" => Ok(Duration::from_millis(amount)),
        "s" => Ok(Duration::from_secs(amount)),
        "m" => Ok(Duration::from_secs(amount * 60)),
        "h" => Ok(Duration::from_secs(amount * 3600)),
        _ => Err(err()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        BridgeConfig::default().validate().unwrap();
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("30").is_err());
        assert!(parse_duration("30x").is_err());
        assert!(parse_duration("abc").is_err());
    }

    #[test]
    fn invalid_mode_rejected() {
        let mut config = BridgeConfig::default();
        config.server.mode = "production".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_backend_rejected() {
        let mut config = BridgeConfig::default();
        config.storage.backend = "postgres".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_workers_rejected() {
        let mut config = BridgeConfig::default();
        config.workers.count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn relative_directories_resolve_against_working() {
        let mut config = BridgeConfig::default();
        config.directories.working = PathBuf::from("/srv/bridge");
        assert_eq!(config.log_dir(), PathBuf::from("/srv/bridge/logs"));
        assert_eq!(config.data_dir(), PathBuf::from("/srv/bridge/data"));
        assert_eq!(
            config.sqlite_path(),
            PathBuf::from("/srv/bridge/webhook_bridge.db")
        );

        config.directories.data = PathBuf::from("/var/lib/bridge");
        assert_eq!(config.data_dir(), PathBuf::from("/var/lib/bridge"));
    }

    #[test]
    fn executor_base_url() {
        let config = BridgeConfig::default();
        assert_eq!(config.executor.base_url(), "http://127.0.0.1:50051");
        assert_eq!(config.executor.timeout(), Duration::from_secs(30));
    }
}
