use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::store::{DatabaseConfig, DatabaseType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Optional JSON file describing members, permissions and roles.
    #[serde(default)]
    pub directory_path: Option<PathBuf>,
    /// Application settings readable from workflow params (`app_setting`, `{{setting:key}}`).
    #[serde(default)]
    pub settings: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on node executions in a single drive call.
    pub max_steps: usize,
    /// Base delay for the exponential backoff between node retry attempts.
    pub retry_backoff_ms: u64,
    /// Waiting instances read per page by the scheduled scan.
    #[serde(default = "default_scan_page_size")]
    pub scan_page_size: i64,
}

fn default_scan_page_size() -> i64 {
    500
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: 200,
            retry_backoff_ms: 250,
            scan_page_size: default_scan_page_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub scan_interval_secs: u64,
    pub scan_timeout_secs: u64,
    pub resume_max_retries: u32,
    pub queue_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 60,
            scan_timeout_secs: 300,
            resume_max_retries: 3,
            queue_capacity: 256,
        }
    }
}

const SETTING_PREFIX: &str = "WORKFLOW_SETTING_";

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn load() -> crate::Result<Self> {
        // Load environment variables from .env file if it exists
        let _ = dotenvy::dotenv();

        let engine_defaults = EngineConfig::default();
        let scheduler_defaults = SchedulerConfig::default();
        let database_defaults = DatabaseConfig::default();

        let settings = std::env::vars()
            .filter_map(|(key, value)| {
                key.strip_prefix(SETTING_PREFIX)
                    .map(|name| (name.to_lowercase(), value))
            })
            .collect();

        let config = Config {
            server: ServerConfig {
                addr: std::env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            },
            database: DatabaseConfig {
                db_type: match std::env::var("DATABASE_TYPE")
                    .unwrap_or_else(|_| "sqlite".to_string())
                    .to_lowercase()
                    .as_str()
                {
                    "postgres" => DatabaseType::Postgres,
                    _ => DatabaseType::Sqlite,
                },
                sqlite_path: std::env::var("SQLITE_PATH")
                    .map(PathBuf::from)
                    .ok()
                    .or_else(|| Some(PathBuf::from("data/workflow.db"))),
                connection_string: std::env::var("DATABASE_URL").ok(),
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", database_defaults.max_connections),
            },
            engine: EngineConfig {
                max_steps: env_or("WORKFLOW_MAX_STEPS", engine_defaults.max_steps),
                retry_backoff_ms: env_or("WORKFLOW_RETRY_BACKOFF_MS", engine_defaults.retry_backoff_ms),
                scan_page_size: env_or("WORKFLOW_SCAN_PAGE_SIZE", engine_defaults.scan_page_size),
            },
            scheduler: SchedulerConfig {
                scan_interval_secs: env_or("WORKFLOW_SCAN_INTERVAL_SECS", scheduler_defaults.scan_interval_secs),
                scan_timeout_secs: env_or("WORKFLOW_SCAN_TIMEOUT_SECS", scheduler_defaults.scan_timeout_secs),
                resume_max_retries: env_or("WORKFLOW_RESUME_MAX_RETRIES", scheduler_defaults.resume_max_retries),
                queue_capacity: env_or("WORKFLOW_QUEUE_CAPACITY", scheduler_defaults.queue_capacity),
            },
            directory_path: std::env::var("WORKFLOW_DIRECTORY_PATH").ok().map(PathBuf::from),
            settings,
        };

        config.database.validate().map_err(crate::Error::Config)?;

        if config.engine.max_steps == 0 {
            return Err(crate::Error::Config(
                "WORKFLOW_MAX_STEPS must be greater than zero".to_string(),
            ));
        }
        if config.engine.scan_page_size <= 0 {
            return Err(crate::Error::Config(
                "WORKFLOW_SCAN_PAGE_SIZE must be greater than zero".to_string(),
            ));
        }
        if config.scheduler.queue_capacity == 0 {
            return Err(crate::Error::Config(
                "WORKFLOW_QUEUE_CAPACITY must be greater than zero".to_string(),
            ));
        }

        Ok(config)
    }

    /// Defaults over an in-memory SQLite database, for tests and dry runs.
    pub fn in_memory() -> Self {
        Self {
            database: DatabaseConfig::in_memory(),
            ..Self::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                addr: "0.0.0.0:8080".to_string(),
            },
            database: DatabaseConfig::default(),
            engine: EngineConfig::default(),
            scheduler: SchedulerConfig::default(),
            directory_path: None,
            settings: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.engine.max_steps, 200);
        assert_eq!(config.scheduler.resume_max_retries, 3);
        assert_eq!(config.scheduler.scan_timeout_secs, 300);
        assert!(config.database.validate().is_ok());
    }
}
