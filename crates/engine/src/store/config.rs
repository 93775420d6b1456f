use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const MEMORY: &str = ":memory:";

/// Where instances, gates and logs are persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(rename = "type")]
    pub db_type: DatabaseType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sqlite_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,

    /// Pool size; an in-memory database always gets a single connection.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    Sqlite,
    Postgres,
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            db_type: DatabaseType::Sqlite,
            sqlite_path: Some(PathBuf::from("data/workflow.db")),
            connection_string: None,
            max_connections: default_max_connections(),
        }
    }
}

impl DatabaseConfig {
    /// In-memory SQLite, used by tests and dry runs.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: Some(PathBuf::from(MEMORY)),
            max_connections: 1,
            ..Self::default()
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.db_type == DatabaseType::Sqlite && self.sqlite_path.as_deref() == Some(std::path::Path::new(MEMORY))
    }

    /// Connections the pool may open.
    pub fn pool_size(&self) -> u32 {
        if self.is_in_memory() {
            1
        } else {
            self.max_connections.max(1)
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self.db_type {
            DatabaseType::Sqlite if self.sqlite_path.is_none() => {
                Err("SQLITE_PATH must be set when using SQLite".to_string())
            }
            DatabaseType::Postgres if self.connection_string.is_none() => {
                Err("DATABASE_URL must be set when using PostgreSQL".to_string())
            }
            _ if self.max_connections == 0 => Err("DATABASE_MAX_CONNECTIONS must be greater than zero".to_string()),
            _ => Ok(()),
        }
    }
}
