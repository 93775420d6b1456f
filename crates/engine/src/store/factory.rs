use crate::store::{DatabaseConfig, DatabaseType, PostgresStore, SqliteStore, Store};
use std::sync::Arc;

/// Connects to the configured backend and runs migrations.
pub async fn create_store(config: &DatabaseConfig) -> crate::Result<Arc<dyn Store>> {
    let store: Arc<dyn Store> = match config.db_type {
        DatabaseType::Sqlite => {
            let path = config
                .sqlite_path
                .as_ref()
                .ok_or_else(|| crate::Error::Config("SQLite path not configured".into()))?
                .to_str()
                .ok_or_else(|| crate::Error::Config("SQLite path is not valid UTF-8".into()))?;
            Arc::new(SqliteStore::new(path, config.pool_size()).await?)
        }
        DatabaseType::Postgres => {
            let connection_string = config
                .connection_string
                .as_ref()
                .ok_or_else(|| crate::Error::Config("PostgreSQL connection string not configured".into()))?;
            Arc::new(PostgresStore::new(connection_string, config.pool_size()).await?)
        }
    };

    store.init().await?;
    Ok(store)
}
