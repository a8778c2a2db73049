use anyhow::Result;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::store::Repositories;

#[cfg(feature = "database")]
/// Open repositories backed by SQLite when a database is configured
pub async fn init_repositories(database: Option<&DatabaseConfig>) -> Result<Repositories> {
    match database {
        Some(db_config) => {
            info!("Initializing database at {}", db_config.url);
            let store = crate::store::sqlite::SqliteStore::connect(db_config).await?;
            info!("Database repositories initialized successfully");
            Ok(Repositories::from_store(std::sync::Arc::new(store)))
        }
        None => {
            info!("Database not configured, using in-memory repositories");
            Ok(Repositories::in_memory())
        }
    }
}

// Without the database feature every run keeps its state in memory
#[cfg(not(feature = "database"))]
pub async fn init_repositories(database: Option<&DatabaseConfig>) -> Result<Repositories> {
    if database.is_some() {
        info!("Database feature not enabled, ignoring database configuration");
    }
    Ok(Repositories::in_memory())
}
