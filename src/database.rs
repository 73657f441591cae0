use std::str::FromStr;

use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use thiserror::Error;
use tracing::info;

use crate::config::AppConfig;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    Connection(#[from] sqlx::Error),
    #[error("Invalid database URL: {0}")]
    InvalidUrl(String),
}

/// Open a SQLite pool with WAL journaling and a busy timeout.
pub async fn create_pool(url: &str) -> Result<SqlitePool, DatabaseError> {
    let connect_options = SqliteConnectOptions::from_str(url)
        .map_err(|e| DatabaseError::InvalidUrl(format!("Invalid database URL: {}", e)))?
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(5))
        .create_if_missing(true);

    let pool = SqlitePool::connect_with(connect_options).await?;

    Ok(pool)
}

/// Create the schema if it is not there yet.
///
/// One row per live code; `key` is the hashed retrieval key (NULL when the
/// entry is unprotected), `n` the remaining downloads, `time` the absolute
/// expiry as an RFC 3339 string.
pub async fn create_tables(pool: &SqlitePool) -> Result<(), DatabaseError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entries (
            code TEXT PRIMARY KEY,
            content_type TEXT NOT NULL,
            filename TEXT NOT NULL,
            key TEXT,
            n INTEGER NOT NULL,
            time TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Initialize the metadata database: pool plus schema.
pub async fn initialize_database(config: &AppConfig) -> Result<SqlitePool, DatabaseError> {
    info!("Initializing metadata database");

    let pool = create_pool(&config.database.url).await?;
    create_tables(&pool).await?;

    info!("Database initialization completed");

    Ok(pool)
}
