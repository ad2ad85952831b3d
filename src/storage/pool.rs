//! Connection pool construction. WAL mode, foreign keys, and a busy timeout
//! are set on every connection the pool hands out, and migrations run once
//! at startup against that same pool.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;

use crate::config::StorageConfig;
use crate::error::LcmResult;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub async fn connect(config: &StorageConfig) -> LcmResult<SqlitePool> {
    let uri = format!("sqlite://{}", config.database_path.display());
    let options = SqliteConnectOptions::from_str(&uri)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(std::time::Duration::from_millis(5_000));

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await?;

    MIGRATOR.run(&pool).await?;

    Ok(pool)
}

/// In-memory pool for tests: a single connection kept alive for the pool's
/// lifetime (`:memory:` databases are otherwise dropped when the last
/// connection closes), migrated the same way as a file-backed pool.
pub async fn connect_in_memory() -> LcmResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?
        .foreign_keys(true)
        .busy_timeout(std::time::Duration::from_millis(5_000));

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    MIGRATOR.run(&pool).await?;

    Ok(pool)
}
