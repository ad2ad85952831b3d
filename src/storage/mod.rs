//! Storage backend: a pooled SQLite connection with WAL journaling, foreign
//! keys, and busy-retry wrapping every write path. Everything above this
//! module talks to [`sqlx::SqlitePool`] plus [`with_busy_retry`]; nothing
//! outside `storage/` and `store.rs` should need to know SQLite is the
//! backing engine.

mod pool;
mod retry;

pub use pool::{connect, connect_in_memory};
pub use retry::{busy_ceiling_default, with_busy_retry};

pub type Pool = sqlx::SqlitePool;

/// Run `body` inside a transaction, committing on `Ok` and rolling back on
/// `Err`. sqlx already rolls back on drop, this just makes the intent
/// explicit at call sites.
pub async fn with_transaction<T, F>(pool: &Pool, body: F) -> crate::error::LcmResult<T>
where
    for<'c> F: FnOnce(
        &'c mut sqlx::Transaction<'_, sqlx::Sqlite>,
    ) -> futures::future::BoxFuture<'c, crate::error::LcmResult<T>>,
{
    let mut tx = pool.begin().await?;
    let result = body(&mut tx).await;
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            tx.rollback().await.ok();
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_in_memory_runs_migrations() {
        let pool = connect_in_memory().await.expect("connect");
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM conversations")
            .fetch_one(&pool)
            .await
            .expect("conversations table should exist");
        assert_eq!(row.0, 0);
    }

    #[tokio::test]
    async fn with_transaction_rolls_back_on_error() {
        let pool = connect_in_memory().await.expect("connect");
        let result: crate::error::LcmResult<()> = with_transaction(&pool, |tx| {
            Box::pin(async move {
                sqlx::query(
                    "INSERT INTO conversations (conversation_id, session_id, created_at_ms, updated_at_ms) VALUES ('conv_x', 's', 0, 0)",
                )
                .execute(&mut **tx)
                .await?;
                Err(crate::error::LcmError::validation("abort"))
            })
        })
        .await;
        assert!(result.is_err());

        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM conversations")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.0, 0);
    }
}
