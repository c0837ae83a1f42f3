//! Postgres-backed lock table.
//!
//! Each held lock is one row in `courier_saga_locks`. A row carries a lease expiry so a
//! crashed process cannot hold a bucket forever: an expired row may be taken over by
//! the next caller.
//!
//! ## Error Mapping
//!
//! Every SQLx error becomes [`LockError::Backend`] with the operation name prefixed.
//! [`PollingLock`](super::PollingLock) propagates backend errors, which the exclusive
//! access step reports as a failed delivery attempt.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tracing::instrument;

use super::lock::LockError;
use super::lock_table::LockTable;

/// Lease-based lock rows in Postgres.
#[derive(Debug, Clone)]
pub struct PostgresLockTable {
    pool: Arc<PgPool>,
    lease: Duration,
}

impl PostgresLockTable {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            lease: Duration::from_secs(60),
        }
    }

    /// How long a row stays valid without being released. Must exceed the longest
    /// expected handler run.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Create the lock table if it does not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), LockError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS courier_saga_locks (
                lock_key   TEXT PRIMARY KEY,
                owner      TEXT NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    /// Insert the row, or take it over when the current lease has expired.
    #[instrument(skip_all, fields(lock_key = %key, owner = %owner), err)]
    pub async fn try_acquire_row(&self, key: &str, owner: &str) -> Result<bool, LockError> {
        let lease = chrono::Duration::from_std(self.lease)
            .map_err(|e| LockError::Backend(format!("invalid lease: {e}")))?;
        let expires_at = Utc::now() + lease;

        let result = sqlx::query(
            r#"
            INSERT INTO courier_saga_locks (lock_key, owner, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (lock_key) DO UPDATE
                SET owner = EXCLUDED.owner, expires_at = EXCLUDED.expires_at
                WHERE courier_saga_locks.expires_at < now()
            "#,
        )
        .bind(key)
        .bind(owner)
        .bind(expires_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("try_acquire", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip_all, fields(lock_key = %key, owner = %owner), err)]
    pub async fn release_row(&self, key: &str, owner: &str) -> Result<(), LockError> {
        sqlx::query("DELETE FROM courier_saga_locks WHERE lock_key = $1 AND owner = $2")
            .bind(key)
            .bind(owner)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("release", e))?;
        Ok(())
    }
}

#[async_trait]
impl LockTable for PostgresLockTable {
    async fn try_acquire(&self, key: &str, owner: &str) -> Result<bool, LockError> {
        self.try_acquire_row(key, owner).await
    }

    async fn release(&self, key: &str, owner: &str) -> Result<(), LockError> {
        self.release_row(key, owner).await
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LockError {
    LockError::Backend(format!("{operation}: {err}"))
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::sagas::lock::ExclusiveAccessLock;
    use crate::sagas::lock_table::PollingLock;

    #[tokio::test]
    #[ignore = "requires DATABASE_URL pointing at a Postgres instance"]
    async fn rows_are_exclusive_per_owner() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL");
        let pool = PgPool::connect(&url).await.unwrap();
        let table = PostgresLockTable::new(pool).with_lease(Duration::from_secs(5));
        table.ensure_schema().await.unwrap();

        let key = format!("test-{}", uuid::Uuid::now_v7());
        assert!(table.try_acquire(&key, "a").await.unwrap());
        assert!(!table.try_acquire(&key, "b").await.unwrap());

        table.release(&key, "b").await.unwrap();
        assert!(!table.try_acquire(&key, "b").await.unwrap());

        table.release(&key, "a").await.unwrap();
        assert!(table.try_acquire(&key, "b").await.unwrap());
        table.release(&key, "b").await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL pointing at a Postgres instance"]
    async fn expired_leases_are_taken_over() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL");
        let pool = PgPool::connect(&url).await.unwrap();
        let table = PostgresLockTable::new(pool).with_lease(Duration::from_millis(50));
        table.ensure_schema().await.unwrap();

        let crashed = PollingLock::new(table.clone(), format!("crashed-{}", uuid::Uuid::now_v7()));
        let survivor = PollingLock::new(table, format!("survivor-{}", uuid::Uuid::now_v7()));
        let bucket = (uuid::Uuid::now_v7().as_u128() % 1_000_000) as usize;

        crashed.acquire(bucket, &CancellationToken::new()).await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            survivor.acquire(bucket, &CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap();
        survivor.release(bucket).await.unwrap();
    }
}
