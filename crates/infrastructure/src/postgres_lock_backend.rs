use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use latchkey_application::{BackendState, LockBackend};
use latchkey_core::{AppError, AppResult, LockName, OwnerToken};
use sqlx::PgPool;


/// PostgreSQL-backed lock backend storing one row per held lock.
///
/// Expiry is judged against this process's clock, so hosts sharing a table
/// need reasonably synchronized clocks.
#[derive(Clone)]
pub struct PostgresLockBackend {
    pool: PgPool,
}

impl PostgresLockBackend {
    /// Creates a backend with the provided connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the lock table when it does not exist yet.
    pub async fn ensure_schema(&self) -> AppResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS distributed_locks (
                lock_name TEXT PRIMARY KEY,
                locked_by TEXT NOT NULL,
                lock_time TIMESTAMPTZ NOT NULL,
                expire_time TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::BackendUnavailable(format!("failed to create lock table: {error}"))
        })?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_distributed_locks_expire_time
            ON distributed_locks (expire_time)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::BackendUnavailable(format!("failed to create lock expiry index: {error}"))
        })?;

        Ok(())
    }
}

fn expiry_after(now: DateTime<Utc>, lease_time: Duration) -> AppResult<DateTime<Utc>> {
    TimeDelta::from_std(lease_time)
        .ok()
        .and_then(|lease| now.checked_add_signed(lease))
        .ok_or_else(|| AppError::Validation("lock lease time is out of range".to_owned()))
}

#[async_trait]
impl LockBackend for PostgresLockBackend {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn acquire(
        &self,
        lock_name: &LockName,
        owner_token: &OwnerToken,
        lease_time: Duration,
        _wait_time: Duration,
    ) -> AppResult<Option<BackendState>> {
        let mut transaction = self.pool.begin().await.map_err(|error| {
            AppError::BackendUnavailable(format!("failed to begin transaction: {error}"))
        })?;

        let current_expiry = sqlx::query_scalar::<_, DateTime<Utc>>(
            r#"
            SELECT expire_time
            FROM distributed_locks
            WHERE lock_name = $1
            FOR UPDATE
            "#,
        )
        .bind(lock_name.as_str())
        .fetch_optional(&mut *transaction)
        .await
        .map_err(|error| {
            AppError::BackendUnavailable(format!(
                "failed to read lock '{lock_name}': {error}"
            ))
        })?;

        let now = Utc::now();
        match current_expiry {
            Some(expire_time) if expire_time >= now => {
                transaction.rollback().await.map_err(|error| {
                    AppError::BackendUnavailable(format!(
                        "failed to roll back transaction: {error}"
                    ))
                })?;
                return Ok(None);
            }
            Some(_) => {
                sqlx::query(
                    r#"
                    DELETE FROM distributed_locks
                    WHERE lock_name = $1 AND expire_time < $2
                    "#,
                )
                .bind(lock_name.as_str())
                .bind(now)
                .execute(&mut *transaction)
                .await
                .map_err(|error| {
                    AppError::BackendUnavailable(format!(
                        "failed to delete expired lock '{lock_name}': {error}"
                    ))
                })?;
            }
            None => {}
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO distributed_locks (lock_name, locked_by, lock_time, expire_time)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (lock_name) DO NOTHING
            "#,
        )
        .bind(lock_name.as_str())
        .bind(owner_token.as_str())
        .bind(now)
        .bind(expiry_after(now, lease_time)?)
        .execute(&mut *transaction)
        .await
        .map_err(|error| {
            AppError::BackendUnavailable(format!(
                "failed to insert lock '{lock_name}': {error}"
            ))
        })?
        .rows_affected()
            > 0;

        transaction.commit().await.map_err(|error| {
            AppError::BackendUnavailable(format!("failed to commit transaction: {error}"))
        })?;

        Ok(inserted.then(BackendState::empty))
    }

    async fn release(
        &self,
        lock_name: &LockName,
        owner_token: &OwnerToken,
        _state: &BackendState,
    ) -> AppResult<bool> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM distributed_locks
            WHERE lock_name = $1 AND locked_by = $2
            "#,
        )
        .bind(lock_name.as_str())
        .bind(owner_token.as_str())
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::BackendUnavailable(format!(
                "failed to release lock '{lock_name}': {error}"
            ))
        })?
        .rows_affected();

        Ok(deleted > 0)
    }

    async fn renew(
        &self,
        lock_name: &LockName,
        owner_token: &OwnerToken,
        _state: &BackendState,
        lease_time: Duration,
    ) -> AppResult<bool> {
        let expire_time = expiry_after(Utc::now(), lease_time)?;
        let updated = sqlx::query(
            r#"
            UPDATE distributed_locks
            SET expire_time = $1
            WHERE lock_name = $2 AND locked_by = $3
            "#,
        )
        .bind(expire_time)
        .bind(lock_name.as_str())
        .bind(owner_token.as_str())
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::BackendUnavailable(format!(
                "failed to extend lock '{lock_name}': {error}"
            ))
        })?
        .rows_affected();

        Ok(updated > 0)
    }

    fn supports_owner_scoped_reentrancy(&self) -> bool {
        true
    }

    fn supports_renewal(&self) -> bool {
        true
    }
}
