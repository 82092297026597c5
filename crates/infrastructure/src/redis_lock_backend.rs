//! Redis-backed TTL lock backend.

use std::time::Duration;

use async_trait::async_trait;
use latchkey_application::{BackendState, LockBackend};
use latchkey_core::{AppError, AppResult, LockName, OwnerToken};
use redis::Script;
use redis::aio::MultiplexedConnection;

const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
else
  return 0
end
"#;

const RENEW_LOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
  return 0
end
"#;

/// Redis implementation of the lock backend.
///
/// Each lock is one key holding the owner token with a millisecond TTL.
/// Release and renewal compare the stored token before touching the key.
#[derive(Clone)]
pub struct RedisLockBackend {
    client: redis::Client,
    key_prefix: String,
}

impl RedisLockBackend {
    /// Creates one backend adapter.
    #[must_use]
    pub fn new(client: redis::Client, key_prefix: impl Into<String>) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
        }
    }

    fn key_for(&self, lock_name: &LockName) -> String {
        format!("{}:{lock_name}", self.key_prefix)
    }

    async fn connection(&self) -> AppResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|error| {
                AppError::BackendUnavailable(format!("failed to connect to redis: {error}"))
            })
    }
}

fn lease_millis(lease_time: Duration) -> AppResult<u64> {
    let millis = u64::try_from(lease_time.as_millis()).map_err(|_| {
        AppError::Validation("lock lease time does not fit in milliseconds".to_owned())
    })?;

    if millis == 0 {
        return Err(AppError::Validation(
            "lock lease time must be at least one millisecond".to_owned(),
        ));
    }

    Ok(millis)
}

#[async_trait]
impl LockBackend for RedisLockBackend {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn acquire(
        &self,
        lock_name: &LockName,
        owner_token: &OwnerToken,
        lease_time: Duration,
        _wait_time: Duration,
    ) -> AppResult<Option<BackendState>> {
        let lease_ms = lease_millis(lease_time)?;
        let mut connection = self.connection().await?;

        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key_for(lock_name))
            .arg(owner_token.as_str())
            .arg("NX")
            .arg("PX")
            .arg(lease_ms)
            .query_async(&mut connection)
            .await
            .map_err(|error| {
                AppError::BackendUnavailable(format!("failed to acquire redis lock: {error}"))
            })?;

        Ok(reply.map(|_| BackendState::empty()))
    }

    async fn release(
        &self,
        lock_name: &LockName,
        owner_token: &OwnerToken,
        _state: &BackendState,
    ) -> AppResult<bool> {
        let script = Script::new(RELEASE_LOCK_SCRIPT);
        let mut connection = self.connection().await?;

        let deleted = script
            .key(self.key_for(lock_name))
            .arg(owner_token.as_str())
            .invoke_async::<i32>(&mut connection)
            .await
            .map_err(|error| {
                AppError::BackendUnavailable(format!("failed to release redis lock: {error}"))
            })?;

        Ok(deleted > 0)
    }

    async fn renew(
        &self,
        lock_name: &LockName,
        owner_token: &OwnerToken,
        _state: &BackendState,
        lease_time: Duration,
    ) -> AppResult<bool> {
        let lease_ms = lease_millis(lease_time)?;
        let script = Script::new(RENEW_LOCK_SCRIPT);
        let mut connection = self.connection().await?;

        let renewed = script
            .key(self.key_for(lock_name))
            .arg(owner_token.as_str())
            .arg(lease_ms)
            .invoke_async::<i32>(&mut connection)
            .await
            .map_err(|error| {
                AppError::BackendUnavailable(format!("failed to renew redis lock: {error}"))
            })?;

        Ok(renewed > 0)
    }

    fn supports_owner_scoped_reentrancy(&self) -> bool {
        true
    }

    fn supports_renewal(&self) -> bool {
        true
    }
}
