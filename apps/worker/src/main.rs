//! Latchkey lock worker runtime.

#![forbid(unsafe_code)]

use std::env;
use std::sync::Arc;
use std::time::Duration;

use latchkey_application::{
    CallContext, DefaultLockFailStrategy, LockBackend, LockCoordinator, LockRequest,
    LockSettings, LockedExecutor,
};
use latchkey_core::{AppError, AppResult, LockName, OwnerContextId};
use latchkey_infrastructure::{InMemoryLockBackend, PostgresLockBackend, RedisLockBackend};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Eq)]
enum BackendConfig {
    Memory,
    Redis { redis_url: String, key_prefix: String },
    Postgres { database_url: String },
}

#[derive(Debug, Clone)]
struct WorkerConfig {
    backend: BackendConfig,
    worker_id: String,
    lock_name: LockName,
    lease_ms: u64,
    wait_ms: u64,
    retry_interval_ms: u64,
    work_ms: u64,
    iterations: u64,
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = WorkerConfig::load()?;
    let backend = build_backend(&config.backend).await?;
    let settings = LockSettings {
        retry_interval: Duration::from_millis(config.retry_interval_ms),
        default_lease_time: Duration::from_millis(config.lease_ms),
        default_wait_time: Duration::from_millis(config.wait_ms),
        ..LockSettings::default()
    };
    let coordinator = LockCoordinator::with_settings(backend, settings)?;
    let executor = LockedExecutor::new(coordinator.clone());

    info!(
        worker_id = %config.worker_id,
        backend = config.backend.name(),
        lock_name = %config.lock_name,
        lease_ms = config.lease_ms,
        wait_ms = config.wait_ms,
        "latchkey-worker started"
    );

    tokio::select! {
        () = run_rounds(&executor, &config) => {
            info!(worker_id = %config.worker_id, "latchkey-worker finished all rounds");
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(error) = signal {
                warn!(error = %error, "failed to listen for shutdown signal");
            }
            info!(worker_id = %config.worker_id, "shutdown signal received");
        }
    }

    coordinator.shutdown().await;
    Ok(())
}

async fn run_rounds(executor: &LockedExecutor, config: &WorkerConfig) {
    let owner = OwnerContextId::new();
    let call = CallContext::new(config.worker_id.as_str(), "guarded_work");
    let requests = [LockRequest::named(config.lock_name.clone())];
    let mut round = 0_u64;

    while config.iterations == 0 || round < config.iterations {
        round = round.saturating_add(1);

        let outcome = executor
            .execute(&owner, &call, &requests, &DefaultLockFailStrategy, || async {
                tokio::time::sleep(Duration::from_millis(config.work_ms)).await;
                Ok(round)
            })
            .await;

        match outcome {
            Ok(completed_round) => {
                info!(
                    worker_id = %config.worker_id,
                    lock_name = %config.lock_name,
                    round = completed_round,
                    "guarded work completed"
                );
            }
            Err(AppError::AcquisitionFailed { lock_name, .. }) => {
                info!(
                    worker_id = %config.worker_id,
                    lock_name = %lock_name,
                    round,
                    "lock busy, skipping round"
                );
            }
            Err(error) => {
                warn!(
                    worker_id = %config.worker_id,
                    round,
                    error = %error,
                    "guarded work failed"
                );
            }
        }

        tokio::time::sleep(Duration::from_millis(config.retry_interval_ms)).await;
    }
}

async fn build_backend(config: &BackendConfig) -> AppResult<Arc<dyn LockBackend>> {
    match config {
        BackendConfig::Memory => Ok(Arc::new(InMemoryLockBackend::new())),
        BackendConfig::Redis {
            redis_url,
            key_prefix,
        } => {
            let client = redis::Client::open(redis_url.as_str()).map_err(|error| {
                AppError::Validation(format!("invalid REDIS_URL '{redis_url}': {error}"))
            })?;
            Ok(Arc::new(RedisLockBackend::new(client, key_prefix.as_str())))
        }
        BackendConfig::Postgres { database_url } => {
            let pool = connect_and_migrate(database_url.as_str()).await?;
            Ok(Arc::new(PostgresLockBackend::new(pool)))
        }
    }
}

async fn connect_and_migrate(database_url: &str) -> AppResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .map_err(|error| {
            AppError::BackendUnavailable(format!("failed to connect to database: {error}"))
        })?;

    sqlx::migrate!("../../crates/infrastructure/migrations")
        .run(&pool)
        .await
        .map_err(|error| AppError::Internal(format!("failed to run migrations: {error}")))?;

    Ok(pool)
}

impl BackendConfig {
    fn load() -> AppResult<Self> {
        let kind = env::var("LATCHKEY_BACKEND").unwrap_or_else(|_| "memory".to_owned());

        match kind.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis {
                redis_url: required_env("REDIS_URL")?,
                key_prefix: env::var("LATCHKEY_REDIS_KEY_PREFIX")
                    .unwrap_or_else(|_| "latchkey:lock".to_owned()),
            }),
            "postgres" => Ok(Self::Postgres {
                database_url: required_env("DATABASE_URL")?,
            }),
            other => Err(AppError::Validation(format!(
                "LATCHKEY_BACKEND must be one of memory, redis, postgres; got '{other}'"
            ))),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Redis { .. } => "redis",
            Self::Postgres { .. } => "postgres",
        }
    }
}

impl WorkerConfig {
    fn load() -> AppResult<Self> {
        let backend = BackendConfig::load()?;
        let worker_id = env::var("LATCHKEY_WORKER_ID")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| format!("worker-{}", std::process::id()));
        let lock_name = LockName::new(
            env::var("LATCHKEY_LOCK_NAME").unwrap_or_else(|_| "latchkey.worker".to_owned()),
        )?;
        let lease_ms = parse_env_u64("LATCHKEY_LEASE_MS", 30_000)?;
        let wait_ms = parse_env_u64("LATCHKEY_WAIT_MS", 3_000)?;
        let retry_interval_ms = parse_env_u64("LATCHKEY_RETRY_INTERVAL_MS", 100)?;
        let work_ms = parse_env_u64("LATCHKEY_WORK_MS", 1_000)?;
        let iterations = parse_env_u64("LATCHKEY_ITERATIONS", 0)?;

        if lease_ms == 0 {
            return Err(AppError::Validation(
                "LATCHKEY_LEASE_MS must be greater than zero".to_owned(),
            ));
        }

        if retry_interval_ms == 0 {
            return Err(AppError::Validation(
                "LATCHKEY_RETRY_INTERVAL_MS must be greater than zero".to_owned(),
            ));
        }

        Ok(Self {
            backend,
            worker_id,
            lock_name,
            lease_ms,
            wait_ms,
            retry_interval_ms,
            work_ms,
            iterations,
        })
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn required_env(name: &str) -> AppResult<String> {
    env::var(name).map_err(|_| AppError::Validation(format!("{name} is required")))
}

fn parse_env_u64(name: &str, default: u64) -> AppResult<u64> {
    match env::var(name) {
        Ok(value) => value.parse::<u64>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}
