//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tenant_pool::config::{PoolInitPolicy, PoolOptions, RetryPolicy};
use tenant_pool::db::{PoolRegistry, TransactionExecutor};
use tenant_pool::models::{ConnectionHelper, StaticConnectionHelper, TenantConfig, TenantKey};
use tenant_pool::{DbError, DbResult};

/// Helper for a SQLite tenant stored in `dir`.
pub fn sqlite_helper(dir: &TempDir, tenant: &str) -> StaticConnectionHelper {
    StaticConnectionHelper::new(tenant, sqlite_config(dir, &format!("{tenant}.db")))
}

pub fn sqlite_config(dir: &TempDir, file: &str) -> TenantConfig {
    TenantConfig::sqlite(dir.path().join(file).to_string_lossy().into_owned())
}

/// A tenant whose database file lives in a directory that does not exist.
pub fn unreachable_helper(dir: &TempDir, tenant: &str) -> StaticConnectionHelper {
    StaticConnectionHelper::new(tenant, sqlite_config(dir, &format!("missing/{tenant}.db")))
}

/// Executor with a short backoff so retry tests run quickly.
pub fn executor_with(options: PoolOptions, max_retry_attempts: u32) -> TransactionExecutor {
    let registry = Arc::new(PoolRegistry::with_options(
        options,
        PoolInitPolicy {
            backoff: Duration::from_millis(20),
            ..Default::default()
        },
    ));
    TransactionExecutor::new(
        registry,
        RetryPolicy {
            max_retry_attempts,
            retry_backoff: Duration::from_millis(10),
        },
    )
}

pub fn executor(max_retry_attempts: u32) -> TransactionExecutor {
    executor_with(PoolOptions::default(), max_retry_attempts)
}

/// A connection-level failure, as a dropped connection would report it.
pub fn transient_error() -> DbError {
    DbError::connection(
        "server closed the connection unexpectedly",
        "Retry on a fresh connection",
    )
}

pub async fn create_items_table(executor: &TransactionExecutor, helper: &dyn ConnectionHelper) {
    executor
        .run_transaction(helper, |session| {
            Box::pin(async move {
                session
                    .execute(
                        "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE)",
                        &[],
                    )
                    .await?;
                Ok::<_, DbError>(())
            })
        })
        .await
        .expect("create table");
}

pub async fn count_items(executor: &TransactionExecutor, helper: &dyn ConnectionHelper) -> i64 {
    executor
        .run_transaction(helper, |session| {
            Box::pin(async move {
                let cursor = session
                    .execute_query("SELECT COUNT(*) AS n FROM items", &[])
                    .await?;
                let row = cursor
                    .fetch_one()
                    .ok_or_else(|| DbError::internal("no count row"))?;
                Ok::<_, DbError>(row["n"].as_i64().unwrap_or(-1))
            })
        })
        .await
        .expect("count items")
}

/// Helper that counts how often its configuration is requested.
pub struct CountingHelper {
    key: TenantKey,
    config: TenantConfig,
    calls: AtomicUsize,
}

impl CountingHelper {
    pub fn new(key: &str, config: TenantConfig) -> Self {
        Self {
            key: TenantKey::from(key),
            config,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ConnectionHelper for CountingHelper {
    fn key(&self) -> TenantKey {
        self.key.clone()
    }

    fn connection_config(&self) -> DbResult<TenantConfig> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.config.clone())
    }
}
