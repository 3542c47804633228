//! Per-tenant connection pools.
//!
//! Each tenant gets a database-specific pool (MySqlPool, PgPool, SqlitePool)
//! wrapped in a [`PoolHandle`] that hands out [`Session`]s and keeps usage
//! counters.

use crate::cancel::CancellationToken;
use crate::config::{AcquirePolicy, KeepAliveOptions, PoolOptions};
use crate::db::session::{Session, SessionConnection};
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, TenantConfig, TenantKey};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::Serialize;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{MySqlPool, PgPool, SqlitePool};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Acquire bound used when the policy waits forever. sqlx needs a finite value.
const UNBOUNDED_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Database-specific connection pool (avoids AnyPool limitations).
#[derive(Debug, Clone)]
pub enum DbPool {
    MySql(MySqlPool),
    Postgres(PgPool),
    SQLite(SqlitePool),
}

impl DbPool {
    pub async fn close(&self) {
        impl_db_dispatch!(self, {
            MySql(pool) => pool.close().await,
            Postgres(pool) => pool.close().await,
            SQLite(pool) => pool.close().await,
        })
    }

    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbPool::MySql(_) => DatabaseType::MySQL,
            DbPool::Postgres(_) => DatabaseType::PostgreSQL,
            DbPool::SQLite(_) => DatabaseType::SQLite,
        }
    }

    /// Open connections, idle or in use.
    pub fn size(&self) -> u32 {
        impl_db_dispatch!(self, {
            MySql(pool) => pool.size(),
            Postgres(pool) => pool.size(),
            SQLite(pool) => pool.size(),
        })
    }

    pub fn num_idle(&self) -> usize {
        impl_db_dispatch!(self, {
            MySql(pool) => pool.num_idle(),
            Postgres(pool) => pool.num_idle(),
            SQLite(pool) => pool.num_idle(),
        })
    }

    pub fn is_closed(&self) -> bool {
        impl_db_dispatch!(self, {
            MySql(pool) => pool.is_closed(),
            Postgres(pool) => pool.is_closed(),
            SQLite(pool) => pool.is_closed(),
        })
    }
}

#[derive(Debug, Default)]
struct StatCounters {
    checked_out: AtomicU64,
    released: AtomicU64,
    discarded: AtomicU64,
}

/// Snapshot of a pool's session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Sessions handed out.
    pub checked_out: u64,
    /// Sessions returned to the pool for reuse.
    pub released: u64,
    /// Sessions whose connection was closed instead of reused.
    pub discarded: u64,
    /// Open connections, idle or in use.
    pub size: u32,
    pub idle: usize,
}

impl PoolStats {
    /// Sessions currently checked out and not yet returned.
    pub fn outstanding(&self) -> u64 {
        self.checked_out
            .saturating_sub(self.released + self.discarded)
    }
}

/// One tenant's pool plus the policy used to check sessions out of it.
#[derive(Debug)]
pub struct PoolHandle {
    tenant: TenantKey,
    pool: DbPool,
    acquire_policy: AcquirePolicy,
    max_connections: u32,
    created_at: DateTime<Utc>,
    counters: StatCounters,
}

impl PoolHandle {
    pub(crate) fn new(
        tenant: TenantKey,
        pool: DbPool,
        acquire_policy: AcquirePolicy,
        max_connections: u32,
    ) -> Self {
        Self {
            tenant,
            pool,
            acquire_policy,
            max_connections,
            created_at: Utc::now(),
            counters: StatCounters::default(),
        }
    }

    pub fn tenant(&self) -> &TenantKey {
        &self.tenant
    }

    pub fn db_type(&self) -> DatabaseType {
        self.pool.db_type()
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn acquire_policy(&self) -> AcquirePolicy {
        self.acquire_policy
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            checked_out: self.counters.checked_out.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            size: self.pool.size(),
            idle: self.pool.num_idle(),
        }
    }

    pub(crate) fn record_released(&self) {
        self.counters.released.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_discarded(&self) {
        self.counters.discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Check a session out of the pool.
    ///
    /// Blocking acquires are bounded by the pool's acquire timeout and abort
    /// with [`DbError::Cancelled`] when `cancel` fires. Fail-fast acquires
    /// return [`DbError::PoolExhausted`] when every connection is in use.
    pub async fn acquire(self: &Arc<Self>, cancel: &CancellationToken) -> DbResult<Session> {
        let connection = match self.acquire_policy {
            AcquirePolicy::FailFast => {
                cancel
                    .run("acquire connection", self.acquire_fail_fast())
                    .await??
            }
            AcquirePolicy::Block { timeout } => {
                cancel
                    .run("acquire connection", self.acquire_blocking(timeout))
                    .await??
            }
        };

        self.counters.checked_out.fetch_add(1, Ordering::Relaxed);
        let session = Session::new(Arc::clone(self), connection);
        debug!(
            tenant = %self.tenant,
            session_id = %session.id(),
            "Session checked out"
        );
        Ok(session)
    }

    async fn acquire_blocking(&self, timeout: Option<Duration>) -> DbResult<SessionConnection> {
        let map_timeout = |e: sqlx::Error| match e {
            sqlx::Error::PoolTimedOut => DbError::timeout(
                format!("acquire connection for tenant '{}'", self.tenant),
                timeout.map(|t| t.as_secs() as u32).unwrap_or(0),
            ),
            other => DbError::from(other),
        };

        let connection = impl_db_dispatch!(&self.pool, {
            MySql(pool) => SessionConnection::MySql(pool.acquire().await.map_err(map_timeout)?),
            Postgres(pool) => SessionConnection::Postgres(pool.acquire().await.map_err(map_timeout)?),
            SQLite(pool) => SessionConnection::SQLite(pool.acquire().await.map_err(map_timeout)?),
        });
        Ok(connection)
    }

    /// Take an idle connection, or open one if the pool is below its limit.
    async fn acquire_fail_fast(&self) -> DbResult<SessionConnection> {
        let has_free_slot = self.pool.size() < self.max_connections;
        let exhausted = || DbError::pool_exhausted(self.tenant.as_str());

        let connection = impl_db_dispatch!(&self.pool, {
            MySql(pool) => SessionConnection::MySql(match pool.try_acquire() {
                Some(conn) => conn,
                None if has_free_slot => pool.acquire().await?,
                None => return Err(exhausted()),
            }),
            Postgres(pool) => SessionConnection::Postgres(match pool.try_acquire() {
                Some(conn) => conn,
                None if has_free_slot => pool.acquire().await?,
                None => return Err(exhausted()),
            }),
            SQLite(pool) => SessionConnection::SQLite(match pool.try_acquire() {
                Some(conn) => conn,
                None if has_free_slot => pool.acquire().await?,
                None => return Err(exhausted()),
            }),
        });
        Ok(connection)
    }

    /// Close the pool, waiting for checked-out connections to come back.
    pub async fn close(&self) {
        info!(tenant = %self.tenant, "Closing pool");
        self.pool.close().await;
    }
}

/// Decide whether an idle connection may be handed out.
///
/// Connections idle for less than `keep_alive.idle` pass untouched. Older
/// ones are pinged up to `keep_alive.count` times; `false` tells the pool to
/// close the connection and hand out another.
pub async fn check_idle_connection<C>(
    conn: &mut C,
    idle_for: Duration,
    keep_alive: KeepAliveOptions,
) -> Result<bool, sqlx::Error>
where
    C: sqlx::Connection,
{
    Ok(keep_alive_ping(conn, idle_for, keep_alive, |c| c.ping()).await)
}

async fn keep_alive_ping<T, F>(
    target: &mut T,
    idle_for: Duration,
    keep_alive: KeepAliveOptions,
    mut ping: F,
) -> bool
where
    T: ?Sized,
    F: for<'c> FnMut(&'c mut T) -> BoxFuture<'c, Result<(), sqlx::Error>>,
{
    if !keep_alive.enabled() || idle_for < keep_alive.idle {
        return true;
    }

    for attempt in 1..=keep_alive.count {
        match ping(target).await {
            Ok(()) => return true,
            Err(e) => {
                debug!(attempt, error = %e, "Keep-alive ping failed");
                if attempt < keep_alive.count {
                    tokio::time::sleep(keep_alive.interval).await;
                }
            }
        }
    }

    warn!(
        idle_secs = idle_for.as_secs(),
        pings = keep_alive.count,
        "Evicting idle connection after failed keep-alive pings"
    );
    false
}

/// Shared sqlx pool settings for every backend.
fn base_pool_options<DB: sqlx::Database>(
    options: &PoolOptions,
    is_sqlite: bool,
) -> sqlx::pool::PoolOptions<DB> {
    let keep_alive = options.keep_alive();
    let acquire_timeout = match options.acquire_policy() {
        AcquirePolicy::Block { timeout } => timeout.unwrap_or(UNBOUNDED_ACQUIRE_TIMEOUT),
        AcquirePolicy::FailFast => options.connect_timeout_or_default(),
    };

    sqlx::pool::PoolOptions::<DB>::new()
        .min_connections(options.min_connections_or_default(is_sqlite))
        .max_connections(options.max_connections_or_default(is_sqlite))
        .acquire_timeout(acquire_timeout)
        .test_before_acquire(false)
        .before_acquire(move |conn, meta| {
            Box::pin(async move { check_idle_connection(conn, meta.idle_for, keep_alive).await })
        })
}

/// Open a pool for one tenant. Makes a single connection attempt bounded by
/// the connect timeout; retrying is up to the caller.
pub(crate) async fn build_pool(
    tenant: &TenantKey,
    config: &TenantConfig,
    options: &PoolOptions,
) -> DbResult<PoolHandle> {
    let is_sqlite = config.db_type == DatabaseType::SQLite;
    let connect_timeout = options.connect_timeout_or_default();

    let connect = async {
        let pool = match config.db_type {
            DatabaseType::MySQL => {
                let mut connect_options = MySqlConnectOptions::new()
                    .host(&config.host)
                    .port(config.port_or_default())
                    .username(&config.user)
                    .database(&config.database)
                    .charset("utf8mb4");
                if !config.password.is_empty() {
                    connect_options = connect_options.password(&config.password);
                }
                let pool: MySqlPoolOptions = base_pool_options(options, is_sqlite);
                DbPool::MySql(pool.connect_with(connect_options).await?)
            }
            DatabaseType::PostgreSQL => {
                let mut connect_options = PgConnectOptions::new()
                    .host(&config.host)
                    .port(config.port_or_default())
                    .username(&config.user)
                    .database(&config.database);
                if !config.password.is_empty() {
                    connect_options = connect_options.password(&config.password);
                }
                let pool: PgPoolOptions = base_pool_options(options, is_sqlite);
                DbPool::Postgres(pool.connect_with(connect_options).await?)
            }
            DatabaseType::SQLite => {
                let connect_options = SqliteConnectOptions::new()
                    .filename(&config.database)
                    .create_if_missing(true);
                let pool: SqlitePoolOptions = base_pool_options(options, is_sqlite);
                DbPool::SQLite(pool.connect_with(connect_options).await?)
            }
        };
        Ok::<_, sqlx::Error>(pool)
    };

    let pool = match tokio::time::timeout(connect_timeout, connect).await {
        Ok(Ok(pool)) => pool,
        Ok(Err(e)) => {
            return Err(DbError::connection(
                format!("Failed to connect: {}", e),
                connection_suggestion(config.db_type, &e),
            ));
        }
        Err(_) => {
            return Err(DbError::timeout(
                format!("connect to tenant '{}'", tenant),
                connect_timeout.as_secs() as u32,
            ));
        }
    };

    Ok(PoolHandle::new(
        tenant.clone(),
        pool,
        options.acquire_policy(),
        options.max_connections_or_default(is_sqlite),
    ))
}

/// Generate a helpful suggestion for connection errors.
fn connection_suggestion(db_type: DatabaseType, error: &sqlx::Error) -> String {
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection refused") {
        return format!(
            "Check that the {} server is running and accessible",
            db_type
        );
    }

    if error_str.contains("authentication") || error_str.contains("password") {
        return "Verify the tenant's username and password".to_string();
    }

    if error_str.contains("does not exist") || error_str.contains("unknown database") {
        return "Check that the tenant database exists".to_string();
    }

    if error_str.contains("tls") || error_str.contains("ssl") {
        return "Check TLS/SSL configuration or try disabling it".to_string();
    }

    match db_type {
        DatabaseType::SQLite => {
            "Verify the directory exists and the file is writable".to_string()
        }
        _ => format!(
            "Verify host, port and database name for the {} tenant",
            db_type
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Connection as _;
    use tempfile::TempDir;

    fn sqlite_config(dir: &TempDir, name: &str) -> TenantConfig {
        TenantConfig::sqlite(dir.path().join(name).to_string_lossy().into_owned())
    }

    #[tokio::test]
    async fn test_build_sqlite_pool() {
        let dir = TempDir::new().unwrap();
        let handle = build_pool(
            &TenantKey::from("t1"),
            &sqlite_config(&dir, "t1.db"),
            &PoolOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(handle.db_type(), DatabaseType::SQLite);
        assert_eq!(handle.tenant().as_str(), "t1");
        assert_eq!(handle.stats().checked_out, 0);
        assert!(!handle.pool().is_closed());

        handle.close().await;
        assert!(handle.pool().is_closed());
    }

    #[tokio::test]
    async fn test_build_pool_missing_directory_fails() {
        let dir = TempDir::new().unwrap();
        let config = TenantConfig::sqlite(
            dir.path()
                .join("missing")
                .join("t.db")
                .to_string_lossy()
                .into_owned(),
        );
        let err = build_pool(&TenantKey::from("t"), &config, &PoolOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Connection { .. }));
        assert!(err.suggestion().is_some());
    }

    #[tokio::test]
    async fn test_keep_alive_skips_recently_used_connection() {
        let mut conn = sqlx::SqliteConnection::connect("sqlite::memory:")
            .await
            .unwrap();
        let ok = check_idle_connection(
            &mut conn,
            Duration::from_secs(1),
            KeepAliveOptions::default(),
        )
        .await
        .unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn test_keep_alive_pings_idle_connection() {
        let mut conn = sqlx::SqliteConnection::connect("sqlite::memory:")
            .await
            .unwrap();
        let ok = check_idle_connection(
            &mut conn,
            Duration::from_secs(60),
            KeepAliveOptions::default(),
        )
        .await
        .unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn test_keep_alive_disabled() {
        let mut conn = sqlx::SqliteConnection::connect("sqlite::memory:")
            .await
            .unwrap();
        let ok = check_idle_connection(
            &mut conn,
            Duration::from_secs(3600),
            KeepAliveOptions::disabled(),
        )
        .await
        .unwrap();
        assert!(ok);
    }

    /// Stand-in connection whose first `failures` pings fail.
    struct FlakyConn {
        failures: u32,
        pings: u32,
    }

    impl FlakyConn {
        fn new(failures: u32) -> Self {
            Self { failures, pings: 0 }
        }

        fn ping(&mut self) -> BoxFuture<'_, Result<(), sqlx::Error>> {
            Box::pin(async move {
                self.pings += 1;
                if self.pings <= self.failures {
                    Err(sqlx::Error::Io(std::io::Error::from(
                        std::io::ErrorKind::ConnectionReset,
                    )))
                } else {
                    Ok(())
                }
            })
        }
    }

    fn fast_keep_alive(count: u32) -> KeepAliveOptions {
        KeepAliveOptions {
            idle: Duration::from_secs(10),
            interval: Duration::from_millis(1),
            count,
        }
    }

    #[tokio::test]
    async fn test_keep_alive_evicts_after_every_ping_fails() {
        let mut conn = FlakyConn::new(u32::MAX);
        let ok = keep_alive_ping(
            &mut conn,
            Duration::from_secs(60),
            fast_keep_alive(3),
            FlakyConn::ping,
        )
        .await;
        assert!(!ok);
        assert_eq!(conn.pings, 3);
    }

    #[tokio::test]
    async fn test_keep_alive_recovers_before_count() {
        let mut conn = FlakyConn::new(2);
        let ok = keep_alive_ping(
            &mut conn,
            Duration::from_secs(60),
            fast_keep_alive(3),
            FlakyConn::ping,
        )
        .await;
        assert!(ok);
        assert_eq!(conn.pings, 3);
    }

    #[tokio::test]
    async fn test_keep_alive_skips_ping_below_idle_threshold() {
        let mut conn = FlakyConn::new(u32::MAX);
        let ok = keep_alive_ping(
            &mut conn,
            Duration::from_secs(5),
            fast_keep_alive(3),
            FlakyConn::ping,
        )
        .await;
        assert!(ok);
        assert_eq!(conn.pings, 0);
    }

    #[test]
    fn test_stats_outstanding() {
        let stats = PoolStats {
            checked_out: 5,
            released: 3,
            discarded: 1,
            ..Default::default()
        };
        assert_eq!(stats.outstanding(), 1);
    }

    #[test]
    fn test_connection_suggestion() {
        let err = sqlx::Error::Protocol("connection refused".into());
        assert!(connection_suggestion(DatabaseType::PostgreSQL, &err).contains("PostgreSQL"));

        let err = sqlx::Error::Protocol("password authentication failed".into());
        assert!(connection_suggestion(DatabaseType::MySQL, &err).contains("password"));
    }
}
