//! Database dispatch macros for reducing code duplication.
//!
//! Driver types differ per backend, so operations over [`DbPool`] and
//! session connections are written once per variant. These macros expand the
//! match arms at compile time.
//!
//! [`DbPool`]: crate::db::pool::DbPool

/// Match on a `DbPool` with one explicit arm per variant.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(&self.pool, {
///     MySql(p) => p.size(),
///     Postgres(p) => p.size(),
///     SQLite(p) => p.size(),
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($pool:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $pool {
            $(
                $crate::db::pool::DbPool::$variant($p) => $body,
            )+
        }
    };
}

/// Run the same body against whichever driver connection a session holds.
///
/// `$conn` binds the `PoolConnection` and `$bind` the matching
/// parameter binder from [`crate::db::params`].
///
/// # Example
///
/// ```ignore
/// let affected = with_session_connection!(self.connection_mut()?, conn, bind => {
///     let mut query = sqlx::query(sql);
///     for param in params {
///         query = bind(query, param);
///     }
///     query.execute(&mut **conn).await?.rows_affected()
/// });
/// ```
#[macro_export]
macro_rules! with_session_connection {
    ($target:expr, $conn:ident, $bind:ident => $body:expr) => {
        match $target {
            $crate::db::session::SessionConnection::MySql($conn) => {
                #[allow(unused_variables)]
                let $bind = $crate::db::params::bind_mysql_param;
                $body
            }
            $crate::db::session::SessionConnection::Postgres($conn) => {
                #[allow(unused_variables)]
                let $bind = $crate::db::params::bind_postgres_param;
                $body
            }
            $crate::db::session::SessionConnection::SQLite($conn) => {
                #[allow(unused_variables)]
                let $bind = $crate::db::params::bind_sqlite_param;
                $body
            }
        }
    };
}

pub use impl_db_dispatch;
pub use with_session_connection;
