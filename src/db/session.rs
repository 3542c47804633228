//! Sessions: one pooled connection plus a buffered result cursor.
//!
//! A [`Session`] is checked out of exactly one [`PoolHandle`] and goes back
//! exactly once, through [`Session::release`] or, failing that, its `Drop`.
//! A session dropped with a transaction still open is never returned to the
//! pool; its connection is closed.

use crate::db::params::expand_values;
use crate::db::pool::PoolHandle;
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{DEFAULT_PAGE_SIZE, DatabaseType, QueryParam, Row, TenantKey};
use sqlx::pool::PoolConnection;
use sqlx::{Connection as _, Executor as _, MySql, Postgres, Sqlite};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Driver connection held by a session.
pub(crate) enum SessionConnection {
    MySql(PoolConnection<MySql>),
    Postgres(PoolConnection<Postgres>),
    SQLite(PoolConnection<Sqlite>),
}

impl SessionConnection {
    /// Take the connection out of the pool and close it.
    async fn close(self) -> Result<(), sqlx::Error> {
        match self {
            Self::MySql(conn) => conn.detach().close().await,
            Self::Postgres(conn) => conn.detach().close().await,
            Self::SQLite(conn) => conn.detach().close().await,
        }
    }
}

impl std::fmt::Debug for SessionConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::MySql(_) => "MySql",
            Self::Postgres(_) => "Postgres",
            Self::SQLite(_) => "SQLite",
        };
        f.debug_tuple(name).finish_non_exhaustive()
    }
}

/// How a session goes back to its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Return the connection for reuse.
    Healthy,
    /// Close the connection; the pool may open a replacement.
    Discard,
}

/// Rows buffered from the last statement a session ran.
#[derive(Debug, Default)]
pub struct Cursor {
    columns: Vec<String>,
    rows: VecDeque<Row>,
    row_count: u64,
}

impl Cursor {
    fn reset(&mut self, columns: Vec<String>, rows: Vec<Row>, row_count: u64) {
        self.columns = columns;
        self.rows = rows.into();
        self.row_count = row_count;
    }

    /// Next row, or `None` once the buffer is drained.
    pub fn fetch_one(&mut self) -> Option<Row> {
        self.rows.pop_front()
    }

    /// Up to `n` of the remaining rows.
    pub fn fetch_many(&mut self, n: usize) -> Vec<Row> {
        let n = n.min(self.rows.len());
        self.rows.drain(..n).collect()
    }

    /// All remaining rows.
    pub fn fetch_all(&mut self) -> Vec<Row> {
        self.rows.drain(..).collect()
    }

    /// Rows returned by the last query, or rows affected by the last statement.
    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    /// Column names of the last query. Empty when it returned no rows.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows not yet fetched.
    pub fn remaining(&self) -> usize {
        self.rows.len()
    }
}

/// A connection checked out for one transactional operation.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    handle: Arc<PoolHandle>,
    connection: Option<SessionConnection>,
    cursor: Cursor,
    attempt: u32,
    in_transaction: bool,
}

impl Session {
    pub(crate) fn new(handle: Arc<PoolHandle>, connection: SessionConnection) -> Self {
        Self {
            id: Uuid::new_v4(),
            handle,
            connection: Some(connection),
            cursor: Cursor::default(),
            attempt: 0,
            in_transaction: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn tenant(&self) -> &TenantKey {
        self.handle.tenant()
    }

    pub fn db_type(&self) -> DatabaseType {
        self.handle.db_type()
    }

    /// Zero-based attempt number within the current `run_transaction` call.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub(crate) fn set_attempt(&mut self, attempt: u32) {
        self.attempt = attempt;
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn cursor(&mut self) -> &mut Cursor {
        &mut self.cursor
    }

    fn connection_mut(&mut self) -> DbResult<&mut SessionConnection> {
        self.connection
            .as_mut()
            .ok_or_else(|| DbError::internal("Session connection already released"))
    }

    /// Run a statement and return the number of rows affected.
    pub async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        let affected = with_session_connection!(self.connection_mut()?, conn, bind => {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind(query, param);
            }
            query.execute(&mut **conn).await?.rows_affected()
        });
        self.cursor.reset(Vec::new(), Vec::new(), affected);
        Ok(affected)
    }

    /// Run a query and buffer its rows in the session cursor.
    pub async fn execute_query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<&mut Cursor> {
        let (columns, rows) = with_session_connection!(self.connection_mut()?, conn, bind => {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind(query, param);
            }
            let rows = query.fetch_all(&mut **conn).await?;
            let columns = rows.first().map(|r| r.column_names()).unwrap_or_default();
            (columns, rows.iter().map(|r| r.to_json_map()).collect::<Vec<Row>>())
        });
        let count = rows.len() as u64;
        self.cursor.reset(columns, rows, count);
        Ok(&mut self.cursor)
    }

    /// Insert many rows through a statement with one `%s` placeholder, e.g.
    /// `INSERT INTO t (a, b) VALUES %s`.
    ///
    /// Rows are sent `page_size` at a time, [`DEFAULT_PAGE_SIZE`] when `None`.
    /// Returns the total rows affected.
    pub async fn execute_values(
        &mut self,
        sql: &str,
        rows: &[Vec<QueryParam>],
        page_size: Option<usize>,
    ) -> DbResult<u64> {
        let page_size = page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        let pages = expand_values(sql, rows, page_size, self.db_type())?;
        let mut total = 0;
        for page in &pages {
            total += with_session_connection!(self.connection_mut()?, conn, bind => {
                let mut query = sqlx::query(&page.sql);
                for param in &page.params {
                    query = bind(query, *param);
                }
                query.execute(&mut **conn).await?.rows_affected()
            });
        }
        debug!(
            session_id = %self.id,
            rows = rows.len(),
            pages = pages.len(),
            "Bulk insert complete"
        );
        self.cursor.reset(Vec::new(), Vec::new(), total);
        Ok(total)
    }

    async fn raw(&mut self, statement: &'static str) -> DbResult<()> {
        with_session_connection!(self.connection_mut()?, conn, _bind => {
            (&mut **conn).execute(statement).await?;
        });
        Ok(())
    }

    pub(crate) async fn begin(&mut self) -> DbResult<()> {
        self.raw("BEGIN").await?;
        self.in_transaction = true;
        debug!(session_id = %self.id, tenant = %self.tenant(), "Transaction started");
        Ok(())
    }

    pub(crate) async fn commit(&mut self) -> DbResult<()> {
        self.raw("COMMIT").await?;
        self.in_transaction = false;
        debug!(session_id = %self.id, "Transaction committed");
        Ok(())
    }

    pub(crate) async fn rollback(&mut self) -> DbResult<()> {
        self.raw("ROLLBACK").await?;
        self.in_transaction = false;
        debug!(session_id = %self.id, "Transaction rolled back");
        Ok(())
    }

    /// Return the session to its pool.
    ///
    /// A healthy release with a transaction still open discards instead.
    pub async fn release(mut self, mode: Release) {
        let Some(connection) = self.connection.take() else {
            return;
        };

        let mode = if mode == Release::Healthy && self.in_transaction {
            warn!(
                session_id = %self.id,
                tenant = %self.tenant(),
                "Session released inside a transaction, discarding connection"
            );
            Release::Discard
        } else {
            mode
        };

        match mode {
            Release::Healthy => {
                drop(connection);
                self.handle.record_released();
                debug!(session_id = %self.id, "Session released");
            }
            Release::Discard => {
                self.handle.record_discarded();
                if let Err(e) = connection.close().await {
                    warn!(session_id = %self.id, error = %e, "Error closing discarded connection");
                }
                debug!(session_id = %self.id, "Session discarded");
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };

        if !self.in_transaction {
            self.handle.record_released();
            return;
        }

        self.handle.record_discarded();
        warn!(
            session_id = %self.id,
            tenant = %self.handle.tenant(),
            "Session dropped inside a transaction, discarding connection"
        );

        // Close gracefully when a runtime is available; otherwise the detached
        // connection is closed by dropping it.
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let _ = connection.close().await;
                });
            }
            Err(_) => match connection {
                SessionConnection::MySql(conn) => drop(conn.detach()),
                SessionConnection::Postgres(conn) => drop(conn.detach()),
                SessionConnection::SQLite(conn) => drop(conn.detach()),
            },
        }
    }
}
