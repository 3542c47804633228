//! Error types for the tenant pool.
//!
//! This module defines all error types using `thiserror` and the failure
//! classification the transaction executor uses to decide between commit,
//! rollback, retry and propagation.

use thiserror::Error;

/// Boxed error carried as the cause of a wrapped failure.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Pool initialization failed for tenant '{tenant}' after {attempts} attempt(s): {source}")]
    PoolInitialization {
        tenant: String,
        attempts: u32,
        #[source]
        source: Box<DbError>,
    },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "23505" for unique violation
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Transaction failed after {attempts} attempt(s): {message}")]
    Transaction {
        message: String,
        attempts: u32,
        #[source]
        source: BoxError,
    },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u32,
    },

    #[error("Connection pool exhausted for tenant '{tenant}'")]
    PoolExhausted { tenant: String },

    #[error("Cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a pool initialization error carrying the last cause.
    pub fn pool_initialization(tenant: impl Into<String>, attempts: u32, source: DbError) -> Self {
        Self::PoolInitialization {
            tenant: tenant.into(),
            attempts,
            source: Box::new(source),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Wrap the cause of a failed transaction.
    pub fn transaction<E>(message: impl Into<String>, attempts: u32, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transaction {
            message: message.into(),
            attempts,
            source: Box::new(source),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u32) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create a pool exhausted error.
    pub fn pool_exhausted(tenant: impl Into<String>) -> Self {
        Self::PoolExhausted {
            tenant: tenant.into(),
        }
    }

    /// Create a cancellation error.
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::PoolInitialization { source, .. } => source.suggestion(),
            _ => None,
        }
    }

    /// Check if this error is retryable on a fresh connection.
    pub fn is_retryable(&self) -> bool {
        self.failure_kind() == FailureKind::Transient
    }
}

/// How the transaction executor treats a failure raised inside a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Connection-level failure. The connection is discarded and the work retried.
    Transient,
    /// Statement-level failure. Rolled back and wrapped in [`DbError::Transaction`].
    Database,
    /// Anything else. Rolled back and propagated unchanged.
    Other,
}

/// Classification of an error type used with the transaction executor.
///
/// Application error types that wrap [`DbError`] should delegate to
/// [`DbError::failure_kind`] for the wrapped variant so that driver failures
/// keep their classification after conversion.
pub trait FailureClass {
    fn failure_kind(&self) -> FailureKind;
}

impl FailureClass for DbError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Connection { .. } | Self::Timeout { .. } => FailureKind::Transient,
            Self::Database { sql_state, .. } => {
                if sql_state.as_deref().is_some_and(is_connection_sql_state) {
                    FailureKind::Transient
                } else {
                    FailureKind::Database
                }
            }
            _ => FailureKind::Other,
        }
    }
}

/// SQLSTATEs reporting a lost or refused connection rather than a statement problem.
///
/// Class 08 covers PostgreSQL and MySQL connection exceptions; 57P01..57P03
/// are PostgreSQL administrator shutdown and startup states.
fn is_connection_sql_state(code: &str) -> bool {
    code.starts_with("08") || matches!(code, "57P01" | "57P02" | "57P03")
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::invalid_input(format!(
                "Invalid connection configuration: {}",
                msg
            )),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax, constraints and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::timeout("connection pool acquire", 0),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::WorkerCrashed => DbError::connection(
                "Database worker crashed",
                "Retry on a fresh connection",
            ),
            sqlx::Error::TypeNotFound { type_name } => DbError::database(
                format!("Type not found: {}", type_name),
                None,
                "Check the referenced type exists",
            ),
            sqlx::Error::ColumnNotFound(col) => DbError::database(
                format!("Column not found: {}", col),
                None,
                "Check the selected column names",
            ),
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::database(
                format!("Column index {} out of bounds (len: {})", index, len),
                None,
                "Check the number of selected columns",
            ),
            sqlx::Error::ColumnDecode { index, source } => DbError::database(
                format!("Failed to decode column {}: {}", index, source),
                None,
                "Cast the column to a supported type in the query",
            ),
            sqlx::Error::Decode(source) => DbError::database(
                format!("Decode error: {}", source),
                None,
                "Cast the value to a supported type in the query",
            ),
            _ => DbError::database(
                format!("Unknown database error: {}", err),
                None,
                "Check the database server logs",
            ),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
