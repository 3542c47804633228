//! Tenant Pool Library
//!
//! Keeps one lazily created connection pool per tenant database
//! (SQLite, PostgreSQL, MySQL) and runs units of work inside transactions
//! that commit on success, roll back on failure and retry on transient
//! connection errors.

pub mod cancel;
pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use cancel::CancellationToken;
pub use config::{Config, PoolInitPolicy, PoolOptions, RetryPolicy};
pub use db::{PoolHandle, PoolRegistry, Release, Session, TransactionExecutor};
pub use error::{DbError, DbResult, FailureClass, FailureKind};
pub use models::{ConnectionHelper, StaticConnectionHelper, TenantConfig, TenantKey};
