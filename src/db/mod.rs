//! Database layer.
//!
//! This module provides:
//! - Per-tenant connection pools and their registry
//! - Pool creation with a bounded retry budget
//! - Sessions with buffered result cursors
//! - The transactional executor with transient-failure retry
//! - Row decoding and parameter binding per driver

#[macro_use]
pub mod macros;
pub mod initializer;
pub mod params;
pub mod pool;
pub mod registry;
pub mod session;
pub mod transaction;
pub mod types;

pub use initializer::PoolInitializer;
pub use pool::{DbPool, PoolHandle, PoolStats, check_idle_connection};
pub use registry::{PoolRegistry, PoolSummary};
pub use session::{Cursor, Release, Session};
pub use transaction::{RetryContext, TRANSACTION_FAILED, TransactionExecutor};
pub use types::RowToJson;
