//! Data models shared by the pool registry and sessions.

pub mod query;
pub mod tenant;

pub use query::{DEFAULT_PAGE_SIZE, QueryParam, Row};
pub use tenant::{
    ConnectionHelper, DatabaseType, StaticConnectionHelper, TenantConfig, TenantKey,
};
