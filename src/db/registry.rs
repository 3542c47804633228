//! Lazily created, cached pool per tenant.
//!
//! # Concurrency
//!
//! - **`OnceCell` per tenant key**: concurrent first requests for a tenant
//!   create exactly one pool; the others wait for it.
//! - **`RwLock` over the cell map**: lookups take the read lock; a missing
//!   key is inserted under the write lock with a second check.
//! - A failed creation leaves the cell empty, so the next request retries.
//! - **Lifecycle lock**: every lookup holds it shared until its pool is
//!   resolved; [`PoolRegistry::close_all`] holds it exclusively. Closing
//!   waits for creations in flight and no creation starts mid-close, so
//!   every pool handed out is either in the map or already closed.
//!
//! Pools are never evicted. [`PoolRegistry::close_all`] is the only way to
//! shut them down.

use crate::cancel::CancellationToken;
use crate::config::{PoolInitPolicy, PoolOptions};
use crate::db::initializer::PoolInitializer;
use crate::db::pool::{PoolHandle, PoolStats};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionHelper, DatabaseType, TenantKey};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info};

/// Pool information returned by [`PoolRegistry::list_pools`] (no secrets exposed).
#[derive(Debug, Clone, Serialize)]
pub struct PoolSummary {
    pub tenant: TenantKey,
    pub db_type: DatabaseType,
    pub created_at: DateTime<Utc>,
    pub stats: PoolStats,
}

type PoolCell = Arc<OnceCell<Arc<PoolHandle>>>;

/// Cache of tenant pools. Share it by `Arc`.
#[derive(Debug, Default)]
pub struct PoolRegistry {
    initializer: PoolInitializer,
    pools: RwLock<HashMap<TenantKey, PoolCell>>,
    /// Shared by lookups, exclusive in `close_all`.
    lifecycle: RwLock<()>,
}

impl PoolRegistry {
    pub fn new(initializer: PoolInitializer) -> Self {
        Self {
            initializer,
            pools: RwLock::new(HashMap::new()),
            lifecycle: RwLock::new(()),
        }
    }

    pub fn with_options(options: PoolOptions, policy: PoolInitPolicy) -> Self {
        Self::new(PoolInitializer::new(options, policy))
    }

    pub fn initializer(&self) -> &PoolInitializer {
        &self.initializer
    }

    /// Pool for the helper's tenant, created on first use.
    pub async fn get_pool(&self, helper: &dyn ConnectionHelper) -> DbResult<Arc<PoolHandle>> {
        self.get_pool_with_cancel(helper, &CancellationToken::new())
            .await
    }

    /// Like [`get_pool`](Self::get_pool), aborting pool creation or the wait
    /// for another caller's creation when `cancel` fires.
    pub async fn get_pool_with_cancel(
        &self,
        helper: &dyn ConnectionHelper,
        cancel: &CancellationToken,
    ) -> DbResult<Arc<PoolHandle>> {
        let _lifecycle = cancel
            .run("resolve tenant pool", self.lifecycle.read())
            .await?;
        let key = helper.key();
        let cell = self.cell_for(&key).await;

        if let Some(handle) = cell.get() {
            return Ok(Arc::clone(handle));
        }

        let handle = cancel
            .run(
                "resolve tenant pool",
                cell.get_or_try_init(|| async {
                    debug!(tenant = %key, "No pool for tenant, creating one");
                    let config = helper.connection_config()?;
                    let handle = self.initializer.create_pool(&key, &config, cancel).await?;
                    Ok::<_, DbError>(Arc::new(handle))
                }),
            )
            .await??;

        Ok(Arc::clone(handle))
    }

    /// Get or insert the cell for `key`.
    async fn cell_for(&self, key: &TenantKey) -> PoolCell {
        {
            let pools = self.pools.read().await;
            if let Some(cell) = pools.get(key) {
                return Arc::clone(cell);
            }
        }

        let mut pools = self.pools.write().await;
        // Double-check after acquiring write lock
        Arc::clone(pools.entry(key.clone()).or_default())
    }

    /// Number of tenants with an initialized pool.
    pub async fn pool_count(&self) -> usize {
        let pools = self.pools.read().await;
        pools.values().filter(|cell| cell.initialized()).count()
    }

    /// Check if the tenant has an initialized pool.
    pub async fn contains(&self, key: &TenantKey) -> bool {
        let pools = self.pools.read().await;
        pools.get(key).is_some_and(|cell| cell.initialized())
    }

    /// Summaries of every initialized pool, ordered by tenant.
    pub async fn list_pools(&self) -> Vec<PoolSummary> {
        let pools = self.pools.read().await;
        let mut summaries: Vec<PoolSummary> = pools
            .values()
            .filter_map(|cell| cell.get())
            .map(|handle| PoolSummary {
                tenant: handle.tenant().clone(),
                db_type: handle.db_type(),
                created_at: handle.created_at(),
                stats: handle.stats(),
            })
            .collect();
        summaries.sort_by(|a, b| a.tenant.cmp(&b.tenant));
        summaries
    }

    /// Close every pool and forget them.
    ///
    /// Waits for pool creations already in progress and holds off new ones
    /// until every pool is closed.
    pub async fn close_all(&self) {
        let _lifecycle = self.lifecycle.write().await;
        let cells: Vec<(TenantKey, PoolCell)> = {
            let mut pools = self.pools.write().await;
            pools.drain().collect()
        };

        for (tenant, cell) in cells {
            if let Some(handle) = cell.get() {
                debug!(tenant = %tenant, "Closing tenant pool");
                handle.close().await;
            }
        }
        info!("All tenant pools closed");
    }
}
