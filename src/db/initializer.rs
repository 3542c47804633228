//! Pool creation with a bounded retry budget.

use crate::cancel::CancellationToken;
use crate::config::{PoolInitPolicy, PoolOptions};
use crate::db::pool::{PoolHandle, build_pool};
use crate::error::{DbError, DbResult};
use crate::models::{TenantConfig, TenantKey};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Builds tenant pools, retrying failed attempts with a fixed backoff.
///
/// Retrying stops at whichever comes first: `max_attempts` attempts, or
/// `max_elapsed` since the first attempt.
#[derive(Debug, Clone, Default)]
pub struct PoolInitializer {
    options: PoolOptions,
    policy: PoolInitPolicy,
}

impl PoolInitializer {
    pub fn new(options: PoolOptions, policy: PoolInitPolicy) -> Self {
        Self { options, policy }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    pub fn policy(&self) -> &PoolInitPolicy {
        &self.policy
    }

    pub async fn create_pool(
        &self,
        key: &TenantKey,
        config: &TenantConfig,
        cancel: &CancellationToken,
    ) -> DbResult<PoolHandle> {
        let start = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(DbError::cancelled(format!("create pool for tenant '{}'", key)));
            }

            debug!(tenant = %key, attempt, db_type = %config.db_type, "Creating pool");
            let error = match build_pool(key, config, &self.options).await {
                Ok(handle) => {
                    info!(
                        tenant = %key,
                        db_type = %config.db_type,
                        attempts = attempt,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Pool created"
                    );
                    return Ok(handle);
                }
                Err(e) => e,
            };

            if attempt >= self.policy.max_attempts || start.elapsed() >= self.policy.max_elapsed {
                warn!(
                    tenant = %key,
                    attempts = attempt,
                    error = %error,
                    "Giving up creating pool"
                );
                return Err(DbError::pool_initialization(key.as_str(), attempt, error));
            }

            warn!(
                tenant = %key,
                attempt,
                error = %error,
                backoff_ms = self.policy.backoff.as_millis() as u64,
                "Pool creation failed, retrying"
            );
            cancel.sleep("pool creation backoff", self.policy.backoff).await?;
        }
    }
}
