//! Transactional execution with retry on transient connection failures.
//!
//! [`TransactionExecutor::run_transaction`] resolves the tenant's pool, checks
//! out a [`Session`], opens a transaction and runs the caller's unit of work.
//! The outcome decides what happens to the transaction and the connection:
//!
//! | Outcome                         | Transaction | Connection | Result                     |
//! |---------------------------------|-------------|------------|----------------------------|
//! | success                         | commit      | released   | value                      |
//! | transient failure, budget left  | abandoned   | discarded  | work re-run after backoff  |
//! | transient failure, budget spent | abandoned   | discarded  | `DbError::Transaction`     |
//! | database failure                | rollback    | released   | `DbError::Transaction`     |
//! | any other failure               | rollback    | released   | original error             |
//!
//! A failed rollback discards the connection instead of releasing it. Pool
//! resolution and acquire failures are returned as they are, without retry.
//!
//! Retries re-run the whole unit of work, so it must be safe to repeat: keep
//! all of its effects inside the transaction.

use crate::cancel::CancellationToken;
use crate::config::RetryPolicy;
use crate::db::registry::PoolRegistry;
use crate::db::session::{Release, Session};
use crate::error::{DbError, FailureClass, FailureKind};
use crate::models::ConnectionHelper;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Message of the [`DbError::Transaction`] raised after policy is applied.
pub const TRANSACTION_FAILED: &str = "Error while handling request";

/// Retry bookkeeping for one `run_transaction` call.
#[derive(Debug, Clone, Copy)]
pub struct RetryContext {
    attempt: u32,
    started: Instant,
}

impl RetryContext {
    fn new() -> Self {
        Self {
            attempt: 0,
            started: Instant::now(),
        }
    }

    /// Transient failures so far, which is also the zero-based number of
    /// the attempt in progress.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Runs units of work inside tenant transactions.
#[derive(Debug, Clone)]
pub struct TransactionExecutor {
    registry: Arc<PoolRegistry>,
    policy: RetryPolicy,
}

impl TransactionExecutor {
    pub fn new(registry: Arc<PoolRegistry>, policy: RetryPolicy) -> Self {
        Self { registry, policy }
    }

    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `work` in a transaction on the helper's tenant.
    ///
    /// The future returned by `work` may borrow the session but nothing else;
    /// move owned copies of any other data into it.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let count = executor
    ///     .run_transaction(&helper, |session| {
    ///         Box::pin(async move {
    ///             let cursor = session.execute_query("SELECT count(*) AS n FROM orders", &[]).await?;
    ///             Ok::<_, DbError>(cursor.fetch_one())
    ///         })
    ///     })
    ///     .await?;
    /// ```
    pub async fn run_transaction<T, E, F>(&self, helper: &dyn ConnectionHelper, work: F) -> Result<T, E>
    where
        F: for<'s> FnMut(&'s mut Session) -> BoxFuture<'s, Result<T, E>>,
        E: FailureClass + From<DbError> + std::error::Error + Send + Sync + 'static,
    {
        self.run_transaction_with_cancel(helper, &CancellationToken::new(), work)
            .await
    }

    /// Like [`run_transaction`](Self::run_transaction); `cancel` aborts pool
    /// resolution, the acquire wait and the retry backoff.
    pub async fn run_transaction_with_cancel<T, E, F>(
        &self,
        helper: &dyn ConnectionHelper,
        cancel: &CancellationToken,
        mut work: F,
    ) -> Result<T, E>
    where
        F: for<'s> FnMut(&'s mut Session) -> BoxFuture<'s, Result<T, E>>,
        E: FailureClass + From<DbError> + std::error::Error + Send + Sync + 'static,
    {
        let mut ctx = RetryContext::new();

        loop {
            let handle = self
                .registry
                .get_pool_with_cancel(helper, cancel)
                .await
                .map_err(E::from)?;
            let mut session = handle.acquire(cancel).await.map_err(E::from)?;
            session.set_attempt(ctx.attempt);

            let outcome = match session.begin().await {
                Ok(()) => match work(&mut session).await {
                    Ok(value) => session.commit().await.map(|()| value).map_err(E::from),
                    Err(e) => Err(e),
                },
                Err(e) => Err(E::from(e)),
            };

            let error = match outcome {
                Ok(value) => {
                    session.release(Release::Healthy).await;
                    debug!(
                        tenant = %handle.tenant(),
                        attempt = ctx.attempt,
                        "Transaction succeeded"
                    );
                    return Ok(value);
                }
                Err(e) => e,
            };

            match error.failure_kind() {
                FailureKind::Transient => {
                    session.release(Release::Discard).await;
                    ctx.attempt += 1;

                    if ctx.attempt > self.policy.max_retry_attempts {
                        warn!(
                            tenant = %handle.tenant(),
                            attempts = ctx.attempt,
                            elapsed_ms = ctx.elapsed().as_millis() as u64,
                            error = %error,
                            "Transaction retries exhausted"
                        );
                        return Err(E::from(DbError::transaction(
                            TRANSACTION_FAILED,
                            ctx.attempt,
                            error,
                        )));
                    }

                    warn!(
                        tenant = %handle.tenant(),
                        attempt = ctx.attempt,
                        max_retry_attempts = self.policy.max_retry_attempts,
                        error = %error,
                        "Transient failure, retrying transaction"
                    );
                    cancel
                        .sleep("transaction retry backoff", self.policy.retry_backoff)
                        .await
                        .map_err(E::from)?;
                }
                FailureKind::Database => {
                    rollback_and_release(session).await;
                    debug!(tenant = %handle.tenant(), error = %error, "Transaction failed");
                    return Err(E::from(DbError::transaction(
                        TRANSACTION_FAILED,
                        ctx.attempt + 1,
                        error,
                    )));
                }
                FailureKind::Other => {
                    rollback_and_release(session).await;
                    debug!(tenant = %handle.tenant(), error = %error, "Transaction aborted");
                    return Err(error);
                }
            }
        }
    }
}

/// Roll back and return the connection, or discard it if rollback fails.
async fn rollback_and_release(mut session: Session) {
    if !session.in_transaction() {
        session.release(Release::Healthy).await;
        return;
    }

    match session.rollback().await {
        Ok(()) => session.release(Release::Healthy).await,
        Err(e) => {
            warn!(
                session_id = %session.id(),
                error = %e,
                "Rollback failed, discarding connection"
            );
            session.release(Release::Discard).await;
        }
    }
}
