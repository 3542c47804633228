//! Cancellation support for blocking pool operations.
//!
//! A [`CancellationToken`] aborts the waits this crate performs on behalf of a
//! caller: acquiring a session from an exhausted pool, sleeping between pool
//! initialization attempts, and sleeping between transaction retries.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::error::{DbError, DbResult};

/// Cloneable cancellation token with an optional deadline.
///
/// Clones share the cancelled flag. A deadline added with
/// [`with_deadline`](Self::with_deadline) applies only to the returned token.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    notify: Arc<watch::Sender<bool>>,
    deadline: Option<Instant>,
}

impl CancellationToken {
    /// Create a token that is never cancelled until [`cancel`](Self::cancel) is called.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            notify: Arc::new(tx),
            deadline: None,
        }
    }

    /// Derive a token sharing this token's flag that also expires at `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        };
        Self {
            notify: Arc::clone(&self.notify),
            deadline: Some(deadline),
        }
    }

    /// Derive a token that expires `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Cancel the token and every clone of it.
    pub fn cancel(&self) {
        self.notify.send_replace(true);
    }

    /// Check if cancelled or past the deadline.
    pub fn is_cancelled(&self) -> bool {
        *self.notify.borrow() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolve once the token is cancelled or the deadline passes.
    pub async fn cancelled(&self) {
        let mut rx = self.notify.subscribe();
        let flagged = async move {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        };

        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = flagged => {}
                    _ = tokio::time::sleep_until(deadline.into()) => {}
                }
            }
            None => flagged.await,
        }
    }

    /// Run `fut` unless the token fires first.
    pub async fn run<F, T>(&self, operation: &str, fut: F) -> DbResult<T>
    where
        F: Future<Output = T>,
    {
        if self.is_cancelled() {
            return Err(DbError::cancelled(operation));
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(DbError::cancelled(operation)),
            out = fut => Ok(out),
        }
    }

    /// Sleep for `duration` unless the token fires first.
    pub async fn sleep(&self, operation: &str, duration: Duration) -> DbResult<()> {
        self.run(operation, tokio::time::sleep(duration)).await
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancellation_token() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());

        let clone = token.clone();
        let handle = tokio::spawn(async move {
            clone.cancelled().await;
            true
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        assert!(handle.await.unwrap());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_sleep_aborted_by_cancel() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        let result = token.sleep("backoff", Duration::from_secs(30)).await;
        assert!(matches!(result, Err(DbError::Cancelled { .. })));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_deadline_expires() {
        let token = CancellationToken::new().with_timeout(Duration::from_millis(20));
        let result = token.sleep("backoff", Duration::from_secs(30)).await;
        assert!(matches!(result, Err(DbError::Cancelled { .. })));
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_deadline_does_not_leak_to_parent() {
        let parent = CancellationToken::new();
        let child = parent.with_timeout(Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_run_completes_when_not_cancelled() {
        let token = CancellationToken::new();
        let value = token.run("op", async { 42 }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_run_refuses_when_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let result = token.run("op", async { 42 }).await;
        assert!(matches!(result, Err(DbError::Cancelled { .. })));
    }
}
