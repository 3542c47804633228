//! Integration tests for the tenant pool registry.

mod common;

use common::{CountingHelper, executor_with, sqlite_config, sqlite_helper, unreachable_helper};
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tenant_pool::config::{PoolInitPolicy, PoolOptions};
use tenant_pool::db::PoolRegistry;
use tenant_pool::models::TenantKey;
use tenant_pool::{CancellationToken, DbError};
use tokio_test::{assert_err, assert_ok};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_get_pool_creates_one_pool() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(PoolRegistry::default());
    let helper = Arc::new(CountingHelper::new("acme", sqlite_config(&dir, "acme.db")));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let registry = Arc::clone(&registry);
        let helper = Arc::clone(&helper);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..5));
        tasks.push(tokio::spawn(async move {
            tokio::time::sleep(jitter).await;
            registry.get_pool(helper.as_ref()).await
        }));
    }

    let mut handles = Vec::new();
    for task in tasks {
        handles.push(assert_ok!(task.await.unwrap()));
    }

    assert_eq!(helper.calls(), 1, "pool configuration requested more than once");
    assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
    assert_eq!(registry.pool_count().await, 1);

    registry.close_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_tenants_are_independent() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(PoolRegistry::default());

    let mut tasks = Vec::new();
    for i in 0..8 {
        let registry = Arc::clone(&registry);
        let helper = sqlite_helper(&dir, &format!("tenant{}", i % 4));
        tasks.push(tokio::spawn(async move { registry.get_pool(&helper).await }));
    }
    for task in tasks {
        assert_ok!(task.await.unwrap());
    }

    assert_eq!(registry.pool_count().await, 4);
    let tenants: Vec<String> = registry
        .list_pools()
        .await
        .into_iter()
        .map(|s| s.tenant.to_string())
        .collect();
    assert_eq!(tenants, vec!["tenant0", "tenant1", "tenant2", "tenant3"]);

    registry.close_all().await;
}

#[tokio::test]
async fn test_get_pool_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let registry = PoolRegistry::default();
    let helper = CountingHelper::new("same", sqlite_config(&dir, "same.db"));

    let first = registry.get_pool(&helper).await.unwrap();
    let second = registry.get_pool(&helper).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(helper.calls(), 1);
    assert_eq!(first.created_at(), second.created_at());

    registry.close_all().await;
}

#[tokio::test]
async fn test_unreachable_tenant_stops_at_elapsed_bound() {
    let dir = TempDir::new().unwrap();
    let registry = PoolRegistry::with_options(
        PoolOptions::default(),
        PoolInitPolicy {
            max_elapsed: Duration::from_millis(200),
            max_attempts: 100,
            backoff: Duration::from_millis(50),
        },
    );

    let start = Instant::now();
    let err = assert_err!(registry.get_pool(&unreachable_helper(&dir, "down")).await);
    let elapsed = start.elapsed();

    match err {
        DbError::PoolInitialization {
            tenant, attempts, ..
        } => {
            assert_eq!(tenant, "down");
            assert!(attempts > 1 && attempts < 100, "attempts = {attempts}");
        }
        other => panic!("expected PoolInitialization, got {other:?}"),
    }
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(10));
    assert!(!registry.contains(&TenantKey::from("down")).await);
}

#[tokio::test]
async fn test_pool_initialization_failure_is_not_retried_by_executor() {
    let dir = TempDir::new().unwrap();
    let executor = executor_with(PoolOptions::default(), 10);
    let helper = unreachable_helper(&dir, "down");
    let calls = AtomicUsize::new(0);

    let start = Instant::now();
    let err = executor
        .run_transaction(&helper, |_session| {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok::<_, DbError>(()) })
        })
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::PoolInitialization { attempts: 5, .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    // Five attempts, 20ms apart, and no transaction retries on top
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_cancelled_pool_creation() {
    let dir = TempDir::new().unwrap();
    let registry = PoolRegistry::with_options(
        PoolOptions::default(),
        PoolInitPolicy {
            max_elapsed: Duration::from_secs(60),
            max_attempts: 100,
            backoff: Duration::from_secs(30),
        },
    );
    let cancel = CancellationToken::new().with_timeout(Duration::from_millis(100));

    let err = registry
        .get_pool_with_cancel(&unreachable_helper(&dir, "down"), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Cancelled { .. }));
}

#[tokio::test]
async fn test_list_pools_reports_usage() {
    let dir = TempDir::new().unwrap();
    let executor = common::executor(0);
    let helper = sqlite_helper(&dir, "stats");

    common::create_items_table(&executor, &helper).await;
    assert_eq!(common::count_items(&executor, &helper).await, 0);

    let pools = executor.registry().list_pools().await;
    assert_eq!(pools.len(), 1);
    assert_eq!(pools[0].tenant.as_str(), "stats");
    assert_eq!(pools[0].stats.checked_out, 2);
    assert_eq!(pools[0].stats.released, 2);
    assert_eq!(pools[0].stats.outstanding(), 0);

    let json = serde_json::to_value(&pools[0]).unwrap();
    assert_eq!(json["db_type"], "sqlite");
    assert_eq!(json["stats"]["discarded"], 0);

    executor.registry().close_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_all_waits_for_pool_creation_in_flight() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(PoolRegistry::with_options(
        PoolOptions::default(),
        PoolInitPolicy {
            max_elapsed: Duration::from_secs(10),
            max_attempts: 50,
            backoff: Duration::from_millis(200),
        },
    ));
    // Creation keeps failing until the directory shows up
    let helper = Arc::new(CountingHelper::new("late", sqlite_config(&dir, "later/late.db")));

    let creating = {
        let registry = Arc::clone(&registry);
        let helper = Arc::clone(&helper);
        tokio::spawn(async move { registry.get_pool(helper.as_ref()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let closing = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.close_all().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!closing.is_finished(), "close_all returned while a pool was being created");

    std::fs::create_dir(dir.path().join("later")).unwrap();
    let first = assert_ok!(creating.await.unwrap());
    closing.await.unwrap();

    assert!(first.pool().is_closed());
    assert_eq!(helper.calls(), 1);
    assert_eq!(registry.pool_count().await, 0);

    let second = assert_ok!(registry.get_pool(helper.as_ref()).await);
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(helper.calls(), 2);
    assert!(!second.pool().is_closed());

    registry.close_all().await;
    assert!(second.pool().is_closed());
}
