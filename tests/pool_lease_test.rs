//! Lease discipline laws: balanced acquire/release under failure, bounded
//! concurrency, and rollback before transaction errors surface.

mod common;

use common::{initialized_pool, quiet_settings, FakeDatabase};
use dbpulse::config::PoolSettings;
use dbpulse::database::DatabaseConnection;
use dbpulse::error::PoolError;
use futures::future::{join_all, BoxFuture};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_test::assert_ok;

#[tokio::test]
async fn test_releases_balance_acquires_when_every_query_throws() {
    let db = FakeDatabase::new(|_, _| Err(PoolError::Query("injected failure".to_string())));
    let pool = initialized_pool(&db, quiet_settings(3)).await;

    for _ in 0..10 {
        assert!(pool.execute("SELECT 1", &[]).await.is_err());
    }

    let metrics = pool.get_metrics().await.unwrap();
    assert_eq!(metrics.acquires, 10);
    assert_eq!(metrics.releases, 10);
    assert_eq!(metrics.active_connections, 0);
    assert!(metrics.errors >= 10);
}

#[tokio::test]
async fn test_transaction_rolls_back_and_releases_on_throwing_work() {
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let log_writer = Arc::clone(&log);
    let db = FakeDatabase::new(move |sql, _| {
        log_writer.lock().unwrap().push(sql.to_string());
        Ok(vec![])
    });
    let pool = initialized_pool(&db, quiet_settings(3)).await;

    let result: Result<u64, PoolError> = pool
        .execute_transaction(
            |_conn: &mut dyn DatabaseConnection| -> BoxFuture<'_, Result<u64, PoolError>> {
                Box::pin(async { Err(PoolError::Query("unit of work throws".to_string())) })
            },
        )
        .await;
    assert!(matches!(result, Err(PoolError::TransactionRolledBack(_))));

    let statements = log.lock().unwrap().clone();
    assert!(statements.contains(&"BEGIN".to_string()));
    assert!(statements.contains(&"ROLLBACK".to_string()));
    assert!(!statements.contains(&"COMMIT".to_string()));

    let metrics = pool.get_metrics().await.unwrap();
    assert_eq!(metrics.acquires, metrics.releases);
    assert_eq!(metrics.active_connections, 0);
}

#[tokio::test]
async fn test_transaction_commits_on_success() {
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let log_writer = Arc::clone(&log);
    let db = FakeDatabase::new(move |sql, _| {
        log_writer.lock().unwrap().push(sql.to_string());
        Ok(vec![])
    });
    let pool = initialized_pool(&db, quiet_settings(3)).await;

    let value = pool
        .execute_transaction(
            |conn: &mut dyn DatabaseConnection| -> BoxFuture<'_, Result<u64, PoolError>> {
                Box::pin(async move {
                    conn.execute("UPDATE goals SET done = true WHERE id = $1", &[json!(7)])
                        .await?;
                    Ok(42u64)
                })
            },
        )
        .await
        .unwrap();
    assert_eq!(value, 42);

    let statements = log.lock().unwrap().clone();
    assert!(statements.contains(&"BEGIN".to_string()));
    assert!(statements.contains(&"COMMIT".to_string()));
    assert!(!statements.contains(&"ROLLBACK".to_string()));
}

#[tokio::test]
async fn test_four_concurrent_executes_bounded_by_max_three() {
    let db = FakeDatabase::with_delay(Duration::from_millis(100), |_, _| Ok(vec![]));
    let pool = initialized_pool(&db, quiet_settings(3)).await;

    let start = Instant::now();
    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let pool = Arc::clone(&pool);
            async move { pool.execute("SELECT pg_sleep(0)", &[]).await }
        })
        .collect();
    let results = join_all(tasks).await;
    let elapsed = start.elapsed();

    assert!(results.iter().all(Result::is_ok));
    // Never more than three in flight, and the fourth call finished only
    // after one of the first three released.
    assert!(db.max_in_flight.load(Ordering::SeqCst) <= 3);
    assert!(elapsed >= Duration::from_millis(180), "elapsed {elapsed:?}");
}

#[tokio::test]
async fn test_metrics_invariant_under_load() {
    let db = FakeDatabase::with_delay(Duration::from_millis(80), |_, _| Ok(vec![]));
    let pool = initialized_pool(&db, quiet_settings(3)).await;

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let pool = Arc::clone(&pool);
        tasks.push(tokio::spawn(async move {
            pool.execute("SELECT 1", &[]).await
        }));
    }

    tokio::time::sleep(Duration::from_millis(40)).await;
    let mid = pool.get_metrics().await.unwrap();
    assert!(mid.active_connections + mid.idle_connections <= mid.max_connections);
    assert!(mid.total_connections <= mid.max_connections);

    for task in tasks {
        assert!(task.await.unwrap().is_ok());
    }
    let after = pool.get_metrics().await.unwrap();
    assert!(after.active_connections + after.idle_connections <= after.max_connections);
    assert_eq!(after.active_connections, 0);
    assert_eq!(after.acquires, after.releases);
}

#[tokio::test]
async fn test_acquire_times_out_when_pool_exhausted() {
    let db = FakeDatabase::with_delay(Duration::from_millis(400), |_, _| Ok(vec![]));
    let settings = PoolSettings {
        min_connections: 0,
        max_connections: 1,
        acquire_timeout_ms: 50,
        ..PoolSettings::short_lived()
    };
    let pool = initialized_pool(&db, settings).await;

    let holder = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.execute("SELECT 1", &[]).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    let result = pool.execute("SELECT 2", &[]).await;
    assert!(matches!(result, Err(PoolError::AcquireTimeout { .. })));

    assert!(holder.await.unwrap().is_ok());
    let metrics = pool.get_metrics().await.unwrap();
    assert_eq!(metrics.acquires, metrics.releases);
}

#[tokio::test]
async fn test_warm_connections_is_best_effort_and_bounded() {
    let db = FakeDatabase::new(|_, _| Ok(vec![]));
    let pool = initialized_pool(&db, quiet_settings(3)).await;

    // Asking for more than max only opens up to max.
    let warmed = pool.warm_connections(10).await;
    assert!(warmed <= 3);

    let metrics = pool.get_metrics().await.unwrap();
    assert_eq!(metrics.idle_connections, warmed);
    assert!(metrics.total_connections <= metrics.max_connections);
}

#[tokio::test]
async fn test_execute_batch_uses_one_lease() {
    let db = FakeDatabase::new(|_, _| Ok(vec![]));
    let pool = initialized_pool(&db, quiet_settings(3)).await;

    let queries = vec![
        ("SELECT 1".to_string(), vec![]),
        ("SELECT 2".to_string(), vec![]),
        ("SELECT 3".to_string(), vec![]),
    ];
    let results = assert_ok!(pool.execute_batch(&queries).await);
    assert_eq!(results.len(), 3);

    let metrics = pool.get_metrics().await.unwrap();
    assert_eq!(metrics.acquires, 1);
    assert_eq!(metrics.releases, 1);
}
