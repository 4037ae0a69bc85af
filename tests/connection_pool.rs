//! Connection Pool Integration Tests
//!
//! Tests for pool sizing under concurrency, exhaustion, health-checked
//! release and connect retries.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sluice::adapters::{MemoryAdapter, Registry};
use sluice::core::connection::{ConnectSettings, ConnectionConfig, ConnectionManager, PoolError, PoolSettings};

fn manager(adapter: &MemoryAdapter, pool: PoolSettings, connect: ConnectSettings) -> Arc<ConnectionManager> {
    let mut registry = Registry::new();
    registry.register_adapter("memory", Arc::new(adapter.clone()));

    let config = ConnectionConfig::new("memory").with_pool(pool).with_connect(connect);
    let configs = BTreeMap::from([("db".to_string(), config)]);
    Arc::new(ConnectionManager::new(Arc::new(registry), configs))
}

fn pool(max: usize, acquire_timeout_ms: u64) -> PoolSettings {
    PoolSettings {
        min: 1,
        max,
        increment: 1,
        acquire_timeout_ms,
    }
}

fn fast_connect(attempts: u32) -> ConnectSettings {
    ConnectSettings {
        attempts,
        backoff_ms: 1,
    }
}

#[tokio::test]
async fn test_concurrent_acquire_never_exceeds_max() {
    let adapter = MemoryAdapter::new();
    let manager = manager(&adapter, pool(3, 5_000), fast_connect(1));

    let mut handles = Vec::new();
    for _ in 0..20 {
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(async move {
            let conn = manager.acquire("db").await?;
            tokio::time::sleep(Duration::from_millis(5)).await;
            manager.release(conn).await;
            Ok::<_, PoolError>(())
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert!(adapter.peak_open() <= 3, "peak was {}", adapter.peak_open());
    assert!(adapter.opened_total() <= 3);

    let status = manager.status();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].in_use, 0);
    assert!(status[0].live <= 3);
}

#[tokio::test]
async fn test_exhausted_after_timeout() {
    let adapter = MemoryAdapter::new();
    let manager = manager(&adapter, pool(1, 50), fast_connect(1));

    let held = manager.acquire("db").await.unwrap();

    let started = Instant::now();
    let err = manager.acquire("db").await.err().unwrap();
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(matches!(err, PoolError::Exhausted { ref source_id, .. } if source_id == "db"));

    manager.release(held).await;
    tokio_test::assert_ok!(manager.acquire("db").await, "a released connection is lendable again");
    assert_eq!(adapter.opened_total(), 1);
}

#[tokio::test]
async fn test_waiter_gets_released_connection() {
    let adapter = MemoryAdapter::new();
    let manager = manager(&adapter, pool(1, 2_000), fast_connect(1));

    let held = manager.acquire("db").await.unwrap();
    let waiter = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.acquire("db").await.map(|_| ()) })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    manager.release(held).await;

    assert!(waiter.await.unwrap().is_ok());
    assert_eq!(adapter.opened_total(), 1);
}

#[tokio::test]
async fn test_unhealthy_connection_is_replaced() {
    let adapter = MemoryAdapter::new();
    let manager = manager(&adapter, pool(2, 1_000), fast_connect(1));

    let conn = manager.acquire("db").await.unwrap();
    adapter.set_unhealthy(true);
    manager.release(conn).await;
    adapter.set_unhealthy(false);

    // The unhealthy one was closed and a fresh one parked in its place
    assert_eq!(adapter.opened_total(), 2);
    assert_eq!(adapter.open_now(), 1);

    let status = &manager.status()[0];
    assert_eq!(status.live, 1);
    assert_eq!(status.idle, 1);
}

#[tokio::test]
async fn test_transient_connect_failures_are_retried() {
    let adapter = MemoryAdapter::new();
    adapter.fail_connects(2);
    let manager = manager(&adapter, pool(2, 1_000), fast_connect(3));

    assert!(manager.acquire("db").await.is_ok());
    assert_eq!(adapter.opened_total(), 1);

    let failing = MemoryAdapter::new();
    failing.fail_connects(10);
    let manager = crate::manager(&failing, pool(2, 1_000), fast_connect(3));

    match manager.acquire("db").await {
        Err(PoolError::Connect { attempts, .. }) => assert_eq!(attempts, 3),
        Err(other) => panic!("expected connect error, got {}", other),
        Ok(_) => panic!("expected connect error"),
    }
    assert_eq!(manager.status()[0].live, 0, "failed opens give their slot back");
}

#[tokio::test]
async fn test_unknown_connection() {
    let adapter = MemoryAdapter::new();
    let manager = manager(&adapter, pool(1, 100), fast_connect(1));

    assert!(matches!(
        manager.acquire("elsewhere").await,
        Err(PoolError::UnknownConnection(ref name)) if name == "elsewhere"
    ));
}
