//! Integration tests for `RedisLeaseStore` using testcontainers.
//!
//! # Requirements
//!
//! Docker must be running. The tests are marked `#[ignore]`; run them with:
//! `cargo test -p seatguard-redis -- --ignored`

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)] // Test code uses expect for clear failure messages

use seatguard_core::lease::LeaseStore;
use seatguard_core::resource::ResourceId;
use seatguard_redis::RedisLeaseStore;
use seatguard_runtime::{LockAcquisition, LockCoordinator, MultiLockAcquisition};
use std::sync::Arc;
use std::time::Duration;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;

/// Start a Redis container and return a connected store with a unique prefix.
async fn setup_redis_store() -> (ContainerAsync<Redis>, RedisLeaseStore) {
    let container = Redis::default()
        .start()
        .await
        .expect("Failed to start redis container");
    let port = container
        .get_host_port_ipv4(6379)
        .await
        .expect("Failed to get redis port");

    let store = RedisLeaseStore::new(&format!("redis://127.0.0.1:{port}"))
        .await
        .expect("Failed to connect to redis")
        .with_prefix(format!("test:{}:", uuid::Uuid::new_v4()));
    (container, store)
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_acquire_is_exclusive_until_released() {
    let (_container, store) = setup_redis_store().await;
    let ttl = Duration::from_secs(5);

    assert!(store.try_acquire("seat-1", "a", ttl).await.unwrap());
    assert!(!store.try_acquire("seat-1", "b", ttl).await.unwrap());

    // Only the holder can release.
    assert!(!store.release("seat-1", "b").await.unwrap());
    assert!(store.release("seat-1", "a").await.unwrap());
    assert!(!store.release("seat-1", "a").await.unwrap(), "release is idempotent");

    assert!(store.try_acquire("seat-1", "b", ttl).await.unwrap());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_lease_expires_on_the_server() {
    let (_container, store) = setup_redis_store().await;

    assert!(
        store
            .try_acquire("seat-1", "crashed", Duration::from_millis(200))
            .await
            .unwrap()
    );
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(
        store
            .try_acquire("seat-1", "next", Duration::from_secs(5))
            .await
            .unwrap()
    );
    assert!(!store.release("seat-1", "crashed").await.unwrap());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_renew_only_for_holder() {
    let (_container, store) = setup_redis_store().await;
    let short = Duration::from_millis(300);

    assert!(store.try_acquire("seat-1", "a", short).await.unwrap());
    assert!(!store.renew("seat-1", "b", Duration::from_secs(5)).await.unwrap());
    assert!(store.renew("seat-1", "a", Duration::from_secs(5)).await.unwrap());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(
        !store.try_acquire("seat-1", "b", short).await.unwrap(),
        "renewed lease outlives its original TTL"
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_lock_coordinator_over_redis() {
    let (_container, store) = setup_redis_store().await;
    let store = Arc::new(store);
    let locks = LockCoordinator::new(store.clone());
    let ttl = Duration::from_secs(5);
    let (a, b) = (ResourceId::new("a"), ResourceId::new("b"));

    let LockAcquisition::Acquired(held) = locks.acquire(&b, ttl).await.unwrap() else {
        panic!("first lock on b must succeed");
    };

    let all = locks.acquire_all(&[b.clone(), a.clone()], ttl).await.unwrap();
    assert_eq!(all, MultiLockAcquisition::Busy(b.clone()));
    // a was released when b turned out to be busy.
    assert!(matches!(
        locks.acquire(&a, ttl).await.unwrap(),
        LockAcquisition::Acquired(_)
    ));

    assert!(locks.release(held).await.unwrap());
}
