// Copyright 2025 FastLabs Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tendpool::HandleStatus;
use tendpool::ManageHandle;
use tendpool::Pool;
use tendpool::PoolConfig;
use tendpool::PoolError;

#[derive(Default)]
struct Manager {
    destroyed: Arc<AtomicUsize>,
}

impl ManageHandle for Manager {
    type Handle = usize;
    type Error = Infallible;

    async fn create(&self) -> Result<Self::Handle, Self::Error> {
        Ok(0)
    }

    async fn validate(
        &self,
        _handle: &mut Self::Handle,
        _status: &HandleStatus,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn destroy(&self, _handle: Self::Handle) -> Result<(), Self::Error> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_acquire_after_shutdown_fails_closed() {
    let pool = Pool::new(PoolConfig::new(2), Manager::default()).unwrap();
    pool.shutdown().await;

    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, PoolError::Closed));
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let pool = Pool::new(PoolConfig::new(2), Manager::default()).unwrap();
    let handle = pool.acquire().await.unwrap();
    drop(handle);

    pool.shutdown().await;

    let started = std::time::Instant::now();
    pool.shutdown().await;
    assert!(
        started.elapsed() < Duration::from_millis(50),
        "a second shutdown must return immediately"
    );
}

#[tokio::test]
async fn test_shutdown_destroys_idle_handles() {
    let manager = Manager::default();
    let destroyed = manager.destroyed.clone();
    let pool = Pool::new(PoolConfig::new(4).with_min_size(2), manager).unwrap();
    pool.initialize().await.unwrap();
    assert_eq!(pool.stats().idle_count, 2);

    pool.shutdown().await;
    assert_eq!(destroyed.load(Ordering::SeqCst), 2);
    let stats = pool.stats();
    assert_eq!(stats.current_size, 0);
    assert_eq!(stats.destroyed, 2);
}

#[tokio::test]
async fn test_shutdown_rejects_queued_waiters() {
    let config = PoolConfig::new(1)
        .with_max_queue_size(4)
        .with_acquire_timeout(Duration::from_secs(5))
        .with_shutdown_grace(Duration::from_secs(5));
    let pool = Pool::new(config, Manager::default()).unwrap();

    let held = pool.acquire().await.unwrap();

    let waiter_pool = pool.clone();
    let waiter = tokio::spawn(async move { waiter_pool.acquire().await });
    while pool.stats().wait_count < 1 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let shutdown_pool = pool.clone();
    let shutdown = tokio::spawn(async move { shutdown_pool.shutdown().await });

    // the waiter is woken promptly, well before the in-flight grace ends
    let err = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter must be rejected before the grace period ends")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, PoolError::Closed));

    drop(held);
    shutdown.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_waits_for_inflight_release() {
    let manager = Manager::default();
    let destroyed = manager.destroyed.clone();
    let config = PoolConfig::new(1).with_shutdown_grace(Duration::from_secs(5));
    let pool = Pool::new(config, manager).unwrap();

    let held = pool.acquire().await.unwrap();
    let releaser = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);
    });

    let started = std::time::Instant::now();
    pool.shutdown().await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(40));
    assert!(
        elapsed < Duration::from_secs(4),
        "shutdown must return as soon as the handle comes back"
    );
    releaser.await.unwrap();

    // the returned handle is destroyed on a spawned task
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().current_size, 0);
}

#[tokio::test]
async fn test_shutdown_grace_overrun_abandons_inflight() {
    let manager = Manager::default();
    let destroyed = manager.destroyed.clone();
    let config = PoolConfig::new(1).with_shutdown_grace(Duration::from_millis(50));
    let pool = Pool::new(config, manager).unwrap();

    let held = pool.acquire().await.unwrap();

    let started = std::time::Instant::now();
    pool.shutdown().await;
    assert!(started.elapsed() >= Duration::from_millis(50));
    let stats = pool.stats();
    assert_eq!(
        stats.current_size, 0,
        "abandoned handles leave the books after the grace period"
    );
    assert_eq!(stats.destroyed, 1);

    // the straggler release still runs the destroy hook, exactly once
    drop(held);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    let stats = pool.stats();
    assert_eq!(stats.current_size, 0);
    assert_eq!(stats.destroyed, 1, "abandonment already counted the destroy");
}
