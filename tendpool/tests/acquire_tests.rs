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

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use tendpool::HandleStatus;
use tendpool::ManageHandle;
use tendpool::Pool;
use tendpool::PoolConfig;
use tendpool::PoolError;
use tendpool::QueueStrategy;

/// Hands out monotonically numbered handles and counts lifecycle hooks.
#[derive(Default)]
struct Manager {
    created: Arc<AtomicUsize>,
    destroyed: Arc<AtomicUsize>,
    broken: Arc<Mutex<HashSet<usize>>>,
}

impl ManageHandle for Manager {
    type Handle = usize;
    type Error = Infallible;

    async fn create(&self) -> Result<Self::Handle, Self::Error> {
        Ok(self.created.fetch_add(1, Ordering::SeqCst))
    }

    async fn validate(
        &self,
        handle: &mut Self::Handle,
        _status: &HandleStatus,
    ) -> Result<(), Self::Error> {
        if self.broken.lock().contains(handle) {
            // Infallible has no values; a panic here would abort the test,
            // so model "broken" as a validation that never completes
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn destroy(&self, _handle: Self::Handle) -> Result<(), Self::Error> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_acquire_reuses_idle_handle() {
    let manager = Manager::default();
    let created = manager.created.clone();
    let pool = Pool::new(PoolConfig::new(4), manager).unwrap();

    let handle = pool.acquire().await.unwrap();
    assert_eq!(*handle, 0);
    drop(handle);

    let handle = pool.acquire().await.unwrap();
    assert_eq!(*handle, 0, "the idle handle must be reused");
    assert_eq!(created.load(Ordering::SeqCst), 1);

    let stats = pool.stats();
    assert_eq!(stats.acquired, 2);
    assert_eq!(stats.released, 1);
    assert_eq!(stats.current_size, 1);
    assert_eq!(stats.active_count, 1);
    assert_eq!(stats.idle_count, 0);
}

#[tokio::test]
async fn test_idle_acquisition_is_lifo_by_default() {
    let pool = Pool::new(PoolConfig::new(3), Manager::default()).unwrap();

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    let c = pool.acquire().await.unwrap();
    drop(a);
    drop(b);
    drop(c);

    let handle = pool.acquire().await.unwrap();
    assert_eq!(*handle, 2, "LIFO must return the most recently released handle");
}

#[tokio::test]
async fn test_idle_acquisition_fifo_strategy() {
    let config = PoolConfig::new(3).with_queue_strategy(QueueStrategy::Fifo);
    let pool = Pool::new(config, Manager::default()).unwrap();

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    drop(a);
    drop(b);

    let handle = pool.acquire().await.unwrap();
    assert_eq!(*handle, 0, "FIFO must return the oldest idle handle");
}

#[tokio::test]
async fn test_create_error_propagates_to_caller() {
    struct FailingManager;

    impl ManageHandle for FailingManager {
        type Handle = ();
        type Error = std::io::Error;

        async fn create(&self) -> Result<Self::Handle, Self::Error> {
            Err(std::io::Error::other("connection refused"))
        }

        async fn validate(
            &self,
            _handle: &mut Self::Handle,
            _status: &HandleStatus,
        ) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    let pool = Pool::new(PoolConfig::new(2), FailingManager).unwrap();
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, PoolError::Create(_)));
    // the failed create must not leak a reservation
    assert_eq!(pool.stats().current_size, 0);
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, PoolError::Create(_)));
}

#[tokio::test(start_paused = true)]
async fn test_create_timeout_is_reported_distinctly() {
    struct SlowManager;

    impl ManageHandle for SlowManager {
        type Handle = ();
        type Error = Infallible;

        async fn create(&self) -> Result<Self::Handle, Self::Error> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }

        async fn validate(
            &self,
            _handle: &mut Self::Handle,
            _status: &HandleStatus,
        ) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    let config = PoolConfig::new(2).with_create_timeout(Duration::from_millis(100));
    let pool = Pool::new(config, SlowManager).unwrap();
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, PoolError::CreateTimeout));
    assert_eq!(pool.stats().current_size, 0);
}

#[tokio::test(start_paused = true)]
async fn test_validate_before_use_replaces_broken_handle() {
    let manager = Manager::default();
    let created = manager.created.clone();
    let destroyed = manager.destroyed.clone();
    let broken = manager.broken.clone();
    let config = PoolConfig::new(4)
        .with_validate_before_use(true)
        .with_validate_timeout(Duration::from_millis(50));
    let pool = Pool::new(config, manager).unwrap();

    let handle = pool.acquire().await.unwrap();
    assert_eq!(*handle, 0);
    drop(handle);

    broken.lock().insert(0);
    let handle = pool.acquire().await.unwrap();
    assert_eq!(*handle, 1, "the broken idle handle must be replaced");
    assert_eq!(created.load(Ordering::SeqCst), 2);
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);

    let stats = pool.stats();
    assert_eq!(stats.current_size, 1);
    assert_eq!(stats.created - stats.destroyed, stats.current_size as u64);
}

#[tokio::test]
async fn test_with_handle_runs_and_releases() {
    let pool = Pool::new(PoolConfig::new(2), Manager::default()).unwrap();

    let doubled = pool.with_handle(async |id| *id * 2).await.unwrap();
    assert_eq!(doubled, 0);

    let stats = pool.stats();
    assert_eq!(stats.idle_count, 1);
    assert_eq!(stats.active_count, 0);
}

#[tokio::test]
async fn test_with_handle_releases_on_panic() {
    let pool = Pool::new(PoolConfig::new(1), Manager::default()).unwrap();

    let task_pool = pool.clone();
    let result = tokio::spawn(async move {
        task_pool
            .with_handle(async |_id| panic!("user code exploded"))
            .await
    })
    .await;
    assert!(result.is_err(), "the task must have panicked");

    let stats = pool.stats();
    assert_eq!(stats.active_count, 0, "the handle must not leak on panic");
    assert_eq!(stats.idle_count, 1);

    // the pool is still usable afterwards
    let handle = pool.acquire().await.unwrap();
    assert_eq!(*handle, 0);
}

#[tokio::test]
async fn test_detach_removes_handle_without_destroy_hook() {
    let manager = Manager::default();
    let destroyed = manager.destroyed.clone();
    let pool = Pool::new(PoolConfig::new(2), manager).unwrap();

    let handle = pool.acquire().await.unwrap();
    let raw = handle.detach();
    assert_eq!(raw, 0);

    let stats = pool.stats();
    assert_eq!(stats.current_size, 0);
    assert_eq!(stats.destroyed, 1, "detach counts as a destroy in the stats");
    assert_eq!(destroyed.load(Ordering::SeqCst), 0, "the destroy hook must not run");
}

#[tokio::test]
async fn test_fail_destroys_handle_instead_of_reidling() {
    let manager = Manager::default();
    let created = manager.created.clone();
    let destroyed = manager.destroyed.clone();
    let pool = Pool::new(PoolConfig::new(2), manager).unwrap();

    let handle = pool.acquire().await.unwrap();
    handle.fail();

    // the destroy hook runs on a spawned task
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().current_size, 0);

    let handle = pool.acquire().await.unwrap();
    assert_eq!(*handle, 1, "a failed handle must never be lent out again");
    assert_eq!(created.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let err = Pool::new(PoolConfig::new(0), Manager::default()).unwrap_err();
    assert!(matches!(err, PoolError::InvalidConfig(_)));

    let err = Pool::new(PoolConfig::new(2).with_min_size(3), Manager::default()).unwrap_err();
    assert!(matches!(err, PoolError::InvalidConfig(_)));

    let config = PoolConfig::new(2).with_acquire_timeout(Duration::ZERO);
    let err = Pool::new(config, Manager::default()).unwrap_err();
    assert!(matches!(err, PoolError::InvalidConfig(_)));
}

#[tokio::test]
async fn test_stats_invariants_under_mixed_traffic() {
    let pool = Pool::new(PoolConfig::new(4).with_min_size(2), Manager::default()).unwrap();
    pool.initialize().await.unwrap();

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    let c = pool.acquire().await.unwrap();
    drop(b);

    let stats = pool.stats();
    assert_eq!(stats.idle_count + stats.active_count, stats.current_size);
    assert_eq!(stats.created - stats.destroyed, stats.current_size as u64);
    assert!(stats.current_size <= stats.max_size);
    assert!(stats.current_size >= stats.min_size);
    assert_eq!(stats.active_count, 2);
    assert_eq!(stats.idle_count, 1);

    drop(a);
    drop(c);
    let stats = pool.stats();
    assert_eq!(stats.idle_count, 3);
    assert_eq!(stats.active_count, 0);
}

#[tokio::test]
async fn test_stats_invariants_hold_at_every_observation() {
    let manager = Manager::default();
    let config = PoolConfig::new(3).with_max_queue_size(8);
    let pool = Pool::new(config, manager).unwrap();

    let mut tasks = Vec::new();
    for _ in 0..6 {
        let task_pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..20 {
                let handle = task_pool.acquire().await.unwrap();
                tokio::task::yield_now().await;
                drop(handle);
            }
        }));
    }

    // observe mid-churn: the books must balance at every snapshot
    for _ in 0..200 {
        let stats = pool.stats();
        assert_eq!(stats.idle_count + stats.active_count, stats.current_size);
        assert_eq!(stats.created - stats.destroyed, stats.current_size as u64);
        assert!(stats.current_size <= stats.max_size);
        tokio::task::yield_now().await;
    }
    for task in tasks {
        task.await.unwrap();
    }

    let stats = pool.stats();
    assert_eq!(stats.acquired, 120);
    assert_eq!(stats.released, 120);
}

#[tokio::test]
async fn test_initialize_prewarms_to_floor() {
    let manager = Manager::default();
    let created = manager.created.clone();
    let pool = Pool::new(PoolConfig::new(8).with_min_size(3), manager).unwrap();
    pool.initialize().await.unwrap();

    assert_eq!(created.load(Ordering::SeqCst), 3);
    let stats = pool.stats();
    assert_eq!(stats.current_size, 3);
    assert_eq!(stats.idle_count, 3);

    // a second call is a no-op
    pool.initialize().await.unwrap();
    assert_eq!(created.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_initialize_fails_within_attempt_budget() {
    struct FlakyManager {
        attempts: AtomicUsize,
        destroyed: Arc<AtomicUsize>,
    }

    impl ManageHandle for FlakyManager {
        type Handle = usize;
        type Error = std::io::Error;

        async fn create(&self) -> Result<Self::Handle, Self::Error> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            // succeed once, then keep failing: the floor of 3 is unreachable
            if n == 0 {
                Ok(n)
            } else {
                Err(std::io::Error::other("listener gone"))
            }
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

    let destroyed = Arc::new(AtomicUsize::new(0));
    let manager = FlakyManager {
        attempts: AtomicUsize::new(0),
        destroyed: destroyed.clone(),
    };
    let config = PoolConfig::new(8)
        .with_min_size(3)
        .with_max_retries(2)
        .with_retry_delay(Duration::from_millis(10));
    let pool = Pool::new(config, manager).unwrap();

    let err = pool.initialize().await.unwrap_err();
    match err {
        PoolError::Initialize { attempts, .. } => {
            assert_eq!(attempts, 5, "budget is min_size + max_retries");
        }
        other => panic!("expected an initialization error, got {other:?}"),
    }
    assert_eq!(
        destroyed.load(Ordering::SeqCst),
        1,
        "partially created handles must be destroyed"
    );
    assert_eq!(pool.stats().current_size, 0);
}
