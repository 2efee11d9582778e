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
use std::collections::VecDeque;
use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio::time::sleep;
use tokio::time::timeout;
use tokio::time::timeout_at;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::CancellationBehavior;
use crate::HandleId;
use crate::HandleStatus;
use crate::ManageHandle;
use crate::PoolConfig;
use crate::PoolError;
use crate::QueueStrategy;
use crate::health;
use crate::queue::WaitQueue;
use crate::reaper;
use crate::sweep;

/// A snapshot of the pool's counters and gauges.
///
/// See [`Pool::stats`].
#[derive(Clone, Copy, Debug)]
#[non_exhaustive]
pub struct PoolStats {
    /// The minimum size of the pool.
    pub min_size: usize,
    /// The maximum size of the pool.
    pub max_size: usize,
    /// The current size of the pool (idle and in-use combined).
    pub current_size: usize,
    /// The number of idle handles in the pool.
    pub idle_count: usize,
    /// The number of handles lent out to callers.
    pub active_count: usize,
    /// The number of suspended `acquire` calls.
    pub wait_count: usize,
    /// Total number of handles created over the pool's lifetime.
    pub created: u64,
    /// Total number of handles destroyed over the pool's lifetime.
    pub destroyed: u64,
    /// Total number of successful acquisitions.
    pub acquired: u64,
    /// Total number of handles returned to the pool.
    pub released: u64,
    /// Total number of `acquire` calls rejected because the wait queue was
    /// full.
    pub queue_overflows: u64,
}

/// One handle plus its bookkeeping, owned by exactly one place at a time:
/// the idle deque, a [`PooledHandle`] guard, a delivery slot in transit, or
/// a background sweep.
struct HandleEntry<T> {
    id: HandleId,
    resource: T,
    status: HandleStatus,
}

/// The shared mutable registry. Every mutation happens under the pool mutex;
/// factory calls and user code never run while it is held.
struct Registry<T> {
    idle: VecDeque<HandleEntry<T>>,
    /// Ids of handles currently lent out (to callers or to a background
    /// sweep).
    lent: HashSet<HandleId>,
    /// Ids abandoned when the shutdown grace period overran. Already off the
    /// books; a late release still owes them the destroy hook.
    abandoned: HashSet<HandleId>,
    /// Reservations for factory `create` calls in flight. Not part of
    /// `current_size`; counted against `max_size` to cap growth.
    connecting: usize,
    current_size: usize,
    waiters: WaitQueue<HandleEntry<T>>,
    next_handle_id: u64,
    closed: bool,
}

impl<T> Registry<T> {
    fn pop_idle(&mut self, strategy: QueueStrategy) -> Option<HandleEntry<T>> {
        match strategy {
            QueueStrategy::Fifo => self.idle.pop_front(),
            QueueStrategy::Lifo => self.idle.pop_back(),
        }
    }

    fn allot_id(&mut self) -> HandleId {
        let id = HandleId::new(self.next_handle_id);
        self.next_handle_id += 1;
        id
    }

    fn assert_consistent(&self) {
        assert!(
            self.current_size == self.idle.len() + self.lent.len(),
            "invariant broken: idle + active == total (actual: {} + {} != {})",
            self.idle.len(),
            self.lent.len(),
            self.current_size,
        );
    }
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    destroyed: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
    queue_overflows: AtomicU64,
}

/// What an `acquire` call decided to do while holding the registry lock.
enum Plan<T> {
    Ready(HandleEntry<T>),
    Grow,
    Wait(u64, oneshot::Receiver<HandleEntry<T>>, Instant),
}

/// A managed pool of reusable handles.
///
/// The pool owns every handle's bookkeeping and is the only component that
/// moves handles between the idle set and the in-use set. Callers obtain
/// handles with [`Pool::acquire`] or [`Pool::with_handle`]; two background
/// tasks (the idle reaper and the health monitor) evict and repair idle
/// handles independently of acquire traffic.
///
/// The pool is always used wrapped in an [`Arc`]; background tasks hold a
/// [`Weak`] reference so that dropping the last user `Arc` stops them.
pub struct Pool<M: ManageHandle> {
    config: PoolConfig,
    manager: M,
    registry: Mutex<Registry<M::Handle>>,
    counters: Counters,
    /// Signaled whenever a lent handle leaves the in-use set; `shutdown`
    /// waits on it during the grace period.
    returned: Notify,
    shutdown_tx: watch::Sender<bool>,
}

impl<M: ManageHandle> std::fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<M: ManageHandle> Pool<M> {
    /// Creates a new [`Pool`] and spawns its background tasks.
    ///
    /// Returns [`PoolError::InvalidConfig`] if the configuration is
    /// inconsistent. Must be called within a tokio runtime. The pool starts
    /// empty; call [`Pool::initialize`] to pre-warm it to `min_size`.
    pub fn new(config: PoolConfig, manager: M) -> Result<Arc<Self>, PoolError<M::Error>> {
        config.validate().map_err(PoolError::InvalidConfig)?;

        let (shutdown_tx, _) = watch::channel(false);
        let pool = Arc::new(Self {
            config,
            manager,
            registry: Mutex::new(Registry {
                idle: VecDeque::with_capacity(config.max_size),
                lent: HashSet::with_capacity(config.max_size),
                abandoned: HashSet::new(),
                connecting: 0,
                current_size: 0,
                waiters: WaitQueue::new(),
                next_handle_id: 0,
                closed: false,
            }),
            counters: Counters::default(),
            returned: Notify::new(),
            shutdown_tx,
        });

        reaper::spawn(&pool);
        health::spawn(&pool);
        Ok(pool)
    }

    /// Returns the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Pre-warms the pool to `min_size` idle handles.
    ///
    /// The total number of factory `create` attempts is bounded by
    /// `min_size + max_retries`, with `retry_delay` between failed attempts.
    /// If the floor cannot be reached within that budget, every handle
    /// created so far is destroyed and [`PoolError::Initialize`] is
    /// returned.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), PoolError<M::Error>> {
        let gap = {
            let mut registry = self.registry.lock();
            if registry.closed {
                return Err(PoolError::Closed);
            }
            let gap = self
                .config
                .min_size
                .saturating_sub(registry.current_size + registry.connecting);
            registry.connecting += gap;
            gap
        };
        if gap == 0 {
            return Ok(());
        }

        let rollback = scopeguard::guard(gap, |n| {
            self.registry.lock().connecting -= n;
        });

        let budget = gap + self.config.max_retries;
        let mut attempts = 0;
        let mut warmed = Vec::with_capacity(gap);
        let mut last_err = None;
        while warmed.len() < gap {
            if attempts >= budget {
                drop(rollback);
                for resource in warmed {
                    if let Err(err) = self.manager.destroy(resource).await {
                        warn!(error = ?err, "destroy hook failed while unwinding initialization");
                    }
                }
                return Err(PoolError::Initialize {
                    attempts,
                    source: last_err,
                });
            }
            attempts += 1;
            match timeout(self.config.create_timeout, self.manager.create()).await {
                Ok(Ok(resource)) => warmed.push(resource),
                Ok(Err(err)) => {
                    warn!(attempts, error = ?err, "pre-warm create failed");
                    last_err = Some(err);
                    sleep(self.config.retry_delay).await;
                }
                Err(_) => {
                    warn!(attempts, "pre-warm create timed out");
                    last_err = None;
                    sleep(self.config.retry_delay).await;
                }
            }
        }
        scopeguard::ScopeGuard::into_inner(rollback);

        // the registry guard must not live across an await
        let leftover = {
            let now = Instant::now();
            let mut registry = self.registry.lock();
            registry.connecting -= gap;
            if registry.closed {
                Some(warmed)
            } else {
                for resource in warmed {
                    let id = registry.allot_id();
                    registry.current_size += 1;
                    self.counters.created.fetch_add(1, Ordering::Relaxed);
                    let entry = HandleEntry {
                        id,
                        resource,
                        status: HandleStatus::new(now),
                    };
                    self.deliver_or_park(&mut registry, entry, now);
                }
                registry.assert_consistent();
                None
            }
        };
        if let Some(warmed) = leftover {
            for resource in warmed {
                if let Err(err) = self.manager.destroy(resource).await {
                    warn!(error = ?err, "destroy hook failed during shutdown");
                }
            }
            return Err(PoolError::Closed);
        }

        info!(size = gap, "pool pre-warmed to its minimum size");
        Ok(())
    }

    /// Retrieves a [`PooledHandle`] from this [`Pool`].
    ///
    /// The algorithm, in order: pop an idle handle (validating it first if
    /// `validate_before_use` is set); else create a new one if the pool is
    /// below `max_size`; else suspend in the wait queue until a handle is
    /// released, bounded by `acquire_timeout`; else, if the wait queue is
    /// already at `max_queue_size`, fail immediately with
    /// [`PoolError::Exhausted`].
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledHandle<M>, PoolError<M::Error>> {
        loop {
            let now = Instant::now();
            let plan = {
                let mut registry = self.registry.lock();
                if registry.closed {
                    return Err(PoolError::Closed);
                }
                if let Some(mut entry) = registry.pop_idle(self.config.queue_strategy) {
                    entry.status.note_acquired(now);
                    registry.lent.insert(entry.id);
                    Plan::Ready(entry)
                } else if registry.current_size + registry.connecting < self.config.max_size {
                    registry.connecting += 1;
                    Plan::Grow
                } else {
                    registry.waiters.prune(now);
                    if registry.waiters.len() < self.config.max_queue_size {
                        let deadline = now + self.config.acquire_timeout;
                        let (waiter_id, rx) = registry.waiters.enqueue(now, deadline);
                        Plan::Wait(waiter_id, rx, deadline)
                    } else {
                        self.counters.queue_overflows.fetch_add(1, Ordering::Relaxed);
                        return Err(PoolError::Exhausted);
                    }
                }
            };

            match plan {
                Plan::Ready(entry) => {
                    let entry = if self.config.validate_before_use {
                        match self.validate_for_use(entry).await {
                            Some(entry) => entry,
                            // broken handle destroyed; take another route
                            None => continue,
                        }
                    } else {
                        entry
                    };
                    self.counters.acquired.fetch_add(1, Ordering::Relaxed);
                    return Ok(PooledHandle {
                        entry: Some(entry),
                        pool: Arc::downgrade(self),
                    });
                }
                Plan::Grow => {
                    let entry = self.create_lent().await?;
                    self.counters.acquired.fetch_add(1, Ordering::Relaxed);
                    return Ok(PooledHandle {
                        entry: Some(entry),
                        pool: Arc::downgrade(self),
                    });
                }
                Plan::Wait(waiter_id, mut rx, deadline) => {
                    debug!(waiter_id, "pool saturated; waiting for a released handle");
                    match timeout_at(deadline, &mut rx).await {
                        // delivery already counted as acquired by the releaser
                        Ok(Ok(entry)) => {
                            return Ok(PooledHandle {
                                entry: Some(entry),
                                pool: Arc::downgrade(self),
                            });
                        }
                        Ok(Err(_)) => {
                            // The slot was dropped: either shutdown drained
                            // the queue, or a releaser observed our deadline
                            // as elapsed just before the local timer fired.
                            return if Instant::now() >= deadline {
                                Err(PoolError::AcquireTimeout)
                            } else {
                                Err(PoolError::Closed)
                            };
                        }
                        Err(_) => {
                            let removed = self.registry.lock().waiters.remove(waiter_id);
                            if !removed {
                                // A delivery raced with the deadline. The
                                // handle is lent to us on the books; salvage
                                // it back through the release path.
                                if let Ok(entry) = rx.try_recv() {
                                    self.route_release(entry, false);
                                }
                            }
                            return Err(PoolError::AcquireTimeout);
                        }
                    }
                }
            }
        }
    }

    /// Acquires a handle, runs `f` with exclusive access to the resource,
    /// and releases the handle on every exit path of `f`.
    ///
    /// This is the recommended way to use the pool: the handle cannot leak
    /// out of the closure's scope.
    pub async fn with_handle<F, T>(self: &Arc<Self>, f: F) -> Result<T, PoolError<M::Error>>
    where
        F: AsyncFnOnce(&mut M::Handle) -> T,
    {
        let mut handle = self.acquire().await?;
        Ok(f(&mut *handle).await)
    }

    /// Shuts the pool down.
    ///
    /// Rejects every queued `acquire` call, destroys all idle handles, and
    /// waits up to `shutdown_grace` for in-flight handles to be released
    /// before abandoning them. Idempotent: later calls return immediately,
    /// and every future `acquire` fails with [`PoolError::Closed`].
    pub async fn shutdown(self: &Arc<Self>) {
        let idle = {
            let mut registry = self.registry.lock();
            if registry.closed {
                return;
            }
            registry.closed = true;
            let rejected = registry.waiters.drain();
            if rejected > 0 {
                debug!(rejected, "rejected queued acquire calls on shutdown");
            }
            let idle = std::mem::take(&mut registry.idle);
            registry.current_size -= idle.len();
            self.counters
                .destroyed
                .fetch_add(idle.len() as u64, Ordering::Relaxed);
            idle
        };
        let _ = self.shutdown_tx.send(true);

        let evicted = idle.len();
        for entry in idle {
            self.run_destroy(entry, "pool shutdown").await;
        }
        if evicted > 0 {
            debug!(evicted, "destroyed idle handles on shutdown");
        }

        let deadline = Instant::now() + self.config.shutdown_grace;
        loop {
            let notified = self.returned.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.registry.lock().lent.is_empty() {
                break;
            }
            if timeout_at(deadline, notified).await.is_err() {
                let abandoned = {
                    let mut registry = self.registry.lock();
                    let stragglers = std::mem::take(&mut registry.lent);
                    let n = stragglers.len();
                    registry.current_size -= n;
                    self.counters.destroyed.fetch_add(n as u64, Ordering::Relaxed);
                    // remember the ids so a late release still runs the
                    // destroy hook instead of tripping the double-release path
                    registry.abandoned.extend(stragglers);
                    n
                };
                if abandoned > 0 {
                    warn!(abandoned, "shutdown grace elapsed with handles still in use");
                }
                break;
            }
        }
        info!("pool shut down");
    }

    /// Returns a snapshot of the pool statistics.
    ///
    /// Only takes the registry lock for the gauge reads; safe to poll
    /// periodically for export.
    pub fn stats(&self) -> PoolStats {
        // `created` and `destroyed` only move under the registry lock, so
        // reading under it keeps the counters consistent with the gauges
        let registry = self.registry.lock();
        PoolStats {
            min_size: self.config.min_size,
            max_size: self.config.max_size,
            current_size: registry.current_size,
            idle_count: registry.idle.len(),
            active_count: registry.lent.len(),
            wait_count: registry.waiters.len(),
            created: self.counters.created.load(Ordering::Relaxed),
            destroyed: self.counters.destroyed.load(Ordering::Relaxed),
            acquired: self.counters.acquired.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            queue_overflows: self.counters.queue_overflows.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Creates a new handle for the calling acquirer. The caller must have
    /// reserved a `connecting` slot under the lock.
    async fn create_lent(self: &Arc<Self>) -> Result<HandleEntry<M::Handle>, PoolError<M::Error>> {
        let rollback = scopeguard::guard((), |()| {
            self.registry.lock().connecting -= 1;
        });
        let resource = match timeout(self.config.create_timeout, self.manager.create()).await {
            Ok(Ok(resource)) => resource,
            Ok(Err(err)) => return Err(PoolError::Create(err)),
            Err(_) => return Err(PoolError::CreateTimeout),
        };
        scopeguard::ScopeGuard::into_inner(rollback);

        let now = Instant::now();
        let mut registry = self.registry.lock();
        registry.connecting -= 1;
        let id = registry.allot_id();
        let mut status = HandleStatus::new(now);
        status.note_acquired(now);
        registry.current_size += 1;
        registry.lent.insert(id);
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        registry.assert_consistent();
        drop(registry);

        debug!(id = %id, "created a new handle under acquire pressure");
        Ok(HandleEntry {
            id,
            resource,
            status,
        })
    }

    /// Runs the `validate_before_use` check on a freshly popped idle handle.
    ///
    /// Returns `None` if the handle was broken (it has been destroyed). If
    /// the `acquire` future is dropped mid-validation, the handle's fate
    /// follows the configured [`CancellationBehavior`].
    async fn validate_for_use(
        self: &Arc<Self>,
        entry: HandleEntry<M::Handle>,
    ) -> Option<HandleEntry<M::Handle>> {
        let mut unready = UnreadyHandle {
            entry: Some(entry),
            pool: Arc::downgrade(self),
            behavior: self.config.cancellation_behavior,
        };
        let entry = unready.entry_mut();
        let status = entry.status;
        let outcome = timeout(
            self.config.validate_timeout,
            self.manager.validate(&mut entry.resource, &status),
        )
        .await;
        match outcome {
            Ok(Ok(())) => {
                let mut entry = unready.ready();
                entry.status.note_validated(Instant::now());
                Some(entry)
            }
            Ok(Err(err)) => {
                let mut entry = unready.ready();
                debug!(id = %entry.id, error = ?err, "idle handle failed validation before use");
                entry.status.note_failed();
                self.remove_lent(entry.id);
                self.run_destroy(entry, "failed validation before use").await;
                None
            }
            Err(_) => {
                let mut entry = unready.ready();
                debug!(id = %entry.id, "validation timed out before use");
                entry.status.note_failed();
                self.remove_lent(entry.id);
                self.run_destroy(entry, "validation timeout before use").await;
                None
            }
        }
    }

    /// Routes a returned handle: hand it to the oldest live waiter, or park
    /// it in the idle set. Failed handles are destroyed instead, and a
    /// replacement is created for waiters when capacity allows.
    fn route_release(self: &Arc<Self>, mut entry: HandleEntry<M::Handle>, failed: bool) {
        let now = Instant::now();
        let mut registry = self.registry.lock();

        if !registry.lent.remove(&entry.id) {
            let was_abandoned = registry.abandoned.remove(&entry.id);
            drop(registry);
            if was_abandoned {
                // already off the books; it still owes the destroy hook
                self.spawn_destroy(entry, "released after shutdown grace");
            } else {
                warn!(id = %entry.id, "double release: handle is not lent out; ignoring");
            }
            return;
        }
        self.counters.released.fetch_add(1, Ordering::Relaxed);

        if registry.closed {
            registry.current_size -= 1;
            self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
            drop(registry);
            self.spawn_destroy(entry, "released after shutdown");
            self.returned.notify_waiters();
            return;
        }

        if failed {
            entry.status.note_failed();
            registry.current_size -= 1;
            self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
            let wants_refill = registry.waiters.has_live(now);
            registry.assert_consistent();
            drop(registry);
            self.spawn_destroy(entry, "failed by caller");
            if wants_refill {
                self.spawn_refill_waiter();
            }
            return;
        }

        entry.status.touch(now);
        self.deliver_or_park(&mut registry, entry, now);
        registry.assert_consistent();
    }

    /// Hands `entry` to the oldest waiter that can still receive it, or
    /// parks it in the idle set. Must be called with the registry locked.
    fn deliver_or_park(
        &self,
        registry: &mut Registry<M::Handle>,
        mut entry: HandleEntry<M::Handle>,
        now: Instant,
    ) {
        loop {
            let Some(waiter) = registry.waiters.pop_live(now) else {
                break;
            };
            let waiter_id = waiter.id;
            let waited = waiter.waited;
            let id = entry.id;
            entry.status.note_acquired(now);
            registry.lent.insert(id);
            match waiter.deliver(entry) {
                Ok(()) => {
                    // count the acquisition here: the receiving caller only
                    // sees the handle, never this bookkeeping
                    self.counters.acquired.fetch_add(1, Ordering::Relaxed);
                    debug!(id = %id, waiter_id, waited = ?waited, "handed handle to the oldest waiter");
                    return;
                }
                Err(returned) => {
                    // receiver gone; try the next waiter
                    entry = returned;
                    registry.lent.remove(&id);
                }
            }
        }
        entry.status.mark_idle();
        registry.idle.push_back(entry);
    }

    /// Removes a lent handle from the books without running the destroy
    /// hook. Returns whether any waiter could use the freed capacity.
    fn remove_lent(&self, id: HandleId) -> bool {
        let mut registry = self.registry.lock();
        if !registry.lent.remove(&id) {
            registry.abandoned.remove(&id);
            return false;
        }
        registry.current_size -= 1;
        self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
        registry.assert_consistent();
        !registry.closed && registry.waiters.has_live(Instant::now())
    }

    /// Spawns a single best-effort create to serve a queued waiter after a
    /// handle was destroyed instead of released.
    fn spawn_refill_waiter(self: &Arc<Self>) {
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let pool = self.clone();
        rt.spawn(async move {
            pool.refill_one_waiter().await;
        });
    }

    async fn refill_one_waiter(self: &Arc<Self>) {
        {
            let mut registry = self.registry.lock();
            let now = Instant::now();
            if registry.closed
                || !registry.waiters.has_live(now)
                || registry.current_size + registry.connecting >= self.config.max_size
            {
                return;
            }
            registry.connecting += 1;
        }

        let rollback = scopeguard::guard((), |()| {
            self.registry.lock().connecting -= 1;
        });
        match timeout(self.config.create_timeout, self.manager.create()).await {
            Ok(Ok(resource)) => {
                scopeguard::ScopeGuard::into_inner(rollback);
                self.commit_replacement(resource).await;
            }
            Ok(Err(err)) => {
                warn!(error = ?err, "failed to create a replacement handle for a waiter");
            }
            Err(_) => {
                warn!("replacement create for a waiter timed out");
            }
        }
    }

    /// Books a freshly created resource into the pool and routes it to a
    /// waiter or the idle set. Destroys it instead if the pool closed in the
    /// meantime.
    async fn commit_replacement(self: &Arc<Self>, resource: M::Handle) {
        // the registry guard must not live across an await
        let leftover = {
            let now = Instant::now();
            let mut registry = self.registry.lock();
            registry.connecting -= 1;
            if registry.closed {
                Some(resource)
            } else {
                let id = registry.allot_id();
                registry.current_size += 1;
                self.counters.created.fetch_add(1, Ordering::Relaxed);
                let entry = HandleEntry {
                    id,
                    resource,
                    status: HandleStatus::new(now),
                };
                self.deliver_or_park(&mut registry, entry, now);
                registry.assert_consistent();
                None
            }
        };
        if let Some(resource) = leftover {
            if let Err(err) = self.manager.destroy(resource).await {
                warn!(error = ?err, "destroy hook failed for a handle created after shutdown");
            }
        }
    }

    /// One idle reaper sweep: evicts handles idle past `idle_timeout`,
    /// oldest first, never shrinking below `min_size`.
    pub(crate) async fn reap_idle(self: &Arc<Self>) {
        let (expired, kept) = {
            let now = Instant::now();
            let mut registry = self.registry.lock();
            if registry.closed {
                return;
            }
            let budget = registry.current_size.saturating_sub(self.config.min_size);
            if budget == 0 {
                return;
            }
            let mut candidates: Vec<(Instant, HandleId)> = registry
                .idle
                .iter()
                .filter(|entry| {
                    now.duration_since(entry.status.last_used()) > self.config.idle_timeout
                })
                .map(|entry| (entry.status.last_used(), entry.id))
                .collect();
            if candidates.is_empty() {
                return;
            }
            candidates.sort();
            candidates.truncate(budget);
            let victims: HashSet<HandleId> = candidates.into_iter().map(|(_, id)| id).collect();
            let outcome = sweep::sweep_deque(&mut registry.idle, |entry| {
                !victims.contains(&entry.id)
            });
            registry.current_size -= outcome.removed.len();
            self.counters
                .destroyed
                .fetch_add(outcome.removed.len() as u64, Ordering::Relaxed);
            registry.assert_consistent();
            (outcome.removed, outcome.kept)
        };

        let evicted = expired.len();
        for entry in expired {
            self.run_destroy(entry, "idle timeout").await;
        }
        if evicted > 0 {
            debug!(evicted, kept, "idle reaper evicted handles");
        }
    }

    /// One health monitor sweep: validates each idle handle in turn and
    /// repairs broken ones with bounded retries.
    pub(crate) async fn health_sweep(self: &Arc<Self>) {
        let ids: Vec<HandleId> = {
            let registry = self.registry.lock();
            if registry.closed {
                return;
            }
            registry.idle.iter().map(|entry| entry.id).collect()
        };

        for id in ids {
            // handles acquired since the snapshot are skipped; in-use
            // handles are the caller's responsibility
            let Some(mut entry) = self.borrow_idle(id) else {
                continue;
            };
            let status = entry.status;
            let outcome = timeout(
                self.config.validate_timeout,
                self.manager.validate(&mut entry.resource, &status),
            )
            .await;
            match outcome {
                Ok(Ok(())) => {
                    entry.status.note_validated(Instant::now());
                    self.return_borrowed(entry);
                }
                Ok(Err(err)) => {
                    debug!(id = %id, error = ?err, "idle handle failed its health check");
                    entry.status.note_failed();
                    self.repair(entry).await;
                }
                Err(_) => {
                    debug!(id = %id, "health check timed out");
                    entry.status.note_failed();
                    self.repair(entry).await;
                }
            }
            if *self.shutdown_tx.borrow() {
                return;
            }
        }
    }

    /// Takes one idle handle out for a health probe, accounting it as lent
    /// so the registry invariant holds while the probe runs.
    fn borrow_idle(&self, id: HandleId) -> Option<HandleEntry<M::Handle>> {
        let mut registry = self.registry.lock();
        let idx = registry.idle.iter().position(|entry| entry.id == id)?;
        let mut entry = registry.idle.remove(idx)?;
        entry.status.mark_in_use();
        registry.lent.insert(entry.id);
        registry.assert_consistent();
        Some(entry)
    }

    /// Puts a handle that passed its health probe back. `last_used` is left
    /// untouched so a probe never resets the eviction age.
    fn return_borrowed(self: &Arc<Self>, entry: HandleEntry<M::Handle>) {
        let now = Instant::now();
        let mut registry = self.registry.lock();
        if !registry.lent.remove(&entry.id) {
            // abandoned at grace overrun while the probe was running
            registry.abandoned.remove(&entry.id);
            drop(registry);
            self.spawn_destroy(entry, "released after shutdown grace");
            return;
        }
        if registry.closed {
            registry.current_size -= 1;
            self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
            drop(registry);
            self.spawn_destroy(entry, "released after shutdown");
            return;
        }
        self.deliver_or_park(&mut registry, entry, now);
        registry.assert_consistent();
    }

    /// Destroys a broken idle handle and tries to reconnect up to
    /// `max_retries` times. If every attempt fails, restores the `min_size`
    /// floor with one extra best-effort create.
    async fn repair(self: &Arc<Self>, entry: HandleEntry<M::Handle>) {
        let old_id = entry.id;
        let recognized = {
            // hold the slot as a reservation so lazy growth cannot take it
            // while the reconnect attempts run
            let mut registry = self.registry.lock();
            if registry.lent.remove(&old_id) {
                registry.current_size -= 1;
                registry.connecting += 1;
                self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
                registry.assert_consistent();
                true
            } else {
                // abandoned at grace overrun; off the books already
                registry.abandoned.remove(&old_id);
                false
            }
        };
        self.run_destroy(entry, "failed health check").await;
        if !recognized {
            return;
        }

        for attempt in 1..=self.config.max_retries {
            sleep(self.config.retry_delay).await;
            if *self.shutdown_tx.borrow() {
                self.registry.lock().connecting -= 1;
                return;
            }
            match timeout(self.config.create_timeout, self.manager.create()).await {
                Ok(Ok(resource)) => {
                    debug!(old_id = %old_id, attempt, "replaced a broken idle handle");
                    self.commit_replacement(resource).await;
                    return;
                }
                Ok(Err(err)) => {
                    warn!(old_id = %old_id, attempt, error = ?err, "reconnect attempt failed");
                }
                Err(_) => {
                    warn!(old_id = %old_id, attempt, "reconnect attempt timed out");
                }
            }
        }

        // retries exhausted; restore the floor only if this loss dug below it
        let restore = {
            let mut registry = self.registry.lock();
            registry.connecting -= 1;
            let below = !registry.closed
                && registry.current_size + registry.connecting < self.config.min_size;
            if below {
                registry.connecting += 1;
            }
            below
        };
        if !restore {
            warn!(
                old_id = %old_id,
                attempts = self.config.max_retries,
                "gave up repairing a broken idle handle"
            );
            return;
        }
        match timeout(self.config.create_timeout, self.manager.create()).await {
            Ok(Ok(resource)) => {
                self.commit_replacement(resource).await;
            }
            Ok(Err(err)) => {
                self.registry.lock().connecting -= 1;
                warn!(error = ?err, "failed to restore the minimum pool size");
            }
            Err(_) => {
                self.registry.lock().connecting -= 1;
                warn!("create timed out while restoring the minimum pool size");
            }
        }
    }

    /// Runs the factory destroy hook, absorbing its errors.
    async fn run_destroy(&self, entry: HandleEntry<M::Handle>, reason: &'static str) {
        let HandleEntry {
            id,
            resource,
            mut status,
        } = entry;
        status.mark_destroyed();
        debug!(id = %id, reason, "destroying handle");
        if let Err(err) = self.manager.destroy(resource).await {
            warn!(id = %id, error = ?err, "destroy hook failed");
        }
    }

    /// Schedules the destroy hook from a synchronous context (guard drops).
    fn spawn_destroy(self: &Arc<Self>, entry: HandleEntry<M::Handle>, reason: &'static str) {
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let pool = self.clone();
                rt.spawn(async move {
                    pool.run_destroy(entry, reason).await;
                });
            }
            Err(_) => {
                // dropped outside the runtime; the resource's own Drop has
                // to suffice
                warn!(id = %entry.id, reason, "no runtime to run the destroy hook");
            }
        }
    }
}

/// A handle lent out by the pool.
///
/// Dereferences to the pooled resource. Dropping the guard releases the
/// handle: it is handed to the oldest waiter if one is queued, otherwise it
/// returns to the idle set. Call [`PooledHandle::fail`] instead when the
/// resource turned out to be broken, or [`PooledHandle::detach`] to take the
/// resource out of the pool for good.
pub struct PooledHandle<M: ManageHandle> {
    entry: Option<HandleEntry<M::Handle>>,
    pool: Weak<Pool<M>>,
}

impl<M> std::fmt::Debug for PooledHandle<M>
where
    M: ManageHandle,
    M::Handle: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // SAFETY: `entry` is always `Some` while the guard is owned.
        let entry = self.entry.as_ref().unwrap();
        f.debug_struct("PooledHandle")
            .field("id", &entry.id)
            .field("resource", &entry.resource)
            .field("status", &entry.status)
            .finish()
    }
}

impl<M: ManageHandle> Drop for PooledHandle<M> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            if let Some(pool) = self.pool.upgrade() {
                pool.route_release(entry, false);
            }
        }
    }
}

impl<M: ManageHandle> Deref for PooledHandle<M> {
    type Target = M::Handle;
    fn deref(&self) -> &M::Handle {
        // SAFETY: `entry` is always `Some` while the guard is owned.
        &self.entry.as_ref().unwrap().resource
    }
}

impl<M: ManageHandle> DerefMut for PooledHandle<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: `entry` is always `Some` while the guard is owned.
        &mut self.entry.as_mut().unwrap().resource
    }
}

impl<M: ManageHandle> AsRef<M::Handle> for PooledHandle<M> {
    fn as_ref(&self) -> &M::Handle {
        self
    }
}

impl<M: ManageHandle> AsMut<M::Handle> for PooledHandle<M> {
    fn as_mut(&mut self) -> &mut M::Handle {
        self
    }
}

impl<M: ManageHandle> PooledHandle<M> {
    /// Returns the pool-unique id of this handle.
    pub fn id(&self) -> HandleId {
        // SAFETY: `entry` is always `Some` while the guard is owned.
        self.entry.as_ref().unwrap().id
    }

    /// Returns the bookkeeping status of this handle.
    pub fn status(&self) -> HandleStatus {
        // SAFETY: `entry` is always `Some` while the guard is owned.
        self.entry.as_ref().unwrap().status
    }

    /// Reports the resource as broken and releases the handle.
    ///
    /// The handle is destroyed instead of returning to the idle set. If a
    /// caller is queued, the pool creates a replacement for it when capacity
    /// allows. This is the only way to surface an in-use failure; the
    /// resource itself never signals the pool asynchronously.
    pub fn fail(mut self) {
        if let Some(entry) = self.entry.take() {
            if let Some(pool) = self.pool.upgrade() {
                pool.route_release(entry, true);
            }
        }
    }

    /// Detaches the handle from the pool and returns the raw resource.
    ///
    /// The pool shrinks by one; the destroy hook does not run. Counts as a
    /// destroy in the statistics.
    pub fn detach(mut self) -> M::Handle {
        // SAFETY: `entry` is always `Some` while the guard is owned.
        let entry = self.entry.take().unwrap();
        if let Some(pool) = self.pool.upgrade() {
            debug!(id = %entry.id, "handle detached from the pool");
            if pool.remove_lent(entry.id) {
                pool.spawn_refill_waiter();
            }
        }
        entry.resource
    }
}

/// Drop guard for the window where an idle handle is being validated before
/// use. If the `acquire` future is cancelled there, the handle is destroyed
/// or re-parked according to the pool's [`CancellationBehavior`].
struct UnreadyHandle<M: ManageHandle> {
    entry: Option<HandleEntry<M::Handle>>,
    pool: Weak<Pool<M>>,
    behavior: CancellationBehavior,
}

impl<M: ManageHandle> Drop for UnreadyHandle<M> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            if let Some(pool) = self.pool.upgrade() {
                match self.behavior {
                    CancellationBehavior::Detach => {
                        debug!(id = %entry.id, "acquire cancelled mid-validation; destroying handle");
                        let wants_refill = pool.remove_lent(entry.id);
                        pool.spawn_destroy(entry, "acquire cancelled during validation");
                        if wants_refill {
                            pool.spawn_refill_waiter();
                        }
                    }
                    CancellationBehavior::ReturnToPool => {
                        let now = Instant::now();
                        let mut registry = pool.registry.lock();
                        if !registry.lent.remove(&entry.id) {
                            // abandoned at grace overrun mid-validation
                            registry.abandoned.remove(&entry.id);
                            drop(registry);
                            pool.spawn_destroy(entry, "released after shutdown grace");
                            return;
                        }
                        if registry.closed {
                            registry.current_size -= 1;
                            pool.counters.destroyed.fetch_add(1, Ordering::Relaxed);
                            drop(registry);
                            pool.spawn_destroy(entry, "released after shutdown");
                            return;
                        }
                        pool.deliver_or_park(&mut registry, entry, now);
                        registry.assert_consistent();
                    }
                }
            }
        }
    }
}

impl<M: ManageHandle> UnreadyHandle<M> {
    fn ready(mut self) -> HandleEntry<M::Handle> {
        // SAFETY: `entry` is always `Some` until `ready` is called.
        self.entry.take().unwrap()
    }

    fn entry_mut(&mut self) -> &mut HandleEntry<M::Handle> {
        // SAFETY: `entry` is always `Some` until `ready` is called.
        self.entry.as_mut().unwrap()
    }
}
