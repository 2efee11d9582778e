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

use std::time::Duration;

/// Queue strategy when dequeuing handles from the idle set.
///
/// This only affects the idle set. The wait queue of suspended `acquire`
/// calls is always first in first out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum QueueStrategy {
    /// First in first out.
    ///
    /// This strategy behaves like a queue and spreads load evenly over all
    /// idle handles.
    Fifo,
    /// Last in first out.
    ///
    /// This strategy behaves like a stack. It keeps the working set small so
    /// that surplus handles age out.
    #[default]
    Lifo,
}

/// Behavior when an `acquire` call is cancelled during the
/// validate-before-use check.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CancellationBehavior {
    /// Destroy the handle that was being validated (default).
    #[default]
    Detach,

    /// Return the handle to the idle set for potential reuse.
    ReturnToPool,
}

/// The configuration of [`Pool`](crate::Pool).
///
/// The pool takes an immutable snapshot of this struct at construction.
#[derive(Clone, Copy, Debug)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Minimum number of handles the pool maintains.
    ///
    /// [`Pool::initialize`](crate::Pool::initialize) pre-warms to this floor,
    /// the idle reaper never evicts below it, and the health monitor restores
    /// it after destroying a broken handle.
    pub min_size: usize,

    /// Maximum number of handles, in use and idle combined.
    pub max_size: usize,

    /// How long a handle may sit idle before the reaper may evict it.
    pub idle_timeout: Duration,

    /// Total time an `acquire` call may wait for a handle.
    pub acquire_timeout: Duration,

    /// Time budget for a single factory `create` call.
    ///
    /// Independent of `acquire_timeout`; the two budgets do not nest.
    pub create_timeout: Duration,

    /// Time budget for a single factory `validate` call.
    pub validate_timeout: Duration,

    /// Interval between health monitor sweeps over the idle set.
    pub health_check_interval: Duration,

    /// Interval between idle reaper sweeps.
    pub reap_interval: Duration,

    /// Number of reconnect attempts when an idle handle fails validation.
    pub max_retries: usize,

    /// Delay between reconnect attempts.
    pub retry_delay: Duration,

    /// Maximum number of suspended `acquire` calls.
    ///
    /// Once the queue is full, further `acquire` calls fail immediately with
    /// [`PoolError::Exhausted`](crate::PoolError::Exhausted).
    pub max_queue_size: usize,

    /// How long `shutdown` waits for in-flight handles to be released.
    pub shutdown_grace: Duration,

    /// Whether to validate an idle handle before lending it out.
    pub validate_before_use: bool,

    /// Queue strategy of the idle set.
    pub queue_strategy: QueueStrategy,

    /// Behavior when an `acquire` call is cancelled mid-validation.
    pub cancellation_behavior: CancellationBehavior,
}

impl PoolConfig {
    /// Creates a new [`PoolConfig`] with the given maximum size.
    ///
    /// `max_queue_size` defaults to `max_size`; `min_size` defaults to zero
    /// (fully lazy pool).
    pub fn new(max_size: usize) -> Self {
        Self {
            min_size: 0,
            max_size,
            idle_timeout: Duration::from_secs(10 * 60),
            acquire_timeout: Duration::from_secs(30),
            create_timeout: Duration::from_secs(10),
            validate_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(30),
            reap_interval: Duration::from_secs(60),
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            max_queue_size: max_size,
            shutdown_grace: Duration::from_secs(5),
            validate_before_use: false,
            queue_strategy: QueueStrategy::default(),
            cancellation_behavior: CancellationBehavior::default(),
        }
    }

    /// Returns a new [`PoolConfig`] with the specified minimum size.
    pub fn with_min_size(mut self, min_size: usize) -> Self {
        self.min_size = min_size;
        self
    }

    /// Returns a new [`PoolConfig`] with the specified idle timeout.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Returns a new [`PoolConfig`] with the specified acquire timeout.
    pub fn with_acquire_timeout(mut self, acquire_timeout: Duration) -> Self {
        self.acquire_timeout = acquire_timeout;
        self
    }

    /// Returns a new [`PoolConfig`] with the specified create timeout.
    pub fn with_create_timeout(mut self, create_timeout: Duration) -> Self {
        self.create_timeout = create_timeout;
        self
    }

    /// Returns a new [`PoolConfig`] with the specified validate timeout.
    pub fn with_validate_timeout(mut self, validate_timeout: Duration) -> Self {
        self.validate_timeout = validate_timeout;
        self
    }

    /// Returns a new [`PoolConfig`] with the specified health check interval.
    pub fn with_health_check_interval(mut self, health_check_interval: Duration) -> Self {
        self.health_check_interval = health_check_interval;
        self
    }

    /// Returns a new [`PoolConfig`] with the specified reap interval.
    pub fn with_reap_interval(mut self, reap_interval: Duration) -> Self {
        self.reap_interval = reap_interval;
        self
    }

    /// Returns a new [`PoolConfig`] with the specified number of reconnect
    /// attempts.
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Returns a new [`PoolConfig`] with the specified delay between
    /// reconnect attempts.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Returns a new [`PoolConfig`] with the specified wait queue bound.
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Returns a new [`PoolConfig`] with the specified shutdown grace period.
    pub fn with_shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
        self.shutdown_grace = shutdown_grace;
        self
    }

    /// Returns a new [`PoolConfig`] that validates handles before lending
    /// them out.
    pub fn with_validate_before_use(mut self, validate_before_use: bool) -> Self {
        self.validate_before_use = validate_before_use;
        self
    }

    /// Returns a new [`PoolConfig`] with the specified idle queue strategy.
    pub fn with_queue_strategy(mut self, queue_strategy: QueueStrategy) -> Self {
        self.queue_strategy = queue_strategy;
        self
    }

    /// Returns a new [`PoolConfig`] with the specified cancellation behavior.
    pub fn with_cancellation_behavior(
        mut self,
        cancellation_behavior: CancellationBehavior,
    ) -> Self {
        self.cancellation_behavior = cancellation_behavior;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), &'static str> {
        if self.max_size < 1 {
            return Err("max_size must be at least 1");
        }
        if self.min_size > self.max_size {
            return Err("min_size must not exceed max_size");
        }
        if self.idle_timeout.is_zero() {
            return Err("idle_timeout must be positive");
        }
        if self.acquire_timeout.is_zero() {
            return Err("acquire_timeout must be positive");
        }
        if self.create_timeout.is_zero() {
            return Err("create_timeout must be positive");
        }
        if self.validate_timeout.is_zero() {
            return Err("validate_timeout must be positive");
        }
        if self.health_check_interval.is_zero() {
            return Err("health_check_interval must be positive");
        }
        if self.reap_interval.is_zero() {
            return Err("reap_interval must be positive");
        }
        if self.shutdown_grace.is_zero() {
            return Err("shutdown_grace must be positive");
        }
        Ok(())
    }
}
