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

use std::fmt;
use std::future::Future;

use tokio::time::Instant;

/// A trait whose instance creates, validates, and destroys pooled handles.
///
/// This is the only seam between the pool and the concrete resource. The pool
/// never inspects the resource itself; it calls `create` under
/// [`create_timeout`](crate::PoolConfig::create_timeout), `validate` under
/// [`validate_timeout`](crate::PoolConfig::validate_timeout), and `destroy`
/// on a best-effort basis (errors are logged, never propagated).
pub trait ManageHandle: Send + Sync + 'static {
    /// The type of resource that this instance manages.
    type Handle: Send + 'static;

    /// The type of errors that this instance can return.
    type Error: fmt::Debug + Send + 'static;

    /// Creates a new resource.
    fn create(&self) -> impl Future<Output = Result<Self::Handle, Self::Error>> + Send;

    /// Whether the resource behind `handle` is still usable.
    ///
    /// Returns `Ok(())` if the resource is healthy; otherwise, returns an error.
    /// This should be a cheap liveness probe (e.g. a ping).
    fn validate(
        &self,
        handle: &mut Self::Handle,
        status: &HandleStatus,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Tears down a resource that leaves the pool.
    ///
    /// The default implementation does nothing, which is suitable for
    /// resources that close themselves on drop.
    fn destroy(&self, _handle: Self::Handle) -> impl Future<Output = Result<(), Self::Error>> + Send {
        std::future::ready(Ok(()))
    }
}

/// A pool-unique identity for one handle.
///
/// Ids are assigned monotonically by the pool and never reused within a pool
/// instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The lifecycle state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// The factory is constructing the resource; not visible to `acquire`.
    Connecting,
    /// In the idle set; eligible for acquisition, eviction, and validation.
    Idle,
    /// Lent to exactly one user; invisible to the reaper and the monitor.
    InUse,
    /// Reported broken; scheduled for destruction, never re-idled.
    Failed,
    /// Terminal; the destroy hook has run and all bookkeeping is gone.
    Destroyed,
}

/// Bookkeeping about one pooled handle.
///
/// Readable from [`PooledHandle::status`](crate::PooledHandle::status) and
/// passed to [`ManageHandle::validate`]. All instants come from the tokio
/// clock.
#[derive(Debug, Clone, Copy)]
pub struct HandleStatus {
    state: HandleState,
    created: Instant,
    last_used: Instant,
    last_validated: Option<Instant>,
    reuse_count: usize,
    fail_count: u32,
}

impl HandleStatus {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            state: HandleState::Connecting,
            created: now,
            last_used: now,
            last_validated: None,
            reuse_count: 0,
            fail_count: 0,
        }
    }

    /// Returns the lifecycle state of the handle.
    pub fn state(&self) -> HandleState {
        self.state
    }

    /// Returns the instant when the handle was created.
    pub fn created(&self) -> Instant {
        self.created
    }

    /// Returns the instant when the handle was last lent out or released.
    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Returns the instant when the handle last passed validation, if ever.
    pub fn last_validated(&self) -> Option<Instant> {
        self.last_validated
    }

    /// Returns the number of times the handle was lent out after its first use.
    pub fn reuse_count(&self) -> usize {
        self.reuse_count
    }

    /// Returns the number of consecutive failed validations.
    pub fn fail_count(&self) -> u32 {
        self.fail_count
    }

    /// Marks the handle as lent out and refreshes `last_used`.
    ///
    /// Counts a reuse unless this is the first acquisition after `create`.
    pub(crate) fn note_acquired(&mut self, now: Instant) {
        debug_assert!(
            matches!(
                self.state,
                HandleState::Connecting | HandleState::Idle | HandleState::InUse
            ),
            "acquired a handle in state {:?}",
            self.state,
        );
        if self.state != HandleState::Connecting {
            self.reuse_count += 1;
        }
        self.state = HandleState::InUse;
        self.last_used = now;
    }

    /// Marks the handle as lent out without touching `last_used`.
    ///
    /// Used when the monitor borrows an idle handle; eviction age must not
    /// reset on a health probe.
    pub(crate) fn mark_in_use(&mut self) {
        debug_assert_eq!(self.state, HandleState::Idle);
        self.state = HandleState::InUse;
    }

    /// Parks the handle in the idle set without touching `last_used`.
    pub(crate) fn mark_idle(&mut self) {
        debug_assert!(
            matches!(self.state, HandleState::Connecting | HandleState::InUse),
            "parked a handle in state {:?}",
            self.state,
        );
        self.state = HandleState::Idle;
    }

    /// Refreshes `last_used`; called on release.
    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_used = now;
    }

    pub(crate) fn note_validated(&mut self, now: Instant) {
        self.last_validated = Some(now);
        self.fail_count = 0;
    }

    pub(crate) fn note_failed(&mut self) {
        debug_assert_ne!(self.state, HandleState::Destroyed);
        self.fail_count += 1;
        self.state = HandleState::Failed;
    }

    pub(crate) fn mark_destroyed(&mut self) {
        debug_assert_ne!(self.state, HandleState::Destroyed);
        self.state = HandleState::Destroyed;
    }
}
