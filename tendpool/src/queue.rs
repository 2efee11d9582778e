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

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

/// One suspended `acquire` call.
struct Waiter<P> {
    id: u64,
    enqueued: Instant,
    deadline: Instant,
    tx: oneshot::Sender<P>,
}

/// A strictly FIFO queue of suspended `acquire` calls.
///
/// Each entry owns a one-shot delivery slot. A payload is delivered at most
/// once; a timed-out or cancelled entry is removed and any slot it left
/// behind is skipped on delivery. Dropping an entry drops its sender, which
/// wakes the suspended caller with a closed-channel error.
pub(crate) struct WaitQueue<P> {
    entries: VecDeque<Waiter<P>>,
    next_id: u64,
}

/// A waiter popped from the queue whose deadline has not elapsed.
pub(crate) struct LiveWaiter<P> {
    pub(crate) id: u64,
    pub(crate) waited: Duration,
    tx: oneshot::Sender<P>,
}

impl<P> LiveWaiter<P> {
    /// Sends the payload into the slot.
    ///
    /// Returns the payload back if the receiving side is already gone so the
    /// caller can try the next waiter.
    pub(crate) fn deliver(self, payload: P) -> Result<(), P> {
        self.tx.send(payload)
    }
}

impl<P> WaitQueue<P> {
    pub(crate) fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            next_id: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Appends a new entry and returns its id and the delivery slot.
    pub(crate) fn enqueue(
        &mut self,
        now: Instant,
        deadline: Instant,
    ) -> (u64, oneshot::Receiver<P>) {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = oneshot::channel();
        self.entries.push_back(Waiter {
            id,
            enqueued: now,
            deadline,
            tx,
        });
        (id, rx)
    }

    /// Removes the entry with the given id.
    ///
    /// Returns false if the entry is already gone, which means a delivery or
    /// a drain got there first.
    pub(crate) fn remove(&mut self, id: u64) -> bool {
        match self.entries.iter().position(|waiter| waiter.id == id) {
            Some(idx) => {
                self.entries.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Pops the oldest waiter that can still receive a handle.
    ///
    /// Entries whose deadline has elapsed are dropped on the way: their
    /// callers time out on their own, and a handle must never be delivered
    /// past an observed deadline.
    pub(crate) fn pop_live(&mut self, now: Instant) -> Option<LiveWaiter<P>> {
        while let Some(waiter) = self.entries.pop_front() {
            if waiter.deadline <= now {
                continue;
            }
            return Some(LiveWaiter {
                id: waiter.id,
                waited: now.duration_since(waiter.enqueued),
                tx: waiter.tx,
            });
        }
        None
    }

    /// Whether any entry could still receive a handle.
    pub(crate) fn has_live(&self, now: Instant) -> bool {
        self.entries
            .iter()
            .any(|waiter| waiter.deadline > now && !waiter.tx.is_closed())
    }

    /// Drops entries that can no longer receive a handle.
    ///
    /// Keeps the queue length an honest measure for the backpressure check.
    pub(crate) fn prune(&mut self, now: Instant) {
        self.entries
            .retain(|waiter| waiter.deadline > now && !waiter.tx.is_closed());
    }

    /// Drops every entry, waking all suspended callers with a closed slot.
    ///
    /// Returns the number of entries rejected.
    pub(crate) fn drain(&mut self) -> usize {
        let rejected = self.entries.len();
        self.entries.clear();
        rejected
    }
}
