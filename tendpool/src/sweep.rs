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

/// The result of [`sweep_deque`].
pub(crate) struct SweepOutcome<T> {
    /// The number of elements kept, in their original order.
    pub(crate) kept: usize,
    /// The elements removed from the deque.
    pub(crate) removed: Vec<T>,
}

/// Removes the elements of `deque` for which `keep` returns false, in place.
///
/// Runs in O(n) with at most one swap per retained element; the relative
/// order of kept elements is preserved. Removed elements are handed back so
/// the caller can run teardown outside the pool lock.
pub(crate) fn sweep_deque<T>(
    deque: &mut VecDeque<T>,
    mut keep: impl FnMut(&T) -> bool,
) -> SweepOutcome<T> {
    let len = deque.len();
    let mut idx = 0;
    let mut cur = 0;

    // Stage 1: all values so far are retained.
    while cur < len {
        if !keep(&deque[cur]) {
            cur += 1;
            break;
        }
        cur += 1;
        idx += 1;
    }

    // Stage 2: swap each retained value into the current idx.
    while cur < len {
        if !keep(&deque[cur]) {
            cur += 1;
            continue;
        }
        deque.swap(idx, cur);
        cur += 1;
        idx += 1;
    }

    // Stage 3: split all values after idx off.
    let removed = if cur != idx {
        deque.split_off(idx).into_iter().collect()
    } else {
        Vec::new()
    };

    SweepOutcome { kept: idx, removed }
}
