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

use std::error::Error;
use std::fmt;

/// The errors returned by a [`Pool`](crate::Pool).
///
/// `E` is the factory error type ([`ManageHandle::Error`](crate::ManageHandle::Error)).
#[derive(Debug)]
#[non_exhaustive]
pub enum PoolError<E> {
    /// The configuration was rejected at construction.
    InvalidConfig(&'static str),

    /// The pool could not be pre-warmed to `min_size` within the attempt
    /// budget. Partially created handles have been destroyed.
    Initialize {
        /// Number of factory `create` attempts made.
        attempts: usize,
        /// The last factory error, if the final attempt failed with one.
        source: Option<E>,
    },

    /// The factory failed to create a resource during lazy growth.
    ///
    /// Propagated directly to the `acquire` caller; the pool does not retry
    /// on this path.
    Create(E),

    /// A factory `create` call outran `create_timeout`.
    CreateTimeout,

    /// The `acquire` deadline elapsed before a handle became available.
    AcquireTimeout,

    /// The wait queue is full; the request was rejected without queueing.
    ///
    /// This is the backpressure signal. It is distinct from
    /// [`AcquireTimeout`](PoolError::AcquireTimeout) so callers can apply a
    /// different retry policy.
    Exhausted,

    /// A handle was routed back to the pool that the pool no longer
    /// recognizes as lent out.
    ///
    /// The pool logs this and leaves its state untouched; it is never
    /// returned from `acquire`.
    DoubleRelease,

    /// The pool has been shut down; no further operations are accepted.
    Closed,
}

impl<E: fmt::Display> fmt::Display for PoolError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::InvalidConfig(reason) => write!(f, "invalid pool config: {reason}"),
            PoolError::Initialize { attempts, .. } => {
                write!(f, "pool initialization failed after {attempts} attempts")
            }
            PoolError::Create(err) => write!(f, "failed to create resource: {err}"),
            PoolError::CreateTimeout => write!(f, "timed out creating resource"),
            PoolError::AcquireTimeout => write!(f, "timed out waiting for a pooled handle"),
            PoolError::Exhausted => write!(f, "pool exhausted: wait queue is full"),
            PoolError::DoubleRelease => write!(f, "handle released twice"),
            PoolError::Closed => write!(f, "pool is closed"),
        }
    }
}

impl<E: Error + 'static> Error for PoolError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PoolError::Create(err) => Some(err),
            PoolError::Initialize {
                source: Some(err), ..
            } => Some(err),
            _ => None,
        }
    }
}
