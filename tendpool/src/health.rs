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

//! The health monitor: a background task that validates idle handles on
//! `health_check_interval` and repairs broken ones with bounded retries.
//! In-use handles are never probed; their health is the caller's
//! responsibility, surfaced via [`PooledHandle::fail`](crate::PooledHandle::fail).

use std::sync::Arc;

use tokio::time::Instant;
use tokio::time::interval_at;
use tracing::debug;

use crate::ManageHandle;
use crate::Pool;

/// Spawns the monitor task. It holds only a [`Weak`](std::sync::Weak)
/// reference to the pool and stops on shutdown or once the pool is dropped.
pub(crate) fn spawn<M: ManageHandle>(pool: &Arc<Pool<M>>) {
    let weak = Arc::downgrade(pool);
    let mut shutdown = pool.subscribe_shutdown();
    let period = pool.config().health_check_interval;
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            match weak.upgrade() {
                Some(pool) => pool.health_sweep().await,
                None => break,
            }
        }
        debug!("health monitor stopped");
    });
}
