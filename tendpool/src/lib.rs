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

//! A managed connection pool for Async Rust.
//!
//! `tendpool` bounds the number of concurrently open handles to an
//! expensive-to-create resource, reuses idle handles, queues callers fairly
//! under load, and self-heals handles that go bad while idle.
//!
//! # Example
//!
//! ```
//! use tendpool::HandleStatus;
//! use tendpool::ManageHandle;
//! use tendpool::Pool;
//! use tendpool::PoolConfig;
//!
//! struct Conn;
//! impl Conn {
//!     async fn query(&self) -> i32 {
//!         42
//!     }
//! }
//!
//! struct Manager;
//! impl ManageHandle for Manager {
//!     type Handle = Conn;
//!     type Error = std::io::Error;
//!
//!     async fn create(&self) -> Result<Self::Handle, Self::Error> {
//!         Ok(Conn)
//!     }
//!
//!     async fn validate(
//!         &self,
//!         _handle: &mut Self::Handle,
//!         _status: &HandleStatus,
//!     ) -> Result<(), Self::Error> {
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let pool = Pool::new(PoolConfig::new(16).with_min_size(2), Manager).unwrap();
//! pool.initialize().await.unwrap();
//!
//! let answer = pool.with_handle(async |conn| conn.query().await).await.unwrap();
//! assert_eq!(answer, 42);
//!
//! pool.shutdown().await;
//! # }
//! ```

mod config;
mod error;
mod health;
mod manage;
mod pool;
mod queue;
mod reaper;
mod sweep;

pub use config::CancellationBehavior;
pub use config::PoolConfig;
pub use config::QueueStrategy;
pub use error::PoolError;
pub use manage::HandleId;
pub use manage::HandleState;
pub use manage::HandleStatus;
pub use manage::ManageHandle;
pub use pool::Pool;
pub use pool::PoolStats;
pub use pool::PooledHandle;
