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

//! A walkthrough of tendpool against a mock database backend: warm up a
//! floor of connections, run queries from many tasks at once, then shut
//! the pool down cleanly.

use std::io;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tendpool::HandleStatus;
use tendpool::ManageHandle;
use tendpool::Pool;
use tendpool::PoolConfig;
use tendpool::PoolError;

/// A stand-in for a real database connection.
#[derive(Debug)]
pub struct MockConn {
    serial: u64,
    queries: u64,
}

impl MockConn {
    async fn connect(serial: u64) -> Result<Self, io::Error> {
        // pretend to do a network handshake
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(Self { serial, queries: 0 })
    }

    async fn ping(&mut self) -> Result<(), io::Error> {
        tokio::time::sleep(Duration::from_millis(1)).await;
        Ok(())
    }

    pub async fn query(&mut self, sql: &str) -> u64 {
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.queries += 1;
        tracing::debug!(serial = self.serial, "ran query: {sql}");
        self.queries
    }
}

#[derive(Debug, Default)]
struct ManageConnection {
    next_serial: AtomicU64,
}

impl ManageHandle for ManageConnection {
    type Handle = MockConn;
    type Error = io::Error;

    async fn create(&self) -> Result<Self::Handle, Self::Error> {
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        MockConn::connect(serial).await
    }

    async fn validate(
        &self,
        conn: &mut Self::Handle,
        _status: &HandleStatus,
    ) -> Result<(), Self::Error> {
        conn.ping().await
    }

    async fn destroy(&self, conn: Self::Handle) -> Result<(), Self::Error> {
        tracing::debug!(serial = conn.serial, "closing connection");
        Ok(())
    }
}

/// The app-facing façade: clones share one pool.
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<ManageConnection>>,
}

impl Database {
    pub async fn connect() -> Result<Self, PoolError<io::Error>> {
        let config = PoolConfig::new(8)
            .with_min_size(2)
            .with_acquire_timeout(Duration::from_secs(5))
            .with_idle_timeout(Duration::from_secs(60))
            .with_health_check_interval(Duration::from_secs(10));
        let pool = Pool::new(config, ManageConnection::default())?;
        pool.initialize().await?;
        Ok(Self { pool })
    }

    pub async fn count_users(&self) -> Result<u64, PoolError<io::Error>> {
        self.pool
            .with_handle(async |conn| conn.query("SELECT count(*) FROM users").await)
            .await
    }

    pub async fn close(&self) {
        self.pool.shutdown().await;
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let db = Database::connect().await.unwrap();
    let stats = db.pool.stats();
    tracing::info!(idle = stats.idle_count, "warmed up the pool to its floor");

    let mut tasks = Vec::new();
    for worker in 0..16 {
        let db = db.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..4 {
                let rows = db.count_users().await.unwrap();
                tracing::debug!(worker, rows, "query done");
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let stats = db.pool.stats();
    tracing::info!(
        current = stats.current_size,
        created = stats.created,
        acquired = stats.acquired,
        "traffic burst finished"
    );

    db.close().await;
    tracing::info!("pool shut down");
}
