//! Bounded pool of backend store connections

use crate::storage::{Connector, Store};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Pool sizing and recycling policy
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections borrowed at once.
    pub max_size: usize,
    /// Idle connections older than this are closed instead of reused.
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_size: 3,
            idle_timeout: Duration::from_secs(240),
        }
    }
}

struct IdleConnection {
    conn: Box<dyn Store>,
    since: Instant,
}

struct Shared {
    connector: Box<dyn Connector>,
    idle: Mutex<Vec<IdleConnection>>,
    permits: Arc<Semaphore>,
    config: PoolConfig,
}

/// Shared handle to the pool. Cloning is cheap; every clone borrows from the same connections.
#[derive(Clone)]
pub struct StorePool {
    shared: Arc<Shared>,
}

impl StorePool {
    /// Create a pool. No connections are opened until the first borrow.
    pub fn new(connector: impl Connector, config: PoolConfig) -> Self {
        let max_size = config.max_size.max(1);
        StorePool {
            shared: Arc::new(Shared {
                connector: Box::new(connector),
                idle: Mutex::new(Vec::new()),
                permits: Arc::new(Semaphore::new(max_size)),
                config,
            }),
        }
    }

    /// Borrow a connection, waiting while the pool is exhausted.
    ///
    /// Idle connections are checked with a liveness probe before being handed
    /// out; stale or failing ones are dropped and a fresh connection is opened.
    pub async fn get(&self) -> Result<PooledConnection> {
        let permit = Arc::clone(&self.shared.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::Connection("Pool is closed".to_string()))?;

        while let Some(mut idle) = self.pop_idle() {
            if idle.since.elapsed() > self.shared.config.idle_timeout {
                debug!("Dropping store connection idle for {:?}", idle.since.elapsed());
                continue;
            }
            match idle.conn.ping().await {
                Ok(()) => return Ok(self.wrap(idle.conn, permit)),
                Err(e) => warn!("Discarding dead store connection: {}", e),
            }
        }

        let conn = self.shared.connector.connect().await?;
        Ok(self.wrap(conn, permit))
    }

    /// Number of connections currently parked in the pool.
    pub fn idle_count(&self) -> usize {
        self.shared.idle.lock().len()
    }

    fn pop_idle(&self) -> Option<IdleConnection> {
        self.shared.idle.lock().pop()
    }

    fn wrap(&self, conn: Box<dyn Store>, permit: OwnedSemaphorePermit) -> PooledConnection {
        PooledConnection {
            conn: Some(conn),
            shared: Arc::clone(&self.shared),
            _permit: permit,
        }
    }
}

/// A borrowed connection. Dropping it returns the connection to the pool.
pub struct PooledConnection {
    conn: Option<Box<dyn Store>>,
    shared: Arc<Shared>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = dyn Store;

    fn deref(&self) -> &Self::Target {
        // Only taken in drop.
        self.conn.as_deref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_deref_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.idle.lock().push(IdleConnection {
                conn,
                since: Instant::now(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Store whose liveness can be toggled from the test.
    struct Flaky {
        inner: MemoryStore,
        alive: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Store for Flaky {
        async fn ping(&mut self) -> Result<()> {
            if self.alive.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(Error::Connection("gone".to_string()))
            }
        }
        async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
            self.inner.get(key).await
        }
        async fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
            self.inner.set(key, value).await
        }
        async fn incr(&mut self, key: &[u8]) -> Result<i64> {
            self.inner.incr(key).await
        }
        async fn sadd(&mut self, key: &[u8], member: &[u8]) -> Result<bool> {
            self.inner.sadd(key, member).await
        }
        async fn srem(&mut self, key: &[u8], member: &[u8]) -> Result<bool> {
            self.inner.srem(key, member).await
        }
        async fn sismember(&mut self, key: &[u8], member: &[u8]) -> Result<bool> {
            self.inner.sismember(key, member).await
        }
        async fn smembers(&mut self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
            self.inner.smembers(key).await
        }
        async fn scard(&mut self, key: &[u8]) -> Result<u64> {
            self.inner.scard(key).await
        }
        async fn hget(&mut self, key: &[u8], field: &[u8]) -> Result<Option<Vec<u8>>> {
            self.inner.hget(key, field).await
        }
        async fn hset(&mut self, key: &[u8], field: &[u8], value: &[u8]) -> Result<()> {
            self.inner.hset(key, field, value).await
        }
        async fn keys(&mut self, pattern: &[u8]) -> Result<Vec<Vec<u8>>> {
            self.inner.keys(pattern).await
        }
    }

    #[derive(Clone, Default)]
    struct CountingConnector {
        opened: Arc<AtomicUsize>,
        alive: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn connect(&self) -> Result<Box<dyn Store>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            self.alive.store(true, Ordering::SeqCst);
            Ok(Box::new(Flaky {
                inner: MemoryStore::new(),
                alive: Arc::clone(&self.alive),
            }))
        }
    }

    #[tokio::test]
    async fn test_connection_is_reused() {
        let connector = CountingConnector::default();
        let pool = StorePool::new(connector.clone(), PoolConfig::default());

        {
            let mut conn = pool.get().await.unwrap();
            conn.set(b"k", b"v").await.unwrap();
        }
        assert_eq!(pool.idle_count(), 1);

        let mut conn = pool.get().await.unwrap();
        assert_eq!(conn.get(b"k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(connector.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dead_connection_is_replaced() {
        let connector = CountingConnector::default();
        let pool = StorePool::new(connector.clone(), PoolConfig::default());

        drop(pool.get().await.unwrap());
        connector.alive.store(false, Ordering::SeqCst);

        let mut conn = pool.get().await.unwrap();
        conn.ping().await.unwrap();
        assert_eq!(connector.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let connector = CountingConnector::default();
        let config = PoolConfig {
            max_size: 1,
            idle_timeout: Duration::from_millis(10),
        };
        let pool = StorePool::new(connector.clone(), config);

        drop(pool.get().await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(pool.get().await.unwrap());
        assert_eq!(connector.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_pool_blocks_when_exhausted() {
        let config = PoolConfig {
            max_size: 1,
            ..PoolConfig::default()
        };
        let pool = StorePool::new(MemoryStore::new(), config);

        let held = pool.get().await.unwrap();
        let waiting = tokio::time::timeout(Duration::from_millis(50), pool.get()).await;
        assert!(waiting.is_err(), "second borrow should wait");

        drop(held);
        let again = tokio::time::timeout(Duration::from_millis(50), pool.get()).await;
        assert!(again.is_ok());
    }
}
