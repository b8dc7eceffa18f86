//! Backend store access: the primitives the engine needs, their implementations,
//! and the pool handlers borrow connections from

pub mod memory_store;
pub mod pool;
pub mod redis_store;

pub use memory_store::MemoryStore;
pub use pool::{PoolConfig, PooledConnection, StorePool};
pub use redis_store::{RedisConnection, RedisConnector};

use crate::Result;
use async_trait::async_trait;

/// Key-value primitives consumed by the engine. Each call is one atomic store
/// operation; nothing here spans multiple keys.
#[async_trait]
pub trait Store: Send {
    /// Liveness probe used by the pool before handing out a connection.
    async fn ping(&mut self) -> Result<()>;

    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    async fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Atomically increment an integer counter, creating it at 0 first.
    async fn incr(&mut self, key: &[u8]) -> Result<i64>;

    /// Returns true when the member was newly added.
    async fn sadd(&mut self, key: &[u8], member: &[u8]) -> Result<bool>;

    /// Returns true when the member was present.
    async fn srem(&mut self, key: &[u8], member: &[u8]) -> Result<bool>;

    async fn sismember(&mut self, key: &[u8], member: &[u8]) -> Result<bool>;

    async fn smembers(&mut self, key: &[u8]) -> Result<Vec<Vec<u8>>>;

    async fn scard(&mut self, key: &[u8]) -> Result<u64>;

    async fn hget(&mut self, key: &[u8], field: &[u8]) -> Result<Option<Vec<u8>>>;

    async fn hset(&mut self, key: &[u8], field: &[u8], value: &[u8]) -> Result<()>;

    /// Enumerate keys matching a glob pattern.
    async fn keys(&mut self, pattern: &[u8]) -> Result<Vec<Vec<u8>>>;
}

/// Opens new backend connections for the pool.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn Store>>;
}
