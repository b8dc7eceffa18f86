//! Splitcache - an A/B testing bucketing service behind a memcached-style text protocol
//!
//! This crate provides:
//! - A line-oriented TCP server that reinterprets cache verbs (GET, SET, ADD,
//!   DELETE, TOUCH, INCR, STATS) as experiment operations
//! - Sticky, uniformly random variant assignment with impression and conversion counters
//! - A pluggable backend store (Redis over RESP, or in-process memory) behind a bounded pool

pub mod experiment;
pub mod protocol;
pub mod server;
pub mod storage;

pub use experiment::{Engine, Experiment, Variant};
pub use protocol::{Command, Parser, Response};
pub use server::TcpServer;
pub use storage::{MemoryStore, PoolConfig, RedisConnector, Store, StorePool};

/// Result type for splitcache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for splitcache
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Parse(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("No experiment found with id {0}")]
    ExperimentNotFound(u64),

    #[error("Experiment {0} is not active")]
    ExperimentNotActive(u64),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
