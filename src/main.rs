//! Splitcache Server Entry Point

use clap::{Parser, ValueEnum};
use splitcache::{MemoryStore, PoolConfig, RedisConnector, Result, StorePool, TcpServer};
use std::time::Duration;
use tracing::{Level, error, info};

use chrono::Utc;
use tracing_subscriber::fmt::{format::Writer, time::FormatTime};

struct ChronoUtc;

impl FormatTime for ChronoUtc {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        // Format as RFC3339 UTC
        write!(w, "{}", Utc::now().to_rfc3339())
    }
}

/// Which backend store the pool connects to
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// External Redis-compatible store
    Redis,
    /// In-process store, lost on exit
    Memory,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:11222")]
    bind: String,

    /// Backend store address
    #[arg(short, long, default_value = "127.0.0.1:6379")]
    redis: String,

    /// Maximum number of pooled store connections
    #[arg(short, long, default_value_t = 3)]
    pool: usize,

    /// Seconds an idle store connection may be reused
    #[arg(long, default_value_t = 240)]
    idle_timeout: u64,

    /// Log level: error, warn, info, debug or trace
    #[arg(short, long, default_value = "info")]
    log: Level,

    /// Backend store implementation
    #[arg(long, value_enum, default_value_t = Backend::Redis)]
    backend: Backend,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_target(false)
        .with_timer(ChronoUtc)
        .with_max_level(args.log)
        .init();

    info!("Starting Splitcache Server...");
    info!("Bind: {}, Backend: {:?}", args.bind, args.backend);

    let config = PoolConfig {
        max_size: args.pool,
        idle_timeout: Duration::from_secs(args.idle_timeout),
    };
    let pool = match args.backend {
        Backend::Redis => {
            info!("Store: {} with {} pooled connections", args.redis, args.pool);
            StorePool::new(RedisConnector::new(args.redis), config)
        }
        Backend::Memory => StorePool::new(MemoryStore::new(), config),
    };

    let server = TcpServer::bind(&args.bind, pool).await?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    };

    match server.run(shutdown).await {
        Ok(_) => {
            info!("Server stopped gracefully");
            Ok(())
        }
        Err(e) => {
            error!("Server error: {}", e);
            Err(e)
        }
    }
}
