//! TCP server module

pub mod connection;
pub mod handlers;
pub mod tcp_server;

pub use connection::Connection;
pub use handlers::Handler;
pub use tcp_server::TcpServer;
