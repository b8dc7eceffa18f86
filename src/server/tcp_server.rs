//! TCP server implementation

use crate::protocol::{Command, Parser, Response};
use crate::server::{Connection, Handler};
use crate::storage::StorePool;
use crate::{Error, Result};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// TCP server for the experiment protocol
pub struct TcpServer {
    listener: TcpListener,
    handler: Handler,
}

impl TcpServer {
    /// Bind the listening socket. Connections are not accepted until `run`.
    pub async fn bind(addr: &str, pool: StorePool) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(TcpServer {
            listener,
            handler: Handler::new(pool),
        })
    }

    /// Address the server is listening on
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` completes. Each connection runs on
    /// its own task; connections already open are left to finish on their own.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!("Splitcache server listening on {}", self.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, addr)) => {
                        debug!("New connection from {}", addr);

                        let handler = self.handler.clone();
                        tokio::spawn(async move {
                            if let Err(e) = Self::handle_connection(socket, handler).await {
                                warn!("Connection {} closed with error: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
                _ = &mut shutdown => {
                    info!("Shutting down listener");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Per-connection loop: one command per line, processed in arrival order.
    async fn handle_connection(socket: TcpStream, handler: Handler) -> Result<()> {
        let mut connection = Connection::new(socket);

        while let Some(line) = connection.read_line().await? {
            let mut command = match Parser::parse_line(&line) {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(Error::Parse(msg)) => {
                    connection
                        .write_responses(&[Response::ClientError(msg)])
                        .await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if command == Command::Quit {
                debug!("Client quit");
                break;
            }

            if let Some(header) = command.store_header_mut() {
                match connection.read_line().await? {
                    Some(payload) => header.payload = payload,
                    None => break,
                }
            }

            let name = command.name();
            let responses = match handler.execute(command).await {
                Ok(responses) => responses,
                Err(e) => {
                    error!("{} failed: {}", name, e);
                    vec![Response::ServerError(e.to_string())]
                }
            };
            connection.write_responses(&responses).await?;
        }

        debug!("Connection closed");
        Ok(())
    }
}
