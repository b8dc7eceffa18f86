//! RESP client for a Redis-compatible backend store

use crate::storage::{Connector, Store};
use crate::{Error, Result};
use async_trait::async_trait;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
};
use tokio::net::TcpStream;
use tracing::debug;

/// Largest bulk string accepted from the store, matching Redis' `proto-max-bulk-len`.
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;
/// Largest array length accepted from the store.
const MAX_ARRAY_LEN: i64 = u32::MAX as i64;
/// Buffers grow as data arrives past this many elements or bytes.
const PREALLOC_LIMIT: usize = 4096;

/// A decoded RESP2 reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Status(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<Reply>>),
}

/// One connection to the backend store, using split read/write halves.
pub struct RedisConnection<S = TcpStream> {
    reader: BufReader<tokio::io::ReadHalf<S>>,
    writer: BufWriter<tokio::io::WriteHalf<S>>,
    broken: bool,
}

impl RedisConnection<TcpStream> {
    /// Connect to the backend store.
    pub async fn connect(addr: &str) -> Result<Self> {
        let socket = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::Connection(format!("{}: {}", addr, e)))?;
        Ok(Self::new(socket))
    }
}

impl<S: AsyncRead + AsyncWrite + Send> RedisConnection<S> {
    /// Wrap an already established stream.
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        RedisConnection {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            broken: false,
        }
    }

    /// Send one command and read its reply. Error replies become `Error::Storage`.
    ///
    /// A transport or framing failure leaves the stream in an unknown position,
    /// so the connection is marked broken and refuses further use.
    pub async fn execute(&mut self, args: &[&[u8]]) -> Result<Reply> {
        if self.broken {
            return Err(Error::Connection("connection is broken".to_string()));
        }

        match self.round_trip(args).await {
            Ok(Reply::Error(msg)) => Err(Error::Storage(msg)),
            Ok(reply) => Ok(reply),
            Err(e) => {
                self.broken = true;
                Err(e)
            }
        }
    }

    async fn round_trip(&mut self, args: &[&[u8]]) -> Result<Reply> {
        let request = encode_command(args);
        debug!(
            "Sending to store: {:?}",
            args.first().map(|a| String::from_utf8_lossy(a))
        );
        self.writer.write_all(&request).await?;
        self.writer.flush().await?;
        self.read_reply().await
    }

    /// Reads a full reply. Array elements are expected to be scalars, which
    /// covers every command this client issues.
    async fn read_reply(&mut self) -> Result<Reply> {
        let line = self.read_line().await?;
        if line.first() != Some(&b'*') {
            return self.parse_scalar(&line).await;
        }

        let len = parse_int(&line[1..])?;
        if len < 0 {
            return Ok(Reply::Array(None));
        }
        if len > MAX_ARRAY_LEN {
            return Err(Error::Protocol(format!("Array length {} out of range", len)));
        }

        let mut items = Vec::with_capacity((len as usize).min(PREALLOC_LIMIT));
        for _ in 0..len {
            let line = self.read_line().await?;
            if line.first() == Some(&b'*') {
                return Err(Error::Protocol("Nested arrays are not supported".to_string()));
            }
            items.push(self.parse_scalar(&line).await?);
        }
        Ok(Reply::Array(Some(items)))
    }

    async fn parse_scalar(&mut self, line: &[u8]) -> Result<Reply> {
        match line.first() {
            Some(b'+') => Ok(Reply::Status(String::from_utf8_lossy(&line[1..]).into_owned())),
            Some(b'-') => Ok(Reply::Error(String::from_utf8_lossy(&line[1..]).into_owned())),
            Some(b':') => Ok(Reply::Integer(parse_int(&line[1..])?)),
            Some(b'$') => self.parse_bulk_string(&line[1..]).await,
            _ => Err(Error::Protocol("Invalid response format".to_string())),
        }
    }

    async fn parse_bulk_string(&mut self, header: &[u8]) -> Result<Reply> {
        let len = parse_int(header)?;
        if len < 0 {
            return Ok(Reply::Bulk(None));
        }

        if len > MAX_BULK_LEN {
            return Err(Error::Protocol(format!("Bulk length {} out of range", len)));
        }

        let len = len as usize;
        let wanted = len + 2; // +2 for trailing \r\n
        let mut buffer = Vec::with_capacity(wanted.min(PREALLOC_LIMIT));
        (&mut self.reader)
            .take(wanted as u64)
            .read_to_end(&mut buffer)
            .await?;
        if buffer.len() < wanted {
            return Err(Error::Connection("Connection closed by store".into()));
        }
        if &buffer[len..] != b"\r\n" {
            return Err(Error::Protocol("Bulk string is not terminated".to_string()));
        }
        buffer.truncate(len);
        Ok(Reply::Bulk(Some(buffer)))
    }

    async fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        if self.reader.read_until(b'\n', &mut line).await? == 0 {
            return Err(Error::Connection("Connection closed by store".into()));
        }
        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        Ok(line)
    }
}

/// Encode a command as a RESP array of bulk strings.
fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

fn parse_int(raw: &[u8]) -> Result<i64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Protocol("Invalid integer response".to_string()))
}

fn unexpected(reply: Reply) -> Error {
    Error::Protocol(format!("Unexpected reply: {:?}", reply))
}

fn into_bytes_list(reply: Reply) -> Result<Vec<Vec<u8>>> {
    match reply {
        Reply::Array(None) => Ok(Vec::new()),
        Reply::Array(Some(items)) => items
            .into_iter()
            .map(|item| match item {
                Reply::Bulk(Some(data)) => Ok(data),
                other => Err(unexpected(other)),
            })
            .collect(),
        other => Err(unexpected(other)),
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send> Store for RedisConnection<S> {
    async fn ping(&mut self) -> Result<()> {
        match self.execute(&[b"PING".as_slice()]).await? {
            Reply::Status(s) if s == "PONG" => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.execute(&[b"GET".as_slice(), key]).await? {
            Reply::Bulk(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    async fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        match self.execute(&[b"SET".as_slice(), key, value]).await? {
            Reply::Status(_) => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn incr(&mut self, key: &[u8]) -> Result<i64> {
        match self.execute(&[b"INCR".as_slice(), key]).await? {
            Reply::Integer(n) => Ok(n),
            other => Err(unexpected(other)),
        }
    }

    async fn sadd(&mut self, key: &[u8], member: &[u8]) -> Result<bool> {
        match self.execute(&[b"SADD".as_slice(), key, member]).await? {
            Reply::Integer(n) => Ok(n > 0),
            other => Err(unexpected(other)),
        }
    }

    async fn srem(&mut self, key: &[u8], member: &[u8]) -> Result<bool> {
        match self.execute(&[b"SREM".as_slice(), key, member]).await? {
            Reply::Integer(n) => Ok(n > 0),
            other => Err(unexpected(other)),
        }
    }

    async fn sismember(&mut self, key: &[u8], member: &[u8]) -> Result<bool> {
        match self.execute(&[b"SISMEMBER".as_slice(), key, member]).await? {
            Reply::Integer(n) => Ok(n == 1),
            other => Err(unexpected(other)),
        }
    }

    async fn smembers(&mut self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let reply = self.execute(&[b"SMEMBERS".as_slice(), key]).await?;
        into_bytes_list(reply)
    }

    async fn scard(&mut self, key: &[u8]) -> Result<u64> {
        match self.execute(&[b"SCARD".as_slice(), key]).await? {
            Reply::Integer(n) => Ok(n.max(0) as u64),
            other => Err(unexpected(other)),
        }
    }

    async fn hget(&mut self, key: &[u8], field: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.execute(&[b"HGET".as_slice(), key, field]).await? {
            Reply::Bulk(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    async fn hset(&mut self, key: &[u8], field: &[u8], value: &[u8]) -> Result<()> {
        match self.execute(&[b"HSET".as_slice(), key, field, value]).await? {
            Reply::Integer(_) => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn keys(&mut self, pattern: &[u8]) -> Result<Vec<Vec<u8>>> {
        let reply = self.execute(&[b"KEYS".as_slice(), pattern]).await?;
        into_bytes_list(reply)
    }
}

/// Opens TCP connections to a Redis-compatible store.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    addr: String,
}

impl RedisConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        RedisConnector { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self) -> Result<Box<dyn Store>> {
        debug!("Connecting to store at {}", self.addr);
        Ok(Box::new(RedisConnection::connect(&self.addr).await?))
    }
}
