//! Connection handling for TCP clients

use crate::protocol::Response;
use crate::{Error, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tracing::debug;

/// Longest request or data line accepted, excluding the terminator.
pub const MAX_LINE_LEN: usize = 1024 * 1024;

/// Represents a client connection using split read/write halves.
pub struct Connection {
    reader: BufReader<tokio::io::ReadHalf<TcpStream>>,
    writer: BufWriter<tokio::io::WriteHalf<TcpStream>>,
}

impl Connection {
    /// Create new connection wrapper by splitting the socket.
    pub fn new(socket: TcpStream) -> Self {
        let (reader, writer) = tokio::io::split(socket);
        Connection {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
        }
    }

    /// Read one line with its CR/LF terminator removed. `None` once the peer
    /// has closed the stream. A line longer than `MAX_LINE_LEN` is an error.
    pub async fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        let limit = MAX_LINE_LEN + 2;
        let mut buffer = Vec::new();
        let read = (&mut self.reader)
            .take(limit as u64)
            .read_until(b'\n', &mut buffer)
            .await?;
        if read == 0 {
            return Ok(None);
        }
        if read == limit && buffer.last() != Some(&b'\n') {
            return Err(Error::Protocol(format!(
                "Line exceeds {} bytes",
                MAX_LINE_LEN
            )));
        }

        while matches!(buffer.last(), Some(b'\n' | b'\r')) {
            buffer.pop();
        }
        debug!("Received: {:?}", String::from_utf8_lossy(&buffer));
        Ok(Some(buffer))
    }

    /// Write responses in order and flush once.
    pub async fn write_responses(&mut self, responses: &[Response]) -> Result<()> {
        for response in responses {
            let wire = response.to_wire();
            debug!("Sending: {:?}", String::from_utf8_lossy(&wire).trim_end());
            self.writer.write_all(&wire).await?;
        }
        self.writer.flush().await?;
        Ok(())
    }
}
