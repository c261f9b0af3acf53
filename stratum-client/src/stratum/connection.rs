//! TCP connection management with line-delimited I/O.
//!
//! Stratum uses newline-delimited JSON over TCP. A dialed stream is split
//! into a [`LineReader`], owned by whichever task is reading (the handshake,
//! then the dispatch loop), and a [`LineWriter`], kept behind the session lock
//! for request issuance.

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use crate::error::{Error, Result};
use crate::tracing::{prelude::*, WIRE};

/// Longest line accepted from a pool. Jobs are a few hundred bytes; anything
/// near this is a broken or hostile peer.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Read half of a pool connection, yielding one line per message.
pub struct LineReader {
    inner: FramedRead<OwnedReadHalf, LinesCodec>,
}

/// Write half of a pool connection, terminating each message with `\n`.
pub struct LineWriter {
    inner: FramedWrite<OwnedWriteHalf, LinesCodec>,
}

/// Strip a `stratum+tcp://` or `tcp://` scheme, leaving `host:port`.
pub fn strip_scheme(url: &str) -> &str {
    url.strip_prefix("stratum+tcp://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url)
}

/// Dial a pool and frame the stream into lines.
pub async fn connect(address: &str) -> Result<(LineReader, LineWriter)> {
    let address = strip_scheme(address);
    debug!(address, "Connecting to pool");

    let stream = TcpStream::connect(address)
        .await
        .map_err(|e| Error::Connection(format!("{}: {}", address, e)))?;

    if let Ok(local) = stream.local_addr() {
        debug!(address, local = %local, "Dial success");
    }

    Ok(split(stream))
}

/// Frame an established stream.
pub fn split(stream: TcpStream) -> (LineReader, LineWriter) {
    let (read_half, write_half) = stream.into_split();
    let reader = LineReader {
        inner: FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_LEN)),
    };
    let writer = LineWriter {
        inner: FramedWrite::new(write_half, LinesCodec::new()),
    };
    (reader, writer)
}

impl LineReader {
    /// Read the next non-empty line, trimmed.
    ///
    /// EOF is reported as [`Error::Disconnected`].
    pub async fn read_line(&mut self) -> Result<String> {
        loop {
            let line = self.inner.next().await.ok_or(Error::Disconnected)??;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            trace!(target: WIRE, rx = %line, "Received line");
            return Ok(line.to_string());
        }
    }
}

impl LineWriter {
    /// Write one line and flush it.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        trace!(target: WIRE, tx = %line, "Sending line");
        self.inner.send(line).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    #[test]
    fn test_strip_scheme() {
        assert_eq!(strip_scheme("stratum+tcp://pool:3333"), "pool:3333");
        assert_eq!(strip_scheme("tcp://pool:3333"), "pool:3333");
        assert_eq!(strip_scheme("pool:3333"), "pool:3333");
    }

    #[tokio::test]
    async fn test_line_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Echo server
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                write_half.write_all(line.as_bytes()).await.unwrap();
                write_half.write_all(b"\n\n").await.unwrap();
            }
        });

        let (mut reader, mut writer) = connect(&format!("tcp://{}", addr)).await.unwrap();

        writer.write_line(r#"{"id":1}"#).await.unwrap();
        writer.write_line(r#"{"id":2}"#).await.unwrap();

        // Blank lines are skipped.
        assert_eq!(reader.read_line().await.unwrap(), r#"{"id":1}"#);
        assert_eq!(reader.read_line().await.unwrap(), r#"{"id":2}"#);
    }

    #[tokio::test]
    async fn test_eof_is_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let (mut reader, _writer) = connect(&addr.to_string()).await.unwrap();
        assert!(matches!(reader.read_line().await, Err(Error::Disconnected)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to find a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(matches!(
            connect(&addr.to_string()).await,
            Err(Error::Connection(_))
        ));
    }
}
