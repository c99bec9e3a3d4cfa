//! TCP control connection.
//!
//! [`ControlConnection`] carries the line-oriented BorIP control protocol.
//! It owns the socket and a [`LineBuffer`], so a line received together with
//! the tail of a previous one is never lost, and a caller can process
//! buffered lines one at a time before reading from the socket again.
//!
//! # Example
//!
//! ```no_run
//! use borip_transport::ControlConnection;
//! use std::time::Duration;
//!
//! # async fn example() -> borip_core::Result<()> {
//! let mut conn = ControlConnection::connect("192.168.1.20:28888").await?;
//! let greeting = conn.recv_line(Duration::from_secs(5)).await?;
//! conn.send_line("GO").await?;
//! let reply = conn.recv_line(Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use borip_core::error::{Error, Result};
use borip_protocol::framing::{LineBuffer, encode_line};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Default connection timeout (5 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Size of a single socket read.
const READ_CHUNK: usize = 1024;

/// A line-framed TCP connection.
#[derive(Debug)]
pub struct ControlConnection {
    /// The underlying TCP stream, `None` after `close()` is called.
    stream: Option<TcpStream>,
    /// The address string for logging.
    addr: String,
    lines: LineBuffer,
}

impl ControlConnection {
    /// Connect using the default timeout.
    pub async fn connect(addr: &str) -> Result<Self> {
        Self::connect_with_timeout(addr, DEFAULT_CONNECT_TIMEOUT).await
    }

    /// Connect to a `host:port` endpoint with a specified timeout.
    ///
    /// A refused connection is reported as [`Error::Transport`] with
    /// "connection refused" in the message.
    pub async fn connect_with_timeout(addr: &str, timeout: Duration) -> Result<Self> {
        tracing::debug!(
            addr = %addr,
            timeout_ms = timeout.as_millis(),
            "Connecting to BorIP server"
        );

        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                tracing::debug!(addr = %addr, "TCP connection timed out");
                Error::Timeout
            })?
            .map_err(|e| {
                tracing::debug!(addr = %addr, error = %e, "TCP connection failed");
                map_connect_error(e, addr)
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(addr = %addr, error = %e, "Failed to set TCP_NODELAY (continuing anyway)");
        }

        tracing::info!(addr = %addr, "Control connection established");
        Ok(Self::from_stream(stream, addr.to_string()))
    }

    /// Wrap an accepted `TcpStream`.
    ///
    /// `addr` is a label for logging, typically the peer address.
    pub fn from_stream(stream: TcpStream, addr: String) -> Self {
        Self {
            stream: Some(stream),
            addr,
            lines: LineBuffer::new(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|s| s.peer_addr().ok())
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Send one line, appending the terminator.
    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;

        tracing::trace!(addr = %self.addr, line = %line, "Sending line");

        stream.write_all(&encode_line(line)).await.map_err(|e| {
            tracing::debug!(addr = %self.addr, error = %e, "Failed to send line");
            map_io_error(e)
        })?;
        stream.flush().await.map_err(map_io_error)?;
        Ok(())
    }

    /// Take the next complete line already buffered, without touching the
    /// socket.
    pub fn next_buffered_line(&mut self) -> Option<String> {
        self.lines.next_line()
    }

    /// Perform a single socket read into the line buffer.
    ///
    /// Returns [`Error::ConnectionLost`] when the peer has closed the
    /// connection.
    pub async fn fill(&mut self) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        let mut buf = [0u8; READ_CHUNK];

        match stream.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!(addr = %self.addr, "Peer closed connection (0 bytes read)");
                Err(Error::ConnectionLost)
            }
            Ok(n) => {
                tracing::trace!(addr = %self.addr, bytes = n, "Received data");
                self.lines.push(&buf[..n]);
                Ok(n)
            }
            Err(e) => Err(map_io_error(e)),
        }
    }

    /// Receive one line, reading from the socket only when no complete line
    /// is buffered.
    pub async fn recv_line(&mut self, timeout: Duration) -> Result<String> {
        if let Some(line) = self.lines.next_line() {
            return Ok(line);
        }
        match tokio::time::timeout(timeout, self.read_line()).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(
                    addr = %self.addr,
                    timeout_ms = timeout.as_millis(),
                    "Timeout waiting for line"
                );
                Err(Error::Timeout)
            }
        }
    }

    /// Read until a complete line is buffered, with no timeout.
    pub async fn read_line(&mut self) -> Result<String> {
        loop {
            if let Some(line) = self.lines.next_line() {
                return Ok(line);
            }
            self.fill().await?;
        }
    }

    /// Shut down both directions and drop the socket. Idempotent.
    pub async fn close(&mut self) {
        self.lines.clear();
        if let Some(mut stream) = self.stream.take() {
            tracing::debug!(addr = %self.addr, "Closing control connection");
            if let Err(e) = stream.shutdown().await {
                tracing::trace!(addr = %self.addr, error = %e, "Shutdown failed (peer already gone)");
            }
        }
    }
}

/// Message prefix of a refused connection attempt.
const REFUSED: &str = "connection refused";

/// Map a connection-time I/O error to the appropriate [`Error`] variant.
pub fn map_connect_error(e: std::io::Error, addr: &str) -> Error {
    match e.kind() {
        std::io::ErrorKind::ConnectionRefused => {
            Error::Transport(format!("{}: {}", REFUSED, addr))
        }
        _ => Error::Io(e),
    }
}

/// Whether `e` came from [`map_connect_error`] for a refused connection.
pub fn is_connection_refused(e: &Error) -> bool {
    matches!(e, Error::Transport(msg) if msg.starts_with(REFUSED))
}

/// Map a data-path I/O error to the appropriate [`Error`] variant.
pub fn map_io_error(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::UnexpectedEof => Error::ConnectionLost,
        _ => Error::Io(e),
    }
}
