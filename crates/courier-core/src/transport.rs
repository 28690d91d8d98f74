//! Byte-level transport plumbing
//!
//! The relay protocol interleaves newline-terminated control lines with raw
//! payload runs on one stream. [`FrameReader`] owns the only read buffer for
//! such a stream and exposes both views of it, `read_line` and
//! `read_exact`/`read_chunk`, over a single unconsumed-byte cursor. Whatever
//! look-ahead a line read pulls off the socket stays in that buffer and is
//! the first thing the next payload read sees.
//!
//! [`Dialer`] abstracts opening a connection so the session and command
//! channel can run against real TCP in production and in-memory pipes in
//! tests.

use crate::{Error, Result, CHUNK_SIZE};
use bytes::{Bytes, BytesMut};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;

/// Upper bound on a single control line
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Shared cursor over a byte stream carrying lines and binary runs
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    max_line: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a reader
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(CHUNK_SIZE),
            max_line: MAX_LINE_LEN,
        }
    }

    /// Override the maximum control line length
    pub fn with_max_line(mut self, max_line: usize) -> Self {
        self.max_line = max_line;
        self
    }

    /// Bytes already pulled off the stream but not yet consumed
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Give back the underlying reader and any unconsumed bytes
    pub fn into_parts(self) -> (R, BytesMut) {
        (self.inner, self.buf)
    }

    async fn fill(&mut self) -> Result<usize> {
        self.buf.reserve(CHUNK_SIZE);
        self.inner
            .read_buf(&mut self.buf)
            .await
            .map_err(|e| Error::connection("read failed", e))
    }

    /// Read one line, without its `\n` or `\r\n` terminator.
    ///
    /// Consumes exactly the line and its terminator; bytes after the
    /// terminator stay buffered. Returns `Ok(None)` on a clean end of
    /// stream. A final unterminated line before end of stream is returned
    /// as a line.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        let mut scanned = 0;
        loop {
            if let Some(pos) = self.buf[scanned..].iter().position(|&b| b == b'\n') {
                let mut line = self.buf.split_to(scanned + pos + 1);
                line.truncate(line.len() - 1);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                return decode_line(line).map(Some);
            }
            scanned = self.buf.len();

            if scanned > self.max_line {
                return Err(Error::Protocol(format!(
                    "control line exceeds {} bytes",
                    self.max_line
                )));
            }

            if self.fill().await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let line = self.buf.split();
                return decode_line(line).map(Some);
            }
        }
    }

    /// Read up to `max` bytes. An empty result means end of stream.
    pub async fn read_chunk(&mut self, max: usize) -> Result<Bytes> {
        if max == 0 {
            return Ok(Bytes::new());
        }
        if self.buf.is_empty() && self.fill().await? == 0 {
            return Ok(Bytes::new());
        }
        let take = max.min(self.buf.len());
        Ok(self.buf.split_to(take).freeze())
    }

    /// Read exactly `n` bytes.
    ///
    /// End of stream before `n` bytes is a [`Error::TransferIntegrity`].
    pub async fn read_exact(&mut self, n: usize) -> Result<Bytes> {
        let mut out = BytesMut::with_capacity(n);
        while out.len() < n {
            let chunk = self.read_chunk(n - out.len()).await?;
            if chunk.is_empty() {
                return Err(Error::TransferIntegrity {
                    expected: n as u64,
                    actual: out.len() as u64,
                });
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Read and discard `n` bytes, keeping the stream aligned. Returns the
    /// number of bytes actually discarded, which is short of `n` only at end
    /// of stream. `stall` bounds each individual read, not the whole skip.
    pub async fn skip(&mut self, n: u64, stall: Option<Duration>) -> Result<u64> {
        let mut skipped = 0u64;
        while skipped < n {
            let want = (n - skipped).min(CHUNK_SIZE as u64) as usize;
            let chunk = with_timeout(stall, self.read_chunk(want)).await?;
            if chunk.is_empty() {
                break;
            }
            skipped += chunk.len() as u64;
        }
        Ok(skipped)
    }
}

fn decode_line(line: BytesMut) -> Result<String> {
    String::from_utf8(line.to_vec())
        .map_err(|_| Error::Protocol("control line is not valid UTF-8".to_string()))
}

/// Run `fut` under an optional deadline
pub async fn with_timeout<T, F>(limit: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| Error::Timeout(limit))?,
        None => fut.await,
    }
}

/// Opens connections to the relay
pub trait Dialer: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a fresh connection
    fn dial(&self) -> impl Future<Output = Result<Self::Stream>> + Send;

    /// Human-readable description of the remote end
    fn remote(&self) -> String;
}

/// Dials the relay over TCP
#[derive(Debug, Clone)]
pub struct TcpDialer {
    addr: String,
    connect_timeout: Option<Duration>,
}

impl TcpDialer {
    pub fn new(addr: impl Into<String>, connect_timeout: Option<Duration>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
        }
    }
}

impl Dialer for TcpDialer {
    type Stream = TcpStream;

    async fn dial(&self) -> Result<TcpStream> {
        let connect = async {
            TcpStream::connect(&self.addr)
                .await
                .map_err(|e| Error::connection(&format!("cannot connect to {}", self.addr), e))
        };
        let stream = with_timeout(self.connect_timeout, connect).await?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("set_nodelay failed for {}: {}", self.addr, e);
        }
        Ok(stream)
    }

    fn remote(&self) -> String {
        self.addr.clone()
    }
}

pub mod mock {
    //! In-memory dialer for testing

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::io::DuplexStream;

    /// Hands out pre-created in-memory connections, one per dial. Dialing
    /// with nothing queued fails like a refused connection.
    pub struct MockDialer {
        pending: Mutex<VecDeque<DuplexStream>>,
        dials: Mutex<usize>,
    }

    impl MockDialer {
        /// Create a dialer with no queued connections
        pub fn new() -> Self {
            Self {
                pending: Mutex::new(VecDeque::new()),
                dials: Mutex::new(0),
            }
        }

        /// Queue a connection and return the server's end of it
        pub fn push_peer(&self) -> DuplexStream {
            let (client, server) = tokio::io::duplex(CHUNK_SIZE);
            self.pending.lock().unwrap().push_back(client);
            server
        }

        /// Number of dial attempts so far
        pub fn dial_count(&self) -> usize {
            *self.dials.lock().unwrap()
        }
    }

    impl Default for MockDialer {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Dialer for MockDialer {
        type Stream = DuplexStream;

        async fn dial(&self) -> Result<DuplexStream> {
            *self.dials.lock().unwrap() += 1;
            self.pending
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| Error::Connection("connection refused (mock)".to_string()))
        }

        fn remote(&self) -> String {
            "mock-relay".to_string()
        }
    }
}
