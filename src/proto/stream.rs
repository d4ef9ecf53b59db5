//! Buffered SMTP transport
//!
//! Reads arrive in fixed-size `Bytes` chunks. Delimited reads return the
//! chunks they consumed as a [`ByteBuffer`] chain, so a line or DATA block
//! is never copied while it is being scanned.

use super::buffer::ByteBuffer;
use super::response::{SmtpReplyCode, SmtpResponse};
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::trace;

const CRLF: &[u8] = b"\r\n";
const DOT_TERMINATOR: &[u8] = b"\r\n.\r\n";

/// Longest command line accepted, terminator included
pub const MAX_COMMAND_LINE_LENGTH: usize = 4096;

/// A bidirectional byte pipe a session can run over
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Result of a delimited read
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delimited {
    /// The bytes read, terminator stripped
    pub buffer: ByteBuffer,
    /// `false` when the peer closed the connection before the terminator
    pub complete: bool,
}

/// Run `io` under an optional deadline
async fn within<T>(limit: Option<Duration>, io: impl Future<Output = Result<T>>) -> Result<T> {
    match limit {
        Some(duration) => tokio::time::timeout(duration, io)
            .await
            .map_err(|_| Error::Timeout)?,
        None => io.await,
    }
}

/// Advance a partial match of `sequence` by one byte. On a mismatch the
/// match restarts at the byte itself, which is enough for terminators
/// that never repeat their first byte internally.
fn advance_match(sequence: &[u8], matched: usize, b: u8) -> usize {
    if b == sequence[matched] {
        matched + 1
    } else if b == sequence[0] {
        1
    } else {
        0
    }
}

/// Undo dot-stuffing: a line starting with ".." loses its first dot.
/// The block is assumed to start at the beginning of a line.
fn unstuff(buffer: ByteBuffer) -> ByteBuffer {
    // Bytes of "\r\n." seen so far; the block starts just after a CRLF.
    let mut state = 2;
    let mut out = Vec::with_capacity(buffer.segments().len());

    for segment in buffer.segments() {
        let mut start = 0;
        for (i, &b) in segment.iter().enumerate() {
            state = match (state, b) {
                (3, b'.') => {
                    out.push(segment.slice(start..i));
                    start = i + 1;
                    0
                }
                (2, b'.') => 3,
                (1, b'\n') => 2,
                (_, b'\r') => 1,
                _ => 0,
            };
        }
        out.push(segment.slice(start..));
    }

    ByteBuffer::from_segments(out)
}

/// Line and block oriented reader/writer over a swappable transport
pub struct SmtpStream {
    inner: Option<BoxedStream>,
    pending: Bytes,
    buffer_size: usize,
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl SmtpStream {
    pub fn new(stream: impl AsyncStream + 'static, buffer_size: usize, cancel: CancellationToken) -> Self {
        Self {
            inner: Some(Box::new(stream)),
            pending: Bytes::new(),
            buffer_size: buffer_size.max(1),
            timeout: None,
            cancel,
        }
    }

    /// Fail any single read, write or handshake that makes no progress
    /// for `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn transport(&mut self) -> Result<&mut BoxedStream> {
        self.inner
            .as_mut()
            .ok_or_else(|| Error::Protocol("transport closed".into()))
    }

    /// Read one chunk into `pending`. Returns `false` at end of stream.
    async fn fill(&mut self) -> Result<bool> {
        let timeout = self.timeout;
        let cancel = self.cancel.clone();
        let mut chunk = BytesMut::with_capacity(self.buffer_size);
        let stream = self.transport()?;

        let read = within(timeout, async { Ok(stream.read_buf(&mut chunk).await?) });
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            n = read => n?,
        };

        trace!("read {} bytes", n);
        self.pending = chunk.freeze();
        Ok(n > 0)
    }

    /// Scan for `sequence`, starting with `matched` bytes of it already
    /// seen. Returns `None` when more than `limit` bytes preceded the
    /// terminator; the input is still consumed up to and including it.
    async fn read_delimited(
        &mut self,
        sequence: &[u8],
        mut matched: usize,
        limit: Option<usize>,
    ) -> Result<Option<Delimited>> {
        let mut segments = Vec::new();
        let mut total = 0usize;
        let mut overflowed = false;

        loop {
            if self.pending.is_empty() && !self.fill().await? {
                return Ok(Some(Delimited {
                    buffer: ByteBuffer::from_segments(segments),
                    complete: false,
                }));
            }

            let end = self.pending.iter().position(|&b| {
                matched = advance_match(sequence, matched, b);
                matched == sequence.len()
            });
            let chunk = match end {
                Some(index) => self.pending.split_to(index + 1),
                None => std::mem::take(&mut self.pending),
            };

            total += chunk.len();
            if limit.is_some_and(|limit| total > limit + sequence.len()) {
                overflowed = true;
                segments.clear();
            }
            if !overflowed {
                segments.push(chunk);
            }

            if end.is_some() {
                if overflowed {
                    return Ok(None);
                }
                let mut buffer = ByteBuffer::from_segments(segments);
                buffer.truncate(buffer.len().saturating_sub(sequence.len()));
                return Ok(Some(Delimited {
                    buffer,
                    complete: true,
                }));
            }
        }
    }

    /// Read up to and excluding `sequence`
    pub async fn read_until(&mut self, sequence: &[u8]) -> Result<Delimited> {
        if sequence.is_empty() {
            return Err(Error::Protocol("empty delimiter".into()));
        }
        self.read_delimited(sequence, 0, None)
            .await
            .map(Option::unwrap_or_default)
    }

    /// Read one CRLF terminated line. A lone CR or LF is line data.
    pub async fn read_line(&mut self) -> Result<Delimited> {
        self.read_delimited(CRLF, 0, Some(MAX_COMMAND_LINE_LENGTH))
            .await?
            .ok_or_else(|| {
                Error::response(SmtpResponse::new(
                    SmtpReplyCode::CommandUnrecognized,
                    "line too long",
                ))
            })
    }

    /// Read a DATA block up to the `CRLF.CRLF` terminator and undo
    /// dot-stuffing. A block longer than `limit` is drained and refused.
    pub async fn read_dot_block(&mut self, limit: Option<usize>) -> Result<Delimited> {
        let size_exceeded = || Error::response(SmtpResponse::SIZE_LIMIT_EXCEEDED);

        let Some(delimited) = self.read_delimited(DOT_TERMINATOR, 2, limit).await? else {
            return Err(size_exceeded());
        };
        if !delimited.complete {
            return Ok(delimited);
        }

        let buffer = unstuff(delimited.buffer);
        if limit.is_some_and(|limit| buffer.len() > limit) {
            return Err(size_exceeded());
        }
        Ok(Delimited {
            buffer,
            complete: true,
        })
    }

    /// Send a reply and flush it. Gives up on cancellation or when the
    /// peer stops reading for longer than the timeout.
    pub async fn write_reply(&mut self, response: &SmtpResponse) -> Result<()> {
        let cancel = self.cancel.clone();
        let timeout = self.timeout;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            written = self.send(response, timeout) => written,
        }
    }

    /// Send a last reply after the session has already ended, cancelled
    /// or not, waiting at most `limit`
    pub async fn write_final_reply(&mut self, response: &SmtpResponse, limit: Duration) -> Result<()> {
        self.send(response, Some(limit)).await
    }

    async fn send(&mut self, response: &SmtpResponse, limit: Option<Duration>) -> Result<()> {
        let wire = response.to_wire();
        let stream = self.transport()?;
        within(limit, async {
            stream.write_all(wire.as_bytes()).await?;
            stream.flush().await?;
            Ok(())
        })
        .await
    }

    /// Run the server side TLS handshake over the current transport and
    /// continue on the encrypted stream. Buffered plaintext is discarded.
    pub async fn start_tls(&mut self, config: Arc<rustls::ServerConfig>) -> Result<()> {
        let stream = self
            .inner
            .take()
            .ok_or_else(|| Error::Protocol("transport closed".into()))?;
        self.pending = Bytes::new();

        let acceptor = TlsAcceptor::from(config);
        let handshake = within(self.timeout, async {
            acceptor
                .accept(stream)
                .await
                .map_err(|e| Error::Tls(e.to_string()))
        });
        let tls = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            tls = handshake => tls?,
        };

        self.inner = Some(Box::new(tls));
        Ok(())
    }

    /// Close the write half of the transport, waiting at most `limit`
    pub async fn shutdown(&mut self, limit: Duration) -> Result<()> {
        if let Some(stream) = self.inner.as_mut() {
            within(Some(limit), async { Ok(stream.shutdown().await?) }).await?;
        }
        Ok(())
    }
}
