use std::io::ErrorKind;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::context::Context;
use crate::error::LineError;

/// Longest line, newline included, a line relay accepts by default.
pub const DEFAULT_MAX_LINE_LEN: usize = 8192;

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads newline-terminated lines from an async stream into a bounded buffer.
///
/// Bytes past the returned line stay buffered for the next call. The buffer
/// never grows beyond the maximum line length.
pub struct LineReader<R> {
    inner: R,
    buf: BytesMut,
    max_len: usize,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_len(inner, DEFAULT_MAX_LINE_LEN)
    }

    pub fn with_max_len(inner: R, max_len: usize) -> Self {
        let max_len = max_len.max(1);
        Self {
            inner,
            buf: BytesMut::with_capacity(max_len.min(READ_CHUNK_SIZE)),
            max_len,
        }
    }

    /// Read the next line, terminator included.
    ///
    /// Returns [`LineError::Eof`] when the stream ends between lines and
    /// [`LineError::TooLong`] once `max_len` bytes arrive without a newline.
    /// A stream that ends mid-line is an [`LineError::Io`] error.
    pub async fn read_line(&mut self, ctx: &Context) -> Result<Bytes, LineError> {
        let mut scanned = 0;

        loop {
            if let Some(pos) = self.buf[scanned..].iter().position(|&b| b == b'\n') {
                let end = scanned + pos + 1;
                return Ok(self.buf.split_to(end).freeze());
            }
            scanned = self.buf.len();

            if self.buf.len() >= self.max_len {
                return Err(LineError::TooLong { max: self.max_len });
            }

            let room = (self.max_len - self.buf.len()).min(READ_CHUNK_SIZE);
            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = tokio::select! {
                biased;
                _ = ctx.done() => return Err(LineError::Cancelled),
                result = self.inner.read(&mut chunk[..room]) => match result {
                    Ok(n) => n,
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) => return Err(LineError::Io(err)),
                },
            };

            if read == 0 {
                if self.buf.is_empty() {
                    return Err(LineError::Eof);
                }
                return Err(LineError::Io(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "stream ended in the middle of a line",
                )));
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Bytes received but not yet returned as a line.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Mutably borrow the underlying stream, e.g. to write to it.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Consume the reader; buffered bytes are discarded.
    pub fn into_inner(self) -> R {
        self.inner
    }
}
