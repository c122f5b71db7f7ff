use std::io::ErrorKind;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::context::Context;

const COPY_CHUNK_SIZE: usize = 8 * 1024;

/// Why a [`copy`] stopped.
#[derive(Debug)]
pub enum CopyEnd {
    /// The source reached end of stream and everything read was written.
    Eof,
    /// The context was cancelled first.
    Cancelled,
    /// Reading the source or writing the destination failed.
    Failed(std::io::Error),
}

#[derive(Debug)]
pub struct CopyOutcome {
    /// Bytes written to the destination.
    pub bytes: u64,
    pub end: CopyEnd,
}

/// Copy `src` into `dst` until end of stream, an error, or cancellation of
/// `ctx`, whichever happens first.
pub async fn copy<R, W>(ctx: &Context, dst: &mut W, src: &mut R) -> CopyOutcome
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut chunk = vec![0u8; COPY_CHUNK_SIZE];
    let mut bytes = 0u64;

    loop {
        let read = tokio::select! {
            biased;
            _ = ctx.done() => return CopyOutcome { bytes, end: CopyEnd::Cancelled },
            result = src.read(&mut chunk) => match result {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return CopyOutcome { bytes, end: CopyEnd::Failed(err) },
            },
        };

        if read == 0 {
            let end = match dst.flush().await {
                Ok(()) => CopyEnd::Eof,
                Err(err) => CopyEnd::Failed(err),
            };
            return CopyOutcome { bytes, end };
        }

        let written = tokio::select! {
            biased;
            _ = ctx.done() => return CopyOutcome { bytes, end: CopyEnd::Cancelled },
            result = dst.write_all(&chunk[..read]) => result,
        };
        if let Err(err) = written {
            return CopyOutcome {
                bytes,
                end: CopyEnd::Failed(err),
            };
        }
        bytes += read as u64;
    }
}
