use std::fmt;
use std::path::PathBuf;

/// Errors that can occur while binding local sockets or exchanging descriptors.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// Failed to bind to the specified socket path.
    #[error("failed to bind to {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to connect to the specified socket path.
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// The socket path is too long for `sockaddr_un`.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// The connection is not backed by a descriptor that can be transferred,
    /// or a received descriptor is not a stream socket.
    #[error("unsupported connection: {0}")]
    Unsupported(&'static str),

    /// Duplicating the descriptor out of a connection failed.
    #[error("failed to extract descriptor: {0}")]
    ExtractionFailed(std::io::Error),

    /// `sendmsg` on the local socket failed.
    #[error("failed to send control message: {0}")]
    WriteFailed(std::io::Error),

    /// `recvmsg` on the local socket failed or hit end of stream.
    #[error("failed to receive control message: {0}")]
    ReadFailed(std::io::Error),

    /// The ancillary data did not have the expected shape.
    #[error("malformed control message: {0}")]
    MalformedControlMessage(String),

    /// The control message carried a number of descriptors other than one.
    /// All of them were closed.
    #[error("expected 1 descriptor in control message, found {found} (all closed)")]
    DescriptorCountMismatch { found: usize },

    /// Any other I/O error on the local socket.
    #[error("local socket I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ExchangeError>;

/// A failed send that hands the unsent value back to the caller.
///
/// Ownership of a descriptor only moves to the peer when the send succeeds,
/// so on failure the caller gets it back still open.
pub struct SendError<T> {
    pub error: ExchangeError,
    pub value: T,
}

impl<T> SendError<T> {
    pub(crate) fn new(error: ExchangeError, value: T) -> Self {
        Self { error, value }
    }

    /// Take back the value that was not sent.
    pub fn into_inner(self) -> T {
        self.value
    }

    /// Split into the error and the unsent value.
    pub fn into_parts(self) -> (ExchangeError, T) {
        (self.error, self.value)
    }

    /// Drop the unsent value (closing it) and keep the error.
    pub fn into_error(self) -> ExchangeError {
        self.error
    }
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendError")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

impl<T> std::error::Error for SendError<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl<T> From<SendError<T>> for ExchangeError {
    fn from(err: SendError<T>) -> Self {
        err.error
    }
}
