use std::fmt;

/// Which end of a tunnel an operation touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The connection the tunnel was invoked with.
    Inbound,
    /// The connection the tunnel dialed.
    Outbound,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Side::Inbound => "inbound",
            Side::Outbound => "outbound",
        })
    }
}

/// Outcomes of a bounded line read other than a complete line.
#[derive(Debug, thiserror::Error)]
pub enum LineError {
    /// The stream ended cleanly on a line boundary.
    #[error("end of stream")]
    Eof,

    /// The read was cancelled through its context.
    #[error("read cancelled")]
    Cancelled,

    /// No newline within the maximum line length.
    #[error("line exceeds {max} bytes")]
    TooLong { max: usize },

    /// Any other I/O failure, including a stream that ends mid-line.
    #[error("line I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fatal relay conditions. The relay has closed the inbound connection by the
/// time one of these is returned.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("read from {side} connection failed: {source}")]
    ReadFailed { side: Side, source: LineError },

    #[error("write to {side} connection failed: {source}")]
    WriteFailed {
        side: Side,
        source: std::io::Error,
    },
}

impl RelayError {
    /// The inbound peer sent a line longer than the relay accepts.
    pub fn is_line_too_long(&self) -> bool {
        matches!(
            self,
            RelayError::ReadFailed {
                source: LineError::TooLong { .. },
                ..
            }
        )
    }

    /// The connection the failure happened on.
    pub fn side(&self) -> Side {
        match self {
            RelayError::ReadFailed { side, .. } | RelayError::WriteFailed { side, .. } => *side,
        }
    }
}

/// Errors returned by [`crate::Tunnel::serve`].
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// The target could not be dialed; the relay never started.
    #[error("dial {network} {address} failed: {source}")]
    DialFailed {
        network: String,
        address: String,
        source: std::io::Error,
    },

    /// The relay policy terminated on a fatal error.
    #[error("relay failed: {0}")]
    RelayFatal(#[from] RelayError),
}

/// A target string that is neither `host:port` nor `unix:/path`.
#[derive(Debug, thiserror::Error)]
#[error("invalid target address {0:?} (expected ip:port or unix:/path)")]
pub struct InvalidTarget(pub String);

pub type Result<T> = std::result::Result<T, TunnelError>;
