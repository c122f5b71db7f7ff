use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::InvalidTarget;

/// A full-duplex byte stream a tunnel can relay.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased connection handed between tunnels, dialers and relay policies.
pub type BoxConnection = Box<dyn Connection>;

/// Shut down the write side and drop the connection.
pub async fn close(mut conn: BoxConnection) {
    if let Err(err) = conn.shutdown().await {
        debug!(error = %err, "shutdown on close failed");
    }
}

/// A resolved target a tunnel dials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl TargetAddr {
    /// Network name passed to the dialer.
    pub fn network(&self) -> &'static str {
        match self {
            TargetAddr::Tcp(_) => "tcp",
            TargetAddr::Unix(_) => "unix",
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Tcp(addr) => addr.fmt(f),
            TargetAddr::Unix(path) => path.display().fmt(f),
        }
    }
}

impl FromStr for TargetAddr {
    type Err = InvalidTarget;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(InvalidTarget(s.to_string()));
            }
            return Ok(TargetAddr::Unix(PathBuf::from(path)));
        }
        s.parse::<SocketAddr>()
            .map(TargetAddr::Tcp)
            .map_err(|_| InvalidTarget(s.to_string()))
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        TargetAddr::Tcp(addr)
    }
}
