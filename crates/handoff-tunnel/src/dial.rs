use std::future::Future;
use std::io::ErrorKind;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use crate::conn::BoxConnection;
use crate::context::Context;

/// Dial timeout applied when no other is configured.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Establishes outbound connections for a tunnel.
///
/// `network` is `"tcp"` (or `"tcp4"`/`"tcp6"`) or `"unix"`; `address` is the
/// target in that network's notation.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        ctx: &Context,
        network: &str,
        address: &str,
    ) -> std::io::Result<BoxConnection>;
}

/// Dials TCP and Unix stream targets with a timeout.
#[derive(Debug, Clone)]
pub struct NetDialer {
    timeout: Duration,
}

impl NetDialer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for NetDialer {
    fn default() -> Self {
        Self::new(DEFAULT_DIAL_TIMEOUT)
    }
}

#[async_trait]
impl Dialer for NetDialer {
    async fn dial(
        &self,
        ctx: &Context,
        network: &str,
        address: &str,
    ) -> std::io::Result<BoxConnection> {
        self.bounded(ctx, connect(network, address)).await
    }
}

impl NetDialer {
    /// Drive `connect` until it finishes, the timeout elapses, or `ctx` is
    /// cancelled.
    async fn bounded<F>(&self, ctx: &Context, connect: F) -> std::io::Result<BoxConnection>
    where
        F: Future<Output = std::io::Result<BoxConnection>>,
    {
        tokio::select! {
            biased;
            _ = ctx.done() => Err(std::io::Error::other("dial cancelled")),
            result = tokio::time::timeout(self.timeout, connect) => match result {
                Ok(conn) => conn,
                Err(_) => Err(std::io::Error::new(
                    ErrorKind::TimedOut,
                    format!("dial timed out after {:?}", self.timeout),
                )),
            },
        }
    }
}

async fn connect(network: &str, address: &str) -> std::io::Result<BoxConnection> {
    match network {
        "tcp" | "tcp4" | "tcp6" => {
            let stream = TcpStream::connect(address).await?;
            stream.set_nodelay(true)?;
            debug!(address, "dialed tcp target");
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        "unix" => {
            let stream = tokio::net::UnixStream::connect(address).await?;
            debug!(address, "dialed unix target");
            Ok(Box::new(stream))
        }
        other => Err(std::io::Error::new(
            ErrorKind::Unsupported,
            format!("unsupported network {other:?}"),
        )),
    }
}

/// Future returned by closure dialers.
pub type DialFuture = Pin<Box<dyn Future<Output = std::io::Result<BoxConnection>> + Send>>;

/// A [`Dialer`] backed by a closure; see [`dial_fn`].
pub struct DialFn<F> {
    f: F,
}

/// Use a closure as a dialer, e.g. for custom resolution or test doubles.
pub fn dial_fn<F>(f: F) -> DialFn<F>
where
    F: Fn(Context, String, String) -> DialFuture + Send + Sync,
{
    DialFn { f }
}

#[async_trait]
impl<F> Dialer for DialFn<F>
where
    F: Fn(Context, String, String) -> DialFuture + Send + Sync,
{
    async fn dial(
        &self,
        ctx: &Context,
        network: &str,
        address: &str,
    ) -> std::io::Result<BoxConnection> {
        (self.f)(ctx.clone(), network.to_string(), address.to_string()).await
    }
}
