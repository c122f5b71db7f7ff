use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::conn::{close, BoxConnection, TargetAddr};
use crate::context::Context;
use crate::dial::{Dialer, NetDialer, DEFAULT_DIAL_TIMEOUT};
use crate::error::{Result, TunnelError};
use crate::line::DEFAULT_MAX_LINE_LEN;
use crate::relay::{RelayKind, RelayPolicy, RelayStats};

/// Tunnel tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    /// How long dialing the target may take.
    pub dial_timeout: Duration,
    /// Longest line, newline included, a line relay accepts.
    pub max_line_len: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }
}

/// Lifecycle of a single [`Tunnel::serve`] call, reported in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Dialing,
    Relaying,
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Idle => "idle",
            Phase::Dialing => "dialing",
            Phase::Relaying => "relaying",
            Phase::Closed => "closed",
        })
    }
}

/// Dials a target for each inbound connection and relays between the two
/// using a pluggable [`RelayPolicy`].
///
/// A tunnel holds no per-connection state; one instance can serve any number
/// of connections concurrently.
#[derive(Clone)]
pub struct Tunnel {
    policy: Arc<dyn RelayPolicy>,
    dialer: Arc<dyn Dialer>,
}

impl Tunnel {
    /// Tunnel using `policy` and a [`NetDialer`] with the default timeout.
    pub fn new(policy: impl RelayPolicy + 'static) -> Self {
        Self::from_parts(Arc::new(policy), Arc::new(NetDialer::default()))
    }

    /// Tunnel for a policy kind, configured from `config`.
    pub fn from_config(kind: RelayKind, config: &TunnelConfig) -> Self {
        Self::from_parts(
            kind.policy(config.max_line_len),
            Arc::new(NetDialer::new(config.dial_timeout)),
        )
    }

    pub fn from_parts(policy: Arc<dyn RelayPolicy>, dialer: Arc<dyn Dialer>) -> Self {
        Self { policy, dialer }
    }

    /// Replace the dialer, e.g. to resolve names or inject test doubles.
    pub fn with_dialer(mut self, dialer: impl Dialer + 'static) -> Self {
        self.dialer = Arc::new(dialer);
        self
    }

    /// Dial `target`, relay between `from` and the new connection, then close
    /// both.
    ///
    /// If dialing fails the policy is never invoked and `from` is closed.
    /// Otherwise the policy's fatal error, if any, is returned after the
    /// outbound connection is closed.
    pub async fn serve(
        &self,
        ctx: &Context,
        from: BoxConnection,
        target: &TargetAddr,
    ) -> Result<RelayStats> {
        let network = target.network();
        let address = target.to_string();
        debug!(phase = %Phase::Idle, network, %address, "tunnel accepted connection");

        debug!(phase = %Phase::Dialing, network, %address, "dialing target");
        let mut to = match self.dialer.dial(ctx, network, &address).await {
            Ok(to) => to,
            Err(source) => {
                warn!(network, %address, error = %source, "dial failed");
                close(from).await;
                return Err(TunnelError::DialFailed {
                    network: network.to_string(),
                    address,
                    source,
                });
            }
        };

        debug!(phase = %Phase::Relaying, network, %address, "relaying");
        let result = self.policy.relay(ctx, from, &mut to).await;
        close(to).await;

        match &result {
            Ok(stats) => info!(
                phase = %Phase::Closed,
                %address,
                upstream_bytes = stats.upstream_bytes,
                downstream_bytes = stats.downstream_bytes,
                exchanges = stats.exchanges,
                "tunnel closed"
            ),
            Err(err) => warn!(phase = %Phase::Closed, %address, error = %err, "tunnel closed on error"),
        }

        result.map_err(TunnelError::RelayFatal)
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel").finish_non_exhaustive()
    }
}
