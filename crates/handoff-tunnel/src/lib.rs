//! Per-connection tunnels: accept an inbound connection, dial a target, and
//! relay between the two.
//!
//! How bytes move is a [`RelayPolicy`]:
//!
//! - [`RawRelay`] copies both directions until either side finishes
//! - [`LineRelay`] forwards one request line at a time and waits for the
//!   matching reply line, bounded by a maximum line length
//!
//! Operations take a [`Context`] for cancellation. A [`Tunnel`] closes both
//! connections before [`Tunnel::serve`] returns.

pub mod conn;
pub mod context;
pub mod copy;
pub mod dial;
pub mod error;
pub mod line;
pub mod relay;
pub mod tunnel;

pub use conn::{BoxConnection, Connection, TargetAddr};
pub use context::Context;
pub use dial::{dial_fn, DialFuture, Dialer, NetDialer, DEFAULT_DIAL_TIMEOUT};
pub use error::{InvalidTarget, LineError, RelayError, Result, Side, TunnelError};
pub use line::{LineReader, DEFAULT_MAX_LINE_LEN};
pub use relay::{LineRelay, RawRelay, RelayKind, RelayPolicy, RelayStats};
pub use tunnel::{Phase, Tunnel, TunnelConfig};
