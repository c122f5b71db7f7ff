//! Pass live socket descriptors between processes.
//!
//! A process holding an established connection can hand its descriptor to
//! another process over a Unix domain socket (`SCM_RIGHTS`); the receiver
//! adopts the connection as-is, without redialing:
//!
//! - [`send_connection`] / [`recv_connection`] move a whole connection
//! - [`send_descriptor`] / [`recv_descriptor`] move any single descriptor
//! - [`LocalSocket`] and [`LocalListener`] provide the Unix socket ends
//!
//! All operations are blocking. A socket must not carry two transfers in the
//! same direction at once; use one socket per transfer or serialise callers.

pub mod error;

#[cfg(unix)]
pub mod cmsg;
#[cfg(unix)]
pub mod conn;
#[cfg(unix)]
pub mod descriptor;
#[cfg(unix)]
pub mod exchange;
#[cfg(unix)]
pub mod socket;

pub use error::{ExchangeError, Result, SendError};

#[cfg(unix)]
pub use cmsg::ControlMessage;
#[cfg(unix)]
pub use conn::{AdoptedConnection, Connection};
#[cfg(unix)]
pub use descriptor::Descriptor;
#[cfg(unix)]
pub use exchange::{recv_connection, recv_descriptor, send_connection, send_descriptor};
#[cfg(unix)]
pub use socket::{LocalListener, LocalSocket, SocketFile};
