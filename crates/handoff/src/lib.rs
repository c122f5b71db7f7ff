//! Hand live connections between processes and tunnel them onward.
//!
//! # Crate Structure
//!
//! - [`fd`]: descriptor passing over Unix domain sockets (`SCM_RIGHTS`)
//! - [`tunnel`]: dial-and-relay tunnels with raw and line policies (behind the
//!   `tunnel` feature)
//! - [`bridge`]: turn an adopted connection into one a tunnel can relay

/// Re-export descriptor passing types.
pub mod fd {
    pub use handoff_fd::*;
}

/// Re-export tunnel types (requires `tunnel` feature).
#[cfg(feature = "tunnel")]
pub mod tunnel {
    pub use handoff_tunnel::*;
}

#[cfg(all(unix, feature = "tunnel"))]
pub mod bridge;
