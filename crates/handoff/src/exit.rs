use std::fmt;
use std::io;

use handoff_fd::ExchangeError;
use handoff_tunnel::TunnelError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_code(err: &io::Error) -> i32 {
    match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => FAILURE,
        io::ErrorKind::AddrInUse | io::ErrorKind::AddrNotAvailable => USAGE,
        _ => INTERNAL,
    }
}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    CliError::new(io_code(&err), format!("{context}: {err}"))
}

pub fn exchange_error(context: &str, err: ExchangeError) -> CliError {
    let code = match &err {
        ExchangeError::Bind { source, .. }
        | ExchangeError::Connect { source, .. }
        | ExchangeError::Accept(source)
        | ExchangeError::ExtractionFailed(source)
        | ExchangeError::Io(source) => io_code(source),
        ExchangeError::PathTooLong { .. } => USAGE,
        ExchangeError::Unsupported(_) => DATA_INVALID,
        _ => TRANSPORT_ERROR,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn tunnel_code(err: &TunnelError) -> i32 {
    match err {
        TunnelError::DialFailed { source, .. } => io_code(source),
        TunnelError::RelayFatal(relay) if relay.is_line_too_long() => DATA_INVALID,
        TunnelError::RelayFatal(_) => FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use handoff_tunnel::{LineError, RelayError, Side};

    use super::*;

    #[test]
    fn dial_timeout_maps_to_timeout_code() {
        let err = TunnelError::DialFailed {
            network: "tcp".to_string(),
            address: "192.0.2.1:80".to_string(),
            source: io::Error::new(io::ErrorKind::TimedOut, "dial timed out"),
        };
        assert_eq!(tunnel_code(&err), TIMEOUT);
    }

    #[test]
    fn overlong_line_maps_to_data_invalid() {
        let err = TunnelError::RelayFatal(RelayError::ReadFailed {
            side: Side::Inbound,
            source: LineError::TooLong { max: 8192 },
        });
        assert_eq!(tunnel_code(&err), DATA_INVALID);
    }

    #[test]
    fn path_too_long_is_usage_error() {
        let err = exchange_error(
            "bind failed",
            ExchangeError::PathTooLong {
                path: "/x".into(),
                len: 200,
                max: 108,
            },
        );
        assert_eq!(err.code, USAGE);
        assert!(err.message.starts_with("bind failed: "));
    }

    #[test]
    fn connect_refused_is_failure() {
        let err = exchange_error(
            "connect failed",
            ExchangeError::Connect {
                path: "/tmp/missing.sock".into(),
                source: io::Error::from(io::ErrorKind::ConnectionRefused),
            },
        );
        assert_eq!(err.code, FAILURE);
    }
}
