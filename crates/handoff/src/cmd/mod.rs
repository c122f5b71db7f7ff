use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand, ValueEnum};
use handoff_tunnel::{Context, RelayKind, TargetAddr, TunnelConfig, DEFAULT_MAX_LINE_LEN};
use tracing::info;

use crate::exit::{io_error, CliError, CliResult, INTERNAL, USAGE};
use crate::output::OutputFormat;

pub mod adopt;
pub mod pass;
pub mod relay;
pub mod session;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept TCP connections and tunnel each one to a target.
    Relay(RelayArgs),
    /// Accept TCP connections and hand each one to an adopting process.
    Pass(PassArgs),
    /// Adopt connections handed over a Unix socket and tunnel them.
    Adopt(AdoptArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Relay(args) => relay::run(args, format),
        Command::Pass(args) => pass::run(args, format),
        Command::Adopt(args) => adopt::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum Policy {
    /// Copy bytes both ways until either side closes.
    Raw,
    /// Forward one request line, then wait for one reply line.
    Line,
}

impl From<Policy> for RelayKind {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::Raw => RelayKind::Raw,
            Policy::Line => RelayKind::Line,
        }
    }
}

#[derive(Args, Debug)]
pub struct TunnelArgs {
    /// Target to dial: ip:port, host:port, or unix:/path.
    #[arg(long)]
    pub target: String,
    /// Relay policy.
    #[arg(long, value_enum, default_value = "raw")]
    pub policy: Policy,
    /// Dial timeout (e.g. 10s, 500ms).
    #[arg(long, default_value = "10s")]
    pub dial_timeout: String,
    /// Longest line, newline included, the line policy accepts.
    #[arg(long, default_value_t = DEFAULT_MAX_LINE_LEN)]
    pub max_line_len: usize,
    /// Exit after N connections have been served.
    #[arg(long)]
    pub count: Option<usize>,
}

impl TunnelArgs {
    pub fn config(&self) -> CliResult<TunnelConfig> {
        if self.max_line_len == 0 {
            return Err(CliError::new(USAGE, "--max-line-len must be greater than zero"));
        }
        Ok(TunnelConfig {
            dial_timeout: parse_duration(&self.dial_timeout)?,
            max_line_len: self.max_line_len,
        })
    }
}

#[derive(Args, Debug)]
pub struct RelayArgs {
    /// TCP address to listen on.
    #[arg(long)]
    pub listen: String,
    #[command(flatten)]
    pub tunnel: TunnelArgs,
}

#[derive(Args, Debug)]
pub struct PassArgs {
    /// TCP address to listen on.
    #[arg(long)]
    pub listen: String,
    /// Unix socket of the adopting process.
    #[arg(long)]
    pub socket: PathBuf,
    /// Exit after handing off N connections.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct AdoptArgs {
    /// Unix socket path to bind for the passing process.
    #[arg(long)]
    pub socket: PathBuf,
    #[command(flatten)]
    pub tunnel: TunnelArgs,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Parse `unix:/path` or `ip:port` directly, resolving `host:port` otherwise.
pub fn resolve_target(input: &str) -> CliResult<TargetAddr> {
    if let Ok(target) = input.parse::<TargetAddr>() {
        return Ok(target);
    }
    if input.starts_with("unix:") {
        return Err(CliError::new(USAGE, format!("invalid target: {input:?}")));
    }

    let mut addrs = input
        .to_socket_addrs()
        .map_err(|err| CliError::new(USAGE, format!("invalid target {input:?}: {err}")))?;
    addrs
        .next()
        .map(TargetAddr::Tcp)
        .ok_or_else(|| CliError::new(USAGE, format!("target {input:?} resolved to no addresses")))
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(match unit {
        "ms" => Duration::from_millis(value),
        _ => Duration::from_secs(value),
    })
}

pub fn build_runtime() -> CliResult<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| io_error("runtime setup failed", err))
}

/// Root context cancelled on Ctrl-C. Must be called inside the runtime.
pub fn root_context() -> Context {
    let ctx = Context::background();
    let signal_ctx = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            signal_ctx.cancel();
        }
    });
    ctx
}

pub fn internal(context: &str, err: impl std::fmt::Display) -> CliError {
    CliError::new(INTERNAL, format!("{context}: {err}"))
}
