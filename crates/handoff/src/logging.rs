use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Environment variables consulted for filter directives, first match wins.
const FILTER_ENV: [&str; 2] = ["HANDOFF_LOG", "RUST_LOG"];

/// Crates whose events follow `--log-level`; everything else stays at `warn`.
const OWN_TARGETS: [&str; 3] = ["handoff", "handoff_fd", "handoff_tunnel"];

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// One line per event.
    Text,
    /// Like `text`, with span fields folded onto the event line.
    Compact,
    /// One JSON object per event.
    Json,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Directives used when no environment override is set, e.g.
/// `warn,handoff=debug,handoff_fd=debug,handoff_tunnel=debug`.
fn default_directives(level: LogLevel) -> String {
    let level = LevelFilter::from(level);
    let mut directives = vec![LevelFilter::WARN.min(level).to_string()];
    directives.extend(OWN_TARGETS.iter().map(|target| format!("{target}={level}")));
    directives.join(",")
}

/// Build the event filter from an override string, falling back to `level`
/// when the override is absent, blank, or does not parse.
fn build_filter(level: LogLevel, directives: Option<&str>) -> EnvFilter {
    if let Some(directives) = directives.map(str::trim).filter(|d| !d.is_empty()) {
        match EnvFilter::try_new(directives) {
            Ok(filter) => return filter,
            Err(err) => eprintln!("ignoring log filter {directives:?}: {err}"),
        }
    }
    EnvFilter::new(default_directives(level))
}

fn filter_from_env() -> Option<String> {
    FILTER_ENV.iter().find_map(|name| std::env::var(name).ok())
}

pub fn init_logging(format: LogFormat, level: LogLevel) {
    let filter = build_filter(level, filter_from_env().as_deref());
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(false);

    // A subscriber may already be installed, e.g. in tests.
    let _ = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}
