use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// Summary of one finished tunnel session.
#[derive(Debug, Serialize)]
pub struct SessionReport {
    pub session: u64,
    pub peer: String,
    pub target: String,
    pub policy: &'static str,
    pub upstream_bytes: u64,
    pub downstream_bytes: u64,
    pub exchanges: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One connection handed to an adopting process.
#[derive(Debug, Serialize)]
pub struct HandoffReport {
    pub connection: u64,
    pub peer: String,
    pub socket: String,
}

pub fn print_session(report: &SessionReport, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(report),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec![
                    "SESSION", "PEER", "TARGET", "POLICY", "UP", "DOWN", "EXCHANGES", "ERROR",
                ])
                .add_row(vec![
                    report.session.to_string(),
                    report.peer.clone(),
                    report.target.clone(),
                    report.policy.to_string(),
                    report.upstream_bytes.to_string(),
                    report.downstream_bytes.to_string(),
                    report.exchanges.to_string(),
                    report.error.clone().unwrap_or_else(|| "-".to_string()),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            let outcome = match &report.error {
                Some(err) => format!("error={err}"),
                None => "ok".to_string(),
            };
            println!(
                "session={} peer={} target={} policy={} up={} down={} exchanges={} {}",
                report.session,
                report.peer,
                report.target,
                report.policy,
                report.upstream_bytes,
                report.downstream_bytes,
                report.exchanges,
                outcome
            );
        }
    }
}

pub fn print_handoff(report: &HandoffReport, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(report),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["CONNECTION", "PEER", "SOCKET"])
                .add_row(vec![
                    report.connection.to_string(),
                    report.peer.clone(),
                    report.socket.clone(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "connection={} peer={} socket={}",
                report.connection, report.peer, report.socket
            );
        }
    }
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}
