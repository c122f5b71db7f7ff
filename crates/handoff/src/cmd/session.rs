use std::sync::Arc;

use handoff_tunnel::{BoxConnection, Context, RelayKind, TargetAddr, Tunnel};
use tokio::task::{JoinError, JoinSet};
use tracing::warn;

use crate::cmd::internal;
use crate::exit::{tunnel_code, CliResult, SUCCESS};
use crate::output::{print_session, OutputFormat, SessionReport};

/// Concurrent tunnel sessions spawned from one accept loop.
pub struct Sessions {
    tasks: JoinSet<(SessionReport, i32)>,
    tunnel: Tunnel,
    target: Arc<TargetAddr>,
    policy: RelayKind,
    format: OutputFormat,
    next_id: u64,
    exit_code: i32,
}

impl Sessions {
    pub fn new(tunnel: Tunnel, target: TargetAddr, policy: RelayKind, format: OutputFormat) -> Self {
        Self {
            tasks: JoinSet::new(),
            tunnel,
            target: Arc::new(target),
            policy,
            format,
            next_id: 1,
            exit_code: SUCCESS,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Serve `conn` on its own task under a child of `ctx`.
    pub fn spawn(&mut self, ctx: &Context, peer: String, conn: BoxConnection) {
        let session = self.next_id;
        self.next_id += 1;

        let ctx = ctx.child();
        let tunnel = self.tunnel.clone();
        let target = Arc::clone(&self.target);
        let policy = self.policy;

        self.tasks.spawn(async move {
            let result = tunnel.serve(&ctx, conn, &target).await;
            let mut report = SessionReport {
                session,
                peer,
                target: target.to_string(),
                policy: policy.as_str(),
                upstream_bytes: 0,
                downstream_bytes: 0,
                exchanges: 0,
                error: None,
            };
            let code = match result {
                Ok(stats) => {
                    report.upstream_bytes = stats.upstream_bytes;
                    report.downstream_bytes = stats.downstream_bytes;
                    report.exchanges = stats.exchanges;
                    SUCCESS
                }
                Err(err) => {
                    let code = tunnel_code(&err);
                    report.error = Some(err.to_string());
                    code
                }
            };
            (report, code)
        });
    }

    /// Wait for the next session to finish, if any is running.
    pub async fn join_next(&mut self) -> Option<Result<(SessionReport, i32), JoinError>> {
        self.tasks.join_next().await
    }

    /// Print a finished session and remember the first failure's exit code.
    pub fn record(&mut self, joined: Result<(SessionReport, i32), JoinError>) {
        let code = match joined {
            Ok((report, code)) => {
                print_session(&report, self.format);
                code
            }
            Err(err) => {
                let err = internal("session task failed", err);
                warn!(error = %err, "session aborted");
                err.code
            }
        };
        if self.exit_code == SUCCESS {
            self.exit_code = code;
        }
    }

    /// Wait for every running session and return the process exit code.
    pub async fn finish(mut self) -> CliResult<i32> {
        while let Some(joined) = self.tasks.join_next().await {
            self.record(joined);
        }
        Ok(self.exit_code)
    }
}
