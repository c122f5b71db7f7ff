use handoff_tunnel::{RelayKind, Tunnel};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::cmd::session::Sessions;
use crate::cmd::{build_runtime, resolve_target, root_context, RelayArgs};
use crate::exit::{io_error, CliResult};
use crate::output::OutputFormat;

pub fn run(args: RelayArgs, format: OutputFormat) -> CliResult<i32> {
    let target = resolve_target(&args.tunnel.target)?;
    let config = args.tunnel.config()?;
    let policy = RelayKind::from(args.tunnel.policy);
    let tunnel = Tunnel::from_config(policy, &config);

    let runtime = build_runtime()?;
    runtime.block_on(async move {
        let listener = TcpListener::bind(&args.listen)
            .await
            .map_err(|err| io_error("bind failed", err))?;
        let local = listener
            .local_addr()
            .map_err(|err| io_error("bind failed", err))?;
        info!(listen = %local, %target, %policy, "relay listening");

        let ctx = root_context();
        let mut sessions = Sessions::new(tunnel, target, policy, format);
        let mut accepted = 0usize;

        loop {
            if args.tunnel.count.is_some_and(|count| accepted >= count) {
                break;
            }

            tokio::select! {
                _ = ctx.done() => break,
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    sessions.record(joined);
                }
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        if let Err(err) = stream.set_nodelay(true) {
                            warn!(%peer, error = %err, "set_nodelay failed");
                        }
                        sessions.spawn(&ctx, peer.to_string(), Box::new(stream));
                        accepted += 1;
                    }
                    Err(err) => return Err(io_error("accept failed", err)),
                },
            }
        }

        drop(listener);
        sessions.finish().await
    })
}
