use std::io::ErrorKind;
use std::thread;

use handoff::bridge::into_async;
use handoff_fd::{recv_connection, AdoptedConnection, ExchangeError, LocalListener};
use handoff_tunnel::{RelayKind, Tunnel};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cmd::session::Sessions;
use crate::cmd::{build_runtime, resolve_target, root_context, AdoptArgs};
use crate::exit::{exchange_error, CliResult};
use crate::output::OutputFormat;

const HANDOFF_QUEUE_DEPTH: usize = 16;

pub fn run(args: AdoptArgs, format: OutputFormat) -> CliResult<i32> {
    let target = resolve_target(&args.tunnel.target)?;
    let config = args.tunnel.config()?;
    let policy = RelayKind::from(args.tunnel.policy);
    let tunnel = Tunnel::from_config(policy, &config);

    let listener =
        LocalListener::bind(&args.socket).map_err(|err| exchange_error("bind failed", err))?;
    info!(socket = %listener.path().display(), %target, %policy, "waiting for passing process");

    // The receive thread is not joined and may still own the listener at exit.
    let socket_file = listener.socket_file();
    let (tx, mut rx) = mpsc::channel(HANDOFF_QUEUE_DEPTH);
    let count = args.tunnel.count;
    thread::spawn(move || receive_loop(listener, tx, count));

    let runtime = build_runtime()?;
    let result = runtime.block_on(async move {
        let ctx = root_context();
        let mut sessions = Sessions::new(tunnel, target, policy, format);
        let mut failure = None;

        loop {
            tokio::select! {
                _ = ctx.done() => break,
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    sessions.record(joined);
                }
                received = rx.recv() => match received {
                    Some(Ok(conn)) => {
                        let peer = conn.peer_description();
                        match into_async(conn) {
                            Ok(conn) => sessions.spawn(&ctx, peer, conn),
                            Err(err) => warn!(%peer, error = %err, "failed to register adopted connection"),
                        }
                    }
                    Some(Err(err)) => {
                        failure = Some(err);
                        break;
                    }
                    None => break,
                },
            }
        }

        let code = sessions.finish().await?;
        match failure {
            Some(err) => Err(err),
            None => Ok(code),
        }
    });
    socket_file.remove();
    result
}

fn receive_loop(
    listener: LocalListener,
    tx: mpsc::Sender<CliResult<AdoptedConnection>>,
    count: Option<usize>,
) {
    let socket = match listener.accept() {
        Ok(socket) => socket,
        Err(err) => {
            let _ = tx.blocking_send(Err(exchange_error("accept failed", err)));
            return;
        }
    };
    info!("passing process connected");

    let mut received = 0usize;
    while count.is_none_or(|count| received < count) {
        match recv_connection(&socket) {
            Ok(conn) => {
                received += 1;
                if tx.blocking_send(Ok(conn)).is_err() {
                    return;
                }
            }
            Err(ExchangeError::ReadFailed(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                info!(received, "passing process disconnected");
                return;
            }
            Err(
                err @ (ExchangeError::Unsupported(_)
                | ExchangeError::DescriptorCountMismatch { .. }
                | ExchangeError::MalformedControlMessage(_)),
            ) => {
                warn!(error = %err, "discarded invalid hand-off");
            }
            Err(err) => {
                let _ = tx.blocking_send(Err(exchange_error("receive failed", err)));
                return;
            }
        }
    }
}
