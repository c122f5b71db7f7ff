use std::io::ErrorKind;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use handoff_fd::{send_connection, LocalSocket};
use tracing::{debug, info};

use crate::cmd::{internal, PassArgs};
use crate::exit::{exchange_error, io_error, CliResult, SUCCESS};
use crate::output::{print_handoff, HandoffReport, OutputFormat};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub fn run(args: PassArgs, format: OutputFormat) -> CliResult<i32> {
    let socket =
        LocalSocket::connect(&args.socket).map_err(|err| exchange_error("connect failed", err))?;

    let listener = TcpListener::bind(&args.listen).map_err(|err| io_error("bind failed", err))?;
    listener
        .set_nonblocking(true)
        .map_err(|err| io_error("bind failed", err))?;
    let local = listener
        .local_addr()
        .map_err(|err| io_error("bind failed", err))?;
    info!(listen = %local, socket = %args.socket.display(), "passing connections");

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let mut passed = 0u64;

    while running.load(Ordering::SeqCst) {
        if let Some(count) = args.count {
            if passed >= count as u64 {
                break;
            }
        }

        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
                continue;
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(io_error("accept failed", err)),
        };
        stream
            .set_nonblocking(false)
            .map_err(|err| io_error("accept failed", err))?;

        debug!(%peer, "handing off connection");
        send_connection(&socket, stream)
            .map_err(|err| exchange_error("hand-off failed", err.into_error()))?;
        passed += 1;

        print_handoff(
            &HandoffReport {
                connection: passed,
                peer: peer.to_string(),
                socket: args.socket.display().to_string(),
            },
            format,
        );
    }

    info!(passed, "pass finished");
    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| internal("signal handler setup failed", err))
}
