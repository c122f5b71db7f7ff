use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinError;
use tracing::{debug, warn};

use crate::conn::{close, BoxConnection};
use crate::context::Context;
use crate::copy::{copy, CopyEnd, CopyOutcome};
use crate::error::{LineError, RelayError, Side};
use crate::line::{LineReader, DEFAULT_MAX_LINE_LEN};

/// Byte and exchange counts for one relay session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes forwarded from the inbound to the outbound connection.
    pub upstream_bytes: u64,
    /// Bytes forwarded from the outbound to the inbound connection.
    pub downstream_bytes: u64,
    /// Completed request/reply pairs; zero for raw relays.
    pub exchanges: u64,
}

/// Moves data between an inbound and an outbound connection.
///
/// A policy owns `from` and must have closed it by the time it returns,
/// whatever the outcome. `to` stays with the caller.
#[async_trait]
pub trait RelayPolicy: Send + Sync {
    async fn relay(
        &self,
        ctx: &Context,
        from: BoxConnection,
        to: &mut BoxConnection,
    ) -> Result<RelayStats, RelayError>;
}

/// Copies bytes both ways until either direction ends.
///
/// Each direction runs as its own task. The first to finish (end of stream or
/// error) cancels the other. Copy failures end the relay but are not reported
/// as errors. `to` is handed back to the caller once both tasks are done.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawRelay;

#[async_trait]
impl RelayPolicy for RawRelay {
    async fn relay(
        &self,
        ctx: &Context,
        from: BoxConnection,
        to: &mut BoxConnection,
    ) -> Result<RelayStats, RelayError> {
        let ctx = ctx.child();
        // Stops both tasks if this future is dropped before they finish.
        let _abandon = ctx.token().clone().drop_guard();

        let outbound = std::mem::replace(to, detached());
        let (mut from_read, mut from_write) = tokio::io::split(from);
        let (mut to_read, mut to_write) = tokio::io::split(outbound);

        let upstream = tokio::spawn({
            let ctx = ctx.clone();
            async move {
                let outcome = copy(&ctx, &mut to_write, &mut from_read).await;
                ctx.cancel();
                (outcome, from_read, to_write)
            }
        });
        let downstream = tokio::spawn({
            let ctx = ctx.clone();
            async move {
                let outcome = copy(&ctx, &mut from_write, &mut to_read).await;
                ctx.cancel();
                (outcome, to_read, from_write)
            }
        });
        let (up, down) = tokio::join!(upstream, downstream);
        let (up, down) = (joined("upstream", up), joined("downstream", down));

        let mut stats = RelayStats::default();
        if let Some((outcome, _, _)) = &up {
            log_copy_end("upstream", outcome);
            stats.upstream_bytes = outcome.bytes;
        }
        if let Some((outcome, _, _)) = &down {
            log_copy_end("downstream", outcome);
            stats.downstream_bytes = outcome.bytes;
        }

        // Halves held by an aborted task were dropped with it, which closes
        // their connections.
        if let (Some((_, from_read, to_write)), Some((_, to_read, from_write))) = (up, down) {
            *to = to_read.unsplit(to_write);
            close(from_read.unsplit(from_write)).await;
        }

        Ok(stats)
    }
}

/// Stand-in for `to` while its halves are owned by the copy tasks.
fn detached() -> BoxConnection {
    Box::new(tokio::io::duplex(1).0)
}

/// Unwrap a copy task's result, re-raising its panic if it had one.
fn joined<T>(direction: &'static str, result: Result<T, JoinError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        Err(err) => {
            warn!(direction, error = %err, "copy task aborted");
            None
        }
    }
}

fn log_copy_end(direction: &'static str, outcome: &CopyOutcome) {
    match &outcome.end {
        CopyEnd::Eof => debug!(direction, bytes = outcome.bytes, "copy reached end of stream"),
        CopyEnd::Cancelled => debug!(direction, bytes = outcome.bytes, "copy cancelled"),
        CopyEnd::Failed(err) => {
            warn!(direction, bytes = outcome.bytes, error = %err, "copy failed")
        }
    }
}

/// Forwards one newline-terminated request line at a time and waits for the
/// matching reply line before reading the next request.
///
/// Cancellation is honoured only while waiting for a request; a reply already
/// in flight is always delivered. Lines longer than the configured maximum and
/// all I/O failures are fatal.
#[derive(Debug, Clone, Copy)]
pub struct LineRelay {
    max_line_len: usize,
}

impl LineRelay {
    pub fn new() -> Self {
        Self::with_max_line_len(DEFAULT_MAX_LINE_LEN)
    }

    /// Maximum line length, newline included, for both directions.
    pub fn with_max_line_len(max_line_len: usize) -> Self {
        Self { max_line_len }
    }

    pub fn max_line_len(&self) -> usize {
        self.max_line_len
    }
}

impl Default for LineRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelayPolicy for LineRelay {
    async fn relay(
        &self,
        ctx: &Context,
        from: BoxConnection,
        to: &mut BoxConnection,
    ) -> Result<RelayStats, RelayError> {
        let mut inbound = LineReader::with_max_len(from, self.max_line_len);
        let mut outbound = LineReader::with_max_len(to, self.max_line_len);
        let mut stats = RelayStats::default();

        let result = exchange_lines(ctx, &mut inbound, &mut outbound, &mut stats).await;
        if let Err(err) = &result {
            warn!(side = %err.side(), error = %err, "line relay failed");
        }
        close(inbound.into_inner()).await;

        result.map(|()| stats)
    }
}

async fn exchange_lines(
    ctx: &Context,
    inbound: &mut LineReader<BoxConnection>,
    outbound: &mut LineReader<&mut BoxConnection>,
    stats: &mut RelayStats,
) -> Result<(), RelayError> {
    let background = Context::background();

    loop {
        let request = match inbound.read_line(ctx).await {
            Ok(line) => line,
            Err(LineError::Eof) => {
                debug!(exchanges = stats.exchanges, "inbound closed");
                return Ok(());
            }
            Err(LineError::Cancelled) => {
                debug!(exchanges = stats.exchanges, "line relay cancelled");
                return Ok(());
            }
            Err(source) => {
                return Err(RelayError::ReadFailed {
                    side: Side::Inbound,
                    source,
                })
            }
        };

        outbound
            .get_mut()
            .write_all(&request)
            .await
            .map_err(|source| RelayError::WriteFailed {
                side: Side::Outbound,
                source,
            })?;
        stats.upstream_bytes += request.len() as u64;

        let reply = outbound
            .read_line(&background)
            .await
            .map_err(|source| RelayError::ReadFailed {
                side: Side::Outbound,
                source,
            })?;

        inbound
            .get_mut()
            .write_all(&reply)
            .await
            .map_err(|source| RelayError::WriteFailed {
                side: Side::Inbound,
                source,
            })?;
        stats.downstream_bytes += reply.len() as u64;
        stats.exchanges += 1;
    }
}

/// Relay policy selector for configuration and command lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayKind {
    Raw,
    Line,
}

impl RelayKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayKind::Raw => "raw",
            RelayKind::Line => "line",
        }
    }

    /// Build the policy; `max_line_len` only applies to [`RelayKind::Line`].
    pub fn policy(self, max_line_len: usize) -> Arc<dyn RelayPolicy> {
        match self {
            RelayKind::Raw => Arc::new(RawRelay),
            RelayKind::Line => Arc::new(LineRelay::with_max_line_len(max_line_len)),
        }
    }
}

impl fmt::Display for RelayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelayKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(RelayKind::Raw),
            "line" => Ok(RelayKind::Line),
            other => Err(format!("unknown relay policy {other:?} (expected raw or line)")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, DuplexStream};
    use tokio::sync::oneshot;

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    fn pipe() -> (BoxConnection, DuplexStream) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        (Box::new(local), remote)
    }

    async fn read_reply(stream: &mut BufReader<DuplexStream>) -> String {
        let mut line = String::new();
        stream.read_line(&mut line).await.unwrap();
        line
    }

    #[tokio::test]
    async fn raw_relay_copies_both_directions() {
        let (from, client) = pipe();
        let (mut to, mut target) = pipe();
        let ctx = Context::background();

        let session = tokio::spawn(async move {
            let mut client = client;
            client.write_all(b"hello").await.unwrap();

            let mut buf = [0u8; 4];
            client.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"back");
            drop(client);
        });

        let target_side = async {
            let mut buf = [0u8; 5];
            target.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            target.write_all(b"back").await.unwrap();
        };

        let (stats, ()) = tokio::join!(RawRelay.relay(&ctx, from, &mut to), target_side);
        let stats = stats.unwrap();
        session.await.unwrap();

        assert_eq!(stats.upstream_bytes, 5);
        assert_eq!(stats.downstream_bytes, 4);
        assert_eq!(stats.exchanges, 0);
    }

    #[tokio::test]
    async fn raw_relay_ends_when_target_closes() {
        let (from, mut client) = pipe();
        let (mut to, target) = pipe();
        drop(target);

        let stats = tokio::time::timeout(WAIT, RawRelay.relay(&Context::background(), from, &mut to))
            .await
            .expect("relay should end when the target closes")
            .unwrap();
        assert_eq!(stats.downstream_bytes, 0);

        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn raw_relay_stops_on_cancellation() {
        let (from, mut client) = pipe();
        let (mut to, mut target) = pipe();
        let ctx = Context::background();

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        tokio::time::timeout(WAIT, RawRelay.relay(&ctx, from, &mut to))
            .await
            .expect("relay should stop once cancelled")
            .unwrap();

        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).await.unwrap(), 0);

        // The outbound connection comes back intact.
        to.write_all(b"still open").await.unwrap();
        let mut buf = [0u8; 10];
        target.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still open");
    }

    #[tokio::test]
    async fn raw_relay_directions_run_as_separate_tasks() {
        let (from, mut client) = pipe();
        let (mut to, mut target) = pipe();
        let ctx = Context::background();

        // A relay future that is never polled again must not stall the copies.
        let relay = RawRelay.relay(&ctx, from, &mut to);
        tokio::pin!(relay);
        assert!(
            tokio::time::timeout(Duration::from_millis(20), &mut relay)
                .await
                .is_err()
        );

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        tokio::time::timeout(WAIT, target.read_exact(&mut buf))
            .await
            .expect("upstream task should copy without the relay being polled")
            .unwrap();
        assert_eq!(&buf, b"ping");

        drop(client);
        let stats = tokio::time::timeout(WAIT, relay)
            .await
            .expect("relay should end once the client leaves")
            .unwrap();
        assert_eq!(stats.upstream_bytes, 4);
    }

    #[tokio::test]
    async fn dropping_raw_relay_stops_its_tasks() {
        let (from, mut client) = pipe();
        let (mut to, _target) = pipe();
        let ctx = Context::background();

        let relay = RawRelay.relay(&ctx, from, &mut to);
        assert!(tokio::time::timeout(Duration::from_millis(20), relay)
            .await
            .is_err());

        let mut rest = Vec::new();
        let read = tokio::time::timeout(WAIT, client.read_to_end(&mut rest))
            .await
            .expect("inbound connection should close once the relay is dropped")
            .unwrap();
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn line_relay_forwards_request_and_reply() {
        let (from, client) = pipe();
        let (mut to, target) = pipe();

        let backend = tokio::spawn(async move {
            let mut target = BufReader::new(target);
            loop {
                let mut line = String::new();
                if target.read_line(&mut line).await.unwrap() == 0 {
                    break;
                }
                let reply = if line == "PING\n" { "PONG\n" } else { "ERR\n" };
                target.get_mut().write_all(reply.as_bytes()).await.unwrap();
            }
        });

        let session = tokio::spawn(async move {
            let mut client = BufReader::new(client);
            client.get_mut().write_all(b"PING\n").await.unwrap();
            assert_eq!(read_reply(&mut client).await, "PONG\n");
            client.get_mut().write_all(b"WHAT\n").await.unwrap();
            assert_eq!(read_reply(&mut client).await, "ERR\n");
        });

        let stats = LineRelay::new()
            .relay(&Context::background(), from, &mut to)
            .await
            .unwrap();
        session.await.unwrap();
        drop(to);
        backend.await.unwrap();

        assert_eq!(stats.exchanges, 2);
        assert_eq!(stats.upstream_bytes, 10);
        assert_eq!(stats.downstream_bytes, 9);
    }

    #[tokio::test]
    async fn line_relay_rejects_overlong_request() {
        let (from, mut client) = pipe();
        let (mut to, mut target) = pipe();

        client
            .write_all(&vec![b'a'; DEFAULT_MAX_LINE_LEN + 1])
            .await
            .unwrap();

        let err = LineRelay::new()
            .relay(&Context::background(), from, &mut to)
            .await
            .unwrap_err();
        assert!(err.is_line_too_long());
        assert_eq!(err.side(), Side::Inbound);

        drop(to);
        let mut forwarded = Vec::new();
        target.read_to_end(&mut forwarded).await.unwrap();
        assert!(forwarded.is_empty());

        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn line_relay_stops_waiting_on_cancellation() {
        let (from, mut client) = pipe();
        let (mut to, mut target) = pipe();
        let ctx = Context::background();

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let stats = tokio::time::timeout(WAIT, LineRelay::new().relay(&ctx, from, &mut to))
            .await
            .expect("relay should stop once cancelled")
            .unwrap();
        assert_eq!(stats, RelayStats::default());

        drop(to);
        let mut forwarded = Vec::new();
        target.read_to_end(&mut forwarded).await.unwrap();
        assert!(forwarded.is_empty());

        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn line_relay_delivers_reply_in_flight_after_cancel() {
        let (from, client) = pipe();
        let (mut to, target) = pipe();
        let ctx = Context::background();
        let (received_tx, received_rx) = oneshot::channel();
        let (reply_tx, reply_rx) = oneshot::channel::<()>();

        let backend = tokio::spawn(async move {
            let mut target = BufReader::new(target);
            let mut line = String::new();
            target.read_line(&mut line).await.unwrap();
            received_tx.send(line).unwrap();
            reply_rx.await.unwrap();
            target.get_mut().write_all(b"DONE\n").await.unwrap();
            target
        });

        let session = tokio::spawn(async move {
            let mut client = BufReader::new(client);
            client.get_mut().write_all(b"SLOW\n").await.unwrap();
            let reply = read_reply(&mut client).await;
            let mut rest = Vec::new();
            client.read_to_end(&mut rest).await.unwrap();
            (reply, rest)
        });

        let controller = {
            let ctx = ctx.clone();
            async move {
                assert_eq!(received_rx.await.unwrap(), "SLOW\n");
                ctx.cancel();
                reply_tx.send(()).unwrap();
            }
        };

        let relay = LineRelay::new();
        let (stats, ()) = tokio::join!(relay.relay(&ctx, from, &mut to), controller);
        let stats = stats.unwrap();
        assert_eq!(stats.exchanges, 1);

        let (reply, rest) = session.await.unwrap();
        assert_eq!(reply, "DONE\n");
        assert!(rest.is_empty());
        drop(backend.await.unwrap());
    }

    #[tokio::test]
    async fn line_relay_target_closing_mid_exchange_is_fatal() {
        let (from, mut client) = pipe();
        let (mut to, target) = pipe();

        let backend = tokio::spawn(async move {
            let mut target = BufReader::new(target);
            let mut line = String::new();
            target.read_line(&mut line).await.unwrap();
        });

        client.write_all(b"GET\n").await.unwrap();
        let err = LineRelay::new()
            .relay(&Context::background(), from, &mut to)
            .await
            .unwrap_err();
        backend.await.unwrap();

        assert!(matches!(
            err,
            RelayError::ReadFailed {
                side: Side::Outbound,
                source: LineError::Eof,
            }
        ));
        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).await.unwrap(), 0);
    }

    #[test]
    fn relay_kind_parses() {
        assert_eq!("raw".parse::<RelayKind>().unwrap(), RelayKind::Raw);
        assert_eq!("line".parse::<RelayKind>().unwrap(), RelayKind::Line);
        assert!("udp".parse::<RelayKind>().is_err());
        assert_eq!(RelayKind::Line.to_string(), "line");
    }
}
