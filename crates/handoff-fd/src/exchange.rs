//! Send and receive descriptors and connections over a [`LocalSocket`].
//!
//! Every transfer is exactly one socket message carrying one `SCM_RIGHTS`
//! block with one descriptor. Stream sockets additionally carry a single
//! zero byte, since ancillary data is not delivered without at least one
//! byte of payload; datagram sockets carry no payload.

use tracing::debug;

use crate::cmsg::{space_for_descriptors, ControlMessage};
use crate::conn::{AdoptedConnection, Connection};
use crate::descriptor::Descriptor;
use crate::error::{ExchangeError, Result, SendError};
use crate::socket::LocalSocket;

/// Room reserved for descriptors on receive, so that a peer sending more
/// than one is detected (and its descriptors closed) instead of having the
/// kernel silently truncate the block to what fits.
pub const MAX_RECV_DESCRIPTORS: usize = 16;

const STREAM_PAYLOAD: [u8; 1] = [0];

/// Send `descriptor` to the peer of `socket`.
///
/// On success the local handle is closed: the peer is now its only owner.
/// On failure the descriptor comes back inside the error, still open.
pub fn send_descriptor(
    socket: &LocalSocket,
    descriptor: Descriptor,
) -> std::result::Result<(), SendError<Descriptor>> {
    let control = ControlMessage::encode(&[ControlMessage::rights(&[descriptor.as_raw()])]);
    let payload: &[u8] = if socket.is_stream() {
        &STREAM_PAYLOAD
    } else {
        &[]
    };

    match socket.send_with_control(payload, &control) {
        Ok(0) if !payload.is_empty() => {
            let err = std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "sendmsg accepted no bytes for descriptor transfer",
            );
            return Err(SendError::new(ExchangeError::WriteFailed(err), descriptor));
        }
        Ok(_) => {}
        Err(err) => return Err(SendError::new(ExchangeError::WriteFailed(err), descriptor)),
    }

    let fd = descriptor.as_raw();
    if let Err(err) = descriptor.close() {
        // The peer already owns its copy; a failed local close changes nothing
        // about the transfer.
        debug!(fd, error = %err, "closing sent descriptor failed");
    }
    debug!(fd, "sent descriptor");
    Ok(())
}

/// Hand `connection` to the peer of `socket`.
///
/// The connection's descriptor is duplicated and sent. On success the local
/// connection is closed (never shut down, which would also end the peer's
/// copy). Connections without a descriptor are rejected with
/// [`ExchangeError::Unsupported`]. On any failure the connection comes back
/// inside the error, untouched.
pub fn send_connection<C: Connection>(
    socket: &LocalSocket,
    connection: C,
) -> std::result::Result<(), SendError<C>> {
    let descriptor = match connection.descriptor().map(Descriptor::duplicate) {
        Some(Ok(descriptor)) => descriptor,
        Some(Err(err)) => {
            return Err(SendError::new(
                ExchangeError::ExtractionFailed(err),
                connection,
            ))
        }
        None => {
            return Err(SendError::new(
                ExchangeError::Unsupported("connection is not backed by a descriptor"),
                connection,
            ))
        }
    };

    if let Err(err) = send_descriptor(socket, descriptor) {
        return Err(SendError::new(err.into_error(), connection));
    }

    drop(connection);
    debug!("handed off connection");
    Ok(())
}

/// Receive exactly one descriptor from the peer of `socket`.
///
/// Exactly one control block with exactly one descriptor is accepted. In any
/// other case every descriptor that arrived is closed before the error is
/// returned.
pub fn recv_descriptor(socket: &LocalSocket) -> Result<Descriptor> {
    let mut payload = STREAM_PAYLOAD;
    let mut control = vec![0u8; space_for_descriptors(MAX_RECV_DESCRIPTORS)];

    let received = socket
        .recv_with_control(&mut payload, &mut control)
        .map_err(ExchangeError::ReadFailed)?;

    if socket.is_stream() && received.bytes == 0 && received.control_len == 0 {
        return Err(ExchangeError::ReadFailed(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "peer closed the local socket",
        )));
    }

    adopt_single(&control[..received.control_len], received.control_truncated())
}

/// Take ownership of every descriptor in a received control buffer, then
/// accept it only if it held exactly one block with exactly one descriptor.
fn adopt_single(control: &[u8], truncated: bool) -> Result<Descriptor> {
    let scan = ControlMessage::scan_rights(control);
    let descriptors: Vec<Descriptor> = scan
        .fds
        .iter()
        // SAFETY: SCM_RIGHTS installed each `fd` in this process's table and
        // nothing else holds it yet.
        .map(|&fd| unsafe { Descriptor::from_raw(fd) })
        .collect();

    let problem = if let Some(problem) = scan.problem {
        Some(problem)
    } else if truncated {
        Some("control data truncated by the kernel".to_string())
    } else if scan.blocks != 1 {
        Some(format!("expected 1 control message, found {}", scan.blocks))
    } else {
        None
    };
    if let Some(problem) = problem {
        close_all(descriptors);
        return Err(ExchangeError::MalformedControlMessage(problem));
    }

    let found = descriptors.len();
    let mut descriptors = descriptors.into_iter();
    match (descriptors.next(), descriptors.next()) {
        (Some(descriptor), None) => {
            debug!(fd = descriptor.as_raw(), "received descriptor");
            Ok(descriptor)
        }
        (first, second) => {
            close_all(first.into_iter().chain(second).chain(descriptors));
            Err(ExchangeError::DescriptorCountMismatch { found })
        }
    }
}

/// Receive a connection handed off by the peer of `socket`.
pub fn recv_connection(socket: &LocalSocket) -> Result<AdoptedConnection> {
    let descriptor = recv_descriptor(socket)?;
    let connection = AdoptedConnection::from_descriptor(descriptor)?;
    debug!(
        network = connection.network(),
        peer = %connection.peer_description(),
        "adopted connection"
    );
    Ok(connection)
}

fn close_all(descriptors: impl IntoIterator<Item = Descriptor>) {
    let mut closed = 0usize;
    for descriptor in descriptors {
        let fd = descriptor.as_raw();
        if let Err(err) = descriptor.close() {
            debug!(fd, error = %err, "closing unexpected descriptor failed");
        }
        closed += 1;
    }
    if closed > 0 {
        debug!(closed, "closed descriptors from rejected control message");
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd};
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    use super::*;

    fn assert_peer_closed(stream: &mut UnixStream) {
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(stream.read(&mut buf).unwrap(), 0, "expected EOF");
    }

    #[test]
    fn tcp_connection_survives_handoff() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let (accepted, _) = listener.accept().unwrap();

        let (sender, receiver) = LocalSocket::pair().unwrap();
        send_connection(&sender, accepted).unwrap();
        let mut adopted = recv_connection(&receiver).unwrap();
        assert_eq!(adopted.network(), "tcp");

        adopted.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        client.write_all(b"world").unwrap();
        adopted.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"world");

        // Only the adopted handle is left, so dropping it ends the stream.
        drop(adopted);
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn sender_keeps_no_handle() {
        let (left, mut right) = UnixStream::pair().unwrap();
        let (sender, receiver) = LocalSocket::pair().unwrap();

        send_descriptor(&sender, Descriptor::from(OwnedFd::from(left))).unwrap();
        let received = recv_descriptor(&receiver).unwrap();

        let mut adopted = UnixStream::from(received.into_owned());
        adopted.write_all(b"x").unwrap();
        let mut buf = [0u8; 1];
        right.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"x");

        drop(adopted);
        assert_peer_closed(&mut right);
    }

    #[test]
    fn transfers_over_datagram_socket() {
        let (left, mut right) = UnixStream::pair().unwrap();
        let (sender, receiver) = LocalSocket::datagram_pair().unwrap();

        send_connection(&sender, left).unwrap();
        let mut adopted = recv_connection(&receiver).unwrap();

        right.write_all(b"dgram").unwrap();
        let mut buf = [0u8; 5];
        adopted.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"dgram");
    }

    #[test]
    fn failed_send_returns_descriptor() {
        let (left, mut right) = UnixStream::pair().unwrap();
        let (sender, receiver) = LocalSocket::pair().unwrap();
        drop(receiver);

        let err = send_descriptor(&sender, Descriptor::from(OwnedFd::from(left))).unwrap_err();
        assert!(matches!(err.error, ExchangeError::WriteFailed(_)));

        let mut still_ours = UnixStream::from(err.into_inner().into_owned());
        still_ours.write_all(b"ok").unwrap();
        let mut buf = [0u8; 2];
        right.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ok");
    }

    struct Buffered(Vec<u8>);

    impl Read for Buffered {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Ok(0)
        }
    }

    impl Write for Buffered {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Connection for Buffered {}

    #[test]
    fn connection_without_descriptor_is_unsupported() {
        let (sender, _receiver) = LocalSocket::pair().unwrap();

        let err = send_connection(&sender, Buffered(b"kept".to_vec())).unwrap_err();
        let (error, connection) = err.into_parts();
        assert!(matches!(error, ExchangeError::Unsupported(_)));
        assert_eq!(connection.0, b"kept");
    }

    #[test]
    fn rejects_two_descriptors_and_closes_them() {
        let (first, mut first_peer) = UnixStream::pair().unwrap();
        let (second, mut second_peer) = UnixStream::pair().unwrap();
        let (sender, receiver) = LocalSocket::pair().unwrap();

        let control = ControlMessage::encode(&[ControlMessage::rights(&[
            first.as_raw_fd(),
            second.as_raw_fd(),
        ])]);
        sender.send_with_control(&[0], &control).unwrap();
        drop(first);
        drop(second);

        let err = recv_descriptor(&receiver).unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::DescriptorCountMismatch { found: 2 }
        ));

        assert_peer_closed(&mut first_peer);
        assert_peer_closed(&mut second_peer);
    }

    #[test]
    fn malformed_trailing_block_still_closes_earlier_descriptors() {
        let (local, mut peer) = UnixStream::pair().unwrap();
        let fd = OwnedFd::from(local).into_raw_fd();

        let mut control = ControlMessage::encode(&[ControlMessage::rights(&[fd])]);
        control.extend(ControlMessage::encode(&[ControlMessage {
            level: libc::SOL_SOCKET,
            kind: libc::SCM_RIGHTS,
            data: vec![0xff; 3],
        }]));

        let err = adopt_single(&control, false).unwrap_err();
        assert!(matches!(err, ExchangeError::MalformedControlMessage(_)));
        assert_peer_closed(&mut peer);
    }

    #[test]
    fn truncated_control_closes_delivered_descriptor() {
        let (local, mut peer) = UnixStream::pair().unwrap();
        let fd = OwnedFd::from(local).into_raw_fd();
        let control = ControlMessage::encode(&[ControlMessage::rights(&[fd])]);

        let err = adopt_single(&control, true).unwrap_err();
        assert!(matches!(err, ExchangeError::MalformedControlMessage(ref m) if m.contains("truncated")));
        assert_peer_closed(&mut peer);
    }

    #[test]
    fn rejects_message_without_descriptor() {
        let (sender, receiver) = LocalSocket::pair().unwrap();
        sender.send_with_control(&[0], &[]).unwrap();

        let err = recv_descriptor(&receiver).unwrap_err();
        assert!(matches!(err, ExchangeError::MalformedControlMessage(_)));
    }

    #[test]
    fn closed_peer_is_read_failure() {
        let (sender, receiver) = LocalSocket::pair().unwrap();
        drop(sender);

        let err = recv_descriptor(&receiver).unwrap_err();
        assert!(
            matches!(err, ExchangeError::ReadFailed(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
        );
    }

    #[test]
    fn recv_connection_rejects_plain_file() {
        let (sender, receiver) = LocalSocket::pair().unwrap();
        let file = std::fs::File::open("/dev/null").unwrap();
        send_descriptor(&sender, Descriptor::from(OwnedFd::from(file))).unwrap();

        let err = recv_connection(&receiver).unwrap_err();
        assert!(matches!(err, ExchangeError::Unsupported(_)));
    }

    #[test]
    fn sequential_transfers_on_one_socket() {
        let (sender, receiver) = LocalSocket::pair().unwrap();
        let mut peers = Vec::new();

        for _ in 0..3 {
            let (local, peer) = UnixStream::pair().unwrap();
            send_connection(&sender, local).unwrap();
            peers.push(peer);
        }

        for (i, peer) in peers.iter_mut().enumerate() {
            let mut adopted = recv_connection(&receiver).unwrap();
            let msg = format!("conn-{i}");
            adopted.write_all(msg.as_bytes()).unwrap();
            let mut buf = vec![0u8; msg.len()];
            peer.read_exact(&mut buf).unwrap();
            assert_eq!(buf, msg.as_bytes());
        }
    }
}
