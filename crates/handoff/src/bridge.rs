use handoff_fd::AdoptedConnection;
use handoff_tunnel::BoxConnection;

/// Register an adopted connection with the current tokio runtime.
///
/// Must be called from within a runtime. The socket is switched to
/// non-blocking mode first.
pub fn into_async(conn: AdoptedConnection) -> std::io::Result<BoxConnection> {
    match conn {
        AdoptedConnection::Tcp(stream) => {
            stream.set_nonblocking(true)?;
            Ok(Box::new(tokio::net::TcpStream::from_std(stream)?))
        }
        AdoptedConnection::Unix(stream) => {
            stream.set_nonblocking(true)?;
            Ok(Box::new(tokio::net::UnixStream::from_std(stream)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::net::UnixStream;

    use handoff_fd::{recv_connection, send_connection, LocalSocket};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn handed_off_tcp_connection_works_async() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server_side, _) = listener.accept().unwrap();

        let (sender, receiver) = LocalSocket::pair().unwrap();
        send_connection(&sender, server_side).unwrap();
        let adopted = recv_connection(&receiver).unwrap();
        assert_eq!(adopted.network(), "tcp");

        let mut conn = into_async(adopted).unwrap();
        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        conn.write_all(b"pong").await.unwrap();
        conn.flush().await.unwrap();
        drop(conn);
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, b"pong");
    }

    #[tokio::test]
    async fn unix_connection_is_registered() {
        let (local, mut remote) = UnixStream::pair().unwrap();
        let mut conn = into_async(AdoptedConnection::Unix(local)).unwrap();

        conn.write_all(b"hi").await.unwrap();
        drop(conn);
        let mut buf = Vec::new();
        remote.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hi");
    }
}
