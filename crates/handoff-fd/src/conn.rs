use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;

use crate::descriptor::Descriptor;
use crate::error::{ExchangeError, Result};

/// A full-duplex byte stream that may be backed by an OS descriptor.
///
/// Only connections that return `Some` from [`Connection::descriptor`] can be
/// handed to another process. Dropping a connection closes it.
pub trait Connection: Read + Write {
    /// Borrow the descriptor backing this connection, if there is one.
    fn descriptor(&self) -> Option<BorrowedFd<'_>> {
        None
    }
}

impl Connection for TcpStream {
    fn descriptor(&self) -> Option<BorrowedFd<'_>> {
        Some(self.as_fd())
    }
}

impl Connection for UnixStream {
    fn descriptor(&self) -> Option<BorrowedFd<'_>> {
        Some(self.as_fd())
    }
}

impl<C: Connection + ?Sized> Connection for Box<C> {
    fn descriptor(&self) -> Option<BorrowedFd<'_>> {
        (**self).descriptor()
    }
}

/// A connection rebuilt from a descriptor received from another process.
#[derive(Debug)]
pub enum AdoptedConnection {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AdoptedConnection {
    /// Take ownership of `descriptor` as a stream connection.
    ///
    /// The kind of stream is chosen from the socket's address family. Anything
    /// that is not a TCP or Unix stream socket is rejected and closed.
    pub fn from_descriptor(descriptor: Descriptor) -> Result<Self> {
        let fd = descriptor.as_raw();

        if socket_type(fd)? != libc::SOCK_STREAM {
            return Err(ExchangeError::Unsupported(
                "received descriptor is not a stream socket",
            ));
        }

        match socket_family(fd)? {
            libc::AF_INET | libc::AF_INET6 => {
                Ok(Self::Tcp(TcpStream::from(descriptor.into_owned())))
            }
            libc::AF_UNIX => Ok(Self::Unix(UnixStream::from(descriptor.into_owned()))),
            _ => Err(ExchangeError::Unsupported(
                "received socket has an unsupported address family",
            )),
        }
    }

    /// Network name in dialer terms: `"tcp"` or `"unix"`.
    pub fn network(&self) -> &'static str {
        match self {
            Self::Tcp(_) => "tcp",
            Self::Unix(_) => "unix",
        }
    }

    /// Human-readable address of the remote end, for logs.
    pub fn peer_description(&self) -> String {
        match self {
            Self::Tcp(stream) => stream
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            Self::Unix(stream) => stream
                .peer_addr()
                .ok()
                .and_then(|addr| addr.as_pathname().map(|p| p.display().to_string()))
                .unwrap_or_else(|| "unnamed".to_string()),
        }
    }

    /// Switch the adopted socket to non-blocking mode.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        match self {
            Self::Tcp(stream) => stream.set_nonblocking(nonblocking),
            Self::Unix(stream) => stream.set_nonblocking(nonblocking),
        }
        .map_err(Into::into)
    }
}

impl Read for AdoptedConnection {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.read(buf),
            Self::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for AdoptedConnection {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.write(buf),
            Self::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.flush(),
            Self::Unix(stream) => stream.flush(),
        }
    }
}

impl AsFd for AdoptedConnection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Self::Tcp(stream) => stream.as_fd(),
            Self::Unix(stream) => stream.as_fd(),
        }
    }
}

impl AsRawFd for AdoptedConnection {
    fn as_raw_fd(&self) -> RawFd {
        self.as_fd().as_raw_fd()
    }
}

impl Connection for AdoptedConnection {
    fn descriptor(&self) -> Option<BorrowedFd<'_>> {
        Some(self.as_fd())
    }
}

fn socket_type(fd: RawFd) -> Result<libc::c_int> {
    let mut kind: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;

    // SAFETY: `kind` and `len` are valid writable pointers for the given size.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_TYPE,
            (&mut kind as *mut libc::c_int).cast::<libc::c_void>(),
            &mut len,
        )
    };
    if rc < 0 {
        return Err(not_a_socket(std::io::Error::last_os_error()));
    }
    Ok(kind)
}

fn socket_family(fd: RawFd) -> Result<libc::c_int> {
    // SAFETY: sockaddr_storage is plain old data; all-zero is a valid value.
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    // SAFETY: `storage` is large enough for any socket address and `len`
    // holds its size.
    let rc = unsafe {
        libc::getsockname(
            fd,
            (&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr>(),
            &mut len,
        )
    };
    if rc < 0 {
        return Err(not_a_socket(std::io::Error::last_os_error()));
    }
    Ok(libc::c_int::from(storage.ss_family))
}

fn not_a_socket(err: std::io::Error) -> ExchangeError {
    if err.raw_os_error() == Some(libc::ENOTSOCK) {
        ExchangeError::Unsupported("received descriptor is not a socket")
    } else {
        ExchangeError::Io(err)
    }
}
