use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::{UnixDatagram, UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::conn::Connection;
use crate::error::{ExchangeError, Result};

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

/// A connected Unix domain socket that can carry ancillary data.
pub struct LocalSocket {
    inner: LocalSocketInner,
}

enum LocalSocketInner {
    Stream(UnixStream),
    Datagram(UnixDatagram),
}

/// Outcome of a single `recvmsg`.
#[derive(Debug, Clone, Copy)]
pub struct Received {
    /// Payload bytes received.
    pub bytes: usize,
    /// Bytes of the control buffer the kernel filled in.
    pub control_len: usize,
    /// `msg_flags` as reported by the kernel.
    pub flags: libc::c_int,
}

impl Received {
    /// The kernel dropped ancillary data that did not fit the control buffer.
    pub fn control_truncated(&self) -> bool {
        self.flags & libc::MSG_CTRUNC != 0
    }
}

impl LocalSocket {
    /// Connect to a listening stream socket at `path`.
    pub fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).map_err(|e| ExchangeError::Connect {
            path: path.to_path_buf(),
            source: e,
        })?;
        debug!(?path, "connected to local socket");
        Ok(Self::from(stream))
    }

    /// A connected pair of stream sockets.
    pub fn pair() -> Result<(Self, Self)> {
        let (left, right) = UnixStream::pair()?;
        Ok((Self::from(left), Self::from(right)))
    }

    /// A connected pair of datagram sockets.
    pub fn datagram_pair() -> Result<(Self, Self)> {
        let (left, right) = UnixDatagram::pair()?;
        Ok((Self::from(left), Self::from(right)))
    }

    /// Whether this is a stream (as opposed to datagram) socket.
    pub fn is_stream(&self) -> bool {
        matches!(self.inner, LocalSocketInner::Stream(_))
    }

    /// Set read timeout on the underlying socket.
    pub fn set_read_timeout(&self, timeout: Option<std::time::Duration>) -> Result<()> {
        match &self.inner {
            LocalSocketInner::Stream(s) => s.set_read_timeout(timeout),
            LocalSocketInner::Datagram(s) => s.set_read_timeout(timeout),
        }
        .map_err(Into::into)
    }

    /// Set write timeout on the underlying socket.
    pub fn set_write_timeout(&self, timeout: Option<std::time::Duration>) -> Result<()> {
        match &self.inner {
            LocalSocketInner::Stream(s) => s.set_write_timeout(timeout),
            LocalSocketInner::Datagram(s) => s.set_write_timeout(timeout),
        }
        .map_err(Into::into)
    }

    /// Try to clone this socket (creates a new file descriptor).
    pub fn try_clone(&self) -> Result<Self> {
        Ok(match &self.inner {
            LocalSocketInner::Stream(s) => Self::from(s.try_clone()?),
            LocalSocketInner::Datagram(s) => Self::from(s.try_clone()?),
        })
    }

    /// Send `payload` together with a raw control buffer in one `sendmsg`.
    pub fn send_with_control(&self, payload: &[u8], control: &[u8]) -> std::io::Result<usize> {
        let mut iov = libc::iovec {
            iov_base: payload.as_ptr() as *mut libc::c_void,
            iov_len: payload.len(),
        };

        // SAFETY: zeroed msghdr is valid before assigning pointers.
        let mut msghdr: libc::msghdr = unsafe { std::mem::zeroed() };
        msghdr.msg_iov = &mut iov;
        msghdr.msg_iovlen = 1;
        if !control.is_empty() {
            msghdr.msg_control = control.as_ptr() as *mut libc::c_void;
            msghdr.msg_controllen = control.len() as _;
        }

        loop {
            // SAFETY: msghdr points to live iov/control buffers; sendmsg only
            // reads through them.
            let n = unsafe { libc::sendmsg(self.as_raw_fd(), &msghdr, SEND_FLAGS) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// Receive into `payload` and `control` with one `recvmsg`.
    pub fn recv_with_control(
        &self,
        payload: &mut [u8],
        control: &mut [u8],
    ) -> std::io::Result<Received> {
        let mut iov = libc::iovec {
            iov_base: payload.as_mut_ptr().cast(),
            iov_len: payload.len(),
        };

        // SAFETY: zeroed msghdr is valid before assigning pointers.
        let mut msghdr: libc::msghdr = unsafe { std::mem::zeroed() };
        msghdr.msg_iov = &mut iov;
        msghdr.msg_iovlen = 1;
        msghdr.msg_control = control.as_mut_ptr().cast();
        msghdr.msg_controllen = control.len() as _;

        #[cfg(any(target_os = "linux", target_os = "android"))]
        let flags = libc::MSG_CMSG_CLOEXEC;
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let flags = 0;

        loop {
            // SAFETY: msghdr points to live, writable iov/control buffers.
            let n = unsafe { libc::recvmsg(self.as_raw_fd(), &mut msghdr, flags) };
            if n >= 0 {
                return Ok(Received {
                    bytes: n as usize,
                    control_len: (msghdr.msg_controllen as usize).min(control.len()),
                    flags: msghdr.msg_flags,
                });
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl From<UnixStream> for LocalSocket {
    fn from(stream: UnixStream) -> Self {
        Self {
            inner: LocalSocketInner::Stream(stream),
        }
    }
}

impl From<UnixDatagram> for LocalSocket {
    fn from(socket: UnixDatagram) -> Self {
        Self {
            inner: LocalSocketInner::Datagram(socket),
        }
    }
}

impl Read for LocalSocket {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            LocalSocketInner::Stream(s) => s.read(buf),
            LocalSocketInner::Datagram(s) => s.recv(buf),
        }
    }
}

impl Write for LocalSocket {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            LocalSocketInner::Stream(s) => s.write(buf),
            LocalSocketInner::Datagram(s) => s.send(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            LocalSocketInner::Stream(s) => s.flush(),
            LocalSocketInner::Datagram(_) => Ok(()),
        }
    }
}

impl AsFd for LocalSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match &self.inner {
            LocalSocketInner::Stream(s) => s.as_fd(),
            LocalSocketInner::Datagram(s) => s.as_fd(),
        }
    }
}

impl AsRawFd for LocalSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.as_fd().as_raw_fd()
    }
}

impl Connection for LocalSocket {
    fn descriptor(&self) -> Option<BorrowedFd<'_>> {
        Some(self.as_fd())
    }
}

impl std::fmt::Debug for LocalSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_stream() { "stream" } else { "datagram" };
        f.debug_struct("LocalSocket")
            .field("type", &kind)
            .field("fd", &self.as_raw_fd())
            .finish()
    }
}

/// A listening stream socket bound to a filesystem path.
///
/// The socket file is removed on drop, unless something else has replaced it
/// in the meantime.
pub struct LocalListener {
    listener: UnixListener,
    file: SocketFile,
}

/// The filesystem entry of a bound [`LocalListener`].
///
/// Lets a thread other than the listener's owner clean up the path, e.g. when
/// the listener is parked in a blocking accept at shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketFile {
    path: PathBuf,
    identity: (u64, u64),
}

impl SocketFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the socket file if it is still the one that was bound.
    ///
    /// Returns whether a file was removed.
    pub fn remove(&self) -> bool {
        let Ok(metadata) = std::fs::symlink_metadata(&self.path) else {
            return false;
        };
        let same = (metadata.dev(), metadata.ino()) == self.identity;
        if !metadata.file_type().is_socket() || !same {
            debug!(path = ?self.path, "socket path replaced; leaving it in place");
            return false;
        }
        debug!(path = ?self.path, "removing socket file");
        std::fs::remove_file(&self.path).is_ok()
    }
}

impl LocalListener {
    /// Default permission mode for created socket paths.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;

    /// `sizeof(sockaddr_un.sun_path)`.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    const MAX_PATH_LEN: usize = 104;

    /// Bind to `path` with [`Self::DEFAULT_SOCKET_MODE`].
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_mode(path, Self::DEFAULT_SOCKET_MODE)
    }

    /// Bind to `path`, replacing a stale socket file, and chmod it to `mode`.
    pub fn bind_with_mode(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let len = path.as_os_str().len();
        if len >= Self::MAX_PATH_LEN {
            return Err(ExchangeError::PathTooLong {
                path,
                len,
                max: Self::MAX_PATH_LEN,
            });
        }

        let bind_err = |source: std::io::Error| ExchangeError::Bind {
            path: path.clone(),
            source,
        };

        match std::fs::symlink_metadata(&path) {
            Ok(metadata) if metadata.file_type().is_socket() => {
                debug!(?path, "removing stale socket");
                std::fs::remove_file(&path).map_err(bind_err)?;
            }
            Ok(_) => {
                return Err(bind_err(std::io::Error::new(
                    ErrorKind::AlreadyExists,
                    "existing path is not a unix socket",
                )));
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(bind_err(err)),
        }

        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .map_err(bind_err)?;
        let metadata = std::fs::symlink_metadata(&path).map_err(bind_err)?;

        info!(?path, "listening on local socket");

        Ok(Self {
            listener,
            file: SocketFile {
                identity: (metadata.dev(), metadata.ino()),
                path,
            },
        })
    }

    /// Accept one incoming stream connection (blocking).
    pub fn accept(&self) -> Result<LocalSocket> {
        let (stream, _addr) = self.listener.accept().map_err(ExchangeError::Accept)?;
        debug!(path = ?self.file.path, "accepted local connection");
        Ok(LocalSocket::from(stream))
    }

    /// The path this listener is bound to.
    pub fn path(&self) -> &Path {
        &self.file.path
    }

    /// A handle that can remove the socket file independently of this
    /// listener.
    pub fn socket_file(&self) -> SocketFile {
        self.file.clone()
    }
}

impl Drop for LocalListener {
    fn drop(&mut self) {
        self.file.remove();
    }
}
