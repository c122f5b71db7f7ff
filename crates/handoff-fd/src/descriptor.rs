use std::fmt;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

/// An owned OS descriptor that is closed exactly once.
///
/// `Descriptor` is the unit of transfer: sending one consumes it, receiving
/// one yields a fresh owner. It closes on drop; [`Descriptor::close`] closes
/// it eagerly and reports the result.
pub struct Descriptor {
    fd: OwnedFd,
}

impl Descriptor {
    /// Take ownership of a raw descriptor.
    ///
    /// # Safety
    ///
    /// `fd` must be open and not owned by anything else; it will be closed
    /// when the returned value is dropped.
    pub unsafe fn from_raw(fd: RawFd) -> Self {
        Self {
            // SAFETY: forwarded from the caller's contract.
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        }
    }

    /// Duplicate any descriptor-backed object into a new, independent owner.
    pub fn duplicate(source: BorrowedFd<'_>) -> std::io::Result<Self> {
        Ok(Self {
            fd: source.try_clone_to_owned()?,
        })
    }

    /// The raw descriptor number.
    pub fn as_raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Convert into a std owned descriptor.
    pub fn into_owned(self) -> OwnedFd {
        self.fd
    }

    /// Close the descriptor now, reporting any error from `close(2)`.
    pub fn close(self) -> std::io::Result<()> {
        let fd = self.fd.into_raw_fd();
        // SAFETY: `into_raw_fd` released ownership, so this is the only close.
        if unsafe { libc::close(fd) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
}

impl From<OwnedFd> for Descriptor {
    fn from(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl From<Descriptor> for OwnedFd {
    fn from(descriptor: Descriptor) -> Self {
        descriptor.fd
    }
}

impl AsFd for Descriptor {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for Descriptor {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl IntoRawFd for Descriptor {
    fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Descriptor").field(&self.as_raw()).finish()
    }
}
