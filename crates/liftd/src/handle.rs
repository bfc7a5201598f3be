//! Exclusive ownership wrappers for OS resources.
//!
//! Every handle the daemon touches is owned by exactly one value whose
//! drop runs the resource-specific release action, so teardown is
//! leak-free and double-close-free on every exit path, early returns
//! included.

use std::fmt;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use nix::sys::socket::{shutdown, Shutdown};
use tokio::net::UnixStream;

/// An accepted client connection endpoint.
///
/// Release action: orderly write-side shutdown, then close. Move-only;
/// the stream is never touched after teardown begins.
pub struct Endpoint {
    stream: UnixStream,
}

impl Endpoint {
    /// Takes ownership of an accepted stream.
    #[must_use]
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// The underlying stream, for readiness waits and non-blocking I/O.
    #[must_use]
    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }

    /// Releases the endpoint: flushes the peer a clean end-of-stream
    /// before the descriptor closes.
    pub fn disconnect(self) {
        // Drop runs the release action.
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        // Tell the peer we are done writing before the close; a failure
        // here means the connection is already gone.
        let _ = shutdown(self.stream.as_raw_fd(), Shutdown::Write);
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("fd", &self.stream.as_raw_fd())
            .finish()
    }
}

/// An owned descriptor carrying elevated access.
///
/// Plain close-on-drop ownership; transfer out of the wrapper is
/// explicit via [`TokenFd::into_fd`].
pub struct TokenFd(OwnedFd);

impl TokenFd {
    /// Borrows the descriptor (for `SCM_RIGHTS` attachment).
    #[must_use]
    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }

    /// Transfers ownership of the raw descriptor out.
    #[must_use]
    pub fn into_fd(self) -> OwnedFd {
        self.0
    }
}

impl From<OwnedFd> for TokenFd {
    fn from(fd: OwnedFd) -> Self {
        Self(fd)
    }
}

impl fmt::Debug for TokenFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TokenFd").field(&self.0.as_raw_fd()).finish()
    }
}
