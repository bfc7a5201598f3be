//! Peer credential extraction for accepted connections.
//!
//! Credentials come from `SO_PEERCRED` and are kernel-asserted: they
//! identify the connecting process at `connect(2)` time and cannot be
//! forged by the peer. The daemon records them for audit logging; the
//! elevation decision itself rests on the credential exchange, not on
//! the socket peer.

use std::io;

use nix::sys::socket::{getsockopt, sockopt};
use tokio::net::UnixStream;

/// Kernel-reported identity of a connected peer process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    /// Effective user id of the peer at connect time.
    pub uid: u32,
    /// Effective group id of the peer at connect time.
    pub gid: u32,
    /// Process id of the peer at connect time.
    pub pid: i32,
}

impl PeerCredentials {
    /// Reads `SO_PEERCRED` off an accepted stream.
    ///
    /// # Errors
    ///
    /// Propagates the `getsockopt` failure.
    pub fn from_stream(stream: &UnixStream) -> io::Result<Self> {
        let creds = getsockopt(stream, sockopt::PeerCredentials)
            .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;
        Ok(Self {
            uid: creds.uid(),
            gid: creds.gid(),
            pid: creds.pid(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn socketpair_reports_own_process() {
        let (a, _b) = UnixStream::pair().unwrap();
        let creds = PeerCredentials::from_stream(&a).unwrap();
        assert_eq!(creds.uid, nix::unistd::getuid().as_raw());
        assert_eq!(creds.gid, nix::unistd::getgid().as_raw());
        assert_eq!(creds.pid, std::process::id() as i32);
    }
}
