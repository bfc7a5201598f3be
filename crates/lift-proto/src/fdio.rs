//! Socket send/receive primitives that carry file descriptors.
//!
//! `SCM_RIGHTS` ancillary data is delivered with the first byte(s)
//! received for the send call that attached it; subsequent partial
//! writes of the same frame must not repeat it. Callers therefore
//! attach a descriptor to the first chunk of a frame only, and collect
//! any descriptors that arrive while reading.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};

/// Most descriptors accepted in one frame's ancillary data.
///
/// The protocol only ever attaches one; extra room means a peer sending
/// several does not truncate the control message into an error we could
/// not attribute.
pub const MAX_FDS_PER_MESSAGE: usize = 4;

fn errno_to_io(errno: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

/// Receives bytes into `buf`, collecting any `SCM_RIGHTS` descriptors
/// into `fds`.
///
/// Returns the number of bytes read; 0 means the peer closed the
/// connection. Received descriptors are close-on-exec.
///
/// # Errors
///
/// Propagates transport errors, including `WouldBlock` on a
/// non-blocking socket with no data available.
pub fn recv_with_fds(
    socket: RawFd,
    buf: &mut [u8],
    fds: &mut Vec<OwnedFd>,
) -> io::Result<usize> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_FDS_PER_MESSAGE]);
    let msg = recvmsg::<()>(
        socket,
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )
    .map_err(errno_to_io)?;

    let bytes = msg.bytes;
    for cmsg in msg.cmsgs().map_err(errno_to_io)? {
        if let ControlMessageOwned::ScmRights(raw_fds) = cmsg {
            for raw in raw_fds {
                // SAFETY: the kernel just installed `raw` into this
                // process for us; nothing else owns it yet.
                fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
            }
        }
    }
    Ok(bytes)
}

/// Sends bytes from `buf`, attaching `pass_fd` as `SCM_RIGHTS`
/// ancillary data when present.
///
/// Returns the number of bytes written. The descriptor is delivered
/// with whatever prefix of `buf` the kernel accepts, so callers must
/// clear it after the first successful send.
///
/// # Errors
///
/// Propagates transport errors, including `WouldBlock` on a
/// non-blocking socket whose buffer is full.
pub fn send_with_fd(
    socket: RawFd,
    buf: &[u8],
    pass_fd: Option<BorrowedFd<'_>>,
) -> io::Result<usize> {
    let iov = [IoSlice::new(buf)];
    let raw_fds;
    let scm;
    let cmsgs: &[ControlMessage<'_>] = if let Some(fd) = pass_fd {
        raw_fds = [fd.as_raw_fd()];
        scm = [ControlMessage::ScmRights(&raw_fds)];
        &scm
    } else {
        &[]
    };
    sendmsg::<()>(socket, &iov, cmsgs, MsgFlags::empty(), None).map_err(errno_to_io)
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn bytes_round_trip_without_fd() {
        let (a, b) = UnixStream::pair().unwrap();
        let sent = send_with_fd(a.as_raw_fd(), b"hello", None).unwrap();
        assert_eq!(sent, 5);

        let mut buf = [0u8; 16];
        let mut fds = Vec::new();
        let n = recv_with_fds(b.as_raw_fd(), &mut buf, &mut fds).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert!(fds.is_empty());
    }

    #[test]
    fn descriptor_travels_with_first_bytes() {
        let (a, b) = UnixStream::pair().unwrap();

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"token contents").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        send_with_fd(a.as_raw_fd(), b"x", Some(file.as_fd())).unwrap();

        let mut buf = [0u8; 4];
        let mut fds = Vec::new();
        let n = recv_with_fds(b.as_raw_fd(), &mut buf, &mut fds).unwrap();
        assert_eq!(n, 1);
        assert_eq!(fds.len(), 1);

        let mut received = std::fs::File::from(fds.pop().unwrap());
        let mut contents = String::new();
        received.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "token contents");
    }

    #[test]
    fn zero_read_signals_peer_close() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(a);
        let mut buf = [0u8; 4];
        let mut fds = Vec::new();
        let n = recv_with_fds(b.as_raw_fd(), &mut buf, &mut fds).unwrap();
        assert_eq!(n, 0);
    }
}
