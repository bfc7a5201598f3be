//! Synchronous client for the broker socket.
//!
//! Blocking, request/response: used by the CLI and by integration
//! tests. The daemon side never uses this module.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use crate::{
    body_len, encode_bless, encode_credential, encode_frame, fdio, split_tag, AccessRights,
    ProtocolError, ProtocolResult, RequestTag, ResponseTag, LEN_PREFIX_SIZE, MAX_FRAME_SIZE,
};

/// A decoded broker response.
#[derive(Debug)]
pub struct Reply {
    /// Response tag.
    pub tag: ResponseTag,
    /// Response payload (detail text or grant record).
    pub payload: Vec<u8>,
    /// Descriptor attached to the response, when the broker sent one.
    pub fd: Option<OwnedFd>,
}

impl Reply {
    /// Payload rendered as text for display.
    #[must_use]
    pub fn detail(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Blocking connection to the broker.
pub struct Client {
    stream: UnixStream,
}

impl Client {
    /// Connects to the broker socket at `path`.
    ///
    /// # Errors
    ///
    /// Propagates the connect failure.
    pub fn connect(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self {
            stream: UnixStream::connect(path)?,
        })
    }

    /// Submits credentials; a success reply carries the session grant
    /// record and its token descriptor.
    ///
    /// # Errors
    ///
    /// Returns a protocol error on malformed fields or transport
    /// failure.
    pub fn authenticate(&mut self, username: &str, password: &str) -> ProtocolResult<Reply> {
        let payload = encode_credential(username, password)?;
        let frame = encode_frame(RequestTag::Credential.as_bytes(), &payload)?;
        self.send(&frame, None)?;
        self.recv_reply()
    }

    /// Asks the broker to bless `fd` with `rights`; a success reply
    /// carries the elevated descriptor.
    ///
    /// # Errors
    ///
    /// Returns a protocol error on transport failure or an unparsable
    /// reply.
    pub fn bless(&mut self, fd: BorrowedFd<'_>, rights: AccessRights) -> ProtocolResult<Reply> {
        let frame = encode_frame(RequestTag::Bless.as_bytes(), &encode_bless(rights))?;
        self.send(&frame, Some(fd))?;
        self.recv_reply()
    }

    /// Sends an arbitrary frame body (length prefix added here) and
    /// waits for the reply. Exists so tests can speak malformed
    /// protocol on purpose.
    ///
    /// # Errors
    ///
    /// Returns a protocol error on transport failure or an unparsable
    /// reply.
    pub fn send_body(&mut self, body: &[u8]) -> ProtocolResult<Reply> {
        let mut frame = Vec::with_capacity(LEN_PREFIX_SIZE + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(body);
        self.send(&frame, None)?;
        self.recv_reply()
    }

    fn send(&mut self, frame: &[u8], mut pass_fd: Option<BorrowedFd<'_>>) -> ProtocolResult<()> {
        let mut sent = 0;
        while sent < frame.len() {
            let n = fdio::send_with_fd(self.stream.as_raw_fd(), &frame[sent..], pass_fd)?;
            if n == 0 {
                return Err(ProtocolError::Io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "socket accepted zero bytes",
                )));
            }
            // The descriptor rides with the first accepted bytes only.
            pass_fd = None;
            sent += n;
        }
        Ok(())
    }

    /// Receives and decodes one reply frame.
    ///
    /// # Errors
    ///
    /// Returns a protocol error on transport failure, an oversized
    /// frame, or an unknown response tag.
    pub fn recv_reply(&mut self) -> ProtocolResult<Reply> {
        let mut fds = Vec::new();

        let mut prefix = [0u8; LEN_PREFIX_SIZE];
        self.recv_exact(&mut prefix, &mut fds)?;
        let body_size = body_len(prefix);
        if LEN_PREFIX_SIZE + body_size > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: LEN_PREFIX_SIZE + body_size,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut body = vec![0u8; body_size];
        self.recv_exact(&mut body, &mut fds)?;

        let (tag_bytes, payload) = split_tag(&body)?;
        let tag = ResponseTag::from_bytes(tag_bytes)
            .ok_or(ProtocolError::UnknownResponseTag { tag: tag_bytes })?;
        Ok(Reply {
            tag,
            payload: payload.to_vec(),
            fd: fds.into_iter().next(),
        })
    }

    fn recv_exact(&mut self, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> ProtocolResult<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = fdio::recv_with_fds(self.stream.as_raw_fd(), &mut buf[filled..], fds)?;
            if n == 0 {
                return Err(ProtocolError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-frame",
                )));
            }
            filled += n;
        }
        Ok(())
    }
}
