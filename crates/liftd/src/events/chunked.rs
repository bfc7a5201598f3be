//! Chunked non-blocking transfers over a connection endpoint.
//!
//! [`ChunkedIo`] drives one read or one write across possibly many
//! partial completions. Each call to an `advance_*` method performs as
//! much non-blocking work as the socket allows and reports whether the
//! transfer finished; the caller re-arms on readiness and calls again.
//! Nothing here blocks, so the event loop can interleave transfers
//! across every connection it multiplexes.
//!
//! # Buffer discipline
//!
//! The receive buffer starts at one chunk ([`CHUNK_SIZE`]) and doubles
//! when a frame outgrows it, up to [`BUFFER_DOUBLING_LIMIT`] doublings.
//! The frame length prefix is validated against the resulting bound
//! before any growth, so an oversized frame is refused without
//! allocation. [`ChunkedIo::reset`] restores the original capacity
//! between messages and scrubs the buffer, which has usually carried
//! credential material.
//!
//! # Descriptor passing
//!
//! Descriptors received as ancillary data while reading are collected
//! and handed to dispatch with the completed frame. A descriptor
//! attached to an outgoing response rides on the first written chunk
//! only.

use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};

use lift_proto::{body_len, fdio, LEN_PREFIX_SIZE, MAX_FRAME_SIZE};
use tokio::io::Interest;
use tokio::net::UnixStream;

/// Transfer chunk size: the most moved per partial operation, and the
/// receive buffer's starting capacity.
pub const CHUNK_SIZE: usize = 1024;

/// How many times the receive buffer may double.
pub const BUFFER_DOUBLING_LIMIT: u32 = 4;

// The wire-level frame bound and the buffer growth bound are the same
// limit; a drift between them would reject frames the protocol allows.
const _: () = assert!(CHUNK_SIZE << BUFFER_DOUBLING_LIMIT == MAX_FRAME_SIZE);

/// Outcome of one read advance.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadProgress {
    /// The socket ran dry before the frame completed; wait and retry.
    Pending,
    /// A full frame is buffered.
    Complete,
    /// The peer closed cleanly between frames.
    PeerClosed,
}

/// Outcome of one write advance.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteProgress {
    /// The socket buffer filled before the frame was fully written.
    Pending,
    /// The whole frame has been written.
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IoPhase {
    Inactive,
    Reading,
    Writing,
    Failed,
}

/// Chunked transfer state for one connection.
pub struct ChunkedIo {
    buf: Vec<u8>,
    /// Bytes of `buf` holding received data (read phase).
    filled: usize,
    /// Bytes of `buf` already written out (write phase).
    offset: usize,
    doublings: u32,
    /// Total frame size (prefix included) once the prefix has arrived.
    expected: Option<usize>,
    phase: IoPhase,
    recv_fds: Vec<OwnedFd>,
    send_fd: Option<OwnedFd>,
}

impl ChunkedIo {
    /// A fresh transfer buffer of one chunk.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: vec![0; CHUNK_SIZE],
            filled: 0,
            offset: 0,
            doublings: 0,
            expected: None,
            phase: IoPhase::Inactive,
            recv_fds: Vec::new(),
            send_fd: None,
        }
    }

    /// Arms a frame read from the start of the buffer.
    pub fn begin_read(&mut self) {
        debug_assert_eq!(self.phase, IoPhase::Inactive);
        self.filled = 0;
        self.expected = None;
        self.phase = IoPhase::Reading;
    }

    /// Arms a frame write. `frame` must already carry its length
    /// prefix; `fd` is attached to the first chunk as ancillary data.
    pub fn begin_write(&mut self, frame: Vec<u8>, fd: Option<OwnedFd>) {
        debug_assert_eq!(self.phase, IoPhase::Inactive);
        self.buf = frame;
        self.filled = self.buf.len();
        self.offset = 0;
        self.expected = None;
        self.send_fd = fd;
        self.phase = IoPhase::Writing;
    }

    /// Advances an in-flight read as far as the socket allows.
    ///
    /// # Errors
    ///
    /// Fails on transport errors, a frame whose prefix exceeds
    /// [`MAX_FRAME_SIZE`], buffer exhaustion past the doubling limit,
    /// or a peer that vanished mid-frame. All are connection-local.
    pub fn advance_read(&mut self, stream: &UnixStream) -> io::Result<ReadProgress> {
        debug_assert_eq!(self.phase, IoPhase::Reading);
        loop {
            if self.frame_complete() {
                self.phase = IoPhase::Inactive;
                return Ok(ReadProgress::Complete);
            }
            if self.filled == self.read_limit() {
                self.grow()?;
            }

            let limit = self.read_limit();
            let raw = stream.as_raw_fd();
            let (spare, fds) = (&mut self.buf[self.filled..limit], &mut self.recv_fds);
            match stream.try_io(Interest::READABLE, || fdio::recv_with_fds(raw, spare, fds)) {
                Ok(0) => {
                    if self.filled == 0 {
                        self.phase = IoPhase::Inactive;
                        return Ok(ReadProgress::PeerClosed);
                    }
                    self.phase = IoPhase::Failed;
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed mid-frame",
                    ));
                }
                Ok(n) => {
                    self.filled += n;
                    self.note_frame_size()?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadProgress::Pending);
                }
                Err(e) => {
                    self.phase = IoPhase::Failed;
                    return Err(e);
                }
            }
        }
    }

    /// Advances an in-flight write as far as the socket allows.
    ///
    /// # Errors
    ///
    /// Fails on transport errors; connection-local.
    pub fn advance_write(&mut self, stream: &UnixStream) -> io::Result<WriteProgress> {
        debug_assert_eq!(self.phase, IoPhase::Writing);
        loop {
            if self.offset == self.buf.len() {
                self.phase = IoPhase::Inactive;
                return Ok(WriteProgress::Complete);
            }

            let end = (self.offset + CHUNK_SIZE).min(self.buf.len());
            let raw = stream.as_raw_fd();
            let chunk = &self.buf[self.offset..end];
            let pass = self.send_fd.as_ref().map(AsFd::as_fd);
            match stream.try_io(Interest::WRITABLE, || fdio::send_with_fd(raw, chunk, pass)) {
                Ok(0) => {
                    self.phase = IoPhase::Failed;
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted zero bytes",
                    ));
                }
                Ok(n) => {
                    self.offset += n;
                    // Delivered with the first accepted bytes.
                    self.send_fd = None;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(WriteProgress::Pending);
                }
                Err(e) => {
                    self.phase = IoPhase::Failed;
                    return Err(e);
                }
            }
        }
    }

    /// Empties the buffer back to its original one-chunk capacity,
    /// scrubbing old contents, and drops any unclaimed descriptors.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.buf.resize(CHUNK_SIZE, 0);
        self.filled = 0;
        self.offset = 0;
        self.doublings = 0;
        self.expected = None;
        self.phase = IoPhase::Inactive;
        self.recv_fds.clear();
        self.send_fd = None;
    }

    /// The completed frame's body (tag and payload, prefix stripped).
    #[must_use]
    pub fn frame_body(&self) -> &[u8] {
        let total = self.expected.unwrap_or(self.filled);
        &self.buf[LEN_PREFIX_SIZE.min(total)..total]
    }

    /// Hands over descriptors that arrived with the current frame.
    #[must_use]
    pub fn take_received_fds(&mut self) -> Vec<OwnedFd> {
        std::mem::take(&mut self.recv_fds)
    }

    /// Whether a frame is partially buffered (peer loss is then an
    /// error rather than a clean close).
    #[must_use]
    pub fn mid_frame(&self) -> bool {
        self.filled > 0 && !self.frame_complete()
    }

    /// Current buffer capacity in bytes.
    #[must_use]
    pub fn buffer_capacity(&self) -> usize {
        self.buf.len()
    }

    fn frame_complete(&self) -> bool {
        self.expected.is_some_and(|total| self.filled >= total)
    }

    fn read_limit(&self) -> usize {
        match self.expected {
            Some(total) => total.min(self.buf.len()),
            None => self.buf.len(),
        }
    }

    fn note_frame_size(&mut self) -> io::Result<()> {
        if self.expected.is_none() && self.filled >= LEN_PREFIX_SIZE {
            let mut prefix = [0u8; LEN_PREFIX_SIZE];
            prefix.copy_from_slice(&self.buf[..LEN_PREFIX_SIZE]);
            let total = LEN_PREFIX_SIZE + body_len(prefix);
            if total > MAX_FRAME_SIZE {
                self.phase = IoPhase::Failed;
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("frame of {total} bytes exceeds the {MAX_FRAME_SIZE} byte limit"),
                ));
            }
            self.expected = Some(total);
        }
        Ok(())
    }

    fn grow(&mut self) -> io::Result<()> {
        if self.doublings >= BUFFER_DOUBLING_LIMIT {
            self.phase = IoPhase::Failed;
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "receive buffer reached its doubling limit",
            ));
        }
        self.doublings += 1;
        let doubled = self.buf.len() * 2;
        self.buf.resize(doubled, 0);
        Ok(())
    }
}

impl Default for ChunkedIo {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read as _;

    use lift_proto::encode_frame;
    use tokio::io::AsyncWriteExt;

    use super::*;

    async fn read_to_completion(io: &mut ChunkedIo, stream: &UnixStream) -> io::Result<ReadProgress> {
        loop {
            stream.ready(Interest::READABLE).await?;
            match io.advance_read(stream)? {
                ReadProgress::Pending => continue,
                done => return Ok(done),
            }
        }
    }

    #[tokio::test]
    async fn single_chunk_frame_completes() {
        let (local, mut peer) = UnixStream::pair().unwrap();
        let mut io = ChunkedIo::new();
        io.begin_read();

        let frame = encode_frame(*b"CRED", b"alice\0pw\0").unwrap();
        peer.write_all(&frame).await.unwrap();

        let progress = read_to_completion(&mut io, &local).await.unwrap();
        assert_eq!(progress, ReadProgress::Complete);
        assert_eq!(io.frame_body(), &frame[LEN_PREFIX_SIZE..]);
        assert_eq!(io.buffer_capacity(), CHUNK_SIZE);
    }

    #[tokio::test]
    async fn large_frame_grows_the_buffer() {
        let (local, mut peer) = UnixStream::pair().unwrap();
        let mut io = ChunkedIo::new();
        io.begin_read();

        let payload = vec![0x5au8; 5000];
        let frame = encode_frame(*b"CRED", &payload).unwrap();
        let writer = tokio::spawn(async move {
            peer.write_all(&frame).await.unwrap();
            frame
        });

        let progress = read_to_completion(&mut io, &local).await.unwrap();
        let frame = writer.await.unwrap();
        assert_eq!(progress, ReadProgress::Complete);
        assert_eq!(io.frame_body(), &frame[LEN_PREFIX_SIZE..]);
        assert!(io.buffer_capacity() > CHUNK_SIZE);
        assert!(io.buffer_capacity() <= MAX_FRAME_SIZE);
    }

    #[tokio::test]
    async fn maximum_frame_is_received() {
        let (local, mut peer) = UnixStream::pair().unwrap();
        let mut io = ChunkedIo::new();
        io.begin_read();

        let payload = vec![1u8; MAX_FRAME_SIZE - LEN_PREFIX_SIZE - 4];
        let frame = encode_frame(*b"BLES", &payload).unwrap();
        assert_eq!(frame.len(), MAX_FRAME_SIZE);
        let writer = tokio::spawn(async move { peer.write_all(&frame).await.unwrap() });

        let progress = read_to_completion(&mut io, &local).await.unwrap();
        writer.await.unwrap();
        assert_eq!(progress, ReadProgress::Complete);
        assert_eq!(io.buffer_capacity(), MAX_FRAME_SIZE);
    }

    #[tokio::test]
    async fn oversized_frame_is_refused() {
        let (local, mut peer) = UnixStream::pair().unwrap();
        let mut io = ChunkedIo::new();
        io.begin_read();

        // Prefix claims one byte more than the limit allows.
        let body = (MAX_FRAME_SIZE - LEN_PREFIX_SIZE + 1) as u32;
        peer.write_all(&body.to_be_bytes()).await.unwrap();

        let err = read_to_completion(&mut io, &local).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn clean_close_between_frames() {
        let (local, peer) = UnixStream::pair().unwrap();
        let mut io = ChunkedIo::new();
        io.begin_read();
        drop(peer);

        let progress = read_to_completion(&mut io, &local).await.unwrap();
        assert_eq!(progress, ReadProgress::PeerClosed);
    }

    #[tokio::test]
    async fn close_mid_frame_is_an_error() {
        let (local, mut peer) = UnixStream::pair().unwrap();
        let mut io = ChunkedIo::new();
        io.begin_read();

        // A prefix promising more than we send, then close.
        peer.write_all(&100u32.to_be_bytes()).await.unwrap();
        peer.write_all(b"partial").await.unwrap();
        drop(peer);

        let err = read_to_completion(&mut io, &local).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn reset_restores_original_capacity() {
        let (local, mut peer) = UnixStream::pair().unwrap();
        let mut io = ChunkedIo::new();
        io.begin_read();

        let frame = encode_frame(*b"CRED", &vec![0u8; 3000]).unwrap();
        let writer = tokio::spawn(async move { peer.write_all(&frame).await.unwrap() });
        read_to_completion(&mut io, &local).await.unwrap();
        writer.await.unwrap();
        assert!(io.buffer_capacity() > CHUNK_SIZE);

        io.reset();
        assert_eq!(io.buffer_capacity(), CHUNK_SIZE);
        assert!(!io.mid_frame());
        assert!(io.take_received_fds().is_empty());

        // Resetting again is harmless and changes nothing.
        io.reset();
        assert_eq!(io.buffer_capacity(), CHUNK_SIZE);
    }

    #[tokio::test]
    async fn write_attaches_descriptor_to_first_chunk() {
        let (local, peer) = UnixStream::pair().unwrap();
        let mut io = ChunkedIo::new();

        let mut file = tempfile::tempfile().unwrap();
        use std::io::{Seek, SeekFrom, Write as _};
        file.write_all(b"blessed").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let frame = encode_frame(*b"SUCC", b"").unwrap();
        io.begin_write(frame.clone(), Some(OwnedFd::from(file)));
        loop {
            local.ready(Interest::WRITABLE).await.unwrap();
            if io.advance_write(&local).unwrap() == WriteProgress::Complete {
                break;
            }
        }

        let peer = peer.into_std().unwrap();
        peer.set_nonblocking(false).unwrap();
        let mut buf = vec![0u8; frame.len()];
        let mut fds = Vec::new();
        let mut got = 0;
        while got < buf.len() {
            let n = fdio::recv_with_fds(peer.as_raw_fd(), &mut buf[got..], &mut fds).unwrap();
            assert!(n > 0);
            got += n;
        }
        assert_eq!(buf, frame);
        assert_eq!(fds.len(), 1);

        let mut contents = String::new();
        std::fs::File::from(fds.pop().unwrap())
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "blessed");
    }
}
