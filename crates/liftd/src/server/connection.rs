//! Per-connection protocol state machine.
//!
//! One handler per connection slot, driven one transition at a time by
//! the event listener:
//!
//! ```text
//! Connecting ──accept──▶ Reading ──full frame──▶ (dispatch)
//!                          ▲                          │
//!                          │ keep-alive               ▼
//!                          └───────────── Writing ──▶ Finished
//! ```
//!
//! The trigger is a function of the current state: waiting for a
//! client while `Connecting`, read readiness while `Reading`, write
//! readiness while `Writing`. The step consumes whatever the trigger
//! produced and never blocks, so the listener can interleave any
//! number of connections.
//!
//! Failures here are connection-local by construction: a step reports
//! [`EventStatus::Failed`], the listener vacates the slot, and the
//! server driver recycles it into a fresh listening instance.

use std::io;
use std::sync::Arc;

use tokio::io::Interest;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, trace, warn};

use crate::credentials::PeerCredentials;
use crate::events::chunked::{ChunkedIo, ReadProgress, WriteProgress};
use crate::events::{EventStatus, SlotEvent};
use crate::handle::Endpoint;
use crate::server::dispatch::{DispatchContext, Dispatcher, Response};

#[derive(Debug, Clone, Copy)]
enum ConnState {
    /// No client yet; waiting to accept on the shared listener.
    Connecting,
    /// A request frame is being read.
    Reading,
    /// A response frame is being written.
    Writing { keep_alive: bool },
    /// Torn down; the listener removes the slot before its next wait.
    Done,
}

/// State machine for one connection slot.
pub struct ConnectionHandler {
    client_id: u32,
    listener: Arc<UnixListener>,
    dispatcher: Arc<Dispatcher>,
    state: ConnState,
    io: ChunkedIo,
    endpoint: Option<Endpoint>,
    peer: Option<PeerCredentials>,
    /// Username from a successful credential check on this connection.
    session: Option<String>,
}

impl ConnectionHandler {
    /// Creates a slot waiting for the next client on `listener`.
    #[must_use]
    pub fn listen(client_id: u32, listener: Arc<UnixListener>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            client_id,
            listener,
            dispatcher,
            state: ConnState::Connecting,
            io: ChunkedIo::new(),
            endpoint: None,
            peer: None,
            session: None,
        }
    }

    /// Slot-assigned client id.
    #[must_use]
    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    fn stream(&self) -> io::Result<&UnixStream> {
        self.endpoint
            .as_ref()
            .map(Endpoint::stream)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection has no endpoint"))
    }

    /// Awaits whatever this connection's current state is blocked on.
    pub(crate) async fn trigger(&self) -> io::Result<SlotEvent> {
        match self.state {
            ConnState::Connecting => {
                let (stream, _addr) = self.listener.accept().await?;
                Ok(SlotEvent::Accepted(stream))
            }
            ConnState::Reading => {
                self.stream()?.ready(Interest::READABLE).await?;
                Ok(SlotEvent::Readable)
            }
            ConnState::Writing { .. } => {
                self.stream()?.ready(Interest::WRITABLE).await?;
                Ok(SlotEvent::Writable)
            }
            ConnState::Done => {
                // A finished connection is removed before the next
                // wait; this arm never resolves.
                std::future::pending::<io::Result<SlotEvent>>().await
            }
        }
    }

    /// Advances the state machine one transition.
    pub(crate) fn step(&mut self, event: SlotEvent) -> EventStatus {
        match (self.state, event) {
            (ConnState::Connecting, SlotEvent::Accepted(stream)) => self.on_accepted(stream),
            (ConnState::Reading, SlotEvent::Readable) => self.on_readable(),
            (ConnState::Writing { keep_alive }, SlotEvent::Writable) => self.on_writable(keep_alive),
            (state, event) => {
                warn!(
                    client_id = self.client_id,
                    ?state,
                    ?event,
                    "Connection stepped with a mismatched event"
                );
                EventStatus::Failed
            }
        }
    }

    fn on_accepted(&mut self, stream: UnixStream) -> EventStatus {
        let peer = match PeerCredentials::from_stream(&stream) {
            Ok(peer) => peer,
            Err(e) => {
                warn!(
                    client_id = self.client_id,
                    error = %e,
                    "Failed to read peer credentials"
                );
                return EventStatus::Failed;
            }
        };
        debug!(
            client_id = self.client_id,
            uid = peer.uid,
            gid = peer.gid,
            pid = peer.pid,
            "Client connected"
        );

        self.peer = Some(peer);
        self.endpoint = Some(Endpoint::new(stream));
        self.io.begin_read();
        self.state = ConnState::Reading;
        EventStatus::InProgress
    }

    fn on_readable(&mut self) -> EventStatus {
        let Some(endpoint) = &self.endpoint else {
            return EventStatus::Failed;
        };
        match self.io.advance_read(endpoint.stream()) {
            Ok(ReadProgress::Pending) => EventStatus::InProgress,
            Ok(ReadProgress::PeerClosed) => {
                debug!(client_id = self.client_id, "Client disconnected");
                self.state = ConnState::Done;
                EventStatus::Finished
            }
            Ok(ReadProgress::Complete) => self.dispatch_frame(),
            Err(e) => {
                warn!(
                    client_id = self.client_id,
                    error = %e,
                    "Read failed; resetting connection"
                );
                EventStatus::Failed
            }
        }
    }

    fn dispatch_frame(&mut self) -> EventStatus {
        let fds = self.io.take_received_fds();
        let outcome = self.dispatcher.dispatch(
            DispatchContext {
                client_id: self.client_id,
                peer: self.peer,
                session: &mut self.session,
            },
            self.io.frame_body(),
            fds,
        );

        let Response { tag, payload, fd } = outcome.response;
        let frame = match lift_proto::encode_frame(tag.as_bytes(), &payload) {
            Ok(frame) => frame,
            Err(e) => {
                error!(
                    client_id = self.client_id,
                    error = %e,
                    "Failed to encode response frame"
                );
                return EventStatus::Failed;
            }
        };
        trace!(
            client_id = self.client_id,
            response = %tag,
            keep_alive = outcome.keep_alive,
            "Responding"
        );

        // Scrub the request (it may have carried credentials) before
        // the buffer is reused for the response.
        self.io.reset();
        self.io.begin_write(frame, fd);
        self.state = ConnState::Writing {
            keep_alive: outcome.keep_alive,
        };
        EventStatus::InProgress
    }

    fn on_writable(&mut self, keep_alive: bool) -> EventStatus {
        let Some(endpoint) = &self.endpoint else {
            return EventStatus::Failed;
        };
        match self.io.advance_write(endpoint.stream()) {
            Ok(WriteProgress::Pending) => EventStatus::InProgress,
            Ok(WriteProgress::Complete) => {
                if keep_alive {
                    self.io.reset();
                    self.io.begin_read();
                    self.state = ConnState::Reading;
                    trace!(client_id = self.client_id, "Awaiting next request");
                    EventStatus::InProgress
                } else {
                    if let Some(endpoint) = self.endpoint.take() {
                        endpoint.disconnect();
                    }
                    debug!(client_id = self.client_id, "Connection reset after response");
                    self.state = ConnState::Done;
                    EventStatus::Finished
                }
            }
            Err(e) => {
                warn!(
                    client_id = self.client_id,
                    error = %e,
                    "Write failed; resetting connection"
                );
                EventStatus::Failed
            }
        }
    }
}
