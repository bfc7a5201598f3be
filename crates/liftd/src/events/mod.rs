//! Event multiplexing: handlers, triggers, and the listener loop.
//!
//! The daemon is single-threaded and cooperative. Every unit of work is
//! an [`EventHandler`] with two capabilities:
//!
//! - a **trigger**: an awaitable that resolves when the handler can
//!   make progress (a client arrived, the socket became readable or
//!   writable, shutdown was requested), carrying whatever the wait
//!   produced; and
//! - a **step**: a synchronous, non-blocking function that advances the
//!   handler exactly one transition and reports an [`EventStatus`].
//!
//! The [`listener::EventListener`] multi-waits on every registered
//! trigger, steps the one handler whose trigger fired, and acts on its
//! status. Because steps never block, one stalled client cannot starve
//! the rest.
//!
//! Handler kinds form a closed set: the trivial shutdown handler, which
//! fires once and reports `Finished`, and the connection protocol
//! handler, which embeds a [`chunked::ChunkedIo`] transfer engine.

use std::fmt;
use std::io;
use std::sync::Arc;

use tokio::net::UnixStream;
use tokio::sync::Notify;

use crate::server::connection::ConnectionHandler;

pub mod chunked;
pub mod listener;

/// What a handler's step reports back to the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    /// More work remains; keep the handler registered.
    InProgress,
    /// The handler is done and should be removed.
    Finished,
    /// The handler's state is no longer valid; remove it.
    Failed,
}

/// What a fired trigger produced, handed to the step function.
#[derive(Debug)]
pub enum SlotEvent {
    /// The shutdown trigger was signaled.
    ShutdownRequested,
    /// A client joined this connection slot.
    Accepted(UnixStream),
    /// The connection's socket has bytes to read.
    Readable,
    /// The connection's socket can accept bytes.
    Writable,
}

/// Cloneable handle used to request shutdown from outside the loop.
///
/// Signaling is wait-free and latches: a signal delivered before the
/// loop reaches its next wait is not lost.
#[derive(Clone)]
pub struct ShutdownSignal {
    notify: Arc<Notify>,
}

impl ShutdownSignal {
    /// Creates an unsignaled shutdown trigger.
    #[must_use]
    pub fn new() -> Self {
        Self {
            notify: Arc::new(Notify::new()),
        }
    }

    /// Requests shutdown. Safe to call from any thread, including a
    /// signal handling task.
    pub fn signal(&self) {
        self.notify.notify_one();
    }

    /// The handler end of the trigger, registered at listener slot 0.
    #[must_use]
    pub fn handler(&self) -> ShutdownHandler {
        ShutdownHandler {
            notify: Arc::clone(&self.notify),
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// The trivial handler: fires once when shutdown is requested.
pub struct ShutdownHandler {
    notify: Arc<Notify>,
}

impl ShutdownHandler {
    async fn triggered(&self) {
        self.notify.notified().await;
    }

    #[allow(clippy::unused_self)]
    fn step(&mut self) -> EventStatus {
        EventStatus::Finished
    }
}

/// The closed set of handler kinds the listener multiplexes.
pub enum EventHandler {
    /// Reserved slot 0: the process shutdown trigger.
    Shutdown(ShutdownHandler),
    /// One client connection's protocol state machine.
    Connection(ConnectionHandler),
}

impl EventHandler {
    /// Awaits this handler's trigger.
    ///
    /// # Errors
    ///
    /// Trigger waits fail only for connection handlers (accept or
    /// readiness errors); the failure is connection-local.
    pub(crate) async fn trigger(&self) -> io::Result<SlotEvent> {
        match self {
            Self::Shutdown(handler) => {
                handler.triggered().await;
                Ok(SlotEvent::ShutdownRequested)
            }
            Self::Connection(handler) => handler.trigger().await,
        }
    }

    /// Advances the handler one transition.
    pub(crate) fn step(&mut self, event: SlotEvent) -> EventStatus {
        match self {
            Self::Shutdown(handler) => handler.step(),
            Self::Connection(handler) => handler.step(event),
        }
    }

    /// The connection's client id, when this is a connection handler.
    #[must_use]
    pub fn client_id(&self) -> Option<u32> {
        match self {
            Self::Shutdown(_) => None,
            Self::Connection(handler) => Some(handler.client_id()),
        }
    }
}

impl fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown(_) => f.write_str("Shutdown"),
            Self::Connection(handler) => f
                .debug_struct("Connection")
                .field("client_id", &handler.client_id())
                .finish(),
        }
    }
}
