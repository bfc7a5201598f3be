//! The multiplex-and-dispatch loop.
//!
//! An [`EventListener`] owns a bounded sequence of handler slots. Slot
//! 0 is permanently reserved for the shutdown trigger and is never
//! removed; the remaining slots hold connection handlers. One call to
//! [`EventListener::next`] performs one loop iteration: wait on every
//! slot's trigger at once, step the handler whose trigger fired, and
//! report what happened. Removal hands the handler back to the caller
//! by value, so the server driver can log, salvage, and recycle the
//! slot.
//!
//! # Invariants
//!
//! - Slot 0 always holds the shutdown handler; no removal path touches
//!   it.
//! - The slot count never exceeds the configured capacity (connection
//!   pool plus the shutdown slot).
//! - A failure in any slot other than 0 never aborts the loop; it is
//!   reported as a [`ListenerEvent::Vacated`] for that slot alone.

use std::io;
use std::time::Duration;

use futures::future;
use tracing::trace;

use super::{EventHandler, EventStatus, ShutdownHandler};

/// Index of the reserved shutdown slot.
pub const SHUTDOWN_SLOT: usize = 0;

/// Why a handler left the listener.
#[derive(Debug)]
pub enum VacateCause {
    /// The handler completed its work.
    Finished,
    /// The handler's step reported an invalid state.
    Failed,
    /// The peer vanished while the slot was waiting: the Unix analogue
    /// of an abandoned synchronization object. Recoverable; the
    /// returned handler still owns whatever state was in flight.
    Aborted(io::Error),
    /// The trigger wait itself failed for another reason.
    WaitError(io::Error),
}

impl std::fmt::Display for VacateCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Finished => write!(f, "finished"),
            Self::Failed => write!(f, "failed"),
            Self::Aborted(e) => write!(f, "peer aborted: {e}"),
            Self::WaitError(e) => write!(f, "wait error: {e}"),
        }
    }
}

/// Outcome of one loop iteration.
#[derive(Debug)]
pub enum ListenerEvent {
    /// The shutdown trigger fired; the caller should stop looping.
    Shutdown,
    /// The handler at `index` made progress and stays registered.
    Progress {
        /// Slot index that was stepped.
        index: usize,
    },
    /// A handler left its slot; ownership returns to the caller.
    Vacated {
        /// The removed handler.
        handler: EventHandler,
        /// Why it was removed.
        cause: VacateCause,
    },
    /// The wait ran out of time. Not an error; the caller chooses
    /// whether to keep looping.
    TimedOut,
}

/// Bounded registry of handler slots plus the loop iteration itself.
pub struct EventListener {
    slots: Vec<EventHandler>,
    capacity: usize,
}

impl EventListener {
    /// Creates a listener with the shutdown handler pinned at slot 0
    /// and room for `pool_size` connection slots.
    #[must_use]
    pub fn new(shutdown: ShutdownHandler, pool_size: usize) -> Self {
        let capacity = pool_size + 1;
        let mut slots = Vec::with_capacity(capacity);
        slots.push(EventHandler::Shutdown(shutdown));
        Self { slots, capacity }
    }

    /// Registers a handler in the next free slot.
    ///
    /// # Errors
    ///
    /// Hands the handler back when every slot is occupied.
    pub fn push(&mut self, handler: EventHandler) -> Result<usize, EventHandler> {
        if self.slots.len() == self.capacity {
            return Err(handler);
        }
        self.slots.push(handler);
        Ok(self.slots.len() - 1)
    }

    /// Number of occupied slots, shutdown slot included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Always false: slot 0 exists for the listener's whole life.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Total slot capacity, shutdown slot included.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn remove(&mut self, index: usize) -> EventHandler {
        debug_assert_ne!(index, SHUTDOWN_SLOT, "the shutdown slot is never removed");
        self.slots.remove(index)
    }

    /// Runs one loop iteration.
    ///
    /// Waits on all registered triggers (bounded by `timeout` when
    /// given), steps the handler whose trigger fired, and reports the
    /// outcome. Exactly one handler is stepped per call.
    pub async fn next(&mut self, timeout: Option<Duration>) -> ListenerEvent {
        let (index, fired) = {
            let waits: Vec<_> = self
                .slots
                .iter()
                .enumerate()
                .map(|(index, handler)| {
                    Box::pin(async move { (index, handler.trigger().await) })
                })
                .collect();
            let wait_all = future::select_all(waits);

            let ((index, fired), _, remaining) = match timeout {
                Some(limit) => match tokio::time::timeout(limit, wait_all).await {
                    Ok(done) => done,
                    Err(_) => return ListenerEvent::TimedOut,
                },
                None => wait_all.await,
            };
            drop(remaining);
            (index, fired)
        };

        let event = match fired {
            Ok(event) => event,
            Err(error) => {
                // The shutdown trigger's wait is infallible, so a wait
                // error always identifies a connection slot.
                let cause = match error.kind() {
                    io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset => {
                        VacateCause::Aborted(error)
                    }
                    _ => VacateCause::WaitError(error),
                };
                let handler = self.remove(index);
                return ListenerEvent::Vacated { handler, cause };
            }
        };

        if index == SHUTDOWN_SLOT {
            let status = self.slots[SHUTDOWN_SLOT].step(event);
            debug_assert_eq!(status, EventStatus::Finished);
            return ListenerEvent::Shutdown;
        }

        trace!(index, "stepping handler");
        match self.slots[index].step(event) {
            EventStatus::InProgress => ListenerEvent::Progress { index },
            EventStatus::Finished => ListenerEvent::Vacated {
                handler: self.remove(index),
                cause: VacateCause::Finished,
            },
            EventStatus::Failed => ListenerEvent::Vacated {
                handler: self.remove(index),
                cause: VacateCause::Failed,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use secrecy::SecretString;
    use tokio::net::{UnixListener, UnixStream};

    use super::*;
    use crate::auth::{AuthError, CredentialValidator, SessionToken};
    use crate::events::ShutdownSignal;
    use crate::server::connection::ConnectionHandler;
    use crate::server::dispatch::Dispatcher;

    struct DenyAll;

    impl CredentialValidator for DenyAll {
        fn validate(
            &self,
            _username: &str,
            _password: &SecretString,
        ) -> Result<SessionToken, AuthError> {
            Err(AuthError::InvalidCredentials)
        }
    }

    struct Fixture {
        listener: Arc<UnixListener>,
        dispatcher: Arc<Dispatcher>,
        path: std::path::PathBuf,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lift.sock");
        let listener = Arc::new(UnixListener::bind(&path).unwrap());
        let dispatcher = Arc::new(Dispatcher::new(Box::new(DenyAll)));
        Fixture {
            listener,
            dispatcher,
            path,
            _dir: dir,
        }
    }

    fn connection(fx: &Fixture, client_id: u32) -> EventHandler {
        EventHandler::Connection(ConnectionHandler::listen(
            client_id,
            Arc::clone(&fx.listener),
            Arc::clone(&fx.dispatcher),
        ))
    }

    #[tokio::test]
    async fn capacity_is_pool_plus_shutdown_slot() {
        let fx = fixture();
        let signal = ShutdownSignal::new();
        let mut listener = EventListener::new(signal.handler(), 2);
        assert_eq!(listener.len(), 1);
        assert_eq!(listener.capacity(), 3);

        let index = listener.push(connection(&fx, 1)).map_err(|_| "full").unwrap();
        assert_eq!(index, 1);
        listener.push(connection(&fx, 2)).map_err(|_| "full").unwrap();
        assert_eq!(listener.len(), 3);

        // The pool is full; the handler comes back.
        assert!(listener.push(connection(&fx, 3)).is_err());
        assert_eq!(listener.len(), 3);
    }

    #[tokio::test]
    async fn shutdown_fires_and_slot_zero_survives() {
        let fx = fixture();
        let signal = ShutdownSignal::new();
        let mut listener = EventListener::new(signal.handler(), 2);
        listener.push(connection(&fx, 1)).map_err(|_| "full").unwrap();

        signal.signal();
        assert!(matches!(listener.next(None).await, ListenerEvent::Shutdown));
        // Slot 0 stays; the connection slot was untouched.
        assert_eq!(listener.len(), 2);
    }

    #[tokio::test]
    async fn timeout_is_reported_distinctly() {
        let signal = ShutdownSignal::new();
        let mut listener = EventListener::new(signal.handler(), 1);
        let event = listener.next(Some(Duration::from_millis(20))).await;
        assert!(matches!(event, ListenerEvent::TimedOut));
    }

    #[tokio::test]
    async fn slot_count_returns_to_baseline_over_connection_churn() {
        let fx = fixture();
        let signal = ShutdownSignal::new();
        let mut listener = EventListener::new(signal.handler(), 3);
        for id in 1..=3 {
            listener.push(connection(&fx, id)).map_err(|_| "full").unwrap();
        }
        let baseline = listener.len();

        for round in 0..4u32 {
            // A client connects and immediately disconnects.
            let client = UnixStream::connect(&fx.path).await.unwrap();
            drop(client);

            // Accept step keeps the handler registered.
            assert!(
                matches!(listener.next(None).await, ListenerEvent::Progress { .. }),
                "round {round}: expected accept progress"
            );
            // Clean disconnect vacates the slot.
            let event = listener.next(None).await;
            let ListenerEvent::Vacated { handler, cause } = event else {
                panic!("round {round}: expected vacate, got {event:?}");
            };
            assert!(matches!(cause, VacateCause::Finished));
            assert!(handler.client_id().is_some());
            assert_eq!(listener.len(), baseline - 1);

            // The driver recycles the slot.
            listener
                .push(connection(&fx, 100 + round))
                .map_err(|_| "full")
                .unwrap();
            assert_eq!(listener.len(), baseline);
        }
    }
}
