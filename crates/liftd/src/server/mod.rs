//! The server driver: seeds the listener, runs the loop, reports a
//! terminal status.
//!
//! The driver owns the policy around the event loop: it keeps the
//! connection pool at constant capacity by recycling every vacated
//! slot into a fresh listening instance, decides which vacate causes
//! are worth an operator's attention, and maps loop outcomes to a
//! single [`ServerStatus`] reported once on exit. Individual client
//! failures never surface here as anything but a log line and a
//! recycled slot.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::events::listener::{EventListener, ListenerEvent, VacateCause};
use crate::events::{EventHandler, ShutdownSignal};
use crate::server::connection::ConnectionHandler;
use crate::server::dispatch::Dispatcher;

pub mod connection;
pub mod dispatch;
mod socket;

/// Consecutive listener wait failures tolerated before the loop is
/// declared dead.
const MAX_CONSECUTIVE_WAIT_ERRORS: u32 = 8;

/// Terminal condition of one server run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerStatus {
    /// The loop has not run yet.
    #[default]
    Unset,
    /// Clean shutdown.
    Ok,
    /// The listening socket could not be created.
    BindFailed,
    /// An event wait ran out of time (only with a configured poll
    /// timeout).
    TimedOut,
    /// The multi-wait machinery itself failed repeatedly.
    WaitFailed,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Unset => "status not set",
            Self::Ok => "ok",
            Self::BindFailed => "socket creation failed",
            Self::TimedOut => "timed out",
            Self::WaitFailed => "event wait failed",
        };
        write!(f, "{text}")
    }
}

/// Everything the driver needs to serve.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Path of the listening socket.
    pub socket_path: PathBuf,
    /// Connection pool size (listening slots kept at all times).
    pub max_connections: usize,
    /// Optional bound on each event wait; `None` waits forever.
    pub poll_timeout: Option<Duration>,
}

/// Runs the server until shutdown or a fatal condition.
///
/// Returns exactly one status; everything connection-local has already
/// been logged and absorbed by the time this returns.
pub async fn run(
    settings: ServerSettings,
    dispatcher: Dispatcher,
    shutdown: ShutdownSignal,
) -> ServerStatus {
    let listener = match socket::bind_socket(&settings.socket_path) {
        Ok(listener) => Arc::new(listener),
        Err(e) => {
            error!(
                socket = %settings.socket_path.display(),
                error = %e,
                "Failed to create listening socket"
            );
            return ServerStatus::BindFailed;
        }
    };
    let dispatcher = Arc::new(dispatcher);

    let mut events = EventListener::new(shutdown.handler(), settings.max_connections);
    let mut next_client_id = 0u32;
    for _ in 0..settings.max_connections {
        next_client_id += 1;
        let handler = ConnectionHandler::listen(
            next_client_id,
            Arc::clone(&listener),
            Arc::clone(&dispatcher),
        );
        if events.push(EventHandler::Connection(handler)).is_err() {
            // Cannot happen: the pool was sized for exactly this many.
            warn!("Connection pool overflow while seeding");
        }
    }
    info!(
        socket = %settings.socket_path.display(),
        pool = settings.max_connections,
        "liftd/{} serving",
        env!("CARGO_PKG_VERSION")
    );

    let mut consecutive_wait_errors = 0u32;
    let status = loop {
        match events.next(settings.poll_timeout).await {
            ListenerEvent::Shutdown => {
                info!("Shutdown requested; draining connections");
                break ServerStatus::Ok;
            }
            ListenerEvent::TimedOut => {
                warn!("Event wait timed out");
                break ServerStatus::TimedOut;
            }
            ListenerEvent::Progress { .. } => {
                consecutive_wait_errors = 0;
            }
            ListenerEvent::Vacated { handler, cause } => {
                let client_id = handler.client_id();
                match &cause {
                    VacateCause::Finished => {
                        debug!(?client_id, "Connection slot vacated");
                        consecutive_wait_errors = 0;
                    }
                    VacateCause::Failed => {
                        debug!(?client_id, "Connection slot vacated after failure");
                        consecutive_wait_errors = 0;
                    }
                    VacateCause::Aborted(e) => {
                        // The peer vanished while the slot was waiting;
                        // the handler still owns its in-flight state,
                        // dropping it releases everything.
                        warn!(?client_id, error = %e, "Peer aborted mid-wait; recycling slot");
                        consecutive_wait_errors = 0;
                    }
                    VacateCause::WaitError(e) => {
                        warn!(?client_id, error = %e, "Slot wait failed");
                        consecutive_wait_errors += 1;
                        if consecutive_wait_errors >= MAX_CONSECUTIVE_WAIT_ERRORS {
                            error!("Event waits are failing persistently; giving up");
                            break ServerStatus::WaitFailed;
                        }
                    }
                }
                drop(handler);

                // Keep the listening pool at constant capacity.
                next_client_id += 1;
                let replacement = ConnectionHandler::listen(
                    next_client_id,
                    Arc::clone(&listener),
                    Arc::clone(&dispatcher),
                );
                if events.push(EventHandler::Connection(replacement)).is_err() {
                    warn!("Connection pool overflow while recycling a slot");
                }
            }
        }
    };

    socket::remove_socket(&settings.socket_path);
    status
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;
    use crate::auth::{AuthError, CredentialValidator, SessionToken};

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

    #[test]
    fn status_lines_match_the_operator_contract() {
        assert_eq!(ServerStatus::default(), ServerStatus::Unset);
        assert_eq!(ServerStatus::Unset.to_string(), "status not set");
        assert_eq!(ServerStatus::Ok.to_string(), "ok");
        assert_eq!(ServerStatus::BindFailed.to_string(), "socket creation failed");
        assert_eq!(ServerStatus::TimedOut.to_string(), "timed out");
        assert_eq!(ServerStatus::WaitFailed.to_string(), "event wait failed");
    }

    #[tokio::test]
    async fn unbindable_socket_reports_bind_failed() {
        let settings = ServerSettings {
            socket_path: PathBuf::from("/proc/definitely/not/writable/lift.sock"),
            max_connections: 2,
            poll_timeout: None,
        };
        let status = run(
            settings,
            Dispatcher::new(Box::new(DenyAll)),
            ShutdownSignal::new(),
        )
        .await;
        assert_eq!(status, ServerStatus::BindFailed);
    }

    #[tokio::test]
    async fn poll_timeout_maps_to_timed_out() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ServerSettings {
            socket_path: dir.path().join("lift.sock"),
            max_connections: 1,
            poll_timeout: Some(Duration::from_millis(30)),
        };
        let status = run(
            settings,
            Dispatcher::new(Box::new(DenyAll)),
            ShutdownSignal::new(),
        )
        .await;
        assert_eq!(status, ServerStatus::TimedOut);
    }

    #[tokio::test]
    async fn shutdown_before_any_client_reports_ok() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("lift.sock");
        let settings = ServerSettings {
            socket_path: socket_path.clone(),
            max_connections: 2,
            poll_timeout: None,
        };
        let shutdown = ShutdownSignal::new();
        shutdown.signal();

        let status = run(
            settings,
            Dispatcher::new(Box::new(DenyAll)),
            shutdown,
        )
        .await;
        assert_eq!(status, ServerStatus::Ok);
        assert!(!socket_path.exists(), "socket file must be removed on exit");
    }
}
