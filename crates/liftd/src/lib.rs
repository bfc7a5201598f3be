//! liftd: a local privilege-elevation broker.
//!
//! Unprivileged clients connect over a Unix domain socket and either
//! authenticate (`CRED`) or ask the broker to *bless* a file
//! descriptor (`BLES`): duplicate it back across the process boundary
//! with elevated access rights applied by the broker's privilege.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     server driver                         │
//! │   bind socket · seed pool · recycle slots · status code   │
//! ├──────────────────────────────────────────────────────────┤
//! │                    EventListener                          │
//! │     slot 0: shutdown trigger │ slots 1..: connections     │
//! │        one multi-wait, one handler step per turn          │
//! ├──────────────────────────────────────────────────────────┤
//! │   ConnectionHandler ── ChunkedIo ── dispatch (CRED/BLES)  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything runs single-threaded and cooperatively: triggers are
//! awaited in one multi-wait, steps never block, and a misbehaving
//! client costs exactly one recycled connection slot.

pub mod auth;
pub mod config;
pub mod credentials;
pub mod events;
pub mod handle;
pub mod server;

pub use events::ShutdownSignal;
pub use server::{ServerSettings, ServerStatus};
