//! Request dispatch: tag interpretation, credential checks, blessing.
//!
//! Dispatch runs synchronously inside a connection's step once a full
//! frame is buffered. It maps every outcome to a response tag and a
//! keep-alive decision; nothing here can take the server down.
//!
//! # Keep-alive policy
//!
//! Fail-closed: only a successful credential check keeps the
//! connection open for further requests. Every other outcome (denied
//! or malformed requests, backend failures, and bless requests whether
//! they succeed or not) answers and then drops the connection.

use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use lift_proto::{
    parse_bless, parse_credential, split_tag, AccessRights, RequestTag, ResponseTag,
};
use secrecy::SecretString;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthError, CredentialValidator};
use crate::credentials::PeerCredentials;

/// Connection-side context a dispatch runs against.
pub struct DispatchContext<'a> {
    /// Slot-assigned client id, for logging.
    pub client_id: u32,
    /// Kernel-reported peer identity, for audit logging.
    pub peer: Option<PeerCredentials>,
    /// The connection's authenticated user, set by a successful
    /// credential check and consulted by bless.
    pub session: &'a mut Option<String>,
}

/// A response ready to be written back.
pub struct Response {
    /// Response tag.
    pub tag: ResponseTag,
    /// Detail text or grant record.
    pub payload: Vec<u8>,
    /// Descriptor to attach to the first written chunk.
    pub fd: Option<OwnedFd>,
}

impl Response {
    fn detail(tag: ResponseTag, detail: &str) -> Self {
        Self {
            tag,
            payload: detail.as_bytes().to_vec(),
            fd: None,
        }
    }
}

/// What dispatch decided: the response plus whether to keep serving
/// this connection.
pub struct DispatchOutcome {
    /// The response to write.
    pub response: Response,
    /// `true` to await another request after responding; `false` to
    /// reset the connection.
    pub keep_alive: bool,
}

impl DispatchOutcome {
    fn drop_with(tag: ResponseTag, detail: &str) -> Self {
        Self {
            response: Response::detail(tag, detail),
            keep_alive: false,
        }
    }
}

/// Interprets completed frames and produces responses.
pub struct Dispatcher {
    validator: Box<dyn CredentialValidator + Send + Sync>,
}

impl Dispatcher {
    /// Builds a dispatcher around the given credential backend.
    #[must_use]
    pub fn new(validator: Box<dyn CredentialValidator + Send + Sync>) -> Self {
        Self { validator }
    }

    /// Dispatches one frame body. `fds` holds descriptors that arrived
    /// with the frame; unused ones are closed here.
    #[must_use]
    pub fn dispatch(
        &self,
        mut ctx: DispatchContext<'_>,
        body: &[u8],
        fds: Vec<OwnedFd>,
    ) -> DispatchOutcome {
        let (tag_bytes, payload) = match split_tag(body) {
            Ok(parts) => parts,
            Err(_) => {
                warn!(
                    client_id = ctx.client_id,
                    len = body.len(),
                    "Message shorter than a tag"
                );
                return DispatchOutcome::drop_with(
                    ResponseTag::InvalidMessage,
                    "message shorter than a tag",
                );
            }
        };

        match RequestTag::from_bytes(tag_bytes) {
            Some(RequestTag::Credential) => self.credential(&mut ctx, payload),
            Some(RequestTag::Bless) => self.bless(&ctx, payload, fds),
            None => {
                warn!(
                    client_id = ctx.client_id,
                    tag = %String::from_utf8_lossy(&tag_bytes).escape_default(),
                    "Unrecognized message tag"
                );
                DispatchOutcome::drop_with(ResponseTag::InvalidMessage, "unrecognized message tag")
            }
        }
    }

    fn credential(&self, ctx: &mut DispatchContext<'_>, payload: &[u8]) -> DispatchOutcome {
        let (username, password) = match parse_credential(payload) {
            Ok(fields) => fields,
            Err(e) => {
                warn!(
                    client_id = ctx.client_id,
                    error = %e,
                    "Malformed credential payload"
                );
                return DispatchOutcome::drop_with(
                    ResponseTag::InvalidMessage,
                    "malformed credential payload",
                );
            }
        };
        let password = SecretString::new(password.to_owned());

        match self.validator.validate(username, &password) {
            Ok(token) => {
                info!(
                    client_id = ctx.client_id,
                    user = username,
                    peer_uid = ctx.peer.map(|p| p.uid),
                    "Credential check succeeded"
                );
                *ctx.session = Some(username.to_owned());
                let (grant, fd) = token.into_parts();
                DispatchOutcome {
                    response: Response {
                        tag: ResponseTag::Success,
                        payload: grant,
                        fd: Some(fd.into_fd()),
                    },
                    keep_alive: true,
                }
            }
            Err(AuthError::InvalidCredentials) => {
                warn!(
                    client_id = ctx.client_id,
                    user = username,
                    peer_uid = ctx.peer.map(|p| p.uid),
                    "Credential check failed"
                );
                DispatchOutcome::drop_with(ResponseTag::AccessDenied, "invalid credentials")
            }
            Err(AuthError::Backend(reason)) => {
                error!(
                    client_id = ctx.client_id,
                    user = username,
                    reason,
                    "Credential backend failure"
                );
                DispatchOutcome::drop_with(ResponseTag::InternalError, "credential check failed")
            }
        }
    }

    fn bless(
        &self,
        ctx: &DispatchContext<'_>,
        payload: &[u8],
        mut fds: Vec<OwnedFd>,
    ) -> DispatchOutcome {
        let Some(user) = ctx.session.as_deref() else {
            warn!(
                client_id = ctx.client_id,
                "Bless request without an authenticated session"
            );
            return DispatchOutcome::drop_with(ResponseTag::AccessDenied, "authentication required");
        };

        let rights = match parse_bless(payload) {
            Ok(rights) => rights,
            Err(e) => {
                warn!(client_id = ctx.client_id, error = %e, "Malformed bless payload");
                return DispatchOutcome::drop_with(
                    ResponseTag::InvalidMessage,
                    "malformed bless payload",
                );
            }
        };

        if fds.is_empty() {
            warn!(
                client_id = ctx.client_id,
                "Bless request carried no descriptor"
            );
            return DispatchOutcome::drop_with(
                ResponseTag::InvalidMessage,
                "bless request carried no descriptor",
            );
        }
        let candidate = fds.remove(0);
        if !fds.is_empty() {
            debug!(
                client_id = ctx.client_id,
                extra = fds.len(),
                "Dropping extra descriptors attached to bless request"
            );
        }

        match reopen_with_rights(candidate.as_fd(), rights) {
            Ok(blessed) => {
                info!(
                    client_id = ctx.client_id,
                    user,
                    rights = %rights,
                    "Blessed descriptor"
                );
                DispatchOutcome {
                    response: Response {
                        tag: ResponseTag::Success,
                        payload: Vec::new(),
                        fd: Some(blessed),
                    },
                    keep_alive: false,
                }
            }
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                warn!(
                    client_id = ctx.client_id,
                    user,
                    rights = %rights,
                    "Bless denied by the filesystem"
                );
                DispatchOutcome::drop_with(ResponseTag::AccessDenied, "insufficient rights")
            }
            Err(e) => {
                error!(
                    client_id = ctx.client_id,
                    user,
                    error = %e,
                    "Descriptor duplication failed"
                );
                DispatchOutcome::drop_with(
                    ResponseTag::InternalError,
                    "descriptor duplication failed",
                )
            }
        }
    }
}

/// Re-opens a received descriptor with the requested access.
///
/// Going through `/proc/self/fd` applies this process's privileges to
/// the open, which is the point: the broker grants access the caller
/// does not already hold.
fn reopen_with_rights(fd: BorrowedFd<'_>, rights: AccessRights) -> io::Result<OwnedFd> {
    let path = format!("/proc/self/fd/{}", fd.as_raw_fd());
    let file = OpenOptions::new()
        .read(rights.read())
        .write(rights.write())
        .open(path)?;
    Ok(OwnedFd::from(file))
}
