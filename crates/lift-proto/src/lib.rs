//! Wire protocol for the lift elevation broker.
//!
//! The protocol stack is organized in layers:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Request / Response tags          │  CRED, BLES / SUCC, ...
//! ├─────────────────────────────────────────┤
//! │               Framing                    │  Length-prefixed
//! ├─────────────────────────────────────────┤
//! │            UDS transport                 │  Unix socket (+ SCM_RIGHTS)
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Wire Format
//!
//! Every message is a length-prefixed frame:
//!
//! ```text
//! +----------------------------+-----------------+------------------+
//! | Body length (4 bytes, BE)  | Tag (4 ASCII)   | Payload          |
//! +----------------------------+-----------------+------------------+
//! ```
//!
//! - Maximum frame size (prefix included): 16 KiB
//! - Request tags: `CRED` (credential submission), `BLES` (bless request)
//! - Response tags: `SUCC`, `INVM`, `INTE`, `DENY`
//!
//! File descriptors ride as `SCM_RIGHTS` ancillary data attached to the
//! first byte of the frame that carries them: a `BLES` request attaches
//! the descriptor to be blessed, and a successful response attaches the
//! elevated descriptor travelling the other way.
//!
//! # Payload encodings
//!
//! - `CRED`: two NUL-terminated fields, username then password.
//! - `BLES`: 4-byte little-endian access-rights bits ([`AccessRights`]).
//! - Responses: optional human-readable detail (UTF-8), plus the grant
//!   record on a credential success.
//!
//! # Security Considerations
//!
//! - Frame size is validated before allocation on both sides.
//! - Unknown rights bits are rejected rather than ignored.

use std::fmt;
use std::io;

use thiserror::Error;

pub mod client;
pub mod fdio;

/// Size of the big-endian body-length prefix.
pub const LEN_PREFIX_SIZE: usize = 4;

/// Size of the ASCII message tag that starts every frame body.
pub const TAG_SIZE: usize = 4;

/// Maximum total frame size in bytes, length prefix included.
///
/// Chosen as one transfer chunk (1024 bytes) times the receive buffer's
/// doubling limit (2^4); anything larger is rejected before allocation.
pub const MAX_FRAME_SIZE: usize = 16 * 1024;

/// Request message tags recognized by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTag {
    /// Credential submission: authenticate this connection.
    Credential,
    /// Bless request: elevate a caller-supplied descriptor.
    Bless,
}

impl RequestTag {
    /// Wire representation of the tag.
    #[must_use]
    pub const fn as_bytes(self) -> [u8; TAG_SIZE] {
        match self {
            Self::Credential => *b"CRED",
            Self::Bless => *b"BLES",
        }
    }

    /// Parses a tag from its wire representation.
    #[must_use]
    pub fn from_bytes(bytes: [u8; TAG_SIZE]) -> Option<Self> {
        match &bytes {
            b"CRED" => Some(Self::Credential),
            b"BLES" => Some(Self::Bless),
            _ => None,
        }
    }
}

impl fmt::Display for RequestTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Credential => write!(f, "CRED"),
            Self::Bless => write!(f, "BLES"),
        }
    }
}

/// Response message tags sent by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseTag {
    /// Request succeeded.
    Success,
    /// Request was malformed or its tag unrecognized.
    InvalidMessage,
    /// The broker hit an unexpected internal failure.
    InternalError,
    /// Authentication or authorization failed.
    AccessDenied,
}

impl ResponseTag {
    /// Wire representation of the tag.
    #[must_use]
    pub const fn as_bytes(self) -> [u8; TAG_SIZE] {
        match self {
            Self::Success => *b"SUCC",
            Self::InvalidMessage => *b"INVM",
            Self::InternalError => *b"INTE",
            Self::AccessDenied => *b"DENY",
        }
    }

    /// Parses a tag from its wire representation.
    #[must_use]
    pub fn from_bytes(bytes: [u8; TAG_SIZE]) -> Option<Self> {
        match &bytes {
            b"SUCC" => Some(Self::Success),
            b"INVM" => Some(Self::InvalidMessage),
            b"INTE" => Some(Self::InternalError),
            b"DENY" => Some(Self::AccessDenied),
            _ => None,
        }
    }
}

impl fmt::Display for ResponseTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::InvalidMessage => "invalid message",
            Self::InternalError => "internal error",
            Self::AccessDenied => "access denied",
        };
        write!(f, "{name}")
    }
}

/// Access rights requested for a blessed descriptor.
///
/// Encoded on the wire as 4 little-endian bytes. Unknown bits are a
/// protocol error, not a silent no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessRights(u32);

impl AccessRights {
    /// Read access.
    pub const READ: Self = Self(0b01);
    /// Write access.
    pub const WRITE: Self = Self(0b10);
    /// Read and write access.
    pub const READ_WRITE: Self = Self(0b11);

    const ALL_BITS: u32 = 0b11;

    /// Builds rights from raw bits, rejecting unknown bits and the
    /// empty set.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Option<Self> {
        if bits == 0 || bits & !Self::ALL_BITS != 0 {
            None
        } else {
            Some(Self(bits))
        }
    }

    /// Raw bit representation.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether read access is requested.
    #[must_use]
    pub const fn read(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    /// Whether write access is requested.
    #[must_use]
    pub const fn write(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }
}

impl fmt::Display for AccessRights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.read(), self.write()) {
            (true, true) => write!(f, "read-write"),
            (true, false) => write!(f, "read"),
            (false, true) => write!(f, "write"),
            (false, false) => write!(f, "none"),
        }
    }
}

/// Protocol errors shared by client and server.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds [`MAX_FRAME_SIZE`]. Detected before allocation.
    #[error("frame too large: {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge {
        /// Total frame size derived from the length prefix.
        size: usize,
        /// Maximum allowed frame size.
        max: usize,
    },

    /// Frame body ended before the expected field.
    #[error("truncated frame: {reason}")]
    Truncated {
        /// What was being read when the body ran out.
        reason: &'static str,
    },

    /// The response tag is not one of the recognized four.
    #[error("unrecognized response tag {tag:?}")]
    UnknownResponseTag {
        /// Raw tag bytes as received.
        tag: [u8; TAG_SIZE],
    },

    /// A payload field failed validation.
    #[error("invalid payload: {reason}")]
    InvalidPayload {
        /// Description of the offending field.
        reason: String,
    },

    /// Underlying transport error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Encodes a complete frame: length prefix, tag, payload.
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`] when the resulting frame
/// would exceed [`MAX_FRAME_SIZE`].
pub fn encode_frame(tag: [u8; TAG_SIZE], payload: &[u8]) -> ProtocolResult<Vec<u8>> {
    let body_len = TAG_SIZE + payload.len();
    let total = LEN_PREFIX_SIZE + body_len;
    if total > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: total,
            max: MAX_FRAME_SIZE,
        });
    }
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&(body_len as u32).to_be_bytes());
    frame.extend_from_slice(&tag);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Reads the body length out of a frame prefix.
#[must_use]
pub fn body_len(prefix: [u8; LEN_PREFIX_SIZE]) -> usize {
    u32::from_be_bytes(prefix) as usize
}

/// Splits a frame body into tag bytes and payload.
///
/// # Errors
///
/// Returns [`ProtocolError::Truncated`] when the body is shorter than a
/// tag.
pub fn split_tag(body: &[u8]) -> ProtocolResult<([u8; TAG_SIZE], &[u8])> {
    if body.len() < TAG_SIZE {
        return Err(ProtocolError::Truncated {
            reason: "body shorter than a message tag",
        });
    }
    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&body[..TAG_SIZE]);
    Ok((tag, &body[TAG_SIZE..]))
}

/// Encodes a `CRED` payload: username and password, each NUL-terminated.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidPayload`] when either field contains
/// an embedded NUL, or the username is empty.
pub fn encode_credential(username: &str, password: &str) -> ProtocolResult<Vec<u8>> {
    if username.is_empty() {
        return Err(ProtocolError::InvalidPayload {
            reason: "empty username".to_string(),
        });
    }
    if username.contains('\0') || password.contains('\0') {
        return Err(ProtocolError::InvalidPayload {
            reason: "credential fields must not contain NUL".to_string(),
        });
    }
    let mut payload = Vec::with_capacity(username.len() + password.len() + 2);
    payload.extend_from_slice(username.as_bytes());
    payload.push(0);
    payload.extend_from_slice(password.as_bytes());
    payload.push(0);
    Ok(payload)
}

/// Parses a `CRED` payload into username and password.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidPayload`] when the payload does not
/// hold exactly two NUL-terminated UTF-8 fields.
pub fn parse_credential(payload: &[u8]) -> ProtocolResult<(&str, &str)> {
    let (username, rest) = take_nul_field(payload, "username")?;
    let (password, rest) = take_nul_field(rest, "password")?;
    if !rest.is_empty() {
        return Err(ProtocolError::InvalidPayload {
            reason: "trailing bytes after password field".to_string(),
        });
    }
    if username.is_empty() {
        return Err(ProtocolError::InvalidPayload {
            reason: "empty username".to_string(),
        });
    }
    Ok((username, password))
}

fn take_nul_field<'a>(bytes: &'a [u8], field: &str) -> ProtocolResult<(&'a str, &'a [u8])> {
    let nul = bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| ProtocolError::InvalidPayload {
            reason: format!("{field} field is not NUL-terminated"),
        })?;
    let text = std::str::from_utf8(&bytes[..nul]).map_err(|_| ProtocolError::InvalidPayload {
        reason: format!("{field} field is not valid UTF-8"),
    })?;
    Ok((text, &bytes[nul + 1..]))
}

/// Encodes a `BLES` payload.
#[must_use]
pub fn encode_bless(rights: AccessRights) -> Vec<u8> {
    rights.bits().to_le_bytes().to_vec()
}

/// Parses a `BLES` payload into the requested rights.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidPayload`] on a wrong-sized payload or
/// unknown rights bits.
pub fn parse_bless(payload: &[u8]) -> ProtocolResult<AccessRights> {
    let bytes: [u8; 4] = payload
        .try_into()
        .map_err(|_| ProtocolError::InvalidPayload {
            reason: format!("bless payload must be 4 bytes, got {}", payload.len()),
        })?;
    let bits = u32::from_le_bytes(bytes);
    AccessRights::from_bits(bits).ok_or_else(|| ProtocolError::InvalidPayload {
        reason: format!("unknown access rights bits {bits:#x}"),
    })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn request_tags_round_trip() {
        for tag in [RequestTag::Credential, RequestTag::Bless] {
            assert_eq!(RequestTag::from_bytes(tag.as_bytes()), Some(tag));
        }
        assert_eq!(RequestTag::from_bytes(*b"NOPE"), None);
    }

    #[test]
    fn response_tags_round_trip() {
        for tag in [
            ResponseTag::Success,
            ResponseTag::InvalidMessage,
            ResponseTag::InternalError,
            ResponseTag::AccessDenied,
        ] {
            assert_eq!(ResponseTag::from_bytes(tag.as_bytes()), Some(tag));
        }
        assert_eq!(ResponseTag::from_bytes(*b"ZZZZ"), None);
    }

    #[test]
    fn frame_encoding_prefixes_body_length() {
        let frame = encode_frame(*b"CRED", b"abc").unwrap();
        assert_eq!(&frame[..LEN_PREFIX_SIZE], &7u32.to_be_bytes());
        assert_eq!(&frame[LEN_PREFIX_SIZE..LEN_PREFIX_SIZE + TAG_SIZE], b"CRED");
        assert_eq!(&frame[LEN_PREFIX_SIZE + TAG_SIZE..], b"abc");
    }

    #[test]
    fn oversized_frame_is_rejected_before_allocation() {
        let payload = vec![0u8; MAX_FRAME_SIZE];
        let err = encode_frame(*b"CRED", &payload).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[test]
    fn largest_legal_frame_is_accepted() {
        let payload = vec![0u8; MAX_FRAME_SIZE - LEN_PREFIX_SIZE - TAG_SIZE];
        let frame = encode_frame(*b"BLES", &payload).unwrap();
        assert_eq!(frame.len(), MAX_FRAME_SIZE);
    }

    #[test]
    fn split_tag_rejects_short_bodies() {
        assert!(matches!(
            split_tag(b"XY"),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn credential_payload_rejects_embedded_nul() {
        assert!(encode_credential("ali\0ce", "pw").is_err());
        assert!(encode_credential("alice", "p\0w").is_err());
        assert!(encode_credential("", "pw").is_err());
    }

    #[test]
    fn credential_payload_rejects_trailing_bytes() {
        let mut payload = encode_credential("alice", "pw").unwrap();
        payload.push(b'x');
        assert!(parse_credential(&payload).is_err());
    }

    #[test]
    fn bless_payload_rejects_unknown_bits() {
        assert!(parse_bless(&0x4u32.to_le_bytes()).is_err());
        assert!(parse_bless(&0u32.to_le_bytes()).is_err());
        assert!(parse_bless(b"too long payload").is_err());
    }

    #[test]
    fn rights_accessors() {
        assert!(AccessRights::READ.read() && !AccessRights::READ.write());
        assert!(AccessRights::READ_WRITE.read() && AccessRights::READ_WRITE.write());
        assert_eq!(AccessRights::from_bits(0b10), Some(AccessRights::WRITE));
    }

    proptest! {
        #[test]
        fn credential_round_trip(
            username in "[a-zA-Z0-9_.-]{1,32}",
            password in "[ -~]{0,64}",
        ) {
            let payload = encode_credential(&username, &password).unwrap();
            let (user, pass) = parse_credential(&payload).unwrap();
            prop_assert_eq!(user, username);
            prop_assert_eq!(pass, password);
        }

        #[test]
        fn bless_round_trip(bits in 1u32..=3) {
            let rights = AccessRights::from_bits(bits).unwrap();
            let payload = encode_bless(rights);
            prop_assert_eq!(parse_bless(&payload).unwrap(), rights);
        }
    }
}
