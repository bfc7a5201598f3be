//! Credential validation and session token minting.
//!
//! Validation sits behind [`CredentialValidator`] so the broker core
//! never knows which backend decided; the stock backend checks an
//! operator-provisioned credentials file. The two failure modes are
//! deliberately distinct: [`AuthError::InvalidCredentials`] answers the
//! client with access-denied, while [`AuthError::Backend`] answers with
//! internal-error and is logged server-side.
//!
//! # Credentials file
//!
//! One record per line, `username:salthex:digesthex`, where the digest
//! is `SHA-256(salt || password)`. Blank lines and `#` comments are
//! skipped. Records are compared in constant time, and unknown
//! usernames burn the same digest work as known ones.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::OwnedFd;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use subtle::{Choice, ConstantTimeEq};
use thiserror::Error;

use crate::handle::TokenFd;

/// Digest width of a credential record.
const DIGEST_SIZE: usize = 32;

/// Salt burned when a username is unknown, so lookups cost the same
/// either way.
const DUMMY_SALT: &[u8] = b"lift-no-such-user";

/// Why a credential check failed.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The username/password pair is wrong. Maps to access-denied.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The validation backend itself failed. Maps to internal-error.
    #[error("credential backend failure: {0}")]
    Backend(String),
}

/// Why a credentials file could not be loaded.
#[derive(Debug, Error)]
pub enum CredentialStoreError {
    /// The file could not be read.
    #[error("failed to read credentials file: {0}")]
    Read(#[from] io::Error),

    /// A record is not `username:salthex:digesthex`.
    #[error("malformed credentials record at line {line}: {reason}")]
    Malformed {
        /// 1-based line number of the offending record.
        line: usize,
        /// What was wrong with it.
        reason: String,
    },
}

/// The seam to the platform's credential checking service.
///
/// Implementations must be cheap enough to run inside the event loop's
/// step function; anything slower belongs behind its own queue.
pub trait CredentialValidator {
    /// Checks a username/password pair, minting a session token on
    /// success.
    ///
    /// # Errors
    ///
    /// [`AuthError::InvalidCredentials`] for a wrong pair,
    /// [`AuthError::Backend`] when the backend itself failed.
    fn validate(&self, username: &str, password: &SecretString)
        -> Result<SessionToken, AuthError>;
}

/// A minted session grant: the record text plus the token descriptor
/// that carries it to the client.
#[derive(Debug)]
pub struct SessionToken {
    user: String,
    grant: Vec<u8>,
    fd: TokenFd,
}

impl SessionToken {
    /// Mints a token for `user`: an anonymous memory file holding the
    /// grant record, rewound so the recipient reads it from the start.
    ///
    /// # Errors
    ///
    /// Propagates memory-file creation or write failures.
    pub fn mint(user: &str) -> io::Result<Self> {
        let issued_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        let grant = format!(
            "user={user}\nissued-at={issued_at}\nbroker=liftd/{}\n",
            env!("CARGO_PKG_VERSION")
        )
        .into_bytes();

        let fd = memfd_create(c"lift-grant", MemFdCreateFlag::MFD_CLOEXEC)
            .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;
        let mut file = File::from(fd);
        file.write_all(&grant)?;
        file.seek(SeekFrom::Start(0))?;

        Ok(Self {
            user: user.to_owned(),
            grant,
            fd: TokenFd::from(OwnedFd::from(file)),
        })
    }

    /// The authenticated username.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// The grant record carried in the token.
    #[must_use]
    pub fn grant(&self) -> &[u8] {
        &self.grant
    }

    /// Splits the token into its grant record and descriptor.
    #[must_use]
    pub fn into_parts(self) -> (Vec<u8>, TokenFd) {
        (self.grant, self.fd)
    }
}

#[derive(Debug)]
struct CredentialRecord {
    salt: Vec<u8>,
    digest: [u8; DIGEST_SIZE],
}

/// Credentials-file validator.
#[derive(Debug)]
pub struct FileValidator {
    records: HashMap<String, CredentialRecord>,
    dummy_digest: [u8; DIGEST_SIZE],
}

impl FileValidator {
    /// Loads and parses the credentials file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialStoreError`] when the file is unreadable or
    /// a record is malformed; the daemon refuses to start in that case
    /// rather than running with a partial store.
    pub fn load(path: &Path) -> Result<Self, CredentialStoreError> {
        let mut contents = String::new();
        File::open(path)?.read_to_string(&mut contents)?;

        let mut records = HashMap::new();
        for (index, raw_line) in contents.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (user, record) = parse_record(line).map_err(|reason| {
                CredentialStoreError::Malformed {
                    line: index + 1,
                    reason,
                }
            })?;
            records.insert(user, record);
        }

        Ok(Self {
            records,
            dummy_digest: credential_digest(DUMMY_SALT, ""),
        })
    }

    /// Number of loaded records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl CredentialValidator for FileValidator {
    fn validate(
        &self,
        username: &str,
        password: &SecretString,
    ) -> Result<SessionToken, AuthError> {
        let record = self.records.get(username);
        let (salt, expected) = match record {
            Some(r) => (r.salt.as_slice(), &r.digest),
            None => (DUMMY_SALT, &self.dummy_digest),
        };

        let computed = credential_digest(salt, password.expose_secret());
        let digest_matches = computed[..].ct_eq(&expected[..]);
        let user_known = Choice::from(u8::from(record.is_some()));

        if bool::from(digest_matches & user_known) {
            SessionToken::mint(username).map_err(|e| AuthError::Backend(e.to_string()))
        } else {
            Err(AuthError::InvalidCredentials)
        }
    }
}

fn parse_record(line: &str) -> Result<(String, CredentialRecord), String> {
    let mut fields = line.splitn(3, ':');
    let user = fields.next().unwrap_or_default();
    let salt_hex = fields.next().ok_or("missing salt field")?;
    let digest_hex = fields.next().ok_or("missing digest field")?;

    if user.is_empty() {
        return Err("empty username".to_string());
    }
    let salt = hex::decode(salt_hex).map_err(|e| format!("bad salt hex: {e}"))?;
    let digest_bytes = hex::decode(digest_hex).map_err(|e| format!("bad digest hex: {e}"))?;
    let digest: [u8; DIGEST_SIZE] = digest_bytes
        .try_into()
        .map_err(|_| format!("digest must be {DIGEST_SIZE} bytes"))?;

    Ok((user.to_owned(), CredentialRecord { salt, digest }))
}

/// Computes the record digest for a salt/password pair.
#[must_use]
pub fn credential_digest(salt: &[u8], password: &str) -> [u8; DIGEST_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

/// Renders a credentials-file record line. Used by the provisioning
/// helper and by tests.
#[must_use]
pub fn encode_record(username: &str, salt: &[u8], password: &str) -> String {
    format!(
        "{username}:{}:{}",
        hex::encode(salt),
        hex::encode(credential_digest(salt, password))
    )
}

#[cfg(test)]
mod tests {
    use std::io::Read as _;

    use super::*;

    fn store_with(lines: &[&str]) -> FileValidator {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials");
        std::fs::write(&path, lines.join("\n")).unwrap();
        FileValidator::load(&path).unwrap()
    }

    fn secret(s: &str) -> SecretString {
        SecretString::new(s.to_owned())
    }

    #[test]
    fn valid_credentials_mint_a_token() {
        let store = store_with(&[
            "# test store",
            "",
            &encode_record("alice", b"salt-a", "wonderland"),
        ]);
        let token = store.validate("alice", &secret("wonderland")).unwrap();
        assert_eq!(token.user(), "alice");

        let mut contents = String::new();
        File::from(token.into_parts().1.into_fd())
            .read_to_string(&mut contents)
            .unwrap();
        assert!(contents.contains("user=alice"));
    }

    #[test]
    fn wrong_password_is_invalid_credentials() {
        let store = store_with(&[&encode_record("alice", b"salt-a", "wonderland")]);
        let err = store.validate("alice", &secret("looking-glass")).unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[test]
    fn unknown_user_is_invalid_credentials() {
        let store = store_with(&[&encode_record("alice", b"salt-a", "wonderland")]);
        let err = store.validate("mallory", &secret("wonderland")).unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[test]
    fn empty_password_for_unknown_user_is_denied() {
        // The dummy record must never validate, even with the exact
        // inputs it was built from.
        let store = store_with(&[&encode_record("alice", b"salt-a", "wonderland")]);
        let err = store.validate("no-such-user", &secret("")).unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[test]
    fn malformed_record_reports_line_number() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials");
        std::fs::write(&path, "alice:deadbeef\n").unwrap();
        let err = FileValidator::load(&path).unwrap_err();
        match err {
            CredentialStoreError::Malformed { line, .. } => assert_eq!(line, 1),
            other => panic!("expected Malformed, got {other}"),
        }
    }

    #[test]
    fn bad_hex_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials");
        std::fs::write(&path, "alice:zzzz:abcd\n").unwrap();
        assert!(FileValidator::load(&path).is_err());
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = FileValidator::load(Path::new("/nonexistent/credentials")).unwrap_err();
        assert!(matches!(err, CredentialStoreError::Read(_)));
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            #[test]
            fn any_provisioned_record_validates(
                user in "[a-zA-Z0-9_.-]{1,32}",
                password in "[ -~]{1,64}",
                salt in proptest::collection::vec(any::<u8>(), 8..24),
            ) {
                let store = store_with(&[&encode_record(&user, &salt, &password)]);
                prop_assert!(store.validate(&user, &secret(&password)).is_ok());

                // Any other password for the same record is refused.
                let wrong = format!("{password}#");
                prop_assert!(matches!(
                    store.validate(&user, &secret(&wrong)),
                    Err(AuthError::InvalidCredentials)
                ));
            }
        }
    }
}
