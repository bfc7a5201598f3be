//! Listening socket lifecycle.
//!
//! Binding follows a fixed discipline: the parent directory exists
//! (created 0700 when missing), a stale socket file left by a previous
//! run is verified to actually be a socket before removal, and the
//! bound socket gets group-accessible permissions (0660) so clients in
//! the broker's group can connect.
//!
//! # Security Considerations
//!
//! - Symlinked socket directories are refused outright.
//! - Permissions of pre-existing directories are left alone; only
//!   directories created here are forced to 0700.
//! - A non-socket file at the socket path is an error, never removed.

use std::io;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::Path;

use tokio::net::UnixListener;
use tracing::{debug, info, warn};

/// Socket file permissions: owner and group may connect.
pub const SOCKET_MODE: u32 = 0o660;

/// Permissions for a socket directory created by the broker.
const DIRECTORY_MODE: u32 = 0o700;

/// Binds the listening socket at `path`.
///
/// # Errors
///
/// Fails when the directory cannot be prepared, a stale path cannot be
/// cleared, the bind itself fails, or permissions cannot be applied.
/// All of these are transport-fatal for the server.
pub fn bind_socket(path: &Path) -> io::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        ensure_directory(parent)?;
    }
    cleanup_stale_socket(path)?;

    let listener = UnixListener::bind(path)?;

    let perms = std::fs::Permissions::from_mode(SOCKET_MODE);
    std::fs::set_permissions(path, perms)?;

    info!(socket = %path.display(), "Socket bound");
    Ok(listener)
}

/// Removes the socket file, best effort. Called on server exit.
pub fn remove_socket(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(socket = %path.display(), error = %e, "Failed to remove socket file");
        } else {
            debug!(socket = %path.display(), "Removed socket file");
        }
    }
}

fn ensure_directory(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(metadata) => {
            if metadata.file_type().is_symlink() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "{} is a symlink, refusing to use as socket directory",
                        path.display()
                    ),
                ));
            }
            if !metadata.is_dir() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists but is not a directory", path.display()),
                ));
            }
            // Existing directory: leave its permissions alone.
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            std::fs::create_dir_all(path)?;
            let perms = std::fs::Permissions::from_mode(DIRECTORY_MODE);
            std::fs::set_permissions(path, perms)
        }
        Err(e) => Err(e),
    }
}

fn cleanup_stale_socket(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(metadata) => {
            if !metadata.file_type().is_socket() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists but is not a socket", path.display()),
                ));
            }
            std::fs::remove_file(path)?;
            debug!(socket = %path.display(), "Removed stale socket file");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
