//! Daemon configuration: a TOML file with CLI overrides.
//!
//! ```toml
//! [daemon]
//! socket = "/run/lift/lift.sock"
//! max_connections = 10
//! credentials_file = "/etc/lift/credentials"
//! poll_timeout_ms = 0          # omit for infinite waits
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::server::ServerSettings;

/// Default connection pool size. An elevation broker rarely serves
/// many clients at once.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;

/// Socket filename under the runtime directory.
const DEFAULT_SOCKET_NAME: &str = "lift.sock";

/// Subdirectory under the runtime directory.
const DEFAULT_SUBDIR: &str = "lift";

/// Default credentials file location.
const DEFAULT_CREDENTIALS_FILE: &str = "/etc/lift/credentials";

/// Why configuration loading failed.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file: {0}")]
    Read(#[from] io::Error),

    /// The file is not valid TOML or has unknown fields.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// On-disk configuration layout.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// The `[daemon]` table.
    #[serde(default)]
    pub daemon: DaemonSection,
}

/// The `[daemon]` table. Every field optional; defaults below.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonSection {
    /// Listening socket path.
    pub socket: Option<PathBuf>,
    /// Connection pool size.
    pub max_connections: Option<usize>,
    /// Credentials file path.
    pub credentials_file: Option<PathBuf>,
    /// Bound on each event wait; omitted or 0 means wait forever.
    pub poll_timeout_ms: Option<u64>,
}

impl ConfigFile {
    /// Loads and parses the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on read or parse failure.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

/// Default socket path: `$XDG_RUNTIME_DIR/lift/lift.sock`, falling
/// back to `/tmp/lift/lift.sock`.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR").map_or_else(
        |_| {
            PathBuf::from("/tmp")
                .join(DEFAULT_SUBDIR)
                .join(DEFAULT_SOCKET_NAME)
        },
        |runtime_dir| {
            PathBuf::from(runtime_dir)
                .join(DEFAULT_SUBDIR)
                .join(DEFAULT_SOCKET_NAME)
        },
    )
}

/// Fully resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Listening socket path.
    pub socket_path: PathBuf,
    /// Connection pool size.
    pub max_connections: usize,
    /// Credentials file path.
    pub credentials_file: PathBuf,
    /// Bound on each event wait; `None` waits forever.
    pub poll_timeout: Option<Duration>,
}

impl DaemonConfig {
    /// Resolves a `[daemon]` table against the built-in defaults.
    #[must_use]
    pub fn from_file_section(section: &DaemonSection) -> Self {
        Self {
            socket_path: section.socket.clone().unwrap_or_else(default_socket_path),
            max_connections: section.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            credentials_file: section
                .credentials_file
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CREDENTIALS_FILE)),
            poll_timeout: section
                .poll_timeout_ms
                .filter(|&ms| ms > 0)
                .map(Duration::from_millis),
        }
    }

    /// The subset the server driver consumes.
    #[must_use]
    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            socket_path: self.socket_path.clone(),
            max_connections: self.max_connections,
            poll_timeout: self.poll_timeout,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self::from_file_section(&DaemonSection::default())
    }
}
