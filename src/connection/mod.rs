//! Connection layer for remote host communication.
//!
//! This module defines the Connection Factory boundary of the engine. A
//! [`RemoteConnector`] turns resolved [`ConnectParams`] into an authenticated
//! [`RemoteConnection`], which in turn opens the three channel kinds the
//! engine drives:
//!
//! - [`ShellChannel`]: interactive PTY shell for terminal sessions
//! - [`SftpChannel`]: file-transfer subsystem for SFTP sessions and transfers
//! - [`ExecChannel`]: one-shot command execution for batch commands
//!
//! Everything above this layer only sees these traits, so tests substitute an
//! in-memory connector and production uses the russh implementation.
//!
//! # Example
//!
//! ```rust,ignore
//! use hostrelay::connection::{ConnectParams, RemoteConnector, PtySize};
//! use hostrelay::connection::russh::RusshConnector;
//!
//! let connector = RusshConnector::new(Default::default());
//! let conn = connector.open_session(&params).await?;
//! let mut shell = conn.open_shell("xterm-256color", PtySize::new(120, 40)).await?;
//! shell.write(b"uname -a\n").await?;
//! ```

/// Retry policy and identity file helpers.
pub mod config;

/// Host id to connection parameter resolution.
pub mod resolver;

/// Pure Rust SSH implementation using russh.
#[cfg(feature = "russh")]
pub mod russh;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use resolver::{HostResolver, StaticHostResolver};

/// Russh-related error type - wraps russh::Error for compatibility with the Handler trait
#[cfg(feature = "russh")]
#[derive(Debug)]
pub struct RusshError(pub ::russh::Error);

#[cfg(feature = "russh")]
impl From<::russh::Error> for RusshError {
    fn from(err: ::russh::Error) -> Self {
        RusshError(err)
    }
}

#[cfg(feature = "russh")]
impl std::fmt::Display for RusshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Russh error: {}", self.0)
    }
}

#[cfg(feature = "russh")]
impl std::error::Error for RusshError {}

#[cfg(feature = "russh")]
impl From<::russh::Error> for ConnectionError {
    fn from(err: ::russh::Error) -> Self {
        ConnectionError::SshError(format!("Russh error: {}", err))
    }
}

#[cfg(feature = "russh")]
impl From<russh_sftp::client::error::Error> for ConnectionError {
    fn from(e: russh_sftp::client::error::Error) -> Self {
        ConnectionError::TransferFailed(format!("SFTP error: {}", e))
    }
}

/// Errors that can occur during connection operations.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Failed to establish initial connection to the host.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication was rejected by the remote host.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Command execution failed (not to be confused with non-zero exit code).
    #[error("Command execution failed: {0}")]
    ExecutionFailed(String),

    /// File transfer or SFTP operation failed.
    #[error("File transfer failed: {0}")]
    TransferFailed(String),

    /// Connection or operation timed out.
    #[error("Connection timeout after {0:?}")]
    Timeout(Duration),

    /// SSH-specific error from the underlying implementation.
    #[error("SSH error: {0}")]
    SshError(String),

    /// I/O error during connection operations.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Connection or channel was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The requested operation is not supported by this transport.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
}

impl ConnectionError {
    /// Returns true if the error happened while establishing the connection
    /// (as opposed to during an in-flight operation).
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            ConnectionError::ConnectionFailed(_)
                | ConnectionError::AuthenticationFailed(_)
                | ConnectionError::Timeout(_)
        )
    }
}

/// Result type for connection operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Remote operating system family, used for home-path and script naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OsType {
    #[default]
    Linux,
    Windows,
}

/// How to authenticate against the remote host.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthMethod {
    /// Plain password authentication
    Password { password: String },
    /// Private key file, optionally encrypted
    Key {
        path: String,
        passphrase: Option<String>,
    },
    /// Whatever the local SSH agent offers
    Agent,
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::Password { .. } => write!(f, "Password(***)"),
            AuthMethod::Key { path, .. } => write!(f, "Key({})", path),
            AuthMethod::Agent => write!(f, "Agent"),
        }
    }
}

/// Resolved, authenticated-ready parameters for one remote host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub host_id: u64,
    pub host_name: String,
    pub address: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
    #[serde(default)]
    pub os_type: OsType,
    /// File name charset used for the SFTP subsystem.
    #[serde(default = "default_charset")]
    pub charset: String,
    /// Upper bound for TCP connect + handshake + authentication.
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
}

fn default_charset() -> String {
    "UTF-8".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(config::DEFAULT_TIMEOUT)
}

impl ConnectParams {
    /// Create parameters with agent authentication and defaults elsewhere.
    pub fn new(host_id: u64, address: impl Into<String>, username: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            host_id,
            host_name: address.clone(),
            address,
            port: 22,
            username: username.into(),
            auth: AuthMethod::Agent,
            os_type: OsType::Linux,
            charset: default_charset(),
            connect_timeout: default_connect_timeout(),
        }
    }

    /// Set the display name of the host
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.host_name = name.into();
        self
    }

    /// Set the port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the authentication method
    pub fn with_auth(mut self, auth: AuthMethod) -> Self {
        self.auth = auth;
        self
    }

    /// Set the remote OS family
    pub fn with_os_type(mut self, os_type: OsType) -> Self {
        self.os_type = os_type;
        self
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// `user@address:port`, used as the connection identifier in logs.
    pub fn identifier(&self) -> String {
        format!("{}@{}:{}", self.username, self.address, self.port)
    }
}

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtySize {
    pub cols: u32,
    pub rows: u32,
}

impl PtySize {
    pub fn new(cols: u32, rows: u32) -> Self {
        Self { cols, rows }
    }
}

impl Default for PtySize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// File statistics as reported by the SFTP subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStat {
    /// Absolute path of the entry
    pub path: String,
    /// Last path component
    pub name: String,
    /// File size in bytes
    pub size: u64,
    /// Permission bits (lower 12 bits of st_mode)
    pub permissions: u32,
    /// Owner UID
    pub uid: u32,
    /// Group GID
    pub gid: u32,
    /// Last modification time (Unix timestamp)
    pub mtime: i64,
    /// Is this a directory?
    pub is_dir: bool,
    /// Is this a regular file?
    pub is_file: bool,
    /// Is this a symbolic link?
    pub is_symlink: bool,
}

/// Output of a running exec channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    /// The remote process exited with this status.
    Exit(u32),
}

/// Streaming reader over a remote file.
pub type RemoteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Streaming writer into a remote file.
pub type RemoteWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Produces authenticated remote connections.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    /// Establish and authenticate a connection. Implementations must give up
    /// after `params.connect_timeout`.
    async fn open_session(
        &self,
        params: &ConnectParams,
    ) -> ConnectionResult<Arc<dyn RemoteConnection>>;
}

/// One authenticated connection to a remote host.
#[async_trait]
pub trait RemoteConnection: Send + Sync {
    /// Get the connection identifier (`user@host:port`)
    fn identifier(&self) -> &str;

    /// Check if the connection is still alive
    async fn is_alive(&self) -> bool;

    /// Open an interactive shell with a PTY
    async fn open_shell(&self, term: &str, size: PtySize)
        -> ConnectionResult<Box<dyn ShellChannel>>;

    /// Open the SFTP subsystem
    async fn open_sftp(&self, charset: &str) -> ConnectionResult<Box<dyn SftpChannel>>;

    /// Start a command on a fresh exec channel. `timeout` is the command's
    /// time budget and also bounds starting it; `None` means unbounded.
    async fn open_exec(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> ConnectionResult<Box<dyn ExecChannel>>;

    /// Close the connection. Must be safe to call more than once.
    async fn close(&self) -> ConnectionResult<()>;
}

/// An interactive shell channel.
///
/// `read` must be cancel-safe: the terminal read loop polls it inside
/// `tokio::select!` together with inbound client data.
#[async_trait]
pub trait ShellChannel: Send {
    /// Send bytes to the remote shell
    async fn write(&mut self, data: &[u8]) -> ConnectionResult<()>;

    /// Next chunk of remote output, `None` once the remote side closed
    async fn read(&mut self) -> ConnectionResult<Option<Vec<u8>>>;

    /// Propagate a terminal size change
    async fn resize(&mut self, size: PtySize) -> ConnectionResult<()>;

    /// Close the channel
    async fn close(&mut self) -> ConnectionResult<()>;
}

/// The SFTP subsystem of a connection.
#[async_trait]
pub trait SftpChannel: Send + Sync {
    /// List a directory (without `.` and `..`)
    async fn list(&self, path: &str) -> ConnectionResult<Vec<FileStat>>;

    /// Stat a path, following symlinks
    async fn stat(&self, path: &str) -> ConnectionResult<FileStat>;

    /// Check whether a path exists
    async fn exists(&self, path: &str) -> ConnectionResult<bool>;

    /// Open a file for reading
    async fn open_read(&self, path: &str) -> ConnectionResult<RemoteReader>;

    /// Create or truncate a file and open it for writing
    async fn open_write(&self, path: &str) -> ConnectionResult<RemoteWriter>;

    /// Create a single directory
    async fn mkdir(&self, path: &str) -> ConnectionResult<()>;

    /// Truncate a file to zero length
    async fn truncate(&self, path: &str) -> ConnectionResult<()>;

    /// Remove a regular file or symlink
    async fn remove_file(&self, path: &str) -> ConnectionResult<()>;

    /// Remove an empty directory
    async fn remove_dir(&self, path: &str) -> ConnectionResult<()>;

    /// Rename / move a path
    async fn rename(&self, from: &str, to: &str) -> ConnectionResult<()>;

    /// Change permission bits
    async fn chmod(&self, path: &str, mode: u32) -> ConnectionResult<()>;

    /// Close the subsystem. Must be safe to call more than once.
    async fn close(&self) -> ConnectionResult<()>;
}

/// A running remote command.
///
/// `next_event` must be cancel-safe; the batch executor races it against
/// the timeout and interrupt signals.
#[async_trait]
pub trait ExecChannel: Send {
    /// Next output or exit event, `None` once the channel closed
    async fn next_event(&mut self) -> Option<ExecEvent>;

    /// Forcibly terminate the remote command and close the channel
    async fn terminate(&mut self) -> ConnectionResult<()>;
}

/// Quote a string for a POSIX shell.
pub fn escape_shell_arg(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '-' | '_' | ':' | '='))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Join a parent path and a child name with exactly one `/`.
pub fn join_remote(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Parent directory of a remote path, `None` for the root.
pub fn remote_parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&trimmed[..idx]),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_params_builder() {
        let params = ConnectParams::new(7, "10.0.0.5", "deploy")
            .with_name("web-1")
            .with_port(2222)
            .with_os_type(OsType::Windows);

        assert_eq!(params.host_id, 7);
        assert_eq!(params.host_name, "web-1");
        assert_eq!(params.identifier(), "deploy@10.0.0.5:2222");
        assert_eq!(params.os_type, OsType::Windows);
    }

    #[test]
    fn test_password_redacted_in_debug() {
        let auth = AuthMethod::Password {
            password: "hunter2".into(),
        };
        assert!(!format!("{:?}", auth).contains("hunter2"));
    }

    #[test]
    fn test_connect_params_json_roundtrip_keeps_timeout() {
        let params = ConnectParams::new(1, "h", "u").with_connect_timeout(Duration::from_secs(3));
        let json = serde_json::to_string(&params).unwrap();
        let back: ConnectParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back.connect_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_escape_shell_arg() {
        assert_eq!(escape_shell_arg("/tmp/a.sh"), "/tmp/a.sh");
        assert_eq!(escape_shell_arg("it's"), "'it'\\''s'");
        assert_eq!(escape_shell_arg(""), "''");
    }

    #[test]
    fn test_remote_path_helpers() {
        assert_eq!(join_remote("/home/u", "a.txt"), "/home/u/a.txt");
        assert_eq!(join_remote("/", "a.txt"), "/a.txt");
        assert_eq!(remote_parent("/home/u/a.txt"), Some("/home/u"));
        assert_eq!(remote_parent("/a.txt"), Some("/"));
        assert_eq!(remote_parent("a.txt"), None);
    }
}
