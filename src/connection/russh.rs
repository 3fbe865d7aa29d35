//! Russh connection module
//!
//! SSH connectivity using the russh crate. [`RusshConnector`] establishes
//! and authenticates connections; each [`RusshConnection`] then opens PTY
//! shells, SFTP subsystems and exec channels on demand.

use async_trait::async_trait;
use russh::client::{Handle, Handler, Msg};
use russh::keys::key::PublicKey;
use russh::keys::load_secret_key;
use russh::{Channel, ChannelMsg};
use russh_keys::agent::client::AgentClient;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use super::config::{default_identity_files, expand_path, ConnectConfig};
use super::{
    AuthMethod, ConnectParams, ConnectionError, ConnectionResult, ExecChannel, ExecEvent,
    FileStat, PtySize, RemoteConnection, RemoteConnector, RemoteReader, RemoteWriter, RusshError,
    SftpChannel, ShellChannel,
};

/// Client handler for russh with known_hosts verification
struct ClientHandler {
    host: String,
    port: u16,
    /// Whether to accept (and learn) hosts missing from known_hosts
    accept_unknown: bool,
}

impl ClientHandler {
    fn new(host: &str, port: u16, accept_unknown: bool) -> Self {
        Self {
            host: host.to_string(),
            port,
            accept_unknown,
        }
    }
}

#[async_trait]
impl Handler for ClientHandler {
    type Error = RusshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match russh::keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => {
                debug!(host = %self.host, "Host key verified against known_hosts");
                Ok(true)
            }
            Ok(false) if self.accept_unknown => {
                warn!(
                    host = %self.host,
                    "Host not found in known_hosts, accepting (first connection)"
                );
                if let Err(e) =
                    russh::keys::learn_known_hosts(&self.host, self.port, server_public_key)
                {
                    debug!(host = %self.host, error = %e, "Could not record host key");
                }
                Ok(true)
            }
            Ok(false) => {
                warn!(host = %self.host, "Host not found in known_hosts, rejecting");
                Ok(false)
            }
            Err(e) => {
                warn!(
                    host = %self.host,
                    error = %e,
                    "HOST KEY VERIFICATION FAILED! Server key does not match known_hosts entry."
                );
                Ok(false)
            }
        }
    }
}

/// Connector that produces russh-backed connections
#[derive(Debug, Clone, Default)]
pub struct RusshConnector {
    config: ConnectConfig,
}

impl RusshConnector {
    pub fn new(config: ConnectConfig) -> Self {
        Self { config }
    }

    /// Connect with the configured retry policy. All attempts and the
    /// backoff between them share one `params.connect_timeout`.
    async fn connect_with_retry(
        &self,
        params: &ConnectParams,
    ) -> ConnectionResult<Handle<ClientHandler>> {
        let retry = self.config.retry_config();
        let deadline = tokio::time::Instant::now() + params.connect_timeout;
        let mut last_error = None;

        for attempt in 0..=retry.max_retries {
            if attempt > 0 {
                let delay = retry.delay_for_attempt(attempt - 1);
                if tokio::time::Instant::now() + delay >= deadline {
                    debug!(host = %params.address, attempt = attempt, "No connect budget left for retry");
                    break;
                }
                debug!(
                    host = %params.address,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying connection"
                );
                tokio::time::sleep(delay).await;
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let budget = retry.attempt_budget(remaining, attempt);
            match tokio::time::timeout(budget, self.do_connect(params)).await {
                Ok(Ok(handle)) => return Ok(handle),
                // Bad credentials will not get better on retry
                Ok(Err(e @ ConnectionError::AuthenticationFailed(_))) => return Err(e),
                Ok(Err(e)) => {
                    warn!(host = %params.address, error = %e, "Connection attempt failed");
                    last_error = Some(e);
                }
                Err(_) => {
                    warn!(host = %params.address, "Connection attempt timed out");
                    last_error = Some(ConnectionError::Timeout(params.connect_timeout));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ConnectionError::ConnectionFailed(format!("Failed to connect to {}", params.address))
        }))
    }

    /// Perform the actual connection
    async fn do_connect(&self, params: &ConnectParams) -> ConnectionResult<Handle<ClientHandler>> {
        let mut config = russh::client::Config::default();
        if !self.config.keepalive_interval.is_zero() {
            config.keepalive_interval = Some(self.config.keepalive_interval);
        }
        config.preferred = russh::Preferred {
            kex: std::borrow::Cow::Borrowed(&[
                russh::kex::CURVE25519,
                russh::kex::CURVE25519_PRE_RFC_8731,
                russh::kex::DH_G14_SHA256,
            ]),
            cipher: std::borrow::Cow::Borrowed(&[
                russh::cipher::CHACHA20_POLY1305,
                russh::cipher::AES_256_GCM,
                russh::cipher::AES_256_CTR,
            ]),
            key: std::borrow::Cow::Borrowed(&[
                russh::keys::key::ED25519,
                russh::keys::key::RSA_SHA2_256,
                russh::keys::key::RSA_SHA2_512,
            ]),
            mac: std::borrow::Cow::Borrowed(&[russh::mac::HMAC_SHA256, russh::mac::HMAC_SHA512]),
            compression: std::borrow::Cow::Borrowed(&[russh::compression::NONE]),
        };
        let config = Arc::new(config);

        let addr = format!("{}:{}", params.address, params.port);
        let socket = tokio::net::TcpStream::connect(&addr).await.map_err(|e| {
            ConnectionError::ConnectionFailed(format!("Failed to connect to {}: {}", addr, e))
        })?;

        socket.set_nodelay(true).map_err(|e| {
            ConnectionError::ConnectionFailed(format!("Failed to set TCP_NODELAY: {}", e))
        })?;

        let handler = ClientHandler::new(
            &params.address,
            params.port,
            self.config.accept_unknown_hosts,
        );

        let mut session = russh::client::connect_stream(config, socket, handler)
            .await
            .map_err(|e| {
                ConnectionError::ConnectionFailed(format!("SSH handshake failed: {}", e))
            })?;

        self.authenticate(&mut session, params).await?;

        debug!(host = %params.identifier(), "SSH connection established");
        Ok(session)
    }

    /// Authenticate with the host's configured method
    async fn authenticate(
        &self,
        session: &mut Handle<ClientHandler>,
        params: &ConnectParams,
    ) -> ConnectionResult<()> {
        let user = params.username.as_str();
        match &params.auth {
            AuthMethod::Password { password } => {
                let authenticated = session
                    .authenticate_password(user, password)
                    .await
                    .map_err(|e| {
                        ConnectionError::AuthenticationFailed(format!(
                            "Password authentication failed: {}",
                            e
                        ))
                    })?;
                if authenticated {
                    debug!("Authenticated using password");
                    Ok(())
                } else {
                    Err(ConnectionError::AuthenticationFailed(
                        "Password rejected".to_string(),
                    ))
                }
            }
            AuthMethod::Key { path, passphrase } => {
                let key_path = expand_path(path);
                Self::try_key_auth(session, user, &key_path, passphrase.as_deref()).await?;
                debug!(key = %key_path.display(), "Authenticated using key");
                Ok(())
            }
            AuthMethod::Agent => {
                if self.config.use_agent && Self::try_agent_auth(session, user).await.is_ok() {
                    debug!("Authenticated using SSH agent");
                    return Ok(());
                }

                let configured = self.config.identity_files.iter().map(|f| expand_path(f));
                for key_path in configured.chain(default_identity_files()) {
                    if Self::try_key_auth(session, user, &key_path, None)
                        .await
                        .is_ok()
                    {
                        debug!(key = %key_path.display(), "Authenticated using key");
                        return Ok(());
                    }
                }

                Err(ConnectionError::AuthenticationFailed(
                    "All authentication methods failed".to_string(),
                ))
            }
        }
    }

    /// Try SSH agent authentication
    async fn try_agent_auth(
        session: &mut Handle<ClientHandler>,
        user: &str,
    ) -> ConnectionResult<()> {
        let mut agent = AgentClient::connect_env().await.map_err(|e| {
            ConnectionError::AuthenticationFailed(format!("Failed to connect to SSH agent: {}", e))
        })?;

        let identities = agent.request_identities().await.map_err(|e| {
            ConnectionError::AuthenticationFailed(format!("Failed to get agent identities: {}", e))
        })?;

        for identity in identities {
            let (returned_agent, result) = session
                .authenticate_future(user, identity.clone(), agent)
                .await;
            agent = returned_agent;

            match result {
                Ok(true) => return Ok(()),
                Ok(false) => trace!("Identity rejected, trying next"),
                Err(e) => trace!(error = %e, "Agent authentication attempt failed"),
            }
        }

        Err(ConnectionError::AuthenticationFailed(
            "All SSH agent identities rejected".to_string(),
        ))
    }

    /// Try key-based authentication
    async fn try_key_auth(
        session: &mut Handle<ClientHandler>,
        user: &str,
        key_path: &Path,
        passphrase: Option<&str>,
    ) -> ConnectionResult<()> {
        if !key_path.exists() {
            return Err(ConnectionError::AuthenticationFailed(format!(
                "Key file not found: {}",
                key_path.display()
            )));
        }

        let key_pair = load_secret_key(key_path, passphrase).map_err(|e| {
            ConnectionError::AuthenticationFailed(format!(
                "Failed to load key {}: {}",
                key_path.display(),
                e
            ))
        })?;

        let authenticated = session
            .authenticate_publickey(user, Arc::new(key_pair))
            .await
            .map_err(|e| {
                ConnectionError::AuthenticationFailed(format!(
                    "Key authentication failed for {}: {}",
                    key_path.display(),
                    e
                ))
            })?;

        if authenticated {
            Ok(())
        } else {
            Err(ConnectionError::AuthenticationFailed(
                "Key authentication failed".to_string(),
            ))
        }
    }
}

#[async_trait]
impl RemoteConnector for RusshConnector {
    async fn open_session(
        &self,
        params: &ConnectParams,
    ) -> ConnectionResult<Arc<dyn RemoteConnection>> {
        let handle = self.connect_with_retry(params).await?;
        Ok(Arc::new(RusshConnection {
            identifier: params.identifier(),
            handle: RwLock::new(Some(handle)),
            connected: AtomicBool::new(true),
        }))
    }
}

/// An authenticated russh connection.
///
/// Channel opens only need a read lock on the handle; `close` takes the
/// write lock to move the handle out.
pub struct RusshConnection {
    identifier: String,
    handle: RwLock<Option<Handle<ClientHandler>>>,
    connected: AtomicBool,
}

impl RusshConnection {
    async fn open_channel(&self) -> ConnectionResult<Channel<Msg>> {
        let guard = self.handle.read().await;
        let handle = guard.as_ref().ok_or(ConnectionError::ConnectionClosed)?;
        handle.channel_open_session().await.map_err(|e| {
            ConnectionError::ConnectionFailed(format!("Failed to open channel: {}", e))
        })
    }
}

#[async_trait]
impl RemoteConnection for RusshConnection {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn is_alive(&self) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        match self.handle.read().await.as_ref() {
            Some(handle) => !handle.is_closed(),
            None => false,
        }
    }

    async fn open_shell(
        &self,
        term: &str,
        size: PtySize,
    ) -> ConnectionResult<Box<dyn ShellChannel>> {
        let channel = self.open_channel().await?;
        channel
            .request_pty(true, term, size.cols, size.rows, 0, 0, &[])
            .await
            .map_err(|e| ConnectionError::ConnectionFailed(format!("PTY request failed: {}", e)))?;
        channel.request_shell(true).await.map_err(|e| {
            ConnectionError::ConnectionFailed(format!("Shell request failed: {}", e))
        })?;
        trace!(identifier = %self.identifier, cols = size.cols, rows = size.rows, "Shell opened");
        Ok(Box::new(RusshShell { channel }))
    }

    async fn open_sftp(&self, charset: &str) -> ConnectionResult<Box<dyn SftpChannel>> {
        if !charset.eq_ignore_ascii_case("utf-8") && !charset.eq_ignore_ascii_case("utf8") {
            debug!(charset = %charset, "SFTP file names are exchanged as UTF-8");
        }
        let channel = self.open_channel().await?;
        channel.request_subsystem(true, "sftp").await.map_err(|e| {
            ConnectionError::TransferFailed(format!("Failed to request SFTP subsystem: {}", e))
        })?;
        let session = SftpSession::new(channel.into_stream()).await.map_err(|e| {
            ConnectionError::TransferFailed(format!("Failed to create SFTP session: {}", e))
        })?;
        Ok(Box::new(RusshSftp { session }))
    }

    async fn open_exec(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> ConnectionResult<Box<dyn ExecChannel>> {
        let start = async {
            let channel = self.open_channel().await?;
            channel.exec(true, command).await.map_err(|e| {
                ConnectionError::ExecutionFailed(format!("Failed to execute command: {}", e))
            })?;
            Ok::<_, ConnectionError>(channel)
        };
        let channel = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, start)
                .await
                .map_err(|_| ConnectionError::Timeout(timeout))??,
            None => start.await?,
        };
        Ok(Box::new(RusshExec {
            channel,
            finished: false,
        }))
    }

    async fn close(&self) -> ConnectionResult<()> {
        self.connected.store(false, Ordering::SeqCst);

        let handle = {
            let mut guard = self.handle.write().await;
            guard.take()
        };

        if let Some(handle) = handle {
            debug!(identifier = %self.identifier, "Closing SSH connection");
            let _ = handle
                .disconnect(
                    russh::Disconnect::ByApplication,
                    "Connection closed by client",
                    "en",
                )
                .await;
        }
        Ok(())
    }
}

impl std::fmt::Debug for RusshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RusshConnection")
            .field("identifier", &self.identifier)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .finish()
    }
}

/// PTY shell on a russh session channel
struct RusshShell {
    channel: Channel<Msg>,
}

#[async_trait]
impl ShellChannel for RusshShell {
    async fn write(&mut self, data: &[u8]) -> ConnectionResult<()> {
        self.channel
            .data(data)
            .await
            .map_err(|e| ConnectionError::SshError(format!("Failed to write to shell: {}", e)))
    }

    async fn read(&mut self) -> ConnectionResult<Option<Vec<u8>>> {
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Data { ref data }) => return Ok(Some(data.to_vec())),
                Some(ChannelMsg::ExtendedData { ref data, .. }) => {
                    return Ok(Some(data.to_vec()))
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => return Ok(None),
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    trace!(exit_status = exit_status, "Shell exited");
                }
                Some(_) => {}
            }
        }
    }

    async fn resize(&mut self, size: PtySize) -> ConnectionResult<()> {
        self.channel
            .window_change(size.cols, size.rows, 0, 0)
            .await
            .map_err(|e| ConnectionError::SshError(format!("Failed to resize PTY: {}", e)))
    }

    async fn close(&mut self) -> ConnectionResult<()> {
        let _ = self.channel.eof().await;
        self.channel
            .close()
            .await
            .map_err(|e| ConnectionError::SshError(format!("Failed to close shell: {}", e)))
    }
}

/// One-shot command on a russh session channel
struct RusshExec {
    channel: Channel<Msg>,
    finished: bool,
}

#[async_trait]
impl ExecChannel for RusshExec {
    async fn next_event(&mut self) -> Option<ExecEvent> {
        if self.finished {
            return None;
        }
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Data { ref data }) => return Some(ExecEvent::Stdout(data.to_vec())),
                Some(ChannelMsg::ExtendedData { ref data, ext }) if ext == 1 => {
                    return Some(ExecEvent::Stderr(data.to_vec()))
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    return Some(ExecEvent::Exit(exit_status))
                }
                Some(ChannelMsg::Close) | None => {
                    self.finished = true;
                    return None;
                }
                Some(_) => {}
            }
        }
    }

    async fn terminate(&mut self) -> ConnectionResult<()> {
        self.finished = true;
        if let Err(e) = self.channel.signal(russh::Sig::KILL).await {
            trace!(error = %e, "Failed to signal remote command");
        }
        self.channel
            .close()
            .await
            .map_err(|e| ConnectionError::ExecutionFailed(format!("Failed to close channel: {}", e)))
    }
}

/// SFTP subsystem backed by russh-sftp
struct RusshSftp {
    session: SftpSession,
}

fn sftp_error(op: &str, path: &str, e: russh_sftp::client::error::Error) -> ConnectionError {
    let error_str = e.to_string().to_lowercase();
    if error_str.contains("no such file") || error_str.contains("not found") {
        ConnectionError::TransferFailed(format!("File not found: {}", path))
    } else if error_str.contains("permission denied") {
        ConnectionError::TransferFailed(format!("Permission denied: {}", path))
    } else {
        ConnectionError::TransferFailed(format!("Failed to {} {}: {}", op, path, e))
    }
}

fn to_file_stat(path: &str, attrs: &FileAttributes, is_symlink: bool) -> FileStat {
    let name = path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
        .to_string();
    FileStat {
        path: path.to_string(),
        name,
        size: attrs.size.unwrap_or(0),
        permissions: attrs.permissions.unwrap_or(0) & 0o7777,
        uid: attrs.uid.unwrap_or(0),
        gid: attrs.gid.unwrap_or(0),
        mtime: attrs.mtime.map(|t| t as i64).unwrap_or(0),
        is_dir: attrs.is_dir(),
        is_file: attrs.is_regular(),
        is_symlink,
    }
}

#[async_trait]
impl SftpChannel for RusshSftp {
    async fn list(&self, path: &str) -> ConnectionResult<Vec<FileStat>> {
        let entries = self
            .session
            .read_dir(path)
            .await
            .map_err(|e| sftp_error("list", path, e))?;

        let mut stats = Vec::new();
        for entry in entries {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let metadata = entry.metadata();
            let full_path = super::join_remote(path, &name);
            let is_symlink = metadata.is_symlink();
            stats.push(to_file_stat(&full_path, &metadata, is_symlink));
        }
        Ok(stats)
    }

    async fn stat(&self, path: &str) -> ConnectionResult<FileStat> {
        let is_symlink = match self.session.symlink_metadata(path).await {
            Ok(attrs) => attrs.is_symlink(),
            Err(_) => false,
        };
        let attrs = self
            .session
            .metadata(path)
            .await
            .map_err(|e| sftp_error("stat", path, e))?;
        Ok(to_file_stat(path, &attrs, is_symlink))
    }

    async fn exists(&self, path: &str) -> ConnectionResult<bool> {
        self.session
            .try_exists(path)
            .await
            .map_err(|e| sftp_error("check", path, e))
    }

    async fn open_read(&self, path: &str) -> ConnectionResult<RemoteReader> {
        let file = self
            .session
            .open_with_flags(path, OpenFlags::READ)
            .await
            .map_err(|e| sftp_error("open", path, e))?;
        Ok(Box::new(file))
    }

    async fn open_write(&self, path: &str) -> ConnectionResult<RemoteWriter> {
        let file = self
            .session
            .open_with_flags(
                path,
                OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            )
            .await
            .map_err(|e| sftp_error("create", path, e))?;
        Ok(Box::new(file))
    }

    async fn mkdir(&self, path: &str) -> ConnectionResult<()> {
        self.session
            .create_dir(path)
            .await
            .map_err(|e| sftp_error("create directory", path, e))
    }

    async fn truncate(&self, path: &str) -> ConnectionResult<()> {
        let file = self
            .session
            .open_with_flags(path, OpenFlags::WRITE | OpenFlags::TRUNCATE)
            .await
            .map_err(|e| sftp_error("truncate", path, e))?;
        drop(file);
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> ConnectionResult<()> {
        self.session
            .remove_file(path)
            .await
            .map_err(|e| sftp_error("remove", path, e))
    }

    async fn remove_dir(&self, path: &str) -> ConnectionResult<()> {
        self.session
            .remove_dir(path)
            .await
            .map_err(|e| sftp_error("remove directory", path, e))
    }

    async fn rename(&self, from: &str, to: &str) -> ConnectionResult<()> {
        self.session
            .rename(from, to)
            .await
            .map_err(|e| sftp_error("rename", from, e))
    }

    async fn chmod(&self, path: &str, mode: u32) -> ConnectionResult<()> {
        let mut attrs = FileAttributes::default();
        attrs.permissions = Some(mode);
        self.session
            .set_metadata(path, attrs)
            .await
            .map_err(|e| sftp_error("chmod", path, e))
    }

    async fn close(&self) -> ConnectionResult<()> {
        self.session
            .close()
            .await
            .map_err(|e| ConnectionError::TransferFailed(format!("Failed to close SFTP: {}", e)))
    }
}
