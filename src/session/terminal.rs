//! Interactive terminal session.
//!
//! A single driver task owns the shell channel. It multiplexes remote output
//! (pushed to the client channel in order) with write/resize commands from
//! the handler, so no lock is held across remote I/O. When the remote side
//! hangs up the driver closes everything and removes the registry entry.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::SessionKey;
use crate::config::TerminalConfig;
use crate::connection::{ConnectionError, PtySize, RemoteConnection, ShellChannel};
use crate::error::{Error, Result};
use crate::handler::OutboundMessage;

/// Lifecycle of a terminal session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    Connecting,
    Open,
    Closed,
}

enum ShellCommand {
    Write(Vec<u8>),
    Resize(PtySize),
}

/// One interactive shell bound to a registry entry
pub struct TerminalSession {
    key: SessionKey,
    state: Mutex<TerminalState>,
    created_at: DateTime<Utc>,
    last_activity: Arc<AtomicI64>,
    commands: mpsc::Sender<ShellCommand>,
    shutdown: CancellationToken,
    driver: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TerminalSession {
    /// Open a PTY shell on `connection` and start streaming.
    ///
    /// On failure the connection is closed and the session never becomes
    /// `Open`.
    pub(crate) async fn connect<F>(
        key: SessionKey,
        connection: Arc<dyn RemoteConnection>,
        config: &TerminalConfig,
        size: PtySize,
        output: mpsc::Sender<OutboundMessage>,
        timeout: Duration,
        on_remote_close: F,
    ) -> Result<Arc<Self>>
    where
        F: FnOnce() + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(config.input_buffer.max(1));
        let now = Utc::now();
        let session = Arc::new(Self {
            key,
            state: Mutex::new(TerminalState::Connecting),
            created_at: now,
            last_activity: Arc::new(AtomicI64::new(now.timestamp_millis())),
            commands: tx,
            shutdown: CancellationToken::new(),
            driver: tokio::sync::Mutex::new(None),
        });

        let shell = match tokio::time::timeout(timeout, connection.open_shell(&config.term, size))
            .await
            .map_err(|_| ConnectionError::Timeout(timeout))
            .and_then(|r| r)
        {
            Ok(shell) => shell,
            Err(e) => {
                *session.state.lock() = TerminalState::Closed;
                let _ = connection.close().await;
                return Err(e.into());
            }
        };

        *session.state.lock() = TerminalState::Open;
        let driver = ShellDriver {
            key: session.key.clone(),
            shell,
            connection,
            commands: rx,
            output,
            shutdown: session.shutdown.clone(),
            last_activity: Arc::clone(&session.last_activity),
        };
        let weak = Arc::downgrade(&session);
        let handle = tokio::spawn(async move {
            let remote_closed = driver.run().await;
            if let Some(session) = weak.upgrade() {
                *session.state.lock() = TerminalState::Closed;
            }
            if remote_closed {
                on_remote_close();
            }
        });
        *session.driver.lock().await = Some(handle);

        Ok(session)
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn state(&self) -> TerminalState {
        *self.state.lock()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        let millis = self.last_activity.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or(self.created_at)
    }

    /// Refresh the activity timestamp (inbound keepalive)
    pub fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Send bytes to the remote shell
    pub async fn write(&self, data: Vec<u8>) -> Result<()> {
        if self.state() != TerminalState::Open {
            return Err(Error::SessionClosed);
        }
        self.touch();
        self.commands
            .send(ShellCommand::Write(data))
            .await
            .map_err(|_| Error::SessionClosed)
    }

    /// Best-effort terminal resize; ignored unless the session is open
    pub async fn resize(&self, size: PtySize) {
        if self.state() != TerminalState::Open {
            trace!(session_id = %self.key.session_id, "Resize ignored, terminal not open");
            return;
        }
        let _ = self.commands.send(ShellCommand::Resize(size)).await;
    }

    /// Stop the driver and release the shell and connection. Idempotent.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state == TerminalState::Closed && self.shutdown.is_cancelled() {
                return Ok(());
            }
            *state = TerminalState::Closed;
        }
        self.shutdown.cancel();

        let handle = self.driver.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(session_id = %self.key.session_id, error = %e, "Terminal driver panicked");
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSession")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

struct ShellDriver {
    key: SessionKey,
    shell: Box<dyn ShellChannel>,
    connection: Arc<dyn RemoteConnection>,
    commands: mpsc::Receiver<ShellCommand>,
    output: mpsc::Sender<OutboundMessage>,
    shutdown: CancellationToken,
    last_activity: Arc<AtomicI64>,
}

impl ShellDriver {
    /// Pump until shutdown or remote close. Returns true if the remote side
    /// (or the client queue) ended the session.
    async fn run(mut self) -> bool {
        debug!(channel_id = %self.key.channel_id, session_id = %self.key.session_id, "Terminal driver started");
        let remote_closed = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break false,
                command = self.commands.recv() => match command {
                    Some(ShellCommand::Write(data)) => {
                        if let Err(e) = self.shell.write(&data).await {
                            warn!(session_id = %self.key.session_id, error = %e, "Shell write failed");
                            break true;
                        }
                    }
                    Some(ShellCommand::Resize(size)) => {
                        if let Err(e) = self.shell.resize(size).await {
                            debug!(session_id = %self.key.session_id, error = %e, "Shell resize failed");
                        }
                    }
                    None => break false,
                },
                read = self.shell.read() => match read {
                    Ok(Some(bytes)) => {
                        self.last_activity.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                        let message = OutboundMessage::data(&self.key.session_id, &bytes);
                        // Bounded queue: a slow client stalls this shell only
                        let delivered = tokio::select! {
                            _ = self.shutdown.cancelled() => break false,
                            sent = self.output.send(message) => sent.is_ok(),
                        };
                        if !delivered {
                            debug!(session_id = %self.key.session_id, "Client queue closed");
                            break true;
                        }
                    }
                    Ok(None) => {
                        info!(session_id = %self.key.session_id, "Remote shell closed");
                        break true;
                    }
                    Err(e) => {
                        warn!(session_id = %self.key.session_id, error = %e, "Shell read failed");
                        break true;
                    }
                },
            }
        };

        if let Err(e) = self.shell.close().await {
            trace!(session_id = %self.key.session_id, error = %e, "Shell close failed");
        }
        if let Err(e) = self.connection.close().await {
            trace!(session_id = %self.key.session_id, error = %e, "Connection close failed");
        }
        if remote_closed {
            let _ = self
                .output
                .try_send(OutboundMessage::closed(&self.key.session_id, "remote closed"));
        }
        debug!(session_id = %self.key.session_id, "Terminal driver stopped");
        remote_closed
    }
}
