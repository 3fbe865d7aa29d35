//! Session registry and the two live session variants.
//!
//! The [`SessionRegistry`] owns every live [`Session`] of the process, keyed
//! by [`SessionKey`] (client channel id + session id). It is the only place
//! sessions are created or destroyed:
//!
//! - `open` reserves the key before connecting, so two concurrent opens of
//!   the same key cannot both reach the connection factory
//! - `close` and `close_all` are idempotent and may run from any task
//! - a terminal whose remote side hangs up removes its own entry, but only
//!   if the entry still belongs to that terminal instance

pub mod sftp;
pub mod terminal;

pub use sftp::{OpenMode, SftpSession, SftpStream};
pub use terminal::{TerminalSession, TerminalState};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{SftpConfig, TerminalConfig};
use crate::connection::{ConnectParams, ConnectionError, PtySize, RemoteConnector};
use crate::error::{Error, Result};
use crate::handler::OutboundMessage;

/// Identifies one live session within the registry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub channel_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(channel_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            session_id: session_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.channel_id, self.session_id)
    }
}

/// What kind of session `open` should create
#[derive(Debug, Clone)]
pub enum SessionVariant {
    /// Interactive shell; output is pushed to `output`
    Terminal {
        size: PtySize,
        output: mpsc::Sender<OutboundMessage>,
    },
    Sftp,
}

/// A live session
#[derive(Clone)]
pub enum Session {
    Terminal(Arc<TerminalSession>),
    Sftp(Arc<SftpSession>),
}

impl Session {
    pub fn key(&self) -> &SessionKey {
        match self {
            Session::Terminal(t) => t.key(),
            Session::Sftp(s) => s.key(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Session::Terminal(_) => "terminal",
            Session::Sftp(_) => "sftp",
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Session::Terminal(t) => t.state() == TerminalState::Closed,
            Session::Sftp(s) => s.is_closed(),
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Session::Terminal(t) => t.created_at(),
            Session::Sftp(s) => s.created_at(),
        }
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        match self {
            Session::Terminal(t) => t.last_activity(),
            Session::Sftp(s) => s.last_activity(),
        }
    }

    /// Release the remote channel and connection. Idempotent.
    pub async fn close(&self) -> Result<()> {
        match self {
            Session::Terminal(t) => t.close().await,
            Session::Sftp(s) => s.close().await,
        }
    }

    pub fn as_terminal(&self) -> Result<&Arc<TerminalSession>> {
        match self {
            Session::Terminal(t) => Ok(t),
            Session::Sftp(s) => Err(Error::SessionVariantMismatch {
                session_id: s.key().session_id.clone(),
                expected: "terminal",
            }),
        }
    }

    pub fn as_sftp(&self) -> Result<&Arc<SftpSession>> {
        match self {
            Session::Sftp(s) => Ok(s),
            Session::Terminal(t) => Err(Error::SessionVariantMismatch {
                session_id: t.key().session_id.clone(),
                expected: "sftp",
            }),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("kind", &self.kind())
            .field("key", self.key())
            .field("closed", &self.is_closed())
            .finish()
    }
}

enum SlotState {
    /// Key reserved while the connection is being established
    Connecting,
    Live(Session),
}

struct Slot {
    instance: u64,
    state: SlotState,
}

type SessionTable = Mutex<HashMap<SessionKey, Slot>>;

/// Remove `key` only if it still holds `instance`
fn remove_instance(table: &SessionTable, key: &SessionKey, instance: u64) -> Option<Slot> {
    let mut sessions = table.lock();
    match sessions.get(key) {
        Some(slot) if slot.instance == instance => sessions.remove(key),
        _ => None,
    }
}

/// Process-wide table of live sessions
pub struct SessionRegistry {
    sessions: Arc<SessionTable>,
    connector: Arc<dyn RemoteConnector>,
    terminal: TerminalConfig,
    sftp: SftpConfig,
    next_instance: AtomicU64,
}

impl SessionRegistry {
    pub fn new(
        connector: Arc<dyn RemoteConnector>,
        terminal: TerminalConfig,
        sftp: SftpConfig,
    ) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            connector,
            terminal,
            sftp,
            next_instance: AtomicU64::new(0),
        }
    }

    /// Create a session under `key`.
    ///
    /// Fails with `SessionAlreadyPresent` if a live or connecting session
    /// holds the key, and with `Connection` if the remote side cannot be
    /// reached within `params.connect_timeout`.
    pub async fn open(
        &self,
        key: SessionKey,
        variant: SessionVariant,
        params: &ConnectParams,
    ) -> Result<Session> {
        let instance = self.reserve(&key)?;
        info!(
            channel_id = %key.channel_id,
            session_id = %key.session_id,
            host_id = params.host_id,
            "Opening session"
        );

        let session = match self.connect(&key, variant, params, instance).await {
            Ok(session) => session,
            Err(e) => {
                remove_instance(&self.sessions, &key, instance);
                warn!(
                    channel_id = %key.channel_id,
                    session_id = %key.session_id,
                    error = %e,
                    "Failed to open session"
                );
                return Err(e);
            }
        };

        let published = {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(&key) {
                Some(slot) if slot.instance == instance => {
                    slot.state = SlotState::Live(session.clone());
                    true
                }
                _ => false,
            }
        };

        if !published {
            // Closed while connecting
            debug!(channel_id = %key.channel_id, session_id = %key.session_id, "Session closed during open");
            let _ = session.close().await;
            return Err(Error::SessionClosed);
        }

        info!(
            channel_id = %key.channel_id,
            session_id = %key.session_id,
            kind = session.kind(),
            "Session opened"
        );
        Ok(session)
    }

    fn reserve(&self, key: &SessionKey) -> Result<u64> {
        let mut sessions = self.sessions.lock();
        if let Some(slot) = sessions.get(key) {
            let stale = matches!(&slot.state, SlotState::Live(s) if s.is_closed());
            if !stale {
                return Err(Error::session_present(&key.channel_id, &key.session_id));
            }
        }
        let instance = self.next_instance.fetch_add(1, Ordering::Relaxed) + 1;
        sessions.insert(
            key.clone(),
            Slot {
                instance,
                state: SlotState::Connecting,
            },
        );
        Ok(instance)
    }

    async fn connect(
        &self,
        key: &SessionKey,
        variant: SessionVariant,
        params: &ConnectParams,
        instance: u64,
    ) -> Result<Session> {
        let timeout = params.connect_timeout;
        let connection = tokio::time::timeout(timeout, self.connector.open_session(params))
            .await
            .map_err(|_| ConnectionError::Timeout(timeout))??;

        match variant {
            SessionVariant::Terminal { size, output } => {
                let table: Weak<SessionTable> = Arc::downgrade(&self.sessions);
                let owner = key.clone();
                let on_remote_close = move || {
                    if let Some(table) = table.upgrade() {
                        if remove_instance(&table, &owner, instance).is_some() {
                            debug!(channel_id = %owner.channel_id, session_id = %owner.session_id, "Terminal removed after remote close");
                        }
                    }
                };
                let terminal = TerminalSession::connect(
                    key.clone(),
                    connection,
                    &self.terminal,
                    size,
                    output,
                    timeout,
                    on_remote_close,
                )
                .await?;
                Ok(Session::Terminal(terminal))
            }
            SessionVariant::Sftp => {
                let sftp =
                    SftpSession::connect(key.clone(), connection, &params.charset, &self.sftp, timeout)
                        .await?;
                Ok(Session::Sftp(sftp))
            }
        }
    }

    /// Look up a live session
    pub fn get(&self, key: &SessionKey) -> Option<Session> {
        match self.sessions.lock().get(key) {
            Some(Slot {
                state: SlotState::Live(session),
                ..
            }) if !session.is_closed() => Some(session.clone()),
            _ => None,
        }
    }

    /// Whether a live or connecting session holds `key`
    pub fn contains(&self, key: &SessionKey) -> bool {
        match self.sessions.lock().get(key) {
            Some(Slot {
                state: SlotState::Live(session),
                ..
            }) => !session.is_closed(),
            Some(_) => true,
            None => false,
        }
    }

    /// Close and remove the session under `key`. Idempotent.
    pub async fn close(&self, key: &SessionKey) -> Result<()> {
        let slot = self.sessions.lock().remove(key);
        match slot {
            Some(Slot {
                state: SlotState::Live(session),
                ..
            }) => {
                info!(channel_id = %key.channel_id, session_id = %key.session_id, "Closing session");
                session.close().await
            }
            Some(_) => {
                debug!(channel_id = %key.channel_id, session_id = %key.session_id, "Cancelled session still connecting");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Close every session of a client channel. Failures are logged, never raised.
    pub async fn close_all(&self, channel_id: &str) {
        let slots: Vec<(SessionKey, Slot)> = {
            let mut sessions = self.sessions.lock();
            let keys: Vec<SessionKey> = sessions
                .keys()
                .filter(|k| k.channel_id == channel_id)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|k| sessions.remove(&k).map(|slot| (k, slot)))
                .collect()
        };

        info!(channel_id = %channel_id, count = slots.len(), "Closing all sessions of channel");
        for (key, slot) in slots {
            if let SlotState::Live(session) = slot.state {
                if let Err(e) = session.close().await {
                    warn!(
                        channel_id = %key.channel_id,
                        session_id = %key.session_id,
                        error = %e,
                        "Failed to close session"
                    );
                }
            }
        }
    }

    /// Keys of every session registered under a client channel
    pub fn sessions_of(&self, channel_id: &str) -> Vec<SessionKey> {
        let mut keys: Vec<SessionKey> = self
            .sessions
            .lock()
            .keys()
            .filter(|k| k.channel_id == channel_id)
            .cloned()
            .collect();
        keys.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        keys
    }

    /// Number of registered sessions
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
