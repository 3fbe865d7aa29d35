//! Client channel protocol.
//!
//! A client channel carries JSON messages for many sessions at once:
//!
//! ```json
//! {"type": "CONNECT", "sessionId": "s-1", "payload": {"hostId": 3, "kind": "TERMINAL"}}
//! {"type": "CONNECT", "sessionId": "s-1", "result": true}
//! ```
//!
//! The [`TerminalDispatcher`] routes each inbound message to the session
//! registry and always answers requests with an outcome message. Stream
//! messages (DATA, RESIZE) are only answered when they fail.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::KvCache;
use crate::config::{CheckConfig, TerminalConfig};
use crate::connection::{ConnectParams, HostResolver, PtySize};
use crate::error::{Error, Result};
use crate::session::{Session, SessionKey, SessionRegistry, SessionVariant};

/// Message types on the client channel (wire-stable names)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Pre-flight before CONNECT
    Check,
    Connect,
    /// Terminal bytes, in both directions
    #[serde(alias = "INPUT")]
    Data,
    Resize,
    SftpList,
    SftpStat,
    SftpTruncate,
    SftpRename,
    SftpChmod,
    SftpRemove,
    SftpMkdir,
    SftpGetContent,
    SftpSetContent,
    Close,
    Ping,
    Pong,
    Error,
}

/// Message from the client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub payload: Value,
}

impl InboundMessage {
    pub fn new(kind: MessageType, session_id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            session_id: session_id.into(),
            payload,
        }
    }
}

/// Message to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub session_id: String,
    pub result: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl OutboundMessage {
    pub fn ok(kind: MessageType, session_id: &str) -> Self {
        Self {
            kind,
            session_id: session_id.to_string(),
            result: true,
            message: None,
            body: None,
        }
    }

    pub fn ok_with(kind: MessageType, session_id: &str, body: Value) -> Self {
        Self {
            body: Some(body),
            ..Self::ok(kind, session_id)
        }
    }

    pub fn error(kind: MessageType, session_id: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            session_id: session_id.to_string(),
            result: false,
            message: Some(message.into()),
            body: None,
        }
    }

    /// Terminal output; bytes travel base64 encoded in `body`
    pub fn data(session_id: &str, bytes: &[u8]) -> Self {
        Self::ok_with(MessageType::Data, session_id, Value::String(STANDARD.encode(bytes)))
    }

    /// The session ended without the client asking
    pub fn closed(session_id: &str, reason: &str) -> Self {
        Self {
            message: Some(reason.to_string()),
            ..Self::ok(MessageType::Close, session_id)
        }
    }

    /// Decode the bytes of a DATA message
    pub fn data_bytes(&self) -> Option<Vec<u8>> {
        match (&self.kind, &self.body) {
            (MessageType::Data, Some(Value::String(encoded))) => STANDARD.decode(encoded).ok(),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Sending half of one client connection
#[derive(Debug, Clone)]
pub struct ClientChannel {
    pub id: String,
    tx: mpsc::Sender<OutboundMessage>,
}

impl ClientChannel {
    /// Create a channel with a bounded outbound queue
    pub fn new(id: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { id: id.into(), tx }, rx)
    }

    pub fn sender(&self) -> mpsc::Sender<OutboundMessage> {
        self.tx.clone()
    }

    /// Queue a message; dropped with a warning once the client is gone
    pub async fn send(&self, message: OutboundMessage) {
        if self.tx.send(message).await.is_err() {
            warn!(channel_id = %self.id, "Client channel closed, message dropped");
        }
    }
}

/// Session flavour requested by CONNECT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionKind {
    #[default]
    Terminal,
    Sftp,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckPayload {
    host_id: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ConnectPayload {
    host_id: Option<u64>,
    kind: SessionKind,
    cols: Option<u32>,
    rows: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct DataPayload {
    data: String,
}

#[derive(Debug, Deserialize)]
struct ResizePayload {
    cols: u32,
    rows: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PathPayload {
    path: String,
    #[serde(default)]
    show_hidden: bool,
}

#[derive(Debug, Deserialize)]
struct RenamePayload {
    from: String,
    to: String,
}

#[derive(Debug, Deserialize)]
struct ChmodPayload {
    path: String,
    /// Octal digits, e.g. `"755"`
    mode: String,
}

#[derive(Debug, Deserialize)]
struct ContentPayload {
    path: String,
    content: String,
}

fn parse_payload<T: DeserializeOwned>(payload: Value) -> Result<T> {
    let payload = match payload {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    serde_json::from_value(payload).map_err(|e| Error::InvalidMessage(e.to_string()))
}

fn parse_mode(mode: &str) -> Result<u32> {
    u32::from_str_radix(mode.trim_start_matches("0o"), 8)
        .ok()
        .filter(|m| *m <= 0o7777)
        .ok_or_else(|| Error::InvalidMessage(format!("invalid permission mode: {}", mode)))
}

/// Cache key of the connect parameters stashed by CHECK
pub fn check_cache_key(key: &SessionKey) -> String {
    format!("check:{}:{}", key.channel_id, key.session_id)
}

/// Routes client channel messages to sessions
pub struct TerminalDispatcher {
    registry: Arc<SessionRegistry>,
    resolver: Arc<dyn HostResolver>,
    cache: Arc<dyn KvCache>,
    terminal: TerminalConfig,
    check: CheckConfig,
}

impl TerminalDispatcher {
    pub fn new(
        registry: Arc<SessionRegistry>,
        resolver: Arc<dyn HostResolver>,
        cache: Arc<dyn KvCache>,
        terminal: TerminalConfig,
        check: CheckConfig,
    ) -> Self {
        Self {
            registry,
            resolver,
            cache,
            terminal,
            check,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Parse and handle one raw text frame
    pub async fn handle_text(&self, channel: &ClientChannel, text: &str) {
        match serde_json::from_str::<InboundMessage>(text) {
            Ok(message) => self.handle(channel, message).await,
            Err(e) => {
                debug!(channel_id = %channel.id, error = %e, "Unparseable client message");
                channel
                    .send(OutboundMessage::error(
                        MessageType::Error,
                        "",
                        format!("invalid message: {}", e),
                    ))
                    .await;
            }
        }
    }

    /// Handle one message, answering with its outcome
    pub async fn handle(&self, channel: &ClientChannel, message: InboundMessage) {
        let kind = message.kind;
        let session_id = message.session_id.clone();
        match self.dispatch(channel, message).await {
            Ok(Some(reply)) => channel.send(reply).await,
            Ok(None) => {}
            Err(e) => {
                debug!(channel_id = %channel.id, session_id = %session_id, kind = ?kind, error = %e, "Client request failed");
                channel
                    .send(OutboundMessage::error(kind, &session_id, e.to_string()))
                    .await;
            }
        }
    }

    /// Close every session of a client connection that went away
    pub async fn on_disconnect(&self, channel_id: &str) {
        info!(channel_id = %channel_id, "Client channel disconnected");
        self.registry.close_all(channel_id).await;
    }

    async fn dispatch(
        &self,
        channel: &ClientChannel,
        message: InboundMessage,
    ) -> Result<Option<OutboundMessage>> {
        let key = SessionKey::new(&channel.id, &message.session_id);
        let sid = message.session_id.as_str();
        let reply = match message.kind {
            MessageType::Check => {
                self.check(&key, parse_payload(message.payload)?).await?;
                OutboundMessage::ok(MessageType::Check, sid)
            }
            MessageType::Connect => {
                let kind = self
                    .connect(channel, &key, parse_payload(message.payload)?)
                    .await?;
                OutboundMessage::ok_with(MessageType::Connect, sid, json!({ "kind": kind }))
            }
            MessageType::Data => {
                let payload: DataPayload = parse_payload(message.payload)?;
                let session = self.session(&key)?;
                session.as_terminal()?.write(payload.data.into_bytes()).await?;
                return Ok(None);
            }
            MessageType::Resize => {
                let payload: ResizePayload = parse_payload(message.payload)?;
                let session = self.session(&key)?;
                session
                    .as_terminal()?
                    .resize(PtySize::new(payload.cols, payload.rows))
                    .await;
                return Ok(None);
            }
            MessageType::SftpList => {
                let payload: PathPayload = parse_payload(message.payload)?;
                let session = self.session(&key)?;
                let entries = session
                    .as_sftp()?
                    .list(&payload.path, payload.show_hidden)
                    .await?;
                OutboundMessage::ok_with(MessageType::SftpList, sid, serde_json::to_value(entries)?)
            }
            MessageType::SftpStat => {
                let payload: PathPayload = parse_payload(message.payload)?;
                let session = self.session(&key)?;
                let stat = session.as_sftp()?.stat(&payload.path).await?;
                OutboundMessage::ok_with(MessageType::SftpStat, sid, serde_json::to_value(stat)?)
            }
            MessageType::SftpTruncate => {
                let payload: PathPayload = parse_payload(message.payload)?;
                let session = self.session(&key)?;
                session.as_sftp()?.truncate(&payload.path).await?;
                OutboundMessage::ok(MessageType::SftpTruncate, sid)
            }
            MessageType::SftpRename => {
                let payload: RenamePayload = parse_payload(message.payload)?;
                let session = self.session(&key)?;
                session.as_sftp()?.rename(&payload.from, &payload.to).await?;
                OutboundMessage::ok(MessageType::SftpRename, sid)
            }
            MessageType::SftpChmod => {
                let payload: ChmodPayload = parse_payload(message.payload)?;
                let mode = parse_mode(&payload.mode)?;
                let session = self.session(&key)?;
                session.as_sftp()?.chmod(&payload.path, mode).await?;
                OutboundMessage::ok(MessageType::SftpChmod, sid)
            }
            MessageType::SftpRemove => {
                let payload: PathPayload = parse_payload(message.payload)?;
                let session = self.session(&key)?;
                session.as_sftp()?.remove(&payload.path).await?;
                OutboundMessage::ok(MessageType::SftpRemove, sid)
            }
            MessageType::SftpMkdir => {
                let payload: PathPayload = parse_payload(message.payload)?;
                let session = self.session(&key)?;
                session.as_sftp()?.mkdirs(&payload.path).await?;
                OutboundMessage::ok(MessageType::SftpMkdir, sid)
            }
            MessageType::SftpGetContent => {
                let payload: PathPayload = parse_payload(message.payload)?;
                let session = self.session(&key)?;
                let content = session.as_sftp()?.get_content(&payload.path).await?;
                OutboundMessage::ok_with(
                    MessageType::SftpGetContent,
                    sid,
                    json!({ "path": payload.path, "content": String::from_utf8_lossy(&content) }),
                )
            }
            MessageType::SftpSetContent => {
                let payload: ContentPayload = parse_payload(message.payload)?;
                let session = self.session(&key)?;
                session
                    .as_sftp()?
                    .set_content(&payload.path, payload.content.as_bytes())
                    .await?;
                OutboundMessage::ok(MessageType::SftpSetContent, sid)
            }
            MessageType::Close => {
                self.registry.close(&key).await?;
                self.cache.delete(&check_cache_key(&key)).await;
                OutboundMessage::ok(MessageType::Close, sid)
            }
            MessageType::Ping => OutboundMessage::ok(MessageType::Pong, sid),
            MessageType::Pong | MessageType::Error => {
                return Err(Error::InvalidMessage(format!(
                    "{:?} is not accepted from clients",
                    message.kind
                )))
            }
        };
        Ok(Some(reply))
    }

    fn session(&self, key: &SessionKey) -> Result<Session> {
        self.registry
            .get(key)
            .ok_or_else(|| Error::session_not_found(&key.channel_id, &key.session_id))
    }

    /// Refuse duplicates and unknown hosts, then stash the connect parameters
    async fn check(&self, key: &SessionKey, payload: CheckPayload) -> Result<()> {
        if self.registry.contains(key) {
            return Err(Error::session_present(&key.channel_id, &key.session_id));
        }
        let params = self
            .resolver
            .resolve(payload.host_id)
            .await
            .ok_or(Error::HostNotFound(payload.host_id))?;
        self.cache
            .set(
                &check_cache_key(key),
                serde_json::to_string(&params)?,
                Some(self.check.cache_ttl),
            )
            .await;
        debug!(channel_id = %key.channel_id, session_id = %key.session_id, host_id = payload.host_id, "Check passed");
        Ok(())
    }

    async fn connect(
        &self,
        channel: &ClientChannel,
        key: &SessionKey,
        payload: ConnectPayload,
    ) -> Result<SessionKind> {
        let params = self.connect_params(key, payload.host_id).await?;
        let variant = match payload.kind {
            SessionKind::Terminal => SessionVariant::Terminal {
                size: PtySize::new(
                    payload.cols.unwrap_or(self.terminal.cols),
                    payload.rows.unwrap_or(self.terminal.rows),
                ),
                output: channel.sender(),
            },
            SessionKind::Sftp => SessionVariant::Sftp,
        };
        self.registry.open(key.clone(), variant, &params).await?;
        Ok(payload.kind)
    }

    /// Parameters stashed by CHECK, or a fresh resolution of `host_id`
    async fn connect_params(&self, key: &SessionKey, host_id: Option<u64>) -> Result<ConnectParams> {
        let cache_key = check_cache_key(key);
        if let Some(stashed) = self.cache.get(&cache_key).await {
            self.cache.delete(&cache_key).await;
            return Ok(serde_json::from_str(&stashed)?);
        }
        let host_id = host_id.ok_or_else(|| {
            Error::InvalidMessage("CONNECT without a prior CHECK needs a hostId".to_string())
        })?;
        self.resolver
            .resolve(host_id)
            .await
            .ok_or(Error::HostNotFound(host_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_inbound_wire_format() {
        let message: InboundMessage = serde_json::from_str(
            r#"{"type":"SFTP_GET_CONTENT","sessionId":"s-1","payload":{"path":"/etc/hosts"}}"#,
        )
        .unwrap();
        assert_eq!(message.kind, MessageType::SftpGetContent);
        assert_eq!(message.session_id, "s-1");

        let input: InboundMessage =
            serde_json::from_str(r#"{"type":"INPUT","sessionId":"s-1"}"#).unwrap();
        assert_eq!(input.kind, MessageType::Data);
        assert_eq!(input.payload, Value::Null);
    }

    #[test]
    fn test_outbound_wire_format() {
        let json = OutboundMessage::error(MessageType::Connect, "s-1", "boom")
            .to_json()
            .unwrap();
        assert_eq!(
            json,
            r#"{"type":"CONNECT","sessionId":"s-1","result":false,"message":"boom"}"#
        );
    }

    #[test]
    fn test_data_is_base64() {
        let message = OutboundMessage::data("s-1", b"\x1b[0mok\r\n");
        assert_eq!(message.data_bytes().unwrap(), b"\x1b[0mok\r\n".to_vec());
        assert!(matches!(message.body, Some(Value::String(_))));
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("755").unwrap(), 0o755);
        assert_eq!(parse_mode("0o644").unwrap(), 0o644);
        assert!(parse_mode("999").is_err());
        assert!(parse_mode("17777").is_err());
    }

    #[test]
    fn test_check_cache_key() {
        assert_eq!(check_cache_key(&SessionKey::new("c", "s")), "check:c:s");
    }
}
