//! # Hostrelay - Remote Host Session & Transfer Engine
//!
//! Hostrelay bridges persistent client connections to live sessions on
//! remote hosts. One client channel multiplexes many interactive terminals
//! and SFTP sessions; batch file transfers and batch commands run on their
//! own workers and report per-item status through an abstract record store.
//!
//! ## Core Concepts
//!
//! - **Sessions**: terminal or SFTP sessions keyed by (channel id, session id)
//! - **Transfer tasks**: files moved sequentially over one SFTP connection per host
//! - **Batch commands**: one command or script run on many hosts, each with its own timeout
//! - **Timeout checker**: one background loop firing expired deadlines exactly once
//! - **Connection factory**: the trait boundary to the SSH transport
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                     Client channel (handler)                         │
//! │            CHECK / CONNECT / DATA / RESIZE / SFTP_* / CLOSE          │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        Session Registry                              │
//! │               (Terminal and SFTP sessions per key)                   │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                    │
//!          ┌─────────────────────────┼─────────────────────────┐
//!          ▼                         ▼                         ▼
//! ┌─────────────────┐   ┌─────────────────────┐   ┌─────────────────────┐
//! │ Transfer workers│   │   Batch executor    │   │   Timeout checker   │
//! │ (per task+host) │   │   (per host)        │   │   (single loop)     │
//! └─────────────────┘   └─────────────────────┘   └─────────────────────┘
//!          │                         │
//!          └────────────┬────────────┘
//!                       ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                 Connection factory (russh, russh-sftp)               │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use hostrelay::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = EngineConfig::load(None).map_err(|e| Error::Config(e.to_string()))?;
//!     let connector = Arc::new(RusshConnector::new(config.connect.clone()));
//!     let registry = SessionRegistry::new(connector, config.terminal.clone(), config.sftp.clone());
//!
//!     let params = ConnectParams::new(1, "10.0.0.5", "deploy");
//!     let session = registry
//!         .open(SessionKey::new("ch-1", "s-1"), SessionVariant::Sftp, &params)
//!         .await?;
//!     for entry in session.as_sftp()?.list("/var/log", false).await? {
//!         println!("{}", entry.name);
//!     }
//!     registry.close_all("ch-1").await;
//!     Ok(())
//! }
//! ```

/// Prelude with the types most callers need
pub mod prelude {
    pub use std::sync::Arc;

    pub use crate::cache::{KvCache, MemoryCache};
    pub use crate::config::EngineConfig;
    pub use crate::connection::{
        AuthMethod, ConnectParams, ConnectionError, HostResolver, OsType, PtySize,
        RemoteConnection, RemoteConnector, StaticHostResolver,
    };
    #[cfg(feature = "russh")]
    pub use crate::connection::russh::RusshConnector;
    pub use crate::error::{Error, Result};
    pub use crate::exec::{
        BatchExecutor, BatchHandle, ExecCommand, ExecContext, ExecHostOutcome, ExecHostStatus,
    };
    pub use crate::handler::{ClientChannel, InboundMessage, MessageType, OutboundMessage, TerminalDispatcher};
    pub use crate::session::{Session, SessionKey, SessionRegistry, SessionVariant};
    pub use crate::store::{ExecHostStore, MemoryStore, TransferFileStore};
    pub use crate::timeout::TimeoutChecker;
    pub use crate::transfer::{
        FsLocalStore, TransferContext, TransferDirection, TransferFileSpec, TransferFileStatus,
        TransferManager,
    };
}

// ============================================================================
// Foundations
// ============================================================================

/// Error types and the crate `Result` alias.
pub mod error;

/// Engine configuration loaded from TOML.
pub mod config;

/// Structured logging setup over tracing-subscriber.
pub mod logging;

/// Key-value cache used between CHECK and CONNECT.
pub mod cache;

/// Record store contract and the in-memory store.
pub mod store;

// ============================================================================
// Remote connections
// ============================================================================

/// Connection factory traits and the russh implementation.
///
/// Everything above this layer talks to remote hosts through
/// [`RemoteConnector`](connection::RemoteConnector) and the channel traits,
/// which keeps the engine testable without a network.
pub mod connection;

// ============================================================================
// Engine
// ============================================================================

/// Shared deadline tracking with single-fire guards.
pub mod timeout;

/// Session registry with terminal and SFTP sessions.
pub mod session;

/// Batch file transfer workers.
pub mod transfer;

/// Batch command execution across hosts.
pub mod exec;

/// Client channel protocol and dispatcher.
pub mod handler;

// ============================================================================
// Version Information
// ============================================================================

/// Returns the current version of Hostrelay.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
