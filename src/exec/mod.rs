//! Batch command execution.
//!
//! A batch runs one command (or one uploaded script) on a set of hosts. Each
//! host gets its own record, its own connection, its own timeout and its own
//! transcript, and ends in exactly one terminal status:
//!
//! ```text
//! WAITING -> RUNNING -> COMPLETED | FAILED | INTERRUPTED | TIMEOUT
//! ```
//!
//! Hosts are independent. Interrupting one host, or one host timing out,
//! never touches its siblings; [`BatchHandle::interrupt`] stops them all.

pub mod banner;
pub mod handler;
pub mod log;

pub use handler::ExecHostHandler;
pub use log::{ExecLogStore, FsExecLogStore, MemoryExecLogStore};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ExecConfig;
use crate::connection::{ConnectParams, HostResolver, OsType, RemoteConnector};
use crate::error::Result;
use crate::store::{ExecHostRecord, ExecHostStore};
use crate::timeout::TimeoutChecker;

/// `@{{ name }}` placeholders in batch commands
static PARAM_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("Invalid param regex"));

/// Operator id that is never shown next to the operator name
pub const SYSTEM_USER_ID: u64 = 0;

/// Status of one host of a batch command (wire-stable names)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecHostStatus {
    Waiting,
    Running,
    Completed,
    Failed,
    Interrupted,
    Timeout,
}

impl ExecHostStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecHostStatus::Completed
                | ExecHostStatus::Failed
                | ExecHostStatus::Interrupted
                | ExecHostStatus::Timeout
        )
    }

    /// Strict progression: WAITING to RUNNING, RUNNING to any terminal status
    pub fn can_transition_to(&self, next: ExecHostStatus) -> bool {
        match self {
            ExecHostStatus::Waiting => next == ExecHostStatus::Running,
            ExecHostStatus::Running => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecHostStatus::Waiting => "WAITING",
            ExecHostStatus::Running => "RUNNING",
            ExecHostStatus::Completed => "COMPLETED",
            ExecHostStatus::Failed => "FAILED",
            ExecHostStatus::Interrupted => "INTERRUPTED",
            ExecHostStatus::Timeout => "TIMEOUT",
        }
    }
}

impl fmt::Display for ExecHostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A batch command as submitted by the operator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecCommand {
    pub exec_id: u64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub user_id: u64,
    #[serde(default)]
    pub username: String,
    /// Position of this run in a sequence of runs, shown in the banner
    #[serde(default)]
    pub exec_seq: Option<u32>,
    /// Zero means no timeout
    #[serde(with = "humantime_serde", default)]
    pub timeout: Duration,
    /// Upload `command` as a script and run the script
    #[serde(default)]
    pub script_exec: bool,
    /// Command template; may contain `@{{ name }}` placeholders
    pub command: String,
    /// Caller-supplied placeholder values
    #[serde(default)]
    pub params: HashMap<String, String>,
}

impl ExecCommand {
    pub fn new(exec_id: u64, command: impl Into<String>) -> Self {
        Self {
            exec_id,
            description: String::new(),
            user_id: SYSTEM_USER_ID,
            username: String::new(),
            exec_seq: None,
            timeout: Duration::ZERO,
            script_exec: false,
            command: command.into(),
            params: HashMap::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_script(mut self, script_exec: bool) -> Self {
        self.script_exec = script_exec;
        self
    }

    pub fn with_operator(mut self, user_id: u64, username: impl Into<String>) -> Self {
        self.user_id = user_id;
        self.username = username.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }
}

/// One host's share of a batch command
#[derive(Debug, Clone)]
pub struct ExecHostCommand {
    /// Id of the host's record in the store
    pub id: u64,
    pub exec_id: u64,
    pub host_id: u64,
    pub host_name: String,
    pub host_address: String,
    /// Command rendered for this host
    pub command: String,
    /// Remote script location when the command runs as a script
    pub script_path: Option<String>,
    pub timeout: Duration,
    /// `None` when the host could not be resolved
    pub params: Option<ConnectParams>,
}

/// Final outcome of one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecHostOutcome {
    pub id: u64,
    pub host_id: u64,
    pub status: ExecHostStatus,
    pub exit_code: Option<i32>,
}

/// Substitute `@{{ name }}` placeholders. Unknown names are left untouched.
pub fn render_command(template: &str, vars: &HashMap<String, String>) -> String {
    PARAM_REGEX
        .replace_all(template, |caps: &regex::Captures<'_>| {
            vars.get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Built-in placeholder values for one host, overridden by caller params
fn host_vars(command: &ExecCommand, host_id: u64, params: Option<&ConnectParams>) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    vars.insert("hostId".to_string(), host_id.to_string());
    vars.insert("execId".to_string(), command.exec_id.to_string());
    vars.insert("uuid".to_string(), uuid::Uuid::new_v4().to_string());
    vars.insert(
        "timestamp".to_string(),
        Utc::now().timestamp_millis().to_string(),
    );
    if let Some(params) = params {
        vars.insert("hostName".to_string(), params.host_name.clone());
        vars.insert("hostAddress".to_string(), params.address.clone());
        vars.insert("hostPort".to_string(), params.port.to_string());
        vars.insert("username".to_string(), params.username.clone());
    }
    for (name, value) in &command.params {
        vars.insert(name.clone(), value.clone());
    }
    vars
}

/// `<script_dir>/<execId>_<hostId>.sh`, `.cmd` on Windows hosts
pub fn script_path(script_dir: &str, exec_id: u64, host_id: u64, os_type: OsType) -> String {
    let extension = match os_type {
        OsType::Linux => "sh",
        OsType::Windows => "cmd",
    };
    crate::connection::join_remote(
        script_dir,
        &format!("{}_{}.{}", exec_id, host_id, extension),
    )
}

/// Collaborators shared by every host of every batch
#[derive(Clone)]
pub struct ExecContext {
    pub store: Arc<dyn ExecHostStore>,
    pub resolver: Arc<dyn HostResolver>,
    pub connector: Arc<dyn RemoteConnector>,
    pub logs: Arc<dyn ExecLogStore>,
    pub checker: TimeoutChecker,
    pub config: ExecConfig,
}

/// Starts batch commands
pub struct BatchExecutor {
    context: ExecContext,
}

impl BatchExecutor {
    pub fn new(context: ExecContext) -> Self {
        Self { context }
    }

    /// Insert one WAITING record per host and start every host
    pub async fn submit(&self, command: ExecCommand, host_ids: &[u64]) -> Result<BatchHandle> {
        let mut command = command;
        if command.timeout.is_zero() {
            command.timeout = self.context.config.default_timeout;
        }
        let command = Arc::new(command);

        let mut hosts = Vec::with_capacity(host_ids.len());
        let mut records = Vec::with_capacity(host_ids.len());
        for &host_id in host_ids {
            let params = self.context.resolver.resolve(host_id).await;
            if params.is_none() {
                warn!(exec_id = command.exec_id, host_id = host_id, "Batch host not resolvable");
            }
            let vars = host_vars(&command, host_id, params.as_ref());
            let rendered = render_command(&command.command, &vars);
            let script = command.script_exec.then(|| {
                let os_type = params.as_ref().map(|p| p.os_type).unwrap_or_default();
                script_path(&self.context.config.script_dir, command.exec_id, host_id, os_type)
            });
            let (host_name, host_address) = params
                .as_ref()
                .map(|p| (p.host_name.clone(), p.address.clone()))
                .unwrap_or_default();

            records.push(ExecHostRecord {
                id: 0,
                exec_id: command.exec_id,
                host_id,
                host_name: host_name.clone(),
                host_address: host_address.clone(),
                command: rendered.clone(),
                script_path: script.clone(),
                status: ExecHostStatus::Waiting,
                exit_code: None,
                start_time: None,
                finish_time: None,
                error_message: None,
                log_path: self.context.logs.location(command.exec_id, host_id),
            });
            hosts.push(ExecHostCommand {
                id: 0,
                exec_id: command.exec_id,
                host_id,
                host_name,
                host_address,
                command: rendered,
                script_path: script,
                timeout: command.timeout,
                params,
            });
        }

        let ids = self.context.store.insert_batch(records).await?;
        for (host, id) in hosts.iter_mut().zip(ids) {
            host.id = id;
        }

        info!(exec_id = command.exec_id, hosts = hosts.len(), "Batch command submitted");

        let interrupt = CancellationToken::new();
        let mut host_tokens = HashMap::with_capacity(hosts.len());
        let mut handles = Vec::with_capacity(hosts.len());
        for host in hosts {
            let token = interrupt.child_token();
            host_tokens.insert(host.host_id, token.clone());
            let host_id = host.host_id;
            let handler = ExecHostHandler::new(
                self.context.clone(),
                Arc::clone(&command),
                host,
                token,
            );
            handles.push((host_id, tokio::spawn(async move { handler.run().await })));
        }

        Ok(BatchHandle {
            exec_id: command.exec_id,
            interrupt,
            host_tokens,
            handles,
        })
    }
}

/// Control over a running batch
pub struct BatchHandle {
    exec_id: u64,
    interrupt: CancellationToken,
    host_tokens: HashMap<u64, CancellationToken>,
    handles: Vec<(u64, JoinHandle<ExecHostOutcome>)>,
}

impl BatchHandle {
    pub fn exec_id(&self) -> u64 {
        self.exec_id
    }

    /// Interrupt every host still running
    pub fn interrupt(&self) {
        info!(exec_id = self.exec_id, "Batch interrupt requested");
        self.interrupt.cancel();
    }

    /// Interrupt one host. Returns `false` for a host outside the batch.
    pub fn interrupt_host(&self, host_id: u64) -> bool {
        match self.host_tokens.get(&host_id) {
            Some(token) => {
                info!(exec_id = self.exec_id, host_id = host_id, "Host interrupt requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Wait for every host and return the outcomes in submission order
    pub async fn wait(self) -> Vec<ExecHostOutcome> {
        let mut outcomes = Vec::with_capacity(self.handles.len());
        for (host_id, handle) in self.handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    warn!(exec_id = self.exec_id, host_id = host_id, error = %e, "Batch host task aborted");
                }
            }
        }
        outcomes
    }
}
