//! One host's run of a batch command.
//!
//! The handler owns the host's connection for the whole run and always
//! releases it before recording the final status. Exactly one terminal
//! status and one terminal banner are written per host. When the deadline
//! and the natural end of the command race, the timeout endpoint's
//! single-fire guard picks the winner.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{banner, ExecCommand, ExecContext, ExecHostCommand, ExecHostOutcome, ExecHostStatus};
use crate::connection::{
    escape_shell_arg, ConnectParams, ConnectionError, ExecChannel, ExecEvent, OsType,
    RemoteConnection,
};
use crate::error::{Error, Result};
use crate::session::sftp::mkdir_parent;
use crate::store::ExecHostUpdate;
use crate::timeout::TimeoutEndpoint;

/// How the remote command ended, when it got to run at all
enum Ending {
    Exited(i32),
    Interrupted,
    TimedOut,
}

/// Runs one [`ExecHostCommand`] from WAITING to a terminal status
pub struct ExecHostHandler {
    context: ExecContext,
    command: Arc<ExecCommand>,
    host: ExecHostCommand,
    interrupt: CancellationToken,
    status: Mutex<ExecHostStatus>,
}

impl ExecHostHandler {
    pub fn new(
        context: ExecContext,
        command: Arc<ExecCommand>,
        host: ExecHostCommand,
        interrupt: CancellationToken,
    ) -> Self {
        Self {
            context,
            command,
            host,
            interrupt,
            status: Mutex::new(ExecHostStatus::Waiting),
        }
    }

    pub fn status(&self) -> ExecHostStatus {
        *self.status.lock()
    }

    pub async fn run(self) -> ExecHostOutcome {
        let started = Instant::now();
        self.start().await;

        let mut connection: Option<Arc<dyn RemoteConnection>> = None;
        let result = self.execute(&mut connection).await;
        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                debug!(exec_id = self.host.exec_id, host_id = self.host.host_id, error = %e, "Connection close failed");
            }
        }

        match result {
            Ok(Ending::Exited(code)) => {
                let used_ms = started.elapsed().as_millis() as u64;
                let status = if code == 0 {
                    ExecHostStatus::Completed
                } else {
                    ExecHostStatus::Failed
                };
                self.finish(status, Some(code), None, banner::completed(code, used_ms))
                    .await
            }
            Ok(Ending::Interrupted) => {
                self.finish(ExecHostStatus::Interrupted, None, None, banner::interrupted())
                    .await
            }
            Ok(Ending::TimedOut) => {
                let cause = Error::TimeoutExceeded(self.host.timeout).to_string();
                self.finish(ExecHostStatus::Timeout, None, Some(cause), banner::timeout())
                    .await
            }
            Err(e) => {
                let cause = e.to_string();
                let text = banner::failed(&cause);
                self.finish(ExecHostStatus::Failed, None, Some(cause), text)
                    .await
            }
        }
    }

    /// WAITING to RUNNING, then the opening banner
    async fn start(&self) {
        if !self.transition(ExecHostStatus::Running) {
            return;
        }
        info!(exec_id = self.host.exec_id, host_id = self.host.host_id, "Batch host running");
        let update = ExecHostUpdate {
            start_time: Some(Utc::now()),
            ..ExecHostUpdate::new(self.host.id).status(ExecHostStatus::Running)
        };
        self.persist(update).await;
        self.append_log(&banner::preparing(&self.command, &self.host))
            .await;
    }

    async fn execute(&self, slot: &mut Option<Arc<dyn RemoteConnection>>) -> Result<Ending> {
        if self.interrupt.is_cancelled() {
            return Ok(Ending::Interrupted);
        }
        let params = self
            .host
            .params
            .clone()
            .ok_or(Error::HostNotFound(self.host.host_id))?;

        let timeout = params.connect_timeout;
        let connection =
            tokio::time::timeout(timeout, self.context.connector.open_session(&params))
                .await
                .map_err(|_| ConnectionError::Timeout(timeout))??;
        *slot = Some(Arc::clone(&connection));

        if let Some(script_path) = &self.host.script_path {
            if self.interrupt.is_cancelled() {
                return Ok(Ending::Interrupted);
            }
            self.upload_script(connection.as_ref(), script_path, &params)
                .await?;
        }
        if self.interrupt.is_cancelled() {
            return Ok(Ending::Interrupted);
        }

        let command_line = match (&self.host.script_path, params.os_type) {
            (Some(path), OsType::Linux) => escape_shell_arg(path),
            (Some(path), OsType::Windows) => path.clone(),
            (None, _) => self.host.command.clone(),
        };
        let budget = (!self.host.timeout.is_zero()).then_some(self.host.timeout);
        let mut exec = connection.open_exec(&command_line, budget).await?;
        debug!(exec_id = self.host.exec_id, host_id = self.host.host_id, "Remote command started");

        let timed_out = CancellationToken::new();
        let endpoint = (!self.host.timeout.is_zero()).then(|| {
            let token = timed_out.clone();
            self.context
                .checker
                .register(self.host.timeout, move || token.cancel())
        });

        let ending = loop {
            tokio::select! {
                biased;
                _ = timed_out.cancelled() => {
                    warn!(exec_id = self.host.exec_id, host_id = self.host.host_id, "Batch host timed out");
                    self.terminate(exec.as_mut()).await;
                    break Ok(Ending::TimedOut);
                }
                _ = self.interrupt.cancelled() => {
                    self.terminate(exec.as_mut()).await;
                    break Ok(if self.complete_endpoint(endpoint.as_deref()) {
                        Ending::Interrupted
                    } else {
                        Ending::TimedOut
                    });
                }
                event = exec.next_event() => match event {
                    Some(ExecEvent::Stdout(data)) | Some(ExecEvent::Stderr(data)) => {
                        self.append_output(&data).await;
                    }
                    Some(ExecEvent::Exit(code)) => {
                        break self.natural_end(exec.as_mut(), endpoint.as_deref(), Some(code)).await;
                    }
                    None => {
                        break self.natural_end(exec.as_mut(), endpoint.as_deref(), None).await;
                    }
                }
            }
        };

        if let Some(endpoint) = &endpoint {
            self.context.checker.unregister(endpoint);
        }
        ending
    }

    /// The command ended by itself. Loses to a deadline that already fired.
    async fn natural_end(
        &self,
        exec: &mut dyn ExecChannel,
        endpoint: Option<&TimeoutEndpoint>,
        code: Option<u32>,
    ) -> Result<Ending> {
        if !self.complete_endpoint(endpoint) {
            self.terminate(exec).await;
            return Ok(Ending::TimedOut);
        }
        match code {
            Some(code) => Ok(Ending::Exited(code as i32)),
            None => Err(Error::RemoteIo(
                "exec channel closed without an exit status".to_string(),
            )),
        }
    }

    /// `false` if the deadline fired first
    fn complete_endpoint(&self, endpoint: Option<&TimeoutEndpoint>) -> bool {
        match endpoint {
            Some(endpoint) => self.context.checker.unregister(endpoint),
            None => true,
        }
    }

    async fn terminate(&self, exec: &mut dyn ExecChannel) {
        if let Err(e) = exec.terminate().await {
            debug!(exec_id = self.host.exec_id, host_id = self.host.host_id, error = %e, "Terminate failed");
        }
    }

    async fn upload_script(
        &self,
        connection: &dyn RemoteConnection,
        script_path: &str,
        params: &ConnectParams,
    ) -> Result<()> {
        self.append_log(&banner::uploading(script_path)).await;
        match self.write_script(connection, script_path, params).await {
            Ok(()) => {
                debug!(exec_id = self.host.exec_id, host_id = self.host.host_id, path = %script_path, "Script uploaded");
                self.append_log(&banner::uploaded()).await;
                Ok(())
            }
            Err(e) => {
                self.append_log(&banner::upload_failed()).await;
                Err(e)
            }
        }
    }

    async fn write_script(
        &self,
        connection: &dyn RemoteConnection,
        script_path: &str,
        params: &ConnectParams,
    ) -> Result<()> {
        let sftp = connection.open_sftp(&params.charset).await?;
        let result = async {
            mkdir_parent(sftp.as_ref(), script_path).await?;
            let mut writer = sftp.open_write(script_path).await?;
            writer.write_all(self.host.command.as_bytes()).await?;
            writer.shutdown().await?;
            if params.os_type == OsType::Linux {
                sftp.chmod(script_path, 0o755).await?;
            }
            Ok::<(), ConnectionError>(())
        }
        .await;
        if let Err(e) = sftp.close().await {
            debug!(error = %e, "SFTP close failed");
        }
        result.map_err(Error::remote_io)
    }

    /// Record the terminal status and its banner
    async fn finish(
        &self,
        status: ExecHostStatus,
        exit_code: Option<i32>,
        error_message: Option<String>,
        text: String,
    ) -> ExecHostOutcome {
        if self.transition(status) {
            info!(
                exec_id = self.host.exec_id,
                host_id = self.host.host_id,
                status = %status,
                exit_code = ?exit_code,
                "Batch host finished"
            );
            let update = ExecHostUpdate {
                exit_code,
                finish_time: Some(Utc::now()),
                error_message,
                ..ExecHostUpdate::new(self.host.id).status(status)
            };
            self.persist(update).await;
            self.append_log(&text).await;
        }
        ExecHostOutcome {
            id: self.host.id,
            host_id: self.host.host_id,
            status: self.status(),
            exit_code,
        }
    }

    fn transition(&self, next: ExecHostStatus) -> bool {
        let mut status = self.status.lock();
        let current = *status;
        if !current.can_transition_to(next) {
            warn!(
                exec_id = self.host.exec_id,
                host_id = self.host.host_id,
                from = %current,
                to = %next,
                "Rejected status transition"
            );
            return false;
        }
        *status = next;
        true
    }

    async fn persist(&self, update: ExecHostUpdate) {
        if let Err(e) = self.context.store.update_by_id(update).await {
            warn!(exec_id = self.host.exec_id, host_id = self.host.host_id, error = %e, "Failed to persist host status");
        }
    }

    async fn append_log(&self, text: &str) {
        self.append_output(text.as_bytes()).await;
    }

    async fn append_output(&self, data: &[u8]) {
        if let Err(e) = self
            .context
            .logs
            .append(self.host.exec_id, self.host.host_id, data)
            .await
        {
            warn!(exec_id = self.host.exec_id, host_id = self.host.host_id, error = %e, "Failed to append transcript");
        }
    }
}
