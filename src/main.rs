//! Hostrelay - remote host session and transfer engine
//!
//! Command-line front end over the engine, driven by the static host table
//! of the configuration file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;

use hostrelay::config::EngineConfig;
use hostrelay::connection::russh::RusshConnector;
use hostrelay::connection::{join_remote, HostResolver, RemoteConnector, StaticHostResolver};
use hostrelay::exec::{BatchExecutor, ExecCommand, ExecContext, ExecHostStatus, FsExecLogStore};
use hostrelay::exec::ExecLogStore;
use hostrelay::logging::LoggingBuilder;
use hostrelay::store::MemoryStore;
use hostrelay::timeout::TimeoutChecker;
use hostrelay::transfer::{
    FsLocalStore, LocalStore, TransferContext, TransferDirection, TransferFileSpec,
    TransferFileStatus, TransferManager,
};

/// Application version information
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Hostrelay - drive remote hosts over SSH
#[derive(Parser, Debug)]
#[command(name = "hostrelay")]
#[command(author = "Hostrelay Contributors")]
#[command(version)]
#[command(about = "Remote host session and transfer engine", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short = 'c', long, global = true, env = "HOSTRELAY_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check that hosts are reachable and accept our credentials
    Check {
        /// Host ids from the host table (all hosts when omitted)
        #[arg(long = "host")]
        hosts: Vec<u64>,
    },

    /// Run a command or script on hosts
    Exec {
        /// Host ids from the host table
        #[arg(long = "host", required = true)]
        hosts: Vec<u64>,

        /// Command to run; may use @{{ name }} placeholders
        #[arg(required_unless_present = "script")]
        command: Option<String>,

        /// Upload and run this local script instead of a command
        #[arg(long, conflicts_with = "command")]
        script: Option<PathBuf>,

        /// Timeout in seconds (0 = none)
        #[arg(long, default_value = "0")]
        timeout: u64,

        /// Placeholder values (name=value)
        #[arg(long = "param", action = clap::ArgAction::Append)]
        params: Vec<String>,
    },

    /// Upload local files to hosts
    Upload {
        #[arg(long = "host", required = true)]
        hosts: Vec<u64>,

        /// Remote directory (may use ${home} and ${username})
        #[arg(long)]
        remote: String,

        /// Local files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Download a remote file from one host
    Download {
        #[arg(long = "host")]
        host: u64,

        /// Remote file path
        #[arg(long)]
        remote: String,

        /// Local destination
        local: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref())?;
    init_logging(&config, cli.verbose);

    if cli.verbose >= 2 {
        eprintln!("Hostrelay v{}", VERSION);
    }

    let all_ok = match cli.command {
        Commands::Check { hosts } => check(&config, hosts).await?,
        Commands::Exec {
            hosts,
            command,
            script,
            timeout,
            params,
        } => exec(&config, hosts, command, script, timeout, params).await?,
        Commands::Upload {
            hosts,
            remote,
            files,
        } => upload(&config, hosts, &remote, files).await?,
        Commands::Download {
            host,
            remote,
            local,
        } => download(&config, host, &remote, &local).await?,
    };

    std::process::exit(if all_ok { 0 } else { 1 });
}

/// Initialize logging based on verbosity level
fn init_logging(config: &EngineConfig, verbosity: u8) {
    let mut builder = LoggingBuilder::from_config(&config.logging).with_target(verbosity >= 3);
    builder = match verbosity {
        0 => builder,
        1 => builder.with_level("info"),
        2 => builder.with_level("debug"),
        _ => builder.with_level("trace"),
    };
    if let Err(e) = builder.init() {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }
}

fn status_label(ok: bool, label: &str) -> String {
    if ok {
        label.green().to_string()
    } else {
        label.red().bold().to_string()
    }
}

async fn check(config: &EngineConfig, hosts: Vec<u64>) -> Result<bool> {
    let resolver = StaticHostResolver::from_config(config);
    let connector = RusshConnector::new(config.connect.clone());
    let hosts = if hosts.is_empty() {
        resolver.host_ids()
    } else {
        hosts
    };

    let mut all_ok = true;
    for host_id in hosts {
        let Some(params) = resolver.resolve(host_id).await else {
            println!("{:<24} {}", host_id, status_label(false, "unknown host"));
            all_ok = false;
            continue;
        };
        match connector.open_session(&params).await {
            Ok(connection) => {
                let alive = connection.is_alive().await;
                let _ = connection.close().await;
                println!("{:<24} {}", params.identifier(), status_label(alive, "ok"));
                all_ok &= alive;
            }
            Err(e) => {
                println!(
                    "{:<24} {} {}",
                    params.identifier(),
                    status_label(false, "unreachable"),
                    e.to_string().dimmed()
                );
                all_ok = false;
            }
        }
    }
    Ok(all_ok)
}

async fn exec(
    config: &EngineConfig,
    hosts: Vec<u64>,
    command: Option<String>,
    script: Option<PathBuf>,
    timeout: u64,
    params: Vec<String>,
) -> Result<bool> {
    let (text, script_exec) = match (command, script) {
        (_, Some(path)) => (
            std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read script: {}", path.display()))?,
            true,
        ),
        (Some(command), None) => (command, false),
        (None, None) => bail!("either a command or --script is required"),
    };

    let mut exec_command = ExecCommand::new(chrono::Utc::now().timestamp_millis() as u64, text)
        .with_script(script_exec)
        .with_timeout(Duration::from_secs(timeout))
        .with_operator(0, whoami());
    exec_command.params = parse_params(&params)?;

    let logs = Arc::new(FsExecLogStore::new(&config.exec.log_dir));
    let checker = TimeoutChecker::start();
    let executor = BatchExecutor::new(ExecContext {
        store: Arc::new(MemoryStore::new()),
        resolver: Arc::new(StaticHostResolver::from_config(config)),
        connector: Arc::new(RusshConnector::new(config.connect.clone())),
        logs: logs.clone(),
        checker: checker.clone(),
        config: config.exec.clone(),
    });

    let exec_id = exec_command.exec_id;
    let handle = executor.submit(exec_command, &hosts).await?;
    let outcomes = handle.wait().await;
    checker.shutdown();

    let mut all_ok = true;
    for outcome in &outcomes {
        let transcript = logs.read(exec_id, outcome.host_id).await.unwrap_or_default();
        print!("{}", transcript);
        let ok = outcome.status == ExecHostStatus::Completed;
        all_ok &= ok;
        println!(
            "{} host {}: {}",
            "==>".bold(),
            outcome.host_id,
            status_label(ok, outcome.status.as_str())
        );
    }
    Ok(all_ok && outcomes.len() == hosts.len())
}

async fn upload(
    config: &EngineConfig,
    hosts: Vec<u64>,
    remote: &str,
    files: Vec<PathBuf>,
) -> Result<bool> {
    let local = Arc::new(FsLocalStore::new("."));
    let mut specs = Vec::new();
    for file in &files {
        let local_ref = file.display().to_string();
        let size = local
            .size(&local_ref)
            .await
            .with_context(|| format!("Failed to stat local file: {}", local_ref))?;
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .with_context(|| format!("Not a file: {}", local_ref))?;
        for &host_id in &hosts {
            specs.push(TransferFileSpec {
                host_id,
                local_ref: local_ref.clone(),
                remote_path: join_remote(remote, &name),
                size_bytes: size,
            });
        }
    }
    run_transfer(config, local, TransferDirection::Upload, specs).await
}

async fn download(config: &EngineConfig, host: u64, remote: &str, local_path: &Path) -> Result<bool> {
    let local = Arc::new(FsLocalStore::new("."));
    let spec = TransferFileSpec {
        host_id: host,
        local_ref: local_path.display().to_string(),
        remote_path: remote.to_string(),
        size_bytes: 0,
    };
    run_transfer(config, local, TransferDirection::Download, vec![spec]).await
}

async fn run_transfer(
    config: &EngineConfig,
    local: Arc<FsLocalStore>,
    direction: TransferDirection,
    specs: Vec<TransferFileSpec>,
) -> Result<bool> {
    let store = Arc::new(MemoryStore::new());
    let manager = TransferManager::new(TransferContext {
        store: store.clone(),
        resolver: Arc::new(StaticHostResolver::from_config(config)),
        connector: Arc::new(RusshConnector::new(config.connect.clone())),
        local,
        config: config.sftp.clone(),
    });

    let task_id = 1;
    manager.submit(task_id, direction, specs).await?;
    manager.wait(task_id).await;

    let mut all_ok = true;
    for file in store.files_of_task(task_id) {
        let ok = file.status == TransferFileStatus::Finished;
        all_ok &= ok;
        println!(
            "{:<8} {} -> {} ({}/{} bytes) {}",
            file.host_id,
            file.local_ref,
            file.remote_path,
            file.transferred_bytes,
            file.size_bytes,
            status_label(ok, file.status.as_str())
        );
        if let Some(message) = &file.error_message {
            println!("         {}", message.dimmed());
        }
    }
    Ok(all_ok)
}

fn parse_params(params: &[String]) -> Result<HashMap<String, String>> {
    params
        .iter()
        .map(|p| match p.split_once('=') {
            Some((name, value)) => Ok((name.trim().to_string(), value.to_string())),
            None => bail!("invalid --param '{}', expected name=value", p),
        })
        .collect()
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "hostrelay".to_string())
}
