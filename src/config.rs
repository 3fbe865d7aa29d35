//! Configuration module for Hostrelay
//!
//! Handles loading configuration from:
//! - Default values
//! - A TOML file (`--config`, `HOSTRELAY_CONFIG`, or `./hostrelay.toml`)
//! - Environment variables

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connection::config::ConnectConfig;
use crate::connection::{AuthMethod, ConnectParams, OsType, PtySize};
use crate::logging::LogFormat;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Connection settings
    pub connect: ConnectConfig,

    /// Terminal session settings
    pub terminal: TerminalConfig,

    /// SFTP and file transfer settings
    pub sftp: SftpConfig,

    /// Batch command settings
    pub exec: ExecConfig,

    /// CHECK pre-flight settings
    pub check: CheckConfig,

    /// Logging settings
    pub logging: LoggingConfig,

    /// Static host table
    pub hosts: Vec<HostEntry>,
}

/// Terminal session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// TERM value requested for the PTY
    pub term: String,

    /// Default columns when CONNECT carries none
    pub cols: u32,

    /// Default rows when CONNECT carries none
    pub rows: u32,

    /// Capacity of the per-channel outbound queue
    pub output_buffer: usize,

    /// Capacity of the per-session inbound command queue
    pub input_buffer: usize,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            term: "xterm-256color".to_string(),
            cols: 80,
            rows: 24,
            output_buffer: 256,
            input_buffer: 64,
        }
    }
}

impl TerminalConfig {
    pub fn default_size(&self) -> PtySize {
        PtySize::new(self.cols, self.rows)
    }
}

/// What to do when an upload target already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadPresentPolicy {
    /// Write over the existing file
    Overwrite,
    /// Rename the existing file to `<name>_bk_<epoch-millis>` first
    #[default]
    Backup,
    /// Fail the file
    Fail,
}

/// SFTP and file transfer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SftpConfig {
    /// Default file name charset
    pub charset: String,

    /// Chunk size for transfers
    pub buffer_size: usize,

    /// Policy for existing upload targets
    pub upload_present: UploadPresentPolicy,

    /// Largest file served by whole-content reads
    pub preview_size: u64,
}

impl Default for SftpConfig {
    fn default() -> Self {
        Self {
            charset: "UTF-8".to_string(),
            buffer_size: 32 * 1024,
            upload_present: UploadPresentPolicy::Backup,
            preview_size: 2 * 1024 * 1024,
        }
    }
}

/// Batch command settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Remote directory scripts are uploaded to
    pub script_dir: String,

    /// Local directory for command transcripts
    pub log_dir: PathBuf,

    /// Timeout for commands that do not set one (zero = none)
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            script_dir: "/tmp/hostrelay/script".to_string(),
            log_dir: std::env::temp_dir().join("hostrelay").join("exec"),
            default_timeout: Duration::ZERO,
        }
    }
}

/// CHECK pre-flight settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckConfig {
    /// How long resolved connect info waits for the following CONNECT
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(60),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,

    /// Output format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

/// One entry of the static host table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostEntry {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub identity_file: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub os_type: OsType,
    #[serde(default)]
    pub charset: Option<String>,
}

fn default_port() -> u16 {
    22
}

impl HostEntry {
    /// Build connection parameters, falling back to engine defaults
    pub fn to_connect_params(&self, connect: &ConnectConfig, sftp: &SftpConfig) -> ConnectParams {
        let auth = match (&self.identity_file, &self.password) {
            (Some(path), _) => AuthMethod::Key {
                path: path.clone(),
                passphrase: self.passphrase.clone(),
            },
            (None, Some(password)) => AuthMethod::Password {
                password: password.clone(),
            },
            (None, None) => AuthMethod::Agent,
        };

        let mut params = ConnectParams::new(self.id, &self.address, &self.username)
            .with_name(self.name.clone().unwrap_or_else(|| self.address.clone()))
            .with_port(self.port)
            .with_auth(auth)
            .with_os_type(self.os_type)
            .with_connect_timeout(connect.timeout);
        params.charset = self.charset.clone().unwrap_or_else(|| sftp.charset.clone());
        params
    }
}

impl EngineConfig {
    /// Load configuration from the first file found, then apply env overrides
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = match Self::find_config_file(config_path) {
            Some(path) => Self::from_file(&path)?,
            None => EngineConfig::default(),
        };

        config.apply_env_overrides();

        Ok(config)
    }

    /// Explicit path, then `HOSTRELAY_CONFIG`, then the working directory
    fn find_config_file(explicit_path: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit_path {
            return Some(path.to_path_buf());
        }

        if let Ok(env_config) = std::env::var("HOSTRELAY_CONFIG") {
            return Some(PathBuf::from(env_config));
        }

        let mut candidates = vec![PathBuf::from("hostrelay.toml")];
        if let Some(config_dir) = dirs::config_dir() {
            candidates.push(config_dir.join("hostrelay").join("config.toml"));
        }
        candidates.into_iter().find(|p| p.exists())
    }

    /// Load from a specific TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // HOSTRELAY_CONNECT_TIMEOUT (seconds)
        if let Ok(timeout) = std::env::var("HOSTRELAY_CONNECT_TIMEOUT") {
            if let Ok(n) = timeout.parse() {
                self.connect.timeout = Duration::from_secs(n);
            }
        }

        // HOSTRELAY_LOG_LEVEL
        if let Ok(level) = std::env::var("HOSTRELAY_LOG_LEVEL") {
            self.logging.level = level;
        }

        // HOSTRELAY_SCRIPT_DIR
        if let Ok(dir) = std::env::var("HOSTRELAY_SCRIPT_DIR") {
            self.exec.script_dir = dir;
        }
    }

    /// Look up a host of the static table
    pub fn host(&self, id: u64) -> Option<&HostEntry> {
        self.hosts.iter().find(|h| h.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.terminal.term, "xterm-256color");
        assert_eq!(config.sftp.buffer_size, 32 * 1024);
        assert_eq!(config.sftp.upload_present, UploadPresentPolicy::Backup);
        assert_eq!(config.connect.timeout, Duration::from_secs(10));
        assert!(config.hosts.is_empty());
    }

    #[test]
    fn test_parse_toml_sections() {
        let toml = r#"
[connect]
timeout = "5s"

[sftp]
upload_present = "overwrite"
buffer_size = 4096

[exec]
script_dir = "/var/tmp/scripts"
default_timeout = "30s"

[[hosts]]
id = 1
name = "web-1"
address = "10.0.0.1"
username = "deploy"
password = "secret"

[[hosts]]
id = 2
address = "10.0.0.2"
port = 2222
username = "root"
identity_file = "~/.ssh/id_ed25519"
os_type = "WINDOWS"
"#;
        let config: EngineConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.connect.timeout, Duration::from_secs(5));
        assert_eq!(config.sftp.upload_present, UploadPresentPolicy::Overwrite);
        assert_eq!(config.exec.default_timeout, Duration::from_secs(30));
        assert_eq!(config.terminal.cols, 80);

        let web = config.host(1).unwrap();
        let params = web.to_connect_params(&config.connect, &config.sftp);
        assert_eq!(params.host_name, "web-1");
        assert!(matches!(params.auth, AuthMethod::Password { .. }));
        assert_eq!(params.connect_timeout, Duration::from_secs(5));

        let win = config.host(2).unwrap();
        let params = win.to_connect_params(&config.connect, &config.sftp);
        assert_eq!(params.port, 2222);
        assert_eq!(params.host_name, "10.0.0.2");
        assert_eq!(params.os_type, OsType::Windows);
        assert!(matches!(params.auth, AuthMethod::Key { .. }));
    }

    #[test]
    fn test_from_file_missing() {
        let result = EngineConfig::from_file("/nonexistent/hostrelay.toml");
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hostrelay.toml");
        std::fs::write(&path, "[check]\ncache_ttl = \"2m\"\n").unwrap();
        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.check.cache_ttl, Duration::from_secs(120));
    }
}
