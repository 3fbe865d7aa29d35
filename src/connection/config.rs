//! Connection configuration module
//!
//! Connect timeout, retry policy, host key policy and the identity files the
//! russh connector tries when a host has no explicit key.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default connection timeout in seconds
pub const DEFAULT_TIMEOUT: u64 = 10;

/// Default number of connection retries
pub const DEFAULT_RETRIES: u32 = 0;

/// Default delay between retries in seconds
pub const DEFAULT_RETRY_DELAY: u64 = 1;

/// Default keepalive interval in seconds (0 = disabled)
pub const DEFAULT_KEEPALIVE_INTERVAL: u64 = 15;

/// Settings applied to every outgoing connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// Upper bound for connect + handshake + authentication
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Number of connection retries after the first attempt
    pub retries: u32,

    /// Delay between retries
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,

    /// Accept hosts missing from known_hosts (like StrictHostKeyChecking=accept-new)
    pub accept_unknown_hosts: bool,

    /// Try the SSH agent before key files
    pub use_agent: bool,

    /// Identity files to try when a host uses agent authentication
    pub identity_files: Vec<String>,

    /// SSH keepalive interval
    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT),
            retries: DEFAULT_RETRIES,
            retry_delay: Duration::from_secs(DEFAULT_RETRY_DELAY),
            accept_unknown_hosts: true,
            use_agent: true,
            identity_files: vec![],
            keepalive_interval: Duration::from_secs(DEFAULT_KEEPALIVE_INTERVAL),
        }
    }
}

impl ConnectConfig {
    /// Get retry configuration
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.retries,
            retry_delay: self.retry_delay,
            exponential_backoff: true,
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries
    pub max_retries: u32,

    /// Initial delay between retries
    pub retry_delay: Duration,

    /// Use exponential backoff
    pub exponential_backoff: bool,

    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_RETRIES,
            retry_delay: Duration::from_secs(DEFAULT_RETRY_DELAY),
            exponential_backoff: true,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Calculate delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.exponential_backoff {
            let delay = self.retry_delay * 2u32.pow(attempt.min(10));
            delay.min(self.max_delay)
        } else {
            self.retry_delay
        }
    }

    /// Share of the remaining connect budget given to `attempt` (0-based),
    /// so every attempt still fits inside one overall connect timeout
    pub fn attempt_budget(&self, remaining: Duration, attempt: u32) -> Duration {
        let attempts_left = self.max_retries.saturating_sub(attempt) + 1;
        remaining / attempts_left
    }
}

/// Helper to expand paths with ~ and environment variables
pub fn expand_path(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or_else(|_| path.into());
    PathBuf::from(expanded.as_ref())
}

/// Get default identity files to try
pub fn default_identity_files() -> Vec<PathBuf> {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));
    let ssh_dir = home.join(".ssh");

    vec![
        ssh_dir.join("id_ed25519"),
        ssh_dir.join("id_ecdsa"),
        ssh_dir.join("id_rsa"),
    ]
    .into_iter()
    .filter(|p| p.exists())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_connect_config() {
        let config = ConnectConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(DEFAULT_TIMEOUT));
        assert_eq!(config.retries, 0);
        assert!(config.accept_unknown_hosts);
    }

    #[test]
    fn test_retry_config_delay() {
        let config = RetryConfig::default();

        let delay0 = config.delay_for_attempt(0);
        let delay1 = config.delay_for_attempt(1);
        let delay2 = config.delay_for_attempt(2);

        assert!(delay1 > delay0);
        assert!(delay2 > delay1);
    }

    #[test]
    fn test_attempt_budget_splits_remaining_time() {
        let config = RetryConfig {
            max_retries: 2,
            ..Default::default()
        };
        assert_eq!(
            config.attempt_budget(Duration::from_secs(9), 0),
            Duration::from_secs(3)
        );
        assert_eq!(
            config.attempt_budget(Duration::from_secs(4), 1),
            Duration::from_secs(2)
        );
        assert_eq!(
            config.attempt_budget(Duration::from_secs(1), 2),
            Duration::from_secs(1)
        );
        // Never divides by zero past the last attempt
        assert_eq!(
            config.attempt_budget(Duration::from_secs(1), 5),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_retry_delay_capped() {
        let config = RetryConfig {
            max_delay: Duration::from_secs(5),
            ..Default::default()
        };
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn test_connect_config_from_toml() {
        let toml = r#"
timeout = "3s"
retries = 2
accept_unknown_hosts = false
"#;
        let config: ConnectConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.timeout, Duration::from_secs(3));
        assert_eq!(config.retry_config().max_retries, 2);
        assert!(!config.accept_unknown_hosts);
        assert!(config.use_agent);
    }
}
