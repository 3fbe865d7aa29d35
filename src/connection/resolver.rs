//! Host resolution: host id to connection parameters.

use std::collections::HashMap;

use async_trait::async_trait;

use super::ConnectParams;
use crate::config::EngineConfig;

/// Resolves a host id into ready-to-use connection parameters
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// `None` when the host is unknown
    async fn resolve(&self, host_id: u64) -> Option<ConnectParams>;
}

/// Resolver over a fixed host table
#[derive(Debug, Clone, Default)]
pub struct StaticHostResolver {
    hosts: HashMap<u64, ConnectParams>,
}

impl StaticHostResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the `[[hosts]]` table of the engine config
    pub fn from_config(config: &EngineConfig) -> Self {
        let hosts = config
            .hosts
            .iter()
            .map(|h| (h.id, h.to_connect_params(&config.connect, &config.sftp)))
            .collect();
        Self { hosts }
    }

    pub fn with_host(mut self, params: ConnectParams) -> Self {
        self.hosts.insert(params.host_id, params);
        self
    }

    pub fn host_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.hosts.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[async_trait]
impl HostResolver for StaticHostResolver {
    async fn resolve(&self, host_id: u64) -> Option<ConnectParams> {
        self.hosts.get(&host_id).cloned()
    }
}
