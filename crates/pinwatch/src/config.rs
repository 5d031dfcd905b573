//! Watcher configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime configuration for the watchers, the clients and the REST API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// HTTP RPC URL of the chain node (eth_blockNumber, eth_getLogs).
    pub http_url: String,
    /// Base URL of the IPFS (Kubo) HTTP API.
    pub ipfs_api_url: String,
    /// Listen watcher tick interval.
    pub listen_interval_ms: u64,
    /// Pin watcher tick interval.
    pub pin_interval_ms: u64,
    /// Max block range per eth_getLogs request.
    pub getlogs_max_range: u64,
    pub rpc_timeout_secs: u64,
    /// JSON snapshot of the durable collections. In-memory when unset.
    pub store_path: Option<PathBuf>,
    pub api_address: SocketAddr,
    /// Listener contracts seeded into the poll set at startup.
    pub listener_contracts: Vec<String>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            http_url: "http://127.0.0.1:8545".to_string(),
            ipfs_api_url: "http://127.0.0.1:5001".to_string(),
            listen_interval_ms: 100,
            pin_interval_ms: 100,
            getlogs_max_range: 1000,
            rpc_timeout_secs: 10,
            store_path: None,
            api_address: SocketAddr::from(([127, 0, 0, 1], 3000)),
            listener_contracts: Vec::new(),
        }
    }
}

impl WatcherConfig {
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&contents).context("parse config")?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_interval_ms == 0 || self.pin_interval_ms == 0 {
            anyhow::bail!("watcher intervals must be greater than zero");
        }
        if self.getlogs_max_range == 0 {
            anyhow::bail!("getlogs_max_range must be greater than zero");
        }
        Ok(())
    }

    pub fn listen_interval(&self) -> Duration {
        Duration::from_millis(self.listen_interval_ms)
    }

    pub fn pin_interval(&self) -> Duration {
        Duration::from_millis(self.pin_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }
}
