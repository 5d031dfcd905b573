//! Storage-network client: pin, unpin and list pins on an IPFS (Kubo) node.

use crate::config::WatcherConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

/// Acknowledgement of a pin: the cid and its cumulative size in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinAck {
    pub cid: String,
    pub size: u64,
}

#[async_trait]
pub trait StorageNetwork: Send + Sync {
    /// Pin `cid` (recursively). Pinning an already pinned cid succeeds.
    async fn pin_add(&self, cid: &str) -> Result<PinAck>;

    /// Unpin `cid`. Unpinning a cid that is not pinned succeeds.
    async fn pin_remove(&self, cid: &str) -> Result<()>;

    /// Cids currently pinned recursively.
    async fn pin_list(&self) -> Result<Vec<String>>;
}

#[derive(Debug, Deserialize)]
struct FilesStat {
    #[serde(rename = "CumulativeSize")]
    cumulative_size: u64,
}

#[derive(Debug, Deserialize)]
struct PinLs {
    #[serde(rename = "Keys", default)]
    keys: serde_json::Map<String, Value>,
}

/// Kubo answers pin/rm on an unpinned cid with this message.
const NOT_PINNED: &str = "not pinned";

/// Client for the Kubo HTTP RPC API (`/api/v0/...`).
#[derive(Debug, Clone)]
pub struct KuboClient {
    client: reqwest::Client,
    api_url: String,
}

impl KuboClient {
    pub fn new(api_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::StorageNetwork(e.to_string()))?;
        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &WatcherConfig) -> Result<Self> {
        Self::new(config.ipfs_api_url.clone(), config.rpc_timeout())
    }

    /// POST an RPC command and return its JSON body, or the node's error message.
    async fn call(&self, command: &str, query: &[(&str, &str)]) -> Result<Value> {
        let url = format!("{}/api/v0/{}", self.api_url, command);
        let resp = self
            .client
            .post(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| Error::StorageNetwork(format!("{}: {}", command, e)))?;
        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| Error::StorageNetwork(format!("{}: parse response: {}", command, e)))?;
        if !status.is_success() {
            let message = body
                .get("Message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error")
                .to_string();
            return Err(Error::StorageNetwork(format!("{}: {}", command, message)));
        }
        Ok(body)
    }
}

#[async_trait]
impl StorageNetwork for KuboClient {
    async fn pin_add(&self, cid: &str) -> Result<PinAck> {
        self.call("pin/add", &[("arg", cid), ("recursive", "true")]).await?;
        let ipfs_path = format!("/ipfs/{}", cid);
        let body = self.call("files/stat", &[("arg", ipfs_path.as_str())]).await?;
        let stat: FilesStat = serde_json::from_value(body)
            .map_err(|e| Error::StorageNetwork(format!("files/stat: {}", e)))?;
        tracing::info!(cid, size = stat.cumulative_size, "content pinned");
        Ok(PinAck {
            cid: cid.to_string(),
            size: stat.cumulative_size,
        })
    }

    async fn pin_remove(&self, cid: &str) -> Result<()> {
        match self.call("pin/rm", &[("arg", cid)]).await {
            Ok(_) => {
                tracing::info!(cid, "content unpinned");
                Ok(())
            }
            Err(Error::StorageNetwork(msg)) if msg.contains(NOT_PINNED) => {
                tracing::debug!(cid, "unpin of cid that is not pinned");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn pin_list(&self) -> Result<Vec<String>> {
        let body = self.call("pin/ls", &[("type", "recursive")]).await?;
        let ls: PinLs = serde_json::from_value(body)
            .map_err(|e| Error::StorageNetwork(format!("pin/ls: {}", e)))?;
        Ok(ls.keys.into_iter().map(|(cid, _)| cid).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_ls_shape() {
        let body = serde_json::json!({
            "Keys": {
                "bafyA": {"Type": "recursive"},
                "bafyB": {"Type": "recursive"}
            }
        });
        let ls: PinLs = serde_json::from_value(body).unwrap();
        let mut cids: Vec<String> = ls.keys.into_iter().map(|(c, _)| c).collect();
        cids.sort();
        assert_eq!(cids, vec!["bafyA".to_string(), "bafyB".to_string()]);
    }

    #[test]
    fn files_stat_shape() {
        let body = serde_json::json!({
            "Hash": "bafyA",
            "Size": 0,
            "CumulativeSize": 1234,
            "Blocks": 1,
            "Type": "file"
        });
        let stat: FilesStat = serde_json::from_value(body).unwrap();
        assert_eq!(stat.cumulative_size, 1234);
    }

    #[test]
    fn api_url_trailing_slash_trimmed() {
        let c = KuboClient::new("http://127.0.0.1:5001/", Duration::from_secs(1)).unwrap();
        assert_eq!(c.api_url, "http://127.0.0.1:5001");
    }

    #[tokio::test]
    async fn unreachable_node_is_storage_error() {
        let c = KuboClient::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        assert!(matches!(c.pin_list().await, Err(Error::StorageNetwork(_))));
    }
}
