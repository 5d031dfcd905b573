//! Chain RPC: head height and event logs over Ethereum JSON-RPC.
//!
//! Read-only. Logs are fetched in windows of at most `getlogs_max_range` blocks and returned
//! in chain-native order (block number, then log index).

use crate::abi::{decode_log, parse_hex_u64, BlockchainEvent, EventFilter, EventKind};
use crate::config::WatcherConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

/// Read-only view of the chain that the watchers poll.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Current head block height.
    async fn head_height(&self) -> Result<u64>;

    /// Events matching `filter` emitted by `contract` in `[from_block, to_block]`,
    /// in chain-native order.
    async fn events(
        &self,
        contract: &str,
        filter: EventFilter,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<BlockchainEvent>>;
}

fn build_logs_filter(
    address: &str,
    topics: Option<&[EventKind]>,
    from_block: u64,
    to_block: u64,
) -> Value {
    let mut filter = json!({
        "address": address,
        "fromBlock": format!("0x{:x}", from_block),
        "toBlock": format!("0x{:x}", to_block),
    });
    // topic0 as an OR-list: [[t0a, t0b]].
    if let Some(kinds) = topics {
        let alternatives: Vec<String> = kinds
            .iter()
            .map(|k| format!("0x{}", hex::encode(k.topic0())))
            .collect();
        filter["topics"] = json!([alternatives]);
    }
    filter
}

fn log_matches(log: &Value, filter: EventFilter) -> bool {
    log.get("topics")
        .and_then(|t| t.as_array())
        .and_then(|t| t.first())
        .and_then(|t| t.as_str())
        .and_then(|s| hex::decode(s.strip_prefix("0x").unwrap_or(s)).ok())
        .and_then(|b| EventKind::from_topic0(&b))
        .map(|k| filter.matches(k))
        .unwrap_or(false)
}

/// JSON-RPC client for a chain node reachable over HTTP.
#[derive(Debug, Clone)]
pub struct HttpChainClient {
    client: reqwest::Client,
    http_url: String,
    getlogs_max_range: u64,
}

impl HttpChainClient {
    pub fn new(
        http_url: impl Into<String>,
        getlogs_max_range: u64,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Rpc(e.to_string()))?;
        Ok(Self {
            client,
            http_url: http_url.into(),
            getlogs_max_range: getlogs_max_range.max(1),
        })
    }

    pub fn from_config(config: &WatcherConfig) -> Result<Self> {
        Self::new(
            config.http_url.clone(),
            config.getlogs_max_range,
            config.rpc_timeout(),
        )
    }

    async fn http_json_rpc(&self, method: &str, params: Value, id: u64) -> Result<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params
        });
        let resp = self
            .client
            .post(&self.http_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Rpc(format!("{}: HTTP request failed: {}", method, e)))?;
        let json: Value = resp
            .json()
            .await
            .map_err(|e| Error::Rpc(format!("{}: parse response: {}", method, e)))?;
        if let Some(err) = json.get("error") {
            return Err(Error::Rpc(format!("{}: {}", method, err)));
        }
        json.get("result")
            .cloned()
            .ok_or_else(|| Error::Rpc(format!("{}: missing result", method)))
    }

    async fn eth_get_logs(&self, filter: Value) -> Result<Vec<Value>> {
        let result = self.http_json_rpc("eth_getLogs", json!([filter]), 2).await?;
        let arr = result
            .as_array()
            .ok_or_else(|| Error::Rpc("eth_getLogs: result not array".into()))?;
        Ok(arr.clone())
    }

    /// Logs for one window. Some nodes reject topic OR-lists or silently ignore them and
    /// return nothing; fall back to an address-only query filtered client-side.
    async fn logs_in_window(
        &self,
        contract: &str,
        filter: EventFilter,
        from: u64,
        to: u64,
    ) -> Result<Vec<Value>> {
        let with_topics = build_logs_filter(contract, Some(filter.kinds()), from, to);
        match self.eth_get_logs(with_topics).await {
            Ok(logs) if !logs.is_empty() => return Ok(logs),
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(
                    reason = %e,
                    "eth_getLogs with topic filter failed, trying address-only"
                );
            }
        }
        let address_only = build_logs_filter(contract, None, from, to);
        let raw = self.eth_get_logs(address_only).await?;
        Ok(raw.into_iter().filter(|log| log_matches(log, filter)).collect())
    }
}

#[async_trait]
impl ChainRpc for HttpChainClient {
    async fn head_height(&self) -> Result<u64> {
        let result = self.http_json_rpc("eth_blockNumber", json!([]), 1).await?;
        let s = result
            .as_str()
            .ok_or_else(|| Error::Rpc("eth_blockNumber: result not string".into()))?;
        parse_hex_u64(s).map_err(|e| Error::Rpc(format!("eth_blockNumber: {}", e)))
    }

    async fn events(
        &self,
        contract: &str,
        filter: EventFilter,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<BlockchainEvent>> {
        let mut out = Vec::new();
        let mut from = from_block;
        while from <= to_block {
            let to = from
                .saturating_add(self.getlogs_max_range - 1)
                .min(to_block);
            let logs = self.logs_in_window(contract, filter, from, to).await?;
            let decoded: Vec<BlockchainEvent> = logs
                .iter()
                .filter_map(|log| {
                    decode_log(log)
                        .map_err(|e| tracing::debug!(%e, "decode log skipped"))
                        .ok()
                })
                .filter(|ev| filter.matches(ev.kind))
                .collect();
            if !logs.is_empty() && decoded.is_empty() {
                tracing::warn!(
                    raw_count = logs.len(),
                    from,
                    to,
                    contract,
                    "logs received but none decoded"
                );
            } else if !decoded.is_empty() {
                tracing::debug!(count = decoded.len(), from, to, contract, "decoded events");
            }
            out.extend(decoded);
            if to == u64::MAX {
                break;
            }
            from = to + 1;
        }
        out.sort_by_key(|ev| (ev.block_number, ev.log_index));
        Ok(out)
    }
}
