//! Contract registry: the contracts REST clients asked to have watched.
//!
//! Bookkeeping only; nothing here polls. Entries keep insertion order. Alongside them the
//! registry hands out per-address subscription tokens: the pin watcher holds one while it
//! applies a contract's events, and the token is cancelled when the entry is removed or the
//! contract stops being listened to.

use crate::abi::normalize_address;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Rinkeby,
    Mainnet,
    Localhost,
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rinkeby" => Ok(Network::Rinkeby),
            "mainnet" => Ok(Network::Mainnet),
            "localhost" => Ok(Network::Localhost),
            _ => Err(Error::validation("network")),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Network::Rinkeby => "rinkeby",
            Network::Mainnet => "mainnet",
            Network::Localhost => "localhost",
        };
        f.write_str(s)
    }
}

/// A validated registration request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContractSpec {
    pub address: String,
    pub network: Network,
    pub abi: Value,
}

impl ContractSpec {
    /// Validate a raw request body. On failure every missing or invalid field is reported,
    /// in the order address, network, abi.
    pub fn from_json(body: &Value) -> Result<Self> {
        let mut invalid = Vec::new();

        let address = body
            .get("address")
            .and_then(|a| a.as_str())
            .map(str::trim)
            .filter(|a| !a.is_empty());
        if address.is_none() {
            invalid.push("address".to_string());
        }

        let network = body
            .get("network")
            .and_then(|n| n.as_str())
            .and_then(|n| n.parse::<Network>().ok());
        if network.is_none() {
            invalid.push("network".to_string());
        }

        // ABI JSON is an array of entries in practice; accept an object too.
        let abi = body
            .get("abi")
            .filter(|a| a.is_object() || a.is_array())
            .cloned();
        if abi.is_none() {
            invalid.push("abi".to_string());
        }

        match (address, network, abi) {
            (Some(address), Some(network), Some(abi)) => Ok(Self {
                address: address.to_string(),
                network,
                abi,
            }),
            _ => Err(Error::Validation(invalid)),
        }
    }
}

#[derive(Debug, Default)]
pub struct ContractRegistry {
    entries: RwLock<Vec<ContractSpec>>,
    subscriptions: RwLock<HashMap<String, CancellationToken>>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `body` and append it. Fails on invalid fields or an already registered address.
    pub async fn add(&self, body: &Value) -> Result<ContractSpec> {
        let spec = ContractSpec::from_json(body)?;
        self.add_spec(spec.clone()).await?;
        Ok(spec)
    }

    pub async fn add_spec(&self, spec: ContractSpec) -> Result<()> {
        let mut entries = self.entries.write().await;
        if entries
            .iter()
            .any(|e| e.address.eq_ignore_ascii_case(&spec.address))
        {
            return Err(Error::Duplicate(spec.address));
        }
        tracing::info!(address = %spec.address, network = %spec.network, "contract registered");
        entries.push(spec);
        Ok(())
    }

    /// Remove the entry for `address`, releasing its subscription.
    pub async fn remove(&self, address: &str) -> Result<ContractSpec> {
        let spec = {
            let mut entries = self.entries.write().await;
            let index = entries
                .iter()
                .position(|e| e.address.eq_ignore_ascii_case(address))
                .ok_or_else(|| Error::NotFound(address.to_string()))?;
            entries.remove(index)
        };
        self.release(&spec.address).await;
        tracing::info!(address = %spec.address, "contract unregistered");
        Ok(spec)
    }

    /// Registered contracts in insertion order.
    pub async fn list(&self) -> Vec<ContractSpec> {
        self.entries.read().await.clone()
    }

    /// Live subscription token bound to `address`. A released token is replaced by a fresh
    /// one, so re-subscribing after a release starts uncancelled.
    pub async fn subscribe(&self, address: &str) -> CancellationToken {
        let mut subscriptions = self.subscriptions.write().await;
        let token = subscriptions
            .entry(normalize_address(address))
            .or_insert_with(CancellationToken::new);
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        token.clone()
    }

    /// Cancel the subscription bound to `address`. Returns true if one was live.
    pub async fn release(&self, address: &str) -> bool {
        let removed = self
            .subscriptions
            .write()
            .await
            .remove(&normalize_address(address));
        match removed {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                tracing::debug!(address, "subscription released");
                true
            }
            _ => false,
        }
    }
}
