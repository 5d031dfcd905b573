//! ABI types and decoding for the listener and storage contracts.
//!
//! Listen/StopListening events on the listener contract, PinHash/UnpinHash on storage
//! contracts. Decode from the JSON-RPC log shape into a normalized [BlockchainEvent].

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use sha3::{Digest, Keccak256};

/// Event types the watchers understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    Listen,
    StopListening,
    PinHash,
    UnpinHash,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::Listen,
        EventKind::StopListening,
        EventKind::PinHash,
        EventKind::UnpinHash,
    ];

    /// Solidity event signature (canonical form, no parameter names).
    pub fn signature(self) -> &'static str {
        match self {
            EventKind::Listen => "Listen(address)",
            EventKind::StopListening => "StopListening(address)",
            EventKind::PinHash => "PinHash(string)",
            EventKind::UnpinHash => "UnpinHash(string)",
        }
    }

    /// keccak256 of the signature, i.e. the log's topic0.
    pub fn topic0(self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&Keccak256::digest(self.signature().as_bytes()));
        out
    }

    pub fn from_topic0(topic0: &[u8]) -> Option<Self> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.topic0().as_slice() == topic0)
    }
}

/// Which family of events a watcher asks the chain for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    /// Listen + StopListening on a listener (registry) contract.
    Listener,
    /// PinHash + UnpinHash on a storage contract.
    Storage,
}

impl EventFilter {
    pub fn kinds(self) -> &'static [EventKind] {
        match self {
            EventFilter::Listener => &[EventKind::Listen, EventKind::StopListening],
            EventFilter::Storage => &[EventKind::PinHash, EventKind::UnpinHash],
        }
    }

    pub fn matches(self, kind: EventKind) -> bool {
        self.kinds().contains(&kind)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventPayload {
    pub contract_address: Option<String>,
    pub cid: Option<String>,
}

/// A decoded log, consumed once by a handler. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockchainEvent {
    pub kind: EventKind,
    pub payload: EventPayload,
    /// Contract that emitted the log (lowercase 0x-hex).
    pub emitter: String,
    pub block_number: u64,
    pub log_index: u64,
}

impl BlockchainEvent {
    pub fn new(kind: EventKind, payload: EventPayload) -> Self {
        Self {
            kind,
            payload,
            emitter: String::new(),
            block_number: 0,
            log_index: 0,
        }
    }

    pub fn listen(contract_address: impl Into<String>) -> Self {
        Self::new(
            EventKind::Listen,
            EventPayload {
                contract_address: Some(contract_address.into()),
                cid: None,
            },
        )
    }

    pub fn stop_listening(contract_address: impl Into<String>) -> Self {
        Self::new(
            EventKind::StopListening,
            EventPayload {
                contract_address: Some(contract_address.into()),
                cid: None,
            },
        )
    }

    pub fn pin_hash(cid: impl Into<String>) -> Self {
        Self::new(
            EventKind::PinHash,
            EventPayload {
                contract_address: None,
                cid: Some(cid.into()),
            },
        )
    }

    pub fn unpin_hash(cid: impl Into<String>) -> Self {
        Self::new(
            EventKind::UnpinHash,
            EventPayload {
                contract_address: None,
                cid: Some(cid.into()),
            },
        )
    }

    pub fn emitted_by(mut self, emitter: impl Into<String>) -> Self {
        self.emitter = normalize_address(&emitter.into());
        self
    }

    pub fn at(mut self, block_number: u64, log_index: u64) -> Self {
        self.block_number = block_number;
        self.log_index = log_index;
        self
    }
}

/// Lowercase, 0x-prefixed form used as the key of every tracked set.
pub fn normalize_address(address: &str) -> String {
    let trimmed = address.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    format!("0x{}", body.to_ascii_lowercase())
}

/// Decode a JSON-RPC log (eth_getLogs result entry) into a [BlockchainEvent].
///
/// Structural problems (missing block number, unknown topic0) are errors. A recognized event
/// whose argument cannot be decoded yields an empty payload field, which handlers reject.
pub fn decode_log(log_value: &Value) -> Result<BlockchainEvent> {
    let block_number = parse_hex_u64(
        log_value
            .get("blockNumber")
            .and_then(|n| n.as_str())
            .ok_or_else(|| anyhow::anyhow!("Missing blockNumber"))?,
    )?;
    let log_index = parse_hex_u64(
        log_value
            .get("logIndex")
            .and_then(|n| n.as_str())
            .ok_or_else(|| anyhow::anyhow!("Missing logIndex"))?,
    )?;
    let emitter = log_value
        .get("address")
        .and_then(|a| a.as_str())
        .map(normalize_address)
        .ok_or_else(|| anyhow::anyhow!("Missing address"))?;
    let data = parse_hex_bytes(
        log_value
            .get("data")
            .and_then(|d| d.as_str())
            .unwrap_or("0x"),
    )?;
    let topics = log_value
        .get("topics")
        .and_then(|t| t.as_array())
        .ok_or_else(|| anyhow::anyhow!("Missing topics"))?;
    let topic0 = parse_hex_bytes(
        topics
            .first()
            .and_then(|t| t.as_str())
            .ok_or_else(|| anyhow::anyhow!("Missing topic0"))?,
    )?;
    let kind = EventKind::from_topic0(&topic0)
        .ok_or_else(|| anyhow::anyhow!("Unknown topic0 0x{}", hex::encode(&topic0)))?;

    let payload = match kind {
        EventKind::Listen | EventKind::StopListening => {
            // Indexed address arrives as topic1; non-indexed as the first data word.
            let word = match topics.get(1).and_then(|t| t.as_str()) {
                Some(t1) => Some(parse_hex_bytes(t1)?),
                None => data.get(..32).map(|w| w.to_vec()),
            };
            EventPayload {
                contract_address: word.and_then(|w| address_from_word(&w)),
                cid: None,
            }
        }
        EventKind::PinHash | EventKind::UnpinHash => EventPayload {
            contract_address: None,
            cid: decode_string(&data, 0).ok(),
        },
    };

    Ok(BlockchainEvent {
        kind,
        payload,
        emitter,
        block_number,
        log_index,
    })
}

/// Decode a dynamic `string` whose head word sits at `head_offset` in ABI-encoded data.
pub fn decode_string(data: &[u8], head_offset: usize) -> Result<String> {
    let offset = read_word_usize(data, head_offset).context("string offset")?;
    let len = read_word_usize(data, offset).context("string length")?;
    let start = offset
        .checked_add(32)
        .ok_or_else(|| anyhow::anyhow!("string offset overflow"))?;
    let end = start
        .checked_add(len)
        .ok_or_else(|| anyhow::anyhow!("string length overflow"))?;
    if data.len() < end {
        anyhow::bail!("Data too short for string len {}", len);
    }
    String::from_utf8(data[start..end].to_vec()).context("string is not utf-8")
}

fn read_word_usize(data: &[u8], at: usize) -> Result<usize> {
    let end = at
        .checked_add(32)
        .ok_or_else(|| anyhow::anyhow!("word offset {} overflows", at))?;
    let word = data
        .get(at..end)
        .ok_or_else(|| anyhow::anyhow!("Data too short for word at {}", at))?;
    if word[..24].iter().any(|b| *b != 0) {
        anyhow::bail!("word at {} does not fit in u64", at);
    }
    let mut be = [0u8; 8];
    be.copy_from_slice(&word[24..32]);
    usize::try_from(u64::from_be_bytes(be)).context("word exceeds usize")
}

fn address_from_word(word: &[u8]) -> Option<String> {
    match word.len() {
        20 => Some(format!("0x{}", hex::encode(word))),
        // Address in a 32-byte word is left-padded; take last 20.
        32 => Some(format!("0x{}", hex::encode(&word[12..32]))),
        _ => None,
    }
}

pub(crate) fn parse_hex_u64(s: &str) -> Result<u64> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).context("parse hex u64")
}

fn parse_hex_bytes(s: &str) -> Result<Vec<u8>> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(s).context("parse hex bytes")
}
