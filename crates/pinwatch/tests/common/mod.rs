//! Common helpers for integration tests: an in-memory chain, an in-memory storage network,
//! and Anvil process helpers for the node-backed tests.

#![allow(dead_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use pinwatch::abi::normalize_address;
use pinwatch::{
    BlockchainEvent, ChainRpc, ContractRegistry, Error, EventFilter, EventHandlers, PinAck,
    StorageNetwork, Store,
};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::sleep;

#[derive(Default)]
struct ChainState {
    head: u64,
    events: Vec<BlockchainEvent>,
    head_unavailable: bool,
    failing: HashSet<String>,
    requests: Vec<(String, u64, u64)>,
}

/// Chain double: a head height and a flat list of logs, with failure injection.
#[derive(Default)]
pub struct MockChain {
    state: Mutex<ChainState>,
}

impl MockChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn head(&self) -> u64 {
        self.state.lock().unwrap().head
    }

    /// Mine `n` empty blocks and return the new head.
    pub fn mine(&self, n: u64) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.head += n;
        state.head
    }

    /// Mine one block holding `events`, all emitted by `emitter`, in the given order.
    pub fn mine_with(&self, emitter: &str, events: Vec<BlockchainEvent>) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.head += 1;
        let block = state.head;
        for (i, ev) in events.into_iter().enumerate() {
            state.events.push(ev.emitted_by(emitter).at(block, i as u64));
        }
        block
    }

    pub fn set_head_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().head_unavailable = unavailable;
    }

    /// Make every `events` call for `contract` fail until cleared.
    pub fn set_failing(&self, contract: &str, failing: bool) {
        let mut state = self.state.lock().unwrap();
        let contract = normalize_address(contract);
        if failing {
            state.failing.insert(contract);
        } else {
            state.failing.remove(&contract);
        }
    }

    /// `(contract, from, to)` of every events request, in call order.
    pub fn requests(&self) -> Vec<(String, u64, u64)> {
        self.state.lock().unwrap().requests.clone()
    }
}

#[async_trait]
impl ChainRpc for MockChain {
    async fn head_height(&self) -> pinwatch::Result<u64> {
        let state = self.state.lock().unwrap();
        if state.head_unavailable {
            return Err(Error::Rpc("eth_blockNumber: connection refused".into()));
        }
        Ok(state.head)
    }

    async fn events(
        &self,
        contract: &str,
        filter: EventFilter,
        from_block: u64,
        to_block: u64,
    ) -> pinwatch::Result<Vec<BlockchainEvent>> {
        let mut state = self.state.lock().unwrap();
        let contract = normalize_address(contract);
        state
            .requests
            .push((contract.clone(), from_block, to_block));
        if state.failing.contains(&contract) {
            return Err(Error::Rpc(format!("eth_getLogs {}: timeout", contract)));
        }
        let mut out: Vec<BlockchainEvent> = state
            .events
            .iter()
            .filter(|ev| ev.emitter == contract)
            .filter(|ev| ev.block_number >= from_block && ev.block_number <= to_block)
            .filter(|ev| filter.matches(ev.kind))
            .cloned()
            .collect();
        out.sort_by_key(|ev| (ev.block_number, ev.log_index));
        Ok(out)
    }
}

/// Holds one `pin_add` call open: `reached` fires when the call arrives, and the call
/// finishes after `release` is notified.
#[derive(Clone, Default)]
pub struct PinGate {
    pub reached: Arc<Notify>,
    pub release: Arc<Notify>,
}

/// Storage network double. Sizes default to 100 bytes per cid.
#[derive(Default)]
pub struct MockStorageNetwork {
    pins: Mutex<BTreeSet<String>>,
    sizes: Mutex<BTreeMap<String, u64>>,
    gates: Mutex<BTreeMap<String, PinGate>>,
    unreachable: AtomicBool,
    pin_add_calls: AtomicU64,
    pin_remove_calls: AtomicU64,
}

impl MockStorageNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_size(&self, cid: &str, size: u64) {
        self.sizes.lock().unwrap().insert(cid.to_string(), size);
    }

    /// Hold the next `pin_add` of `cid` until the returned gate is released.
    pub fn hold_pin(&self, cid: &str) -> PinGate {
        let gate = PinGate::default();
        self.gates.lock().unwrap().insert(cid.to_string(), gate.clone());
        gate
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn is_pinned(&self, cid: &str) -> bool {
        self.pins.lock().unwrap().contains(cid)
    }

    pub fn pin_add_calls(&self) -> u64 {
        self.pin_add_calls.load(Ordering::SeqCst)
    }

    pub fn pin_remove_calls(&self) -> u64 {
        self.pin_remove_calls.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> pinwatch::Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::StorageNetwork("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageNetwork for MockStorageNetwork {
    async fn pin_add(&self, cid: &str) -> pinwatch::Result<PinAck> {
        self.pin_add_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gates.lock().unwrap().remove(cid);
        if let Some(gate) = gate {
            gate.reached.notify_one();
            gate.release.notified().await;
        }
        self.check_reachable()?;
        self.pins.lock().unwrap().insert(cid.to_string());
        let size = self.sizes.lock().unwrap().get(cid).copied().unwrap_or(100);
        Ok(PinAck {
            cid: cid.to_string(),
            size,
        })
    }

    async fn pin_remove(&self, cid: &str) -> pinwatch::Result<()> {
        self.pin_remove_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        self.pins.lock().unwrap().remove(cid);
        Ok(())
    }

    async fn pin_list(&self) -> pinwatch::Result<Vec<String>> {
        self.check_reachable()?;
        Ok(self.pins.lock().unwrap().iter().cloned().collect())
    }
}

/// Everything a watcher test needs, wired over in-memory doubles.
pub struct Harness {
    pub chain: Arc<MockChain>,
    pub network: Arc<MockStorageNetwork>,
    pub store: Arc<Store>,
    pub registry: Arc<ContractRegistry>,
    pub handlers: EventHandlers,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(Store::in_memory())
    }

    pub fn with_store(store: Store) -> Self {
        let chain = MockChain::new();
        let network = MockStorageNetwork::new();
        let store = Arc::new(store);
        let registry = Arc::new(ContractRegistry::new());
        let handlers = EventHandlers::new(
            Arc::clone(&store),
            network.clone() as Arc<dyn StorageNetwork>,
            Arc::clone(&registry),
        );
        Self {
            chain,
            network,
            store,
            registry,
            handlers,
        }
    }

    pub fn chain_rpc(&self) -> Arc<dyn ChainRpc> {
        self.chain.clone()
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pinwatch=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

/// Returns true if `anvil` is on PATH.
pub fn foundry_available() -> bool {
    Command::new("anvil")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Spawn Anvil on a dynamic port and wait until ready.
pub async fn spawn_anvil() -> Result<(Child, String)> {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").context("bind for port")?;
        listener.local_addr()?.port()
    };
    let rpc_url = format!("http://127.0.0.1:{}", port);
    let mut cmd = Command::new("anvil");
    cmd.arg("--port")
        .arg(port.to_string())
        .arg("--host")
        .arg("127.0.0.1");
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let process = cmd.spawn().context("spawn anvil")?;
    wait_for_rpc(&rpc_url).await?;
    Ok((process, rpc_url))
}

async fn wait_for_rpc(url: &str) -> Result<()> {
    let client = reqwest::Client::builder().no_proxy().build()?;
    for _ in 0..30 {
        let ok = client
            .post(url)
            .json(&serde_json::json!({
                "jsonrpc": "2.0",
                "method": "eth_blockNumber",
                "params": [],
                "id": 1
            }))
            .send()
            .await
            .is_ok();
        if ok {
            return Ok(());
        }
        sleep(Duration::from_millis(100)).await;
    }
    anyhow::bail!("RPC not ready");
}

async fn rpc(url: &str, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
    let resp: serde_json::Value = reqwest::Client::builder().no_proxy().build()?
        .post(url)
        .json(&serde_json::json!({"jsonrpc":"2.0","method":method,"params":params,"id":1}))
        .send()
        .await?
        .json()
        .await?;
    if let Some(err) = resp.get("error") {
        anyhow::bail!("{}: {}", method, err);
    }
    resp.get("result")
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("{}: missing result", method))
}

/// Mine one empty block.
pub async fn evm_mine(url: &str) -> Result<()> {
    rpc(url, "evm_mine", serde_json::json!([])).await?;
    Ok(())
}

/// First prefunded Anvil account; unlocked, so eth_sendTransaction needs no signature.
pub const ANVIL_ACCOUNT: &str = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266";

/// Deploy `init_code` from [ANVIL_ACCOUNT] and return the created contract address.
///
/// Logs emitted by the init code are attributed to the created address, which is enough to
/// stand in for a contract that emits one event.
pub async fn deploy_init_code(url: &str, init_code: &[u8]) -> Result<String> {
    let tx_hash = rpc(
        url,
        "eth_sendTransaction",
        serde_json::json!([{
            "from": ANVIL_ACCOUNT,
            "data": format!("0x{}", hex::encode(init_code)),
            "gas": "0x100000",
        }]),
    )
    .await?;
    let receipt = rpc(url, "eth_getTransactionReceipt", serde_json::json!([tx_hash])).await?;
    receipt
        .get("contractAddress")
        .and_then(|a| a.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("no contractAddress in receipt: {}", receipt))
}

/// Init code that emits `LOG2(topic0, address)` with empty data.
pub fn emit_address_event(topic0: [u8; 32], address: &str) -> Result<Vec<u8>> {
    let raw = hex::decode(address.trim_start_matches("0x")).context("address hex")?;
    anyhow::ensure!(raw.len() == 20, "address must be 20 bytes");
    let mut topic1 = [0u8; 32];
    topic1[12..].copy_from_slice(&raw);

    let mut code = Vec::new();
    push32(&mut code, &topic1);
    push32(&mut code, &topic0);
    code.extend_from_slice(&[0x60, 0x00, 0x60, 0x00, 0xa2, 0x00]); // size 0, offset 0, LOG2, STOP
    Ok(code)
}

/// Init code that emits `LOG1(topic0)` with an ABI-encoded `string` of up to 32 bytes.
pub fn emit_string_event(topic0: [u8; 32], value: &str) -> Result<Vec<u8>> {
    let bytes = value.as_bytes();
    anyhow::ensure!(bytes.len() <= 32, "string longer than one word");
    let mut offset = [0u8; 32];
    offset[31] = 0x20;
    let mut len = [0u8; 32];
    len[31] = bytes.len() as u8;
    let mut body = [0u8; 32];
    body[..bytes.len()].copy_from_slice(bytes);

    let mut code = Vec::new();
    for (word, at) in [(offset, 0x00u8), (len, 0x20), (body, 0x40)] {
        push32(&mut code, &word);
        code.extend_from_slice(&[0x60, at, 0x52]); // PUSH1 at, MSTORE
    }
    push32(&mut code, &topic0);
    // size 0x60, offset 0, LOG1, STOP
    code.extend_from_slice(&[0x60, 0x60, 0x60, 0x00, 0xa1, 0x00]);
    Ok(code)
}

fn push32(code: &mut Vec<u8>, word: &[u8; 32]) {
    code.push(0x7f);
    code.extend_from_slice(word);
}
