//! Durable collections: listener contracts, storage contracts and the pin ledger.
//!
//! Every mutation is applied to a copy, persisted (when file-backed) and only then made
//! visible, so a failed write never leaves half-applied state behind. Snapshots are written
//! to a temp file, synced, and renamed over the previous snapshot.

use crate::abi::normalize_address;
use crate::cursor::Cursor;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

/// Registry (listener) contract being polled for Listen/StopListening.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedListenerContract {
    pub address: String,
    pub last_polled_block: u64,
}

/// Storage contract being polled for PinHash/UnpinHash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedStorageContract {
    pub address: String,
    pub last_polled_block: u64,
    pub size_of_pinned_data: u64,
}

/// A live pin held on behalf of one or more tracked contracts. At most one per cid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinRecord {
    pub cid: String,
    pub size: u64,
    pub time: DateTime<Utc>,
    /// Contracts that pinned this cid. The row goes away with the last one.
    #[serde(default)]
    pub owners: BTreeSet<String>,
}

impl PinRecord {
    pub fn new(cid: impl Into<String>, size: u64) -> Self {
        Self {
            cid: cid.into(),
            size,
            time: Utc::now(),
            owners: BTreeSet::new(),
        }
    }

    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.owners.contains(&owner_key(owner))
    }

    /// True if a contract other than `owner` still holds this pin.
    pub fn held_by_others(&self, owner: &str) -> bool {
        let key = owner_key(owner);
        self.owners.iter().any(|o| *o != key)
    }
}

/// Owners are stored like contract keys; an unknown emitter is the empty owner.
fn owner_key(owner: &str) -> String {
    if owner.trim().is_empty() {
        String::new()
    } else {
        normalize_address(owner)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Collections {
    listener_contracts: BTreeMap<String, TrackedListenerContract>,
    storage_contracts: BTreeMap<String, TrackedStorageContract>,
    pins: BTreeMap<String, PinRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    #[serde(flatten)]
    collections: Collections,
}

impl Snapshot {
    const CURRENT_VERSION: u32 = 1;
}

/// Store for the three durable collections.
#[derive(Debug)]
pub struct Store {
    path: Option<PathBuf>,
    state: RwLock<Collections>,
}

impl Store {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(Collections::default()),
        }
    }

    /// Open a file-backed store, loading the snapshot at `path` if one exists.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let collections = if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let json = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Store(format!("read {}: {}", path.display(), e)))?;
            let snapshot: Snapshot = serde_json::from_str(&json)
                .map_err(|e| Error::Store(format!("parse {}: {}", path.display(), e)))?;
            if snapshot.version > Snapshot::CURRENT_VERSION {
                return Err(Error::Store(format!(
                    "{}: snapshot version {} is newer than supported version {}",
                    path.display(),
                    snapshot.version,
                    Snapshot::CURRENT_VERSION
                )));
            }
            tracing::info!(
                path = %path.display(),
                listeners = snapshot.collections.listener_contracts.len(),
                storage = snapshot.collections.storage_contracts.len(),
                pins = snapshot.collections.pins.len(),
                "restored store snapshot"
            );
            snapshot.collections
        } else {
            tracing::info!(path = %path.display(), "no store snapshot found, starting fresh");
            Collections::default()
        };
        Ok(Self {
            path: Some(path),
            state: RwLock::new(collections),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn listener_contracts(&self) -> Vec<TrackedListenerContract> {
        self.state
            .read()
            .await
            .listener_contracts
            .values()
            .cloned()
            .collect()
    }

    pub async fn listener_contract(&self, address: &str) -> Option<TrackedListenerContract> {
        self.state
            .read()
            .await
            .listener_contracts
            .get(&normalize_address(address))
            .cloned()
    }

    /// Track a listener contract from block 0. Returns false if it was already tracked.
    pub async fn add_listener_contract(&self, address: &str) -> Result<bool> {
        let key = normalize_address(address);
        self.mutate(|c| {
            if c.listener_contracts.contains_key(&key) {
                return false;
            }
            c.listener_contracts.insert(
                key.clone(),
                TrackedListenerContract {
                    address: key.clone(),
                    last_polled_block: 0,
                },
            );
            true
        })
        .await
    }

    /// Advance a listener cursor. Never moves backwards; unknown rows are left alone.
    pub async fn set_listener_cursor(&self, address: &str, block: u64) -> Result<bool> {
        let key = normalize_address(address);
        self.mutate(|c| match c.listener_contracts.get_mut(&key) {
            Some(row) => advance_cursor(&key, &mut row.last_polled_block, block),
            None => false,
        })
        .await
    }

    pub async fn storage_contracts(&self) -> Vec<TrackedStorageContract> {
        self.state
            .read()
            .await
            .storage_contracts
            .values()
            .cloned()
            .collect()
    }

    pub async fn storage_contract(&self, address: &str) -> Option<TrackedStorageContract> {
        self.state
            .read()
            .await
            .storage_contracts
            .get(&normalize_address(address))
            .cloned()
    }

    /// Insert a storage contract row if absent. Returns true if a row was created.
    pub async fn upsert_storage_contract(&self, address: &str) -> Result<bool> {
        let key = normalize_address(address);
        self.mutate(|c| {
            if c.storage_contracts.contains_key(&key) {
                return false;
            }
            c.storage_contracts.insert(
                key.clone(),
                TrackedStorageContract {
                    address: key.clone(),
                    last_polled_block: 0,
                    size_of_pinned_data: 0,
                },
            );
            true
        })
        .await
    }

    pub async fn remove_storage_contract(
        &self,
        address: &str,
    ) -> Result<Option<TrackedStorageContract>> {
        let key = normalize_address(address);
        self.mutate(|c| c.storage_contracts.remove(&key)).await
    }

    /// Advance a storage cursor. A row deleted mid-tick makes this a no-op.
    pub async fn set_storage_cursor(&self, address: &str, block: u64) -> Result<bool> {
        let key = normalize_address(address);
        self.mutate(|c| match c.storage_contracts.get_mut(&key) {
            Some(row) => advance_cursor(&key, &mut row.last_polled_block, block),
            None => false,
        })
        .await
    }

    pub async fn pins(&self) -> Vec<PinRecord> {
        self.state.read().await.pins.values().cloned().collect()
    }

    pub async fn pin(&self, cid: &str) -> Option<PinRecord> {
        self.state.read().await.pins.get(cid).cloned()
    }

    /// Add `owner` to the ledger row for `record.cid`, inserting the row if absent (first
    /// insert wins and keeps its `time` and size).
    ///
    /// `owner`'s pinned size grows by the row size only when it was not an owner yet.
    /// Returns the live record and whether `owner` was newly added.
    pub async fn record_pin(&self, record: PinRecord, owner: &str) -> Result<(PinRecord, bool)> {
        let key = owner_key(owner);
        let cid = record.cid.clone();
        self.mutate(|c| {
            let row = c.pins.entry(cid).or_insert(record);
            let added = row.owners.insert(key.clone());
            let live = row.clone();
            if added {
                if let Some(contract) = c.storage_contracts.get_mut(&key) {
                    contract.size_of_pinned_data =
                        contract.size_of_pinned_data.saturating_add(live.size);
                }
            }
            (live, added)
        })
        .await
    }

    /// Drop `owner` from the ledger row for `cid`, deleting the row once no owner is left.
    ///
    /// Returns the record as it stands after the release (empty `owners` means the row is
    /// gone), or None if `owner` did not hold the pin. Only `owner`'s size shrinks.
    pub async fn remove_pin(&self, cid: &str, owner: &str) -> Result<Option<PinRecord>> {
        let key = owner_key(owner);
        self.mutate(|c| {
            let row = c.pins.get_mut(cid)?;
            if !row.owners.remove(&key) {
                return None;
            }
            let released = row.clone();
            if released.owners.is_empty() {
                c.pins.remove(cid);
            }
            if let Some(contract) = c.storage_contracts.get_mut(&key) {
                contract.size_of_pinned_data =
                    contract.size_of_pinned_data.saturating_sub(released.size);
            }
            Some(released)
        })
        .await
    }

    async fn mutate<T>(&self, f: impl FnOnce(&mut Collections) -> T) -> Result<T> {
        let mut guard = self.state.write().await;
        let mut next = guard.clone();
        let out = f(&mut next);
        if next != *guard {
            if let Some(path) = &self.path {
                persist(path, &next).await?;
            }
            *guard = next;
        }
        Ok(out)
    }
}

fn advance_cursor(address: &str, field: &mut u64, block: u64) -> bool {
    let mut cursor = Cursor::new(*field);
    if block < cursor.last_polled_block {
        tracing::warn!(
            contract = %address,
            current = cursor.last_polled_block,
            requested = block,
            "ignoring cursor regression"
        );
    }
    let moved = cursor.advance(block);
    *field = cursor.last_polled_block;
    moved
}

async fn persist(path: &Path, collections: &Collections) -> Result<()> {
    let snapshot = Snapshot {
        version: Snapshot::CURRENT_VERSION,
        collections: collections.clone(),
    };
    let json = serde_json::to_vec_pretty(&snapshot)
        .map_err(|e| Error::Store(format!("serialize snapshot: {}", e)))?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::Store(format!("create {}: {}", parent.display(), e)))?;
    }
    let temp_path = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&temp_path)
        .await
        .map_err(|e| Error::Store(format!("create {}: {}", temp_path.display(), e)))?;
    file.write_all(&json)
        .await
        .map_err(|e| Error::Store(format!("write {}: {}", temp_path.display(), e)))?;
    file.sync_all()
        .await
        .map_err(|e| Error::Store(format!("sync {}: {}", temp_path.display(), e)))?;
    drop(file);
    tokio::fs::rename(&temp_path, path)
        .await
        .map_err(|e| Error::Store(format!("rename to {}: {}", path.display(), e)))?;
    tracing::debug!(path = %path.display(), "store snapshot written");
    Ok(())
}
