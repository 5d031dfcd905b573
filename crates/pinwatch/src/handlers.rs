//! Event handlers: turn one decoded event into a state mutation.
//!
//! Every handler is idempotent. Watchers deliver at least once (a crash between handling and
//! the cursor write replays the range), so applying the same event twice must leave the same
//! state as applying it once.
//!
//! Mapping:
//! - `Listen(a)`: track storage contract `a` from block 0 (no-op if tracked).
//! - `StopListening(a)`: stop tracking `a` (no-op if untracked) and release the registry
//!   subscription bound to `a`.
//! - `PinHash(cid)`: ensure the storage network pins `cid`, then ensure the ledger row lists
//!   the emitting contract as an owner.
//! - `UnpinHash(cid)`: drop the emitter from the row's owners. The storage network unpins
//!   only once no other contract holds the cid; an unpin from a non-owner is a no-op.
//!
//! The storage network is always called before the ledger is touched, so a failed pin/unpin
//! leaves the ledger unchanged. Pin and unpin handling is serialized across contracts so the
//! owner check and the network call cannot interleave with another contract's event.

use crate::abi::{normalize_address, BlockchainEvent, EventKind};
use crate::error::{Error, Result};
use crate::ipfs::StorageNetwork;
use crate::registry::ContractRegistry;
use crate::store::{PinRecord, Store};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Result of a Listen/StopListening event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum ListenOutcome {
    Tracked { address: String, created: bool },
    Untracked { address: String, removed: bool },
}

/// Ledger view of a cid after a PinHash/UnpinHash event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerState {
    pub cid: String,
    pub pinned: bool,
    pub record: Option<PinRecord>,
}

#[derive(Clone)]
pub struct EventHandlers {
    store: Arc<Store>,
    storage: Arc<dyn StorageNetwork>,
    registry: Arc<ContractRegistry>,
    ledger_lock: Arc<Mutex<()>>,
}

impl EventHandlers {
    pub fn new(
        store: Arc<Store>,
        storage: Arc<dyn StorageNetwork>,
        registry: Arc<ContractRegistry>,
    ) -> Self {
        Self {
            store,
            storage,
            registry,
            ledger_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ContractRegistry> {
        &self.registry
    }

    pub async fn handle_listen_event(&self, event: &BlockchainEvent) -> Result<ListenOutcome> {
        let address = event
            .payload
            .contract_address
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(normalize_address)
            .ok_or_else(|| Error::validation("contractAddress"))?;

        match event.kind {
            EventKind::Listen => {
                let created = self.store.upsert_storage_contract(&address).await?;
                if created {
                    tracing::info!(
                        contract = %address,
                        block = event.block_number,
                        "listening to storage contract"
                    );
                }
                Ok(ListenOutcome::Tracked { address, created })
            }
            EventKind::StopListening => {
                let removed = self.store.remove_storage_contract(&address).await?.is_some();
                self.registry.release(&address).await;
                if removed {
                    tracing::info!(
                        contract = %address,
                        block = event.block_number,
                        "stopped listening to storage contract"
                    );
                }
                Ok(ListenOutcome::Untracked { address, removed })
            }
            EventKind::PinHash | EventKind::UnpinHash => Err(Error::validation("type")),
        }
    }

    pub async fn handle_pin_hash_event(&self, event: &BlockchainEvent) -> Result<LedgerState> {
        let cid = event
            .payload
            .cid
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::validation("cid"))?
            .to_string();
        let owner = event.emitter.as_str();

        match event.kind {
            EventKind::PinHash => {
                let _ledger = self.ledger_lock.lock().await;
                let ack = self.storage.pin_add(&cid).await?;
                let (record, added) = self
                    .store
                    .record_pin(PinRecord::new(cid.clone(), ack.size), owner)
                    .await?;
                if added {
                    tracing::info!(
                        cid = %cid,
                        size = record.size,
                        contract = owner,
                        "pin recorded"
                    );
                }
                Ok(LedgerState {
                    cid,
                    pinned: true,
                    record: Some(record),
                })
            }
            EventKind::UnpinHash => {
                let _ledger = self.ledger_lock.lock().await;
                if let Some(existing) = self.store.pin(&cid).await {
                    if !existing.is_owned_by(owner) {
                        tracing::debug!(
                            cid = %cid,
                            contract = owner,
                            "unpin from a non-owner ignored"
                        );
                        return Ok(LedgerState {
                            cid,
                            pinned: true,
                            record: Some(existing),
                        });
                    }
                    if !existing.held_by_others(owner) {
                        self.storage.pin_remove(&cid).await?;
                    }
                } else {
                    self.storage.pin_remove(&cid).await?;
                }
                let remaining = self
                    .store
                    .remove_pin(&cid, owner)
                    .await?
                    .filter(|record| !record.owners.is_empty());
                tracing::info!(
                    cid = %cid,
                    contract = owner,
                    still_pinned = remaining.is_some(),
                    "pin released"
                );
                Ok(LedgerState {
                    cid,
                    pinned: remaining.is_some(),
                    record: remaining,
                })
            }
            EventKind::Listen | EventKind::StopListening => Err(Error::validation("type")),
        }
    }
}
