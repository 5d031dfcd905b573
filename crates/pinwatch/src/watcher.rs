//! Watchers: scheduler tasks that poll tracked contracts and feed the event handlers.
//!
//! One tick: read the chain head `H`, load the tracked rows, and for every row whose cursor
//! is behind `H` fetch events in the cursor's next range, apply them in chain order, then
//! commit cursor = `H`. Contracts are polled concurrently and fail independently: a failed
//! fetch or handler leaves that contract's cursor where it was and it is retried next tick.
//!
//! A storage contract is polled under its registry subscription. When a StopListening for it
//! lands mid-range the subscription is cancelled, the remaining events are dropped and the
//! contract is reported as released.

use crate::abi::{BlockchainEvent, EventFilter};
use crate::chain::ChainRpc;
use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::handlers::EventHandlers;
use crate::scheduler::{Scheduler, SchedulerError, Task};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A tracked-contract set plus the handler and cursor column that go with it.
#[async_trait]
pub trait WatchedSet: Send + Sync + 'static {
    fn label(&self) -> &'static str;

    fn filter(&self) -> EventFilter;

    /// Tracked contracts and their cursors.
    async fn contracts(&self) -> Vec<(String, Cursor)>;

    /// Token that is cancelled once `address` stops being tracked. `None` means the set
    /// never untracks contracts while they are being polled.
    async fn subscription(&self, _address: &str) -> Option<CancellationToken> {
        None
    }

    async fn apply(&self, event: &BlockchainEvent) -> Result<()>;

    /// Persist the cursor after the whole range was applied.
    async fn commit(&self, address: &str, block: u64) -> Result<bool>;
}

/// Listener (registry) contracts, driving Listen/StopListening.
pub struct ListenerContracts {
    handlers: EventHandlers,
}

#[async_trait]
impl WatchedSet for ListenerContracts {
    fn label(&self) -> &'static str {
        "listen-watcher"
    }

    fn filter(&self) -> EventFilter {
        EventFilter::Listener
    }

    async fn contracts(&self) -> Vec<(String, Cursor)> {
        self.handlers
            .store()
            .listener_contracts()
            .await
            .into_iter()
            .map(|c| (c.address, Cursor::new(c.last_polled_block)))
            .collect()
    }

    async fn apply(&self, event: &BlockchainEvent) -> Result<()> {
        self.handlers.handle_listen_event(event).await.map(|_| ())
    }

    async fn commit(&self, address: &str, block: u64) -> Result<bool> {
        self.handlers.store().set_listener_cursor(address, block).await
    }
}

/// Storage contracts, driving PinHash/UnpinHash.
pub struct StorageContracts {
    handlers: EventHandlers,
}

#[async_trait]
impl WatchedSet for StorageContracts {
    fn label(&self) -> &'static str {
        "pin-watcher"
    }

    fn filter(&self) -> EventFilter {
        EventFilter::Storage
    }

    async fn contracts(&self) -> Vec<(String, Cursor)> {
        self.handlers
            .store()
            .storage_contracts()
            .await
            .into_iter()
            .map(|c| (c.address, Cursor::new(c.last_polled_block)))
            .collect()
    }

    async fn subscription(&self, address: &str) -> Option<CancellationToken> {
        let registry = self.handlers.registry();
        let token = registry.subscribe(address).await;
        // Untracked between listing and subscribing.
        if self.handlers.store().storage_contract(address).await.is_none() {
            registry.release(address).await;
        }
        Some(token)
    }

    async fn apply(&self, event: &BlockchainEvent) -> Result<()> {
        self.handlers.handle_pin_hash_event(event).await.map(|_| ())
    }

    async fn commit(&self, address: &str, block: u64) -> Result<bool> {
        self.handlers.store().set_storage_cursor(address, block).await
    }
}

/// What one tick did, per contract.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub head: u64,
    /// Contracts whose cursor moved to `head`.
    pub advanced: Vec<String>,
    /// Contracts already at `head`.
    pub up_to_date: Vec<String>,
    /// Contracts left at their old cursor.
    pub failed: Vec<(String, Error)>,
    /// Contracts untracked while their range was being applied.
    pub released: Vec<String>,
}

enum Outcome {
    Advanced,
    UpToDate,
    Failed(Error),
    Released,
}

/// Polls one [WatchedSet] against the chain.
pub struct Watcher<S> {
    chain: Arc<dyn ChainRpc>,
    set: S,
}

pub type ListenWatcher = Watcher<ListenerContracts>;
pub type PinWatcher = Watcher<StorageContracts>;

impl Watcher<ListenerContracts> {
    pub fn new(chain: Arc<dyn ChainRpc>, handlers: EventHandlers) -> Self {
        Self {
            chain,
            set: ListenerContracts { handlers },
        }
    }
}

impl Watcher<StorageContracts> {
    pub fn new(chain: Arc<dyn ChainRpc>, handlers: EventHandlers) -> Self {
        Self {
            chain,
            set: StorageContracts { handlers },
        }
    }
}

impl<S: WatchedSet> Watcher<S> {
    /// Run one polling pass. Fails only if the chain head cannot be read.
    pub async fn tick(&self) -> Result<TickReport> {
        let head = self.chain.head_height().await?;
        let contracts = self.set.contracts().await;
        let outcomes = join_all(
            contracts
                .into_iter()
                .map(|(address, cursor)| self.poll_contract(address, cursor, head)),
        )
        .await;

        let mut report = TickReport {
            head,
            ..Default::default()
        };
        for (address, outcome) in outcomes {
            match outcome {
                Outcome::Advanced => report.advanced.push(address),
                Outcome::UpToDate => report.up_to_date.push(address),
                Outcome::Failed(e) => report.failed.push((address, e)),
                Outcome::Released => report.released.push(address),
            }
        }
        tracing::debug!(
            watcher = self.set.label(),
            head,
            advanced = report.advanced.len(),
            failed = report.failed.len(),
            released = report.released.len(),
            "tick done"
        );
        Ok(report)
    }

    async fn poll_contract(
        &self,
        address: String,
        cursor: Cursor,
        head: u64,
    ) -> (String, Outcome) {
        let Some((from, to)) = cursor.next_range(head) else {
            return (address, Outcome::UpToDate);
        };
        let subscription = self.set.subscription(&address).await;
        let released = || subscription.as_ref().is_some_and(|t| t.is_cancelled());
        if released() {
            return (address, Outcome::Released);
        }
        let events = match self.chain.events(&address, self.set.filter(), from, to).await {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(
                    watcher = self.set.label(),
                    contract = %address,
                    from,
                    to,
                    reason = %e,
                    "fetching events failed"
                );
                return (address, Outcome::Failed(e));
            }
        };
        // Sequential: order within one contract must be preserved.
        for event in &events {
            if released() {
                tracing::info!(
                    watcher = self.set.label(),
                    contract = %address,
                    block = event.block_number,
                    "contract no longer tracked, remaining events dropped"
                );
                return (address, Outcome::Released);
            }
            if let Err(e) = self.set.apply(event).await {
                if e.is_transient() {
                    tracing::warn!(
                        watcher = self.set.label(),
                        contract = %address,
                        block = event.block_number,
                        log_index = event.log_index,
                        from,
                        to,
                        reason = %e,
                        "handler failed, cursor not advanced"
                    );
                } else {
                    // Replays on every tick until the contract is untracked.
                    tracing::error!(
                        watcher = self.set.label(),
                        contract = %address,
                        block = event.block_number,
                        log_index = event.log_index,
                        reason = %e,
                        "event rejected, cursor held"
                    );
                }
                return (address, Outcome::Failed(e));
            }
        }
        match self.set.commit(&address, to).await {
            Ok(_) => {
                if !events.is_empty() {
                    tracing::info!(
                        watcher = self.set.label(),
                        contract = %address,
                        events = events.len(),
                        cursor = to,
                        "applied events"
                    );
                }
                (address, Outcome::Advanced)
            }
            Err(e) => {
                tracing::warn!(
                    watcher = self.set.label(),
                    contract = %address,
                    reason = %e,
                    "cursor commit failed"
                );
                (address, Outcome::Failed(e))
            }
        }
    }
}

#[async_trait]
impl<S: WatchedSet> Task for Watcher<S> {
    async fn run(&self) -> anyhow::Result<()> {
        self.tick().await?;
        Ok(())
    }
}

/// Start a scheduler that runs the listen watcher every `interval`.
pub async fn register_listen_watcher(
    chain: Arc<dyn ChainRpc>,
    handlers: EventHandlers,
    interval: Duration,
) -> std::result::Result<Scheduler, SchedulerError> {
    let scheduler = Scheduler::new("listen-watcher");
    scheduler
        .start(Arc::new(ListenWatcher::new(chain, handlers)), interval)
        .await?;
    Ok(scheduler)
}

/// Start a scheduler that runs the pin watcher every `interval`.
pub async fn register_pin_watcher(
    chain: Arc<dyn ChainRpc>,
    handlers: EventHandlers,
    interval: Duration,
) -> std::result::Result<Scheduler, SchedulerError> {
    let scheduler = Scheduler::new("pin-watcher");
    scheduler
        .start(Arc::new(PinWatcher::new(chain, handlers)), interval)
        .await?;
    Ok(scheduler)
}
