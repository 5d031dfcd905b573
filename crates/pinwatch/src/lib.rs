//! Off-chain pin runtime: follows listener and storage contracts and keeps an IPFS pin ledger
//! in step with them.
//!
//! - **Listen watcher**: polls listener contracts for `Listen`/`StopListening` and maintains
//!   the set of tracked storage contracts.
//! - **Pin watcher**: polls tracked storage contracts for `PinHash`/`UnpinHash`, drives the
//!   storage network and records each pinned cid in the ledger.
//! - **REST API**: registers contracts of interest ([registry]).
//!
//! Both watchers run on a [Scheduler] and persist a per-contract [Cursor] only after a
//! block range has been fully applied, so delivery is at least once and every handler is
//! idempotent.

pub mod abi;
pub mod api;
pub mod chain;
pub mod config;
pub mod cursor;
pub mod error;
pub mod handlers;
pub mod ipfs;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod watcher;

pub use abi::{BlockchainEvent, EventFilter, EventKind, EventPayload};
pub use api::{router, AppState};
pub use chain::{ChainRpc, HttpChainClient};
pub use config::WatcherConfig;
pub use cursor::Cursor;
pub use error::{Error, Result};
pub use handlers::{EventHandlers, LedgerState, ListenOutcome};
pub use ipfs::{KuboClient, PinAck, StorageNetwork};
pub use registry::{ContractRegistry, ContractSpec, Network};
pub use scheduler::{FnTask, Scheduler, SchedulerError, SchedulerState, SchedulerStats, Task};
pub use store::{PinRecord, Store, TrackedListenerContract, TrackedStorageContract};
pub use watcher::{
    register_listen_watcher, register_pin_watcher, ListenWatcher, PinWatcher, TickReport,
    Watcher,
};
