//! # Habitude Core Library
//!
//! Offline-first synchronization for the Habitude task and habit tracker.
//! Local edits are captured durably, replayed against the remote API when
//! the network allows, and reconciled against server-confirmed state. The
//! `habitude` CLI and the mobile hosts are thin layers over this crate.
//!
//! ## Architecture
//!
//! - **Storage**: one SQLite database (queue, cached records, conflict log)
//!   behind a single-writer mutex, plus TOML configuration
//! - **Sync queue**: durable, per-entity ordered log of pending mutations
//! - **Sync engine**: drains the queue with bounded parallelism, classifies
//!   remote failures and merges server copies back
//! - **Optimistic dispatch**: races a completion or tick against a short
//!   deadline and falls back to a local estimate
//!
//! ## Key Components
//!
//! - [`SyncQueue`]: durable action queue
//! - [`SyncEngine`]: orchestrator and aggregate sync state
//! - [`ConflictResolver`]: snapshots and explicit conflict resolution
//! - [`TaskRepository`] / [`HabitRepository`]: local mutation entry points
//! - [`Database`] / [`Config`]: persistence and configuration

pub mod error;
pub mod session;
pub mod storage;
pub mod sync;

pub use error::{ConfigError, CoreError, DatabaseError, Result, ValidationError};
pub use session::SessionContext;
pub use storage::{Config, Database, RemoteSettings, SyncSettings};
pub use sync::{
    ActionStatus, ActionType, AggregateSyncState, BackgroundScheduler, ConflictResolver,
    Connectivity, ConnectivityMonitor, EntityRecord, EntityStore, EntitySyncStatus, EntityType,
    FailureKind, HabitRepository, HttpRemoteApi, ManualConnectivity, OptimisticOutcome, RemoteApi,
    RemoteError, SchedulerHandle, SyncAction, SyncCommand, SyncEngine, SyncQueue, SyncResult,
    TaskRepository, UserRepository,
};
