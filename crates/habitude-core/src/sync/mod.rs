//! Offline-first synchronization layer.
//!
//! Local mutations are written to the entity store and queued as sync
//! actions in one transaction. The engine replays them against the remote
//! API in per-entity order and reconciles the results.

pub mod command;
pub mod conflict_resolver;
pub mod connectivity;
pub mod device_id;
pub mod entity_store;
pub mod http_remote;
pub mod mutations;
pub mod optimistic;
pub mod remote;
pub mod scheduler;
pub mod sync_engine;
pub mod sync_queue;
pub mod types;

#[cfg(test)]
mod sync_engine_tests;
#[cfg(test)]
mod types_tests;

pub use command::{HabitFields, SyncCommand, TaskFields};
pub use conflict_resolver::{decide_snapshot, ConflictEntry, ConflictResolver, SnapshotDecision};
pub use connectivity::{Connectivity, ConnectivityMonitor, ManualConnectivity};
pub use device_id::{get_or_create_device_id, get_or_create_device_id_at, DeviceIdError};
pub use entity_store::{EntityRecord, EntityStore};
pub use http_remote::HttpRemoteApi;
pub use mutations::{HabitRepository, LocalChange, TaskRepository, UserRepository};
pub use optimistic::{estimate_rewards, DispatchOutcome, OptimisticOutcome, ResolveGate};
pub use remote::{RemoteApi, RemoteRequest, RemoteResponse, Rewards, ServerEntity};
pub use scheduler::{BackgroundScheduler, SchedulerHandle};
pub use sync_engine::{CleanupReport, SyncEngine};
pub use sync_queue::SyncQueue;
pub use types::{
    priority, ActionStatus, ActionType, AggregateSyncState, EntitySyncStatus, EntityType,
    FailureKind, RemoteError, SyncAction, SyncResult,
};
