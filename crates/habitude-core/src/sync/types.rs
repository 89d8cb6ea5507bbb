//! Core types for the sync queue and orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::command::SyncCommand;

/// Kind of record a sync action targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Task,
    Habit,
    User,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Task => "TASK",
            EntityType::Habit => "HABIT",
            EntityType::User => "USER",
        }
    }

    /// Path segment used by the HTTP remote (`/v1/tasks/{id}`).
    pub fn collection(&self) -> &'static str {
        match self {
            EntityType::Task => "tasks",
            EntityType::Habit => "habits",
            EntityType::User => "users",
        }
    }

    fn rank(&self) -> i64 {
        match self {
            EntityType::Task => 0,
            EntityType::Habit => 1,
            EntityType::User => 2,
        }
    }
}

/// Kind of mutation a sync action replays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Create,
    Update,
    Delete,
    Complete,
    Tick,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Create => "CREATE",
            ActionType::Update => "UPDATE",
            ActionType::Delete => "DELETE",
            ActionType::Complete => "COMPLETE",
            ActionType::Tick => "TICK",
        }
    }

    fn tier(&self) -> i64 {
        match self {
            ActionType::Complete | ActionType::Tick => 0,
            ActionType::Create => 1,
            ActionType::Update => 2,
            ActionType::Delete => 3,
        }
    }
}

/// Drain priority of an (entity, action) pair. Lower drains first.
///
/// Completions and ticks come first, then creates, updates and deletes; ties
/// inside a tier go to tasks, then habits, then the user profile.
pub fn priority(entity_type: EntityType, action_type: ActionType) -> i64 {
    action_type.tier() * 10 + entity_type.rank()
}

/// Lifecycle status of a queued action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    Pending,
    InFlight,
    Failed,
    Succeeded,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "PENDING",
            ActionStatus::InFlight => "IN_FLIGHT",
            ActionStatus::Failed => "FAILED",
            ActionStatus::Succeeded => "SUCCEEDED",
        }
    }
}

/// Why an action last failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network or server hiccup, retried after backoff.
    Transient,
    /// Transient failures used up the attempt budget.
    Exhausted,
    /// Rejected by the server; never retried automatically.
    Permanent,
    /// Credentials were refused; waits for re-authentication.
    Auth,
    /// Server state diverged; waits for explicit resolution.
    Conflict,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Exhausted => "exhausted",
            FailureKind::Permanent => "permanent",
            FailureKind::Auth => "auth",
            FailureKind::Conflict => "conflict",
        }
    }

    /// Whether a later action on the same entity must keep waiting.
    pub fn blocks_successors(&self) -> bool {
        matches!(
            self,
            FailureKind::Transient | FailureKind::Auth | FailureKind::Conflict
        )
    }
}

/// Sync bookkeeping status of a cached entity record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntitySyncStatus {
    Synced,
    Pending,
    Syncing,
    Failed,
    Conflict,
}

impl EntitySyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntitySyncStatus::Synced => "SYNCED",
            EntitySyncStatus::Pending => "PENDING",
            EntitySyncStatus::Syncing => "SYNCING",
            EntitySyncStatus::Failed => "FAILED",
            EntitySyncStatus::Conflict => "CONFLICT",
        }
    }
}

/// Error returned when a stored enum column holds an unknown value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! impl_str_enum {
    ($ty:ty, $kind:literal, [$($variant:expr),+ $(,)?]) => {
        impl FromStr for $ty {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                [$($variant),+]
                    .into_iter()
                    .find(|v| v.as_str().eq_ignore_ascii_case(s))
                    .ok_or_else(|| ParseEnumError {
                        kind: $kind,
                        value: s.to_string(),
                    })
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

impl_str_enum!(EntityType, "entity type", [EntityType::Task, EntityType::Habit, EntityType::User]);
impl_str_enum!(
    ActionType,
    "action type",
    [
        ActionType::Create,
        ActionType::Update,
        ActionType::Delete,
        ActionType::Complete,
        ActionType::Tick,
    ]
);
impl_str_enum!(
    ActionStatus,
    "action status",
    [
        ActionStatus::Pending,
        ActionStatus::InFlight,
        ActionStatus::Failed,
        ActionStatus::Succeeded,
    ]
);
impl_str_enum!(
    FailureKind,
    "failure kind",
    [
        FailureKind::Transient,
        FailureKind::Exhausted,
        FailureKind::Permanent,
        FailureKind::Auth,
        FailureKind::Conflict,
    ]
);
impl_str_enum!(
    EntitySyncStatus,
    "sync status",
    [
        EntitySyncStatus::Synced,
        EntitySyncStatus::Pending,
        EntitySyncStatus::Syncing,
        EntitySyncStatus::Failed,
        EntitySyncStatus::Conflict,
    ]
);

/// One durable, queued local mutation awaiting remote replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncAction {
    /// Client-generated id; doubles as the idempotency key.
    pub id: String,
    /// Append counter. Apply order for actions on one entity.
    pub sequence: i64,
    pub owner_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub action_type: ActionType,
    pub command: SyncCommand,
    pub priority: i64,
    pub status: ActionStatus,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub failure: Option<FailureKind>,
    /// Set while a transient failure waits out its backoff.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl SyncAction {
    /// FAILED with a retry already scheduled.
    pub fn is_retry_scheduled(&self) -> bool {
        self.status == ActionStatus::Failed && self.next_attempt_at.is_some()
    }

    /// SUCCEEDED, or FAILED with no automatic retry left.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            ActionStatus::Succeeded => true,
            ActionStatus::Failed => self.next_attempt_at.is_none(),
            _ => false,
        }
    }
}

/// Outcome of one drain of the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    /// No action failed terminally during this drain.
    pub success: bool,
    pub succeeded: usize,
    pub failed_count: usize,
    pub errors: Vec<String>,
    /// The remote refused our credentials; dispatch stopped early.
    pub auth_required: bool,
}

impl SyncResult {
    pub(crate) fn empty() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }
}

/// Sync state exposed to the UI.
///
/// Derived from queue counts and connectivity only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AggregateSyncState {
    Synced,
    Syncing { progress: usize, total: usize },
    Pending { count: usize },
    Failed { count: usize, errors: Vec<String> },
    Offline,
}

/// Failure reported by the remote API client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// Network failure, timeout, 408/429 or 5xx.
    #[error("transient remote failure: {0}")]
    Transient(String),

    /// 401/403.
    #[error("authentication required: {0}")]
    Auth(String),

    /// Non-retryable 4xx (validation and friends).
    #[error("request rejected ({status}): {message}")]
    Permanent { status: u16, message: String },

    /// 409/412 or a response that does not match the request.
    #[error("conflict: {message}")]
    Conflict {
        message: String,
        server_updated_at: Option<DateTime<Utc>>,
    },
}

impl RemoteError {
    /// Classify a non-2xx HTTP status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => RemoteError::Auth(message),
            409 | 412 => RemoteError::Conflict {
                message,
                server_updated_at: None,
            },
            408 | 429 | 500..=599 => RemoteError::Transient(format!("HTTP {status}: {message}")),
            _ => RemoteError::Permanent { status, message },
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            RemoteError::Transient(_) => FailureKind::Transient,
            RemoteError::Auth(_) => FailureKind::Auth,
            RemoteError::Permanent { .. } => FailureKind::Permanent,
            RemoteError::Conflict { .. } => FailureKind::Conflict,
        }
    }
}
