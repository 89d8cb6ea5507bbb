//! Optimistic dispatch support: the resolve-once gate and local estimates.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::oneshot;

use crate::sync::command::SyncCommand;
use crate::sync::entity_store::EntityRecord;
use crate::sync::remote::{RemoteResponse, Rewards, ServerEntity};
use crate::sync::types::RemoteError;

const TASK_COMPLETION_XP: u32 = 10;
const HABIT_TICK_XP: u32 = 5;
const STREAK_MILESTONE_EVERY: u32 = 7;

/// Result of one remote dispatch of an action.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Succeeded(RemoteResponse),
    Failed(RemoteError),
}

/// What the caller of an optimistic dispatch gets back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OptimisticOutcome {
    /// The server answered in time.
    Confirmed {
        action_id: String,
        rewards: Rewards,
        entity: Option<ServerEntity>,
    },
    /// No answer in time (or offline); the action stays queued and is
    /// reconciled later under the same id.
    Estimated { action_id: String, rewards: Rewards },
    /// The server refused the action within the deadline.
    Rejected { action_id: String, error: String },
}

impl OptimisticOutcome {
    pub fn action_id(&self) -> &str {
        match self {
            OptimisticOutcome::Confirmed { action_id, .. }
            | OptimisticOutcome::Estimated { action_id, .. }
            | OptimisticOutcome::Rejected { action_id, .. } => action_id,
        }
    }

    pub fn rewards(&self) -> Option<&Rewards> {
        match self {
            OptimisticOutcome::Confirmed { rewards, .. }
            | OptimisticOutcome::Estimated { rewards, .. } => Some(rewards),
            OptimisticOutcome::Rejected { .. } => None,
        }
    }
}

/// Waiters for dispatch outcomes, keyed by action id.
///
/// Each registration is resolved at most once: the first `resolve` takes the
/// sender out of the map, any later one finds nothing and is discarded.
#[derive(Default)]
pub struct ResolveGate {
    waiters: Mutex<HashMap<String, oneshot::Sender<DispatchOutcome>>>,
}

impl ResolveGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for `action_id`. A second registration replaces the
    /// first, whose receiver then reports a closed channel.
    pub fn register(&self, action_id: &str) -> oneshot::Receiver<DispatchOutcome> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(action_id.to_string(), tx);
        rx
    }

    /// Deliver an outcome. Returns `true` if a waiter received it.
    pub fn resolve(&self, action_id: &str, outcome: DispatchOutcome) -> bool {
        let waiter = self.lock().remove(action_id);
        match waiter {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Stop waiting for `action_id`.
    pub fn forget(&self, action_id: &str) {
        self.lock().remove(action_id);
    }

    pub fn is_waiting(&self, action_id: &str) -> bool {
        self.lock().contains_key(action_id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<DispatchOutcome>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Local guess of the rewards a completion or tick will earn.
///
/// Replaced by the server's numbers once the action syncs.
pub fn estimate_rewards(command: &SyncCommand, record: Option<&EntityRecord>) -> Rewards {
    match command {
        SyncCommand::CompleteTask(_) => Rewards {
            xp: TASK_COMPLETION_XP,
            streak: None,
            milestone: false,
        },
        SyncCommand::TickHabit(tick) => {
            let streak = record
                .and_then(|r| r.fields.get("streak"))
                .and_then(serde_json::Value::as_u64)
                .map_or(1, |s| u32::try_from(s).unwrap_or(u32::MAX).saturating_add(1));
            Rewards {
                xp: HABIT_TICK_XP.saturating_mul(tick.count.max(1)),
                streak: Some(streak),
                milestone: streak % STREAK_MILESTONE_EVERY == 0,
            }
        }
        _ => Rewards::default(),
    }
}
