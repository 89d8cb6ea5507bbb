//! Local mutation entry points.
//!
//! Each call writes the Entity Store (PENDING) and appends the matching
//! sync action in one SQLite transaction, then asks the scheduler for a
//! drain. Nothing here waits on the network except the optimistic helpers.

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Result, ValidationError};
use crate::session::SessionContext;
use crate::sync::command::{
    CompleteTask, CreateHabit, CreateTask, DeleteHabit, DeleteTask, HabitFields, SyncCommand,
    TaskFields, TickHabit, UpdateHabit, UpdateTask, UpdateUser,
};
use crate::sync::entity_store::{self, EntityRecord};
use crate::sync::optimistic::OptimisticOutcome;
use crate::sync::sync_engine::SyncEngine;
use crate::sync::sync_queue;
use crate::sync::types::{EntityType, SyncAction};

/// A committed local mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalChange {
    pub record: EntityRecord,
    pub action: SyncAction,
}

/// Write the record and enqueue the action atomically.
///
/// `require_existing` guards edits of records that must already be cached.
fn commit(
    engine: &SyncEngine,
    ctx: &SessionContext,
    patch: serde_json::Value,
    command: SyncCommand,
    require_existing: bool,
) -> Result<LocalChange> {
    let entity_type = command.entity_type();
    let entity_id = command.entity_id().to_string();
    let at = command.client_updated_at();

    let change = engine.queue().database().transaction(|tx| {
        if require_existing && entity_store::get_in(tx, &entity_id)?.is_none() {
            return Err(ValidationError::InvalidValue {
                field: "entity_id".into(),
                message: format!("no {} with id {entity_id}", entity_type.as_str().to_lowercase()),
            }
            .into());
        }
        let record = entity_store::write_local_in(tx, ctx, entity_type, &entity_id, &patch, at)?;
        let action = sync_queue::enqueue_in(tx, ctx, command)?;
        Ok(LocalChange { record, action })
    })?;

    engine.request_drain();
    Ok(change)
}

fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn validate_task(fields: &TaskFields) -> Result<()> {
    if fields.title.trim().is_empty() {
        return Err(ValidationError::EmptyField("title").into());
    }
    Ok(())
}

fn validate_habit(fields: &HabitFields) -> Result<()> {
    if fields.name.trim().is_empty() {
        return Err(ValidationError::EmptyField("name").into());
    }
    if fields.daily_target == 0 {
        return Err(ValidationError::InvalidValue {
            field: "daily_target".into(),
            message: "must be at least 1".into(),
        }
        .into());
    }
    Ok(())
}

fn require_id(id: &str, field: &'static str) -> Result<String> {
    let id = id.trim();
    if id.is_empty() {
        return Err(ValidationError::EmptyField(field).into());
    }
    Ok(id.to_string())
}

/// Task mutations.
#[derive(Clone)]
pub struct TaskRepository {
    engine: Arc<SyncEngine>,
}

impl TaskRepository {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }

    pub fn create(&self, ctx: &SessionContext, fields: TaskFields) -> Result<LocalChange> {
        validate_task(&fields)?;
        let patch = serde_json::to_value(&fields)?;
        let command = SyncCommand::CreateTask(CreateTask {
            task_id: Uuid::new_v4().to_string(),
            fields,
            client_updated_at: now(),
        });
        commit(&self.engine, ctx, patch, command, false)
    }

    pub fn update(&self, ctx: &SessionContext, task_id: &str, fields: TaskFields) -> Result<LocalChange> {
        validate_task(&fields)?;
        let patch = serde_json::to_value(&fields)?;
        let command = SyncCommand::UpdateTask(UpdateTask {
            task_id: require_id(task_id, "task_id")?,
            fields,
            client_updated_at: now(),
        });
        commit(&self.engine, ctx, patch, command, true)
    }

    pub fn complete(&self, ctx: &SessionContext, task_id: &str) -> Result<LocalChange> {
        let at = now();
        let command = SyncCommand::CompleteTask(CompleteTask {
            task_id: require_id(task_id, "task_id")?,
            completed_at: at,
            client_updated_at: at,
        });
        commit(
            &self.engine,
            ctx,
            json!({ "completed": true, "completed_at": at }),
            command,
            true,
        )
    }

    /// Complete and try to confirm with the server within the optimistic
    /// timeout. The local change is committed either way.
    pub async fn complete_now(
        &self,
        ctx: &SessionContext,
        task_id: &str,
    ) -> Result<(LocalChange, OptimisticOutcome)> {
        let change = self.complete(ctx, task_id)?;
        let outcome = self.engine.dispatch_optimistic(ctx, &change.action).await?;
        Ok((change, outcome))
    }

    /// Mark deleted locally; the record is removed once the server confirms.
    pub fn delete(&self, ctx: &SessionContext, task_id: &str) -> Result<LocalChange> {
        let command = SyncCommand::DeleteTask(DeleteTask {
            task_id: require_id(task_id, "task_id")?,
            client_updated_at: now(),
        });
        commit(&self.engine, ctx, json!({ "deleted": true }), command, true)
    }

    pub fn list(&self, ctx: &SessionContext) -> Result<Vec<EntityRecord>> {
        self.engine.store().list(ctx, Some(EntityType::Task))
    }
}

/// Habit mutations.
#[derive(Clone)]
pub struct HabitRepository {
    engine: Arc<SyncEngine>,
}

impl HabitRepository {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }

    pub fn create(&self, ctx: &SessionContext, fields: HabitFields) -> Result<LocalChange> {
        validate_habit(&fields)?;
        let patch = serde_json::to_value(&fields)?;
        let command = SyncCommand::CreateHabit(CreateHabit {
            habit_id: Uuid::new_v4().to_string(),
            fields,
            client_updated_at: now(),
        });
        commit(&self.engine, ctx, patch, command, false)
    }

    pub fn update(&self, ctx: &SessionContext, habit_id: &str, fields: HabitFields) -> Result<LocalChange> {
        validate_habit(&fields)?;
        let patch = serde_json::to_value(&fields)?;
        let command = SyncCommand::UpdateHabit(UpdateHabit {
            habit_id: require_id(habit_id, "habit_id")?,
            fields,
            client_updated_at: now(),
        });
        commit(&self.engine, ctx, patch, command, true)
    }

    pub fn tick(&self, ctx: &SessionContext, habit_id: &str, count: u32) -> Result<LocalChange> {
        if count == 0 {
            return Err(ValidationError::InvalidValue {
                field: "count".into(),
                message: "must be at least 1".into(),
            }
            .into());
        }
        let at = now();
        let command = SyncCommand::TickHabit(TickHabit {
            habit_id: require_id(habit_id, "habit_id")?,
            ticked_at: at,
            count,
            client_updated_at: at,
        });
        commit(&self.engine, ctx, json!({ "last_ticked_at": at }), command, true)
    }

    /// Tick and try to confirm the rewards within the optimistic timeout.
    pub async fn tick_now(
        &self,
        ctx: &SessionContext,
        habit_id: &str,
        count: u32,
    ) -> Result<(LocalChange, OptimisticOutcome)> {
        let change = self.tick(ctx, habit_id, count)?;
        let outcome = self.engine.dispatch_optimistic(ctx, &change.action).await?;
        Ok((change, outcome))
    }

    pub fn delete(&self, ctx: &SessionContext, habit_id: &str) -> Result<LocalChange> {
        let command = SyncCommand::DeleteHabit(DeleteHabit {
            habit_id: require_id(habit_id, "habit_id")?,
            client_updated_at: now(),
        });
        commit(&self.engine, ctx, json!({ "deleted": true }), command, true)
    }

    pub fn list(&self, ctx: &SessionContext) -> Result<Vec<EntityRecord>> {
        self.engine.store().list(ctx, Some(EntityType::Habit))
    }
}

/// Profile edits of the session's own user.
#[derive(Clone)]
pub struct UserRepository {
    engine: Arc<SyncEngine>,
}

impl UserRepository {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }

    pub fn update_profile(
        &self,
        ctx: &SessionContext,
        display_name: Option<String>,
        timezone: Option<String>,
    ) -> Result<LocalChange> {
        if display_name.is_none() && timezone.is_none() {
            return Err(ValidationError::InvalidValue {
                field: "profile".into(),
                message: "nothing to update".into(),
            }
            .into());
        }
        let command = SyncCommand::UpdateUser(UpdateUser {
            user_id: ctx.owner_id.clone(),
            display_name,
            timezone,
            client_updated_at: now(),
        });
        let patch = command.fields();
        commit(&self.engine, ctx, patch, command, false)
    }
}
