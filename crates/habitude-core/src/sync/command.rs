//! Typed sync commands.
//!
//! Each local mutation is captured as one variant of [`SyncCommand`]. The
//! command stays typed while it moves through the orchestrator and is only
//! turned into JSON when written to the `sync_actions.command` column.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::types::{ActionType, EntityType};

/// Editable fields of a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFields {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Editable fields of a habit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HabitFields {
    pub name: String,
    /// Ticks per day that count as "done".
    #[serde(default = "default_daily_target")]
    pub daily_target: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

fn default_daily_target() -> u32 {
    1
}

impl Default for HabitFields {
    fn default() -> Self {
        Self {
            name: String::new(),
            daily_target: default_daily_target(),
            notes: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTask {
    pub task_id: String,
    pub fields: TaskFields,
    pub client_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateTask {
    pub task_id: String,
    pub fields: TaskFields,
    pub client_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteTask {
    pub task_id: String,
    pub client_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteTask {
    pub task_id: String,
    pub completed_at: DateTime<Utc>,
    pub client_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateHabit {
    pub habit_id: String,
    pub fields: HabitFields,
    pub client_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateHabit {
    pub habit_id: String,
    pub fields: HabitFields,
    pub client_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteHabit {
    pub habit_id: String,
    pub client_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickHabit {
    pub habit_id: String,
    pub ticked_at: DateTime<Utc>,
    #[serde(default = "default_tick_count")]
    pub count: u32,
    pub client_updated_at: DateTime<Utc>,
}

fn default_tick_count() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateUser {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    pub client_updated_at: DateTime<Utc>,
}

/// One local mutation, keyed by (entity type, action type).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncCommand {
    CreateTask(CreateTask),
    UpdateTask(UpdateTask),
    DeleteTask(DeleteTask),
    CompleteTask(CompleteTask),
    CreateHabit(CreateHabit),
    UpdateHabit(UpdateHabit),
    DeleteHabit(DeleteHabit),
    TickHabit(TickHabit),
    UpdateUser(UpdateUser),
}

impl SyncCommand {
    pub fn entity_type(&self) -> EntityType {
        match self {
            SyncCommand::CreateTask(_)
            | SyncCommand::UpdateTask(_)
            | SyncCommand::DeleteTask(_)
            | SyncCommand::CompleteTask(_) => EntityType::Task,
            SyncCommand::CreateHabit(_)
            | SyncCommand::UpdateHabit(_)
            | SyncCommand::DeleteHabit(_)
            | SyncCommand::TickHabit(_) => EntityType::Habit,
            SyncCommand::UpdateUser(_) => EntityType::User,
        }
    }

    pub fn action_type(&self) -> ActionType {
        match self {
            SyncCommand::CreateTask(_) | SyncCommand::CreateHabit(_) => ActionType::Create,
            SyncCommand::UpdateTask(_)
            | SyncCommand::UpdateHabit(_)
            | SyncCommand::UpdateUser(_) => ActionType::Update,
            SyncCommand::DeleteTask(_) | SyncCommand::DeleteHabit(_) => ActionType::Delete,
            SyncCommand::CompleteTask(_) => ActionType::Complete,
            SyncCommand::TickHabit(_) => ActionType::Tick,
        }
    }

    /// Remote operation name, e.g. `COMPLETE_TASK`.
    pub fn operation(&self) -> &'static str {
        match self {
            SyncCommand::CreateTask(_) => "CREATE_TASK",
            SyncCommand::UpdateTask(_) => "UPDATE_TASK",
            SyncCommand::DeleteTask(_) => "DELETE_TASK",
            SyncCommand::CompleteTask(_) => "COMPLETE_TASK",
            SyncCommand::CreateHabit(_) => "CREATE_HABIT",
            SyncCommand::UpdateHabit(_) => "UPDATE_HABIT",
            SyncCommand::DeleteHabit(_) => "DELETE_HABIT",
            SyncCommand::TickHabit(_) => "TICK_HABIT",
            SyncCommand::UpdateUser(_) => "UPDATE_USER",
        }
    }

    pub fn entity_id(&self) -> &str {
        match self {
            SyncCommand::CreateTask(c) => &c.task_id,
            SyncCommand::UpdateTask(c) => &c.task_id,
            SyncCommand::DeleteTask(c) => &c.task_id,
            SyncCommand::CompleteTask(c) => &c.task_id,
            SyncCommand::CreateHabit(c) => &c.habit_id,
            SyncCommand::UpdateHabit(c) => &c.habit_id,
            SyncCommand::DeleteHabit(c) => &c.habit_id,
            SyncCommand::TickHabit(c) => &c.habit_id,
            SyncCommand::UpdateUser(c) => &c.user_id,
        }
    }

    pub fn client_updated_at(&self) -> DateTime<Utc> {
        match self {
            SyncCommand::CreateTask(c) => c.client_updated_at,
            SyncCommand::UpdateTask(c) => c.client_updated_at,
            SyncCommand::DeleteTask(c) => c.client_updated_at,
            SyncCommand::CompleteTask(c) => c.client_updated_at,
            SyncCommand::CreateHabit(c) => c.client_updated_at,
            SyncCommand::UpdateHabit(c) => c.client_updated_at,
            SyncCommand::DeleteHabit(c) => c.client_updated_at,
            SyncCommand::TickHabit(c) => c.client_updated_at,
            SyncCommand::UpdateUser(c) => c.client_updated_at,
        }
    }

    /// Move the edit's base timestamp forward (used by "keep local").
    pub fn set_client_updated_at(&mut self, at: DateTime<Utc>) {
        let slot = match self {
            SyncCommand::CreateTask(c) => &mut c.client_updated_at,
            SyncCommand::UpdateTask(c) => &mut c.client_updated_at,
            SyncCommand::DeleteTask(c) => &mut c.client_updated_at,
            SyncCommand::CompleteTask(c) => &mut c.client_updated_at,
            SyncCommand::CreateHabit(c) => &mut c.client_updated_at,
            SyncCommand::UpdateHabit(c) => &mut c.client_updated_at,
            SyncCommand::DeleteHabit(c) => &mut c.client_updated_at,
            SyncCommand::TickHabit(c) => &mut c.client_updated_at,
            SyncCommand::UpdateUser(c) => &mut c.client_updated_at,
        };
        *slot = at;
    }

    /// The captured mutation fields sent to the remote.
    pub fn fields(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            SyncCommand::CreateTask(c) => to_value(&c.fields),
            SyncCommand::UpdateTask(c) => to_value(&c.fields),
            SyncCommand::CompleteTask(c) => json!({ "completed_at": c.completed_at }),
            SyncCommand::CreateHabit(c) => to_value(&c.fields),
            SyncCommand::UpdateHabit(c) => to_value(&c.fields),
            SyncCommand::TickHabit(c) => json!({ "ticked_at": c.ticked_at, "count": c.count }),
            SyncCommand::UpdateUser(c) => {
                let mut fields = serde_json::Map::new();
                if let Some(name) = &c.display_name {
                    fields.insert("display_name".into(), json!(name));
                }
                if let Some(tz) = &c.timezone {
                    fields.insert("timezone".into(), json!(tz));
                }
                serde_json::Value::Object(fields)
            }
            SyncCommand::DeleteTask(_) | SyncCommand::DeleteHabit(_) => json!({}),
        }
    }
}

fn to_value<T: Serialize>(fields: &T) -> serde_json::Value {
    // Plain data structs with string keys always serialize.
    serde_json::to_value(fields).unwrap_or(serde_json::Value::Null)
}
