use clap::Subcommand;
use habitude_core::sync::HabitFields;
use habitude_core::{CoreError, ValidationError};

use super::print_json;
use crate::context::{App, SessionArgs};

#[derive(Subcommand)]
pub enum HabitAction {
    /// Create a new habit
    Create {
        /// Habit name
        name: String,
        /// Ticks per day that count as done
        #[arg(long, default_value = "1")]
        daily_target: u32,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Edit a habit; unspecified fields keep their current value
    Update {
        /// Habit ID
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        daily_target: Option<u32>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Record progress on a habit
    Tick {
        /// Habit ID
        id: String,
        #[arg(long, default_value = "1")]
        count: u32,
        /// Wait briefly for the server's answer
        #[arg(long)]
        wait: bool,
    },
    /// Delete a habit
    Delete {
        /// Habit ID
        id: String,
    },
    /// List cached habits
    List,
}

pub async fn run(action: HabitAction, session: &SessionArgs) -> Result<(), Box<dyn std::error::Error>> {
    let app = App::open(session)?;
    let habits = app.habits();
    match action {
        HabitAction::Create {
            name,
            daily_target,
            notes,
        } => {
            let change = habits.create(
                &app.ctx,
                HabitFields {
                    name,
                    daily_target,
                    notes,
                },
            )?;
            print_json(&change)?;
        }
        HabitAction::Update {
            id,
            name,
            daily_target,
            notes,
        } => {
            let mut fields = current_fields(&app, &id)?;
            if let Some(name) = name {
                fields.name = name;
            }
            if let Some(target) = daily_target {
                fields.daily_target = target;
            }
            if notes.is_some() {
                fields.notes = notes;
            }
            print_json(&habits.update(&app.ctx, &id, fields)?)?;
        }
        HabitAction::Tick { id, count, wait } => {
            if wait {
                let (change, outcome) = habits.tick_now(&app.ctx, &id, count).await?;
                print_json(&serde_json::json!({
                    "record": change.record,
                    "action": change.action,
                    "outcome": outcome,
                }))?;
            } else {
                print_json(&habits.tick(&app.ctx, &id, count)?)?;
            }
        }
        HabitAction::Delete { id } => {
            print_json(&habits.delete(&app.ctx, &id)?)?;
        }
        HabitAction::List => {
            print_json(&habits.list(&app.ctx)?)?;
        }
    }
    Ok(())
}

fn current_fields(app: &App, id: &str) -> Result<HabitFields, CoreError> {
    let record = app
        .engine
        .store()
        .get(id)?
        .filter(|r| r.owner_id == app.ctx.owner_id)
        .ok_or_else(|| ValidationError::InvalidValue {
            field: "habit_id".into(),
            message: format!("no habit {id}"),
        })?;
    Ok(serde_json::from_value(record.fields)?)
}
