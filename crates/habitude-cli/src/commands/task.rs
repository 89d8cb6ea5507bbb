//! Task commands. Every mutation is committed locally and queued; pass
//! `--wait` to `complete` to ask the server for a confirmation.

use chrono::NaiveDate;
use clap::Subcommand;
use habitude_core::sync::TaskFields;
use habitude_core::{CoreError, ValidationError};

use super::print_json;
use crate::context::{App, SessionArgs};

#[derive(Subcommand)]
pub enum TaskAction {
    /// Create a new task
    Create {
        /// Task title
        title: String,
        /// Free-form notes
        #[arg(long)]
        notes: Option<String>,
        /// Due date (YYYY-MM-DD)
        #[arg(long)]
        due: Option<NaiveDate>,
        /// Tag, repeatable
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Edit a task; unspecified fields keep their current value
    Update {
        /// Task ID
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        notes: Option<String>,
        #[arg(long)]
        due: Option<NaiveDate>,
        /// Replace the tags, repeatable
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Mark a task completed
    Complete {
        /// Task ID
        id: String,
        /// Wait briefly for the server's answer
        #[arg(long)]
        wait: bool,
    },
    /// Delete a task
    Delete {
        /// Task ID
        id: String,
    },
    /// List cached tasks
    List,
}

pub async fn run(action: TaskAction, session: &SessionArgs) -> Result<(), Box<dyn std::error::Error>> {
    let app = App::open(session)?;
    let tasks = app.tasks();
    match action {
        TaskAction::Create {
            title,
            notes,
            due,
            tags,
        } => {
            let change = tasks.create(
                &app.ctx,
                TaskFields {
                    title,
                    notes,
                    due_date: due,
                    tags,
                },
            )?;
            print_json(&change)?;
        }
        TaskAction::Update {
            id,
            title,
            notes,
            due,
            tags,
        } => {
            let mut fields = current_fields(&app, &id)?;
            if let Some(title) = title {
                fields.title = title;
            }
            if notes.is_some() {
                fields.notes = notes;
            }
            if due.is_some() {
                fields.due_date = due;
            }
            if !tags.is_empty() {
                fields.tags = tags;
            }
            let change = tasks.update(&app.ctx, &id, fields)?;
            print_json(&change)?;
        }
        TaskAction::Complete { id, wait: false } => {
            let change = tasks.complete(&app.ctx, &id)?;
            print_json(&change)?;
        }
        TaskAction::Complete { id, wait: true } => {
            let (change, outcome) = tasks.complete_now(&app.ctx, &id).await?;
            print_json(&serde_json::json!({
                "record": change.record,
                "action": change.action,
                "outcome": outcome,
            }))?;
        }
        TaskAction::Delete { id } => {
            let change = tasks.delete(&app.ctx, &id)?;
            print_json(&change)?;
        }
        TaskAction::List => {
            print_json(&tasks.list(&app.ctx)?)?;
        }
    }
    Ok(())
}

fn current_fields(app: &App, id: &str) -> Result<TaskFields, CoreError> {
    let record = app
        .engine
        .store()
        .get(id)?
        .filter(|r| r.owner_id == app.ctx.owner_id)
        .ok_or_else(|| ValidationError::InvalidValue {
            field: "task_id".into(),
            message: format!("no task {id}"),
        })?;
    Ok(serde_json::from_value(record.fields)?)
}
