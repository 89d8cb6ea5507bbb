use clap::Subcommand;
use habitude_core::EntityType;

use super::print_json;
use crate::context::{App, SessionArgs};

#[derive(Subcommand)]
pub enum ConflictAction {
    /// Show the most recent conflicts
    List {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Replace the local copy with the server's
    AcceptServer {
        /// Entity type (task, habit, user)
        entity_type: EntityType,
        /// Entity ID
        id: String,
    },
    /// Re-send the local edits over the server copy
    KeepLocal {
        /// Entity ID
        id: String,
    },
}

pub async fn run(action: ConflictAction, session: &SessionArgs) -> Result<(), Box<dyn std::error::Error>> {
    let app = App::open(session)?;
    let resolver = app.engine.resolver();
    match action {
        ConflictAction::List { limit } => {
            print_json(&resolver.list_conflicts(limit)?)?;
        }
        ConflictAction::AcceptServer { entity_type, id } => {
            let record = resolver.accept_server(&app.ctx, entity_type, &id).await?;
            app.engine.publish_state(&app.ctx);
            print_json(&record)?;
        }
        ConflictAction::KeepLocal { id } => {
            let requeued = resolver.keep_local(&app.ctx, &id)?;
            print_json(&serde_json::json!({ "requeued": requeued }))?;
        }
    }
    Ok(())
}
