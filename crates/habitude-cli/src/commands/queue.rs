use clap::Subcommand;
use habitude_core::ActionStatus;

use super::print_json;
use crate::context::{App, SessionArgs};

#[derive(Subcommand)]
pub enum QueueAction {
    /// List queued actions in sequence order
    List {
        /// Only actions in this status (pending, in_flight, failed, succeeded)
        #[arg(long)]
        status: Option<ActionStatus>,
    },
    /// Count actions still waiting to be sent
    Pending,
    /// List actions that failed terminally
    Failed,
    /// Remove succeeded actions and expired failures
    Cleanup,
}

pub fn run(action: QueueAction, session: &SessionArgs) -> Result<(), Box<dyn std::error::Error>> {
    let app = App::open(session)?;
    let queue = app.engine.queue();
    match action {
        QueueAction::List { status } => {
            print_json(&queue.list(&app.ctx, status)?)?;
        }
        QueueAction::Pending => {
            let count = queue.pending_count(&app.ctx)?;
            print_json(&serde_json::json!({ "pending": count }))?;
        }
        QueueAction::Failed => {
            print_json(&queue.failed_actions(&app.ctx)?)?;
        }
        QueueAction::Cleanup => {
            print_json(&app.engine.cleanup(&app.ctx)?)?;
        }
    }
    Ok(())
}
