use clap::Subcommand;

use super::print_json;
use crate::context::{App, SessionArgs};

#[derive(Subcommand)]
pub enum SyncAction {
    /// Drain the queue once
    Run,
    /// Show the aggregate sync state
    Status,
    /// Re-queue terminal failures and drain
    Retry,
}

pub async fn run(action: SyncAction, session: &SessionArgs) -> Result<(), Box<dyn std::error::Error>> {
    let app = App::open(session)?;
    match action {
        SyncAction::Run => {
            let result = app.engine.sync_pending_actions(&app.ctx).await;
            print_json(&result)?;
        }
        SyncAction::Status => {
            print_json(&app.engine.sync_state(&app.ctx)?)?;
        }
        SyncAction::Retry => {
            print_json(&app.engine.retry_failed(&app.ctx).await?)?;
        }
    }
    Ok(())
}
