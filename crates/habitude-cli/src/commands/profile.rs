use clap::Subcommand;

use super::print_json;
use crate::context::{App, SessionArgs};

#[derive(Subcommand)]
pub enum ProfileAction {
    /// Update the signed-in user's profile
    Update {
        #[arg(long)]
        display_name: Option<String>,
        /// IANA timezone name, e.g. "Europe/Berlin"
        #[arg(long)]
        timezone: Option<String>,
    },
    /// Show the cached profile
    Show,
}

pub fn run(action: ProfileAction, session: &SessionArgs) -> Result<(), Box<dyn std::error::Error>> {
    let app = App::open(session)?;
    match action {
        ProfileAction::Update {
            display_name,
            timezone,
        } => {
            let change = app.users().update_profile(&app.ctx, display_name, timezone)?;
            print_json(&change)?;
        }
        ProfileAction::Show => {
            let record = app
                .engine
                .store()
                .get(&app.ctx.owner_id)?
                .filter(|r| r.owner_id == app.ctx.owner_id);
            print_json(&record)?;
        }
    }
    Ok(())
}
