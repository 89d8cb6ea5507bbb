use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod context;

use context::SessionArgs;

#[derive(Parser)]
#[command(name = "habitude", version, about = "Habitude offline-first sync CLI")]
struct Cli {
    #[command(flatten)]
    session: SessionArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Task management
    Task {
        #[command(subcommand)]
        action: commands::task::TaskAction,
    },
    /// Habit management
    Habit {
        #[command(subcommand)]
        action: commands::habit::HabitAction,
    },
    /// User profile
    Profile {
        #[command(subcommand)]
        action: commands::profile::ProfileAction,
    },
    /// Inspect and maintain the sync queue
    Queue {
        #[command(subcommand)]
        action: commands::queue::QueueAction,
    },
    /// Drain the queue and report sync state
    Sync {
        #[command(subcommand)]
        action: commands::sync::SyncAction,
    },
    /// Conflict log and resolution
    Conflict {
        #[command(subcommand)]
        action: commands::conflict::ConflictAction,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
    /// Device identity
    Device {
        #[command(subcommand)]
        action: commands::device::DeviceAction,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let session = cli.session;
    let result = match cli.command {
        Commands::Task { action } => commands::task::run(action, &session).await,
        Commands::Habit { action } => commands::habit::run(action, &session).await,
        Commands::Profile { action } => commands::profile::run(action, &session),
        Commands::Queue { action } => commands::queue::run(action, &session),
        Commands::Sync { action } => commands::sync::run(action, &session).await,
        Commands::Conflict { action } => commands::conflict::run(action, &session).await,
        Commands::Config { action } => commands::config::run(action),
        Commands::Device { action } => commands::device::run(action),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
