use clap::Subcommand;
use habitude_core::sync::get_or_create_device_id;

#[derive(Subcommand)]
pub enum DeviceAction {
    /// Print this installation's device ID
    Id,
}

pub fn run(action: DeviceAction) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        DeviceAction::Id => println!("{}", get_or_create_device_id()?),
    }
    Ok(())
}
