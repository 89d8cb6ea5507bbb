pub mod config;
pub mod conflict;
pub mod device;
pub mod habit;
pub mod profile;
pub mod queue;
pub mod sync;
pub mod task;

use serde::Serialize;

/// Write `value` to stdout as pretty JSON.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
