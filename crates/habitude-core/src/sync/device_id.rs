// Device ID management for the sync session.
// Format: "habitude-<uuid>"

use std::fs;
use std::io::Write;
use std::path::Path;
use uuid::Uuid;

const DEVICE_ID_FILE: &str = "device_id.txt";
const DEVICE_ID_PREFIX: &str = "habitude-";

/// Error type for device ID operations
#[derive(Debug, thiserror::Error)]
pub enum DeviceIdError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid device ID format: {0}")]
    InvalidFormat(String),
}

/// Get or create device ID at the specified directory.
///
/// # Returns
/// Device ID string in format "habitude-<uuid>"
pub fn get_or_create_device_id_at(path: &Path) -> Result<String, DeviceIdError> {
    let device_id_path = path.join(DEVICE_ID_FILE);

    if device_id_path.exists() {
        let content = fs::read_to_string(&device_id_path)?;
        let device_id = content.trim().to_string();

        let valid = device_id
            .strip_prefix(DEVICE_ID_PREFIX)
            .is_some_and(|uuid| Uuid::parse_str(uuid).is_ok());
        return if valid {
            Ok(device_id)
        } else {
            Err(DeviceIdError::InvalidFormat(device_id))
        };
    }

    let device_id = format!("{}{}", DEVICE_ID_PREFIX, Uuid::new_v4());

    fs::create_dir_all(path)?;
    let mut file = fs::File::create(&device_id_path)?;
    writeln!(file, "{}", device_id)?;

    Ok(device_id)
}

/// Get or create device ID in the Habitude data directory.
pub fn get_or_create_device_id() -> Result<String, DeviceIdError> {
    let data_dir = crate::storage::data_dir().map_err(|e| {
        DeviceIdError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            e.to_string(),
        ))
    })?;

    get_or_create_device_id_at(&data_dir)
}
