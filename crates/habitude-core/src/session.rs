//! Explicit session context threaded through queue and engine calls.

use crate::error::{Result, ValidationError};

/// Who is syncing, from which device, with which credentials.
///
/// Every enqueue, drain and resolution call takes one of these; nothing in
/// the crate falls back to an implicit "current user".
#[derive(Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub owner_id: String,
    pub device_id: String,
    pub access_token: Option<String>,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SessionContext")
            .field("owner_id", &self.owner_id)
            .field("device_id", &self.device_id)
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl SessionContext {
    /// Build a session for `owner_id` on `device_id`.
    ///
    /// # Errors
    /// Returns a validation error when either id is blank.
    pub fn new(owner_id: impl Into<String>, device_id: impl Into<String>) -> Result<Self> {
        let owner_id = owner_id.into().trim().to_string();
        let device_id = device_id.into().trim().to_string();
        if owner_id.is_empty() {
            return Err(ValidationError::EmptyField("owner_id").into());
        }
        if device_id.is_empty() {
            return Err(ValidationError::EmptyField("device_id").into());
        }
        Ok(Self {
            owner_id,
            device_id,
            access_token: None,
        })
    }

    #[must_use]
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.access_token = (!token.trim().is_empty()).then(|| token.trim().to_string());
        self
    }
}
