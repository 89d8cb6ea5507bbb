//! Remote API contract.
//!
//! The orchestrator only talks to the authoritative store through
//! [`RemoteApi`]. [`crate::sync::HttpRemoteApi`] is the production adapter;
//! tests plug in scripted fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::SessionContext;
use crate::sync::types::{ActionType, EntityType, RemoteError, SyncAction};

/// One action as sent to the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRequest {
    /// Stable action id, also sent as the idempotency key.
    pub action_id: String,
    /// Operation name such as `CREATE_TASK`.
    pub operation: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub fields: serde_json::Value,
    pub client_updated_at: DateTime<Utc>,
}

impl RemoteRequest {
    pub fn from_action(action: &SyncAction) -> Self {
        Self {
            action_id: action.id.clone(),
            operation: action.command.operation().to_string(),
            entity_type: action.entity_type,
            entity_id: action.entity_id.clone(),
            fields: action.command.fields(),
            client_updated_at: action.command.client_updated_at(),
        }
    }
}

/// Server-computed rewards for a completion or tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rewards {
    #[serde(default)]
    pub xp: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streak: Option<u32>,
    #[serde(default)]
    pub milestone: bool,
}

/// Authoritative copy of an entity as returned by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEntity {
    pub id: String,
    pub entity_type: EntityType,
    pub fields: serde_json::Value,
    pub server_updated_at: DateTime<Utc>,
}

/// Successful response to one action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteResponse {
    /// Absent for deletes.
    #[serde(default)]
    pub entity: Option<ServerEntity>,
    #[serde(default)]
    pub rewards: Option<Rewards>,
}

impl RemoteResponse {
    /// Check that the response describes the entity the request targeted.
    ///
    /// A mismatch is reported as a conflict: the server answered about a
    /// different state than the one we sent.
    pub fn validate_against(&self, request: &RemoteRequest) -> Result<(), RemoteError> {
        match &self.entity {
            Some(entity)
                if entity.id != request.entity_id || entity.entity_type != request.entity_type =>
            {
                Err(RemoteError::Conflict {
                    message: format!(
                        "response for {} {} does not match request for {} {}",
                        entity.entity_type, entity.id, request.entity_type, request.entity_id
                    ),
                    server_updated_at: Some(entity.server_updated_at),
                })
            }
            None if !request.operation.starts_with(ActionType::Delete.as_str()) => {
                Err(RemoteError::Conflict {
                    message: format!("{} response carried no entity", request.operation),
                    server_updated_at: None,
                })
            }
            _ => Ok(()),
        }
    }
}

/// Executes actions against the authoritative store.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Apply one action. The implementation must honour `request.action_id`
    /// as an idempotency key.
    async fn execute(
        &self,
        ctx: &SessionContext,
        request: &RemoteRequest,
    ) -> Result<RemoteResponse, RemoteError>;

    /// Fetch the current server copy of an entity, `None` if it is gone.
    async fn fetch(
        &self,
        ctx: &SessionContext,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<ServerEntity>, RemoteError>;
}
