//! Wiring shared by every command that touches the queue.

use async_trait::async_trait;
use clap::Args;
use habitude_core::sync::{get_or_create_device_id, RemoteRequest, RemoteResponse, ServerEntity};
use habitude_core::{
    Config, Connectivity, Database, EntityType, HabitRepository, HttpRemoteApi,
    ManualConnectivity, RemoteApi, RemoteError, SessionContext, SyncEngine, SyncQueue,
    TaskRepository, UserRepository,
};
use std::sync::Arc;
use tracing::debug;

/// Who the command runs as.
#[derive(Args)]
pub struct SessionArgs {
    /// Owner of the records
    #[arg(long, global = true, env = "HABITUDE_OWNER", default_value = "local")]
    pub owner: String,
    /// Bearer token for the remote API
    #[arg(long, global = true, env = "HABITUDE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
}

/// Stand-in remote used until `remote.base_url` is configured.
///
/// The engine is built with connectivity unavailable in that case, so the
/// drain never reaches it; explicit resolution calls get a clear error.
struct UnconfiguredRemote;

#[async_trait]
impl RemoteApi for UnconfiguredRemote {
    async fn execute(
        &self,
        _ctx: &SessionContext,
        _request: &RemoteRequest,
    ) -> Result<RemoteResponse, RemoteError> {
        Err(RemoteError::Transient("remote.base_url is not configured".into()))
    }

    async fn fetch(
        &self,
        _ctx: &SessionContext,
        _entity_type: EntityType,
        _entity_id: &str,
    ) -> Result<Option<ServerEntity>, RemoteError> {
        Err(RemoteError::Transient("remote.base_url is not configured".into()))
    }
}

pub struct App {
    pub engine: Arc<SyncEngine>,
    pub ctx: SessionContext,
}

impl App {
    pub fn open(session: &SessionArgs) -> Result<Self, Box<dyn std::error::Error>> {
        let config = Config::load()?;
        let db = Arc::new(Database::open()?);
        let queue = Arc::new(SyncQueue::open(db, config.sync.clone())?);

        let (remote, online): (Arc<dyn RemoteApi>, Connectivity) = match config.remote.base_url {
            Some(_) => (
                Arc::new(HttpRemoteApi::from_settings(&config.remote)?),
                Connectivity::Available,
            ),
            None => {
                debug!("no remote configured, working offline");
                (Arc::new(UnconfiguredRemote), Connectivity::Unavailable)
            }
        };
        let engine = SyncEngine::new(queue, remote, Arc::new(ManualConnectivity::new(online)));

        let mut ctx = SessionContext::new(session.owner.as_str(), get_or_create_device_id()?)?;
        if let Some(token) = &session.token {
            ctx = ctx.with_access_token(token.as_str());
        }
        Ok(Self { engine, ctx })
    }

    pub fn tasks(&self) -> TaskRepository {
        TaskRepository::new(Arc::clone(&self.engine))
    }

    pub fn habits(&self) -> HabitRepository {
        HabitRepository::new(Arc::clone(&self.engine))
    }

    pub fn users(&self) -> UserRepository {
        UserRepository::new(Arc::clone(&self.engine))
    }
}
