//! Shared fixtures for the sync integration tests.
//!
//! [`FakeServer`] keeps an in-memory copy of the remote store and honours the
//! idempotency key the way the real API does: a replayed action id returns
//! the stored response without applying the mutation again.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use habitude_core::sync::{RemoteRequest, RemoteResponse, Rewards, ServerEntity};
use habitude_core::{
    Database, EntityType, HabitRepository, ManualConnectivity, RemoteApi, RemoteError,
    SessionContext, SyncEngine, SyncQueue, SyncSettings, TaskRepository,
};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub use habitude_core::Connectivity;

#[derive(Default)]
struct ServerState {
    calls: Vec<RemoteRequest>,
    applied: Vec<RemoteRequest>,
    responses: HashMap<String, RemoteResponse>,
    entities: HashMap<String, ServerEntity>,
    failures: VecDeque<RemoteError>,
    revision: i64,
}

pub struct FakeServer {
    state: Mutex<ServerState>,
    delay: Mutex<Duration>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ServerState::default()),
            delay: Mutex::new(Duration::ZERO),
        })
    }

    /// Answer every later request only after `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Fail the next `times` requests with `error`, before applying them.
    pub fn fail_next(&self, times: usize, error: RemoteError) {
        let mut state = self.state.lock().unwrap();
        state.failures.extend(std::iter::repeat(error).take(times));
    }

    /// Every request received, including failed ones and replays.
    pub fn calls(&self) -> Vec<RemoteRequest> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Requests that actually changed server state, in apply order.
    pub fn applied(&self) -> Vec<RemoteRequest> {
        self.state.lock().unwrap().applied.clone()
    }

    pub fn applied_operations(&self) -> Vec<String> {
        self.applied().into_iter().map(|r| r.operation).collect()
    }

    pub fn entity(&self, id: &str) -> Option<ServerEntity> {
        self.state.lock().unwrap().entities.get(id).cloned()
    }

    /// Put a server-side copy in place, as another device would.
    pub fn put_entity(&self, entity: ServerEntity) {
        self.state
            .lock()
            .unwrap()
            .entities
            .insert(entity.id.clone(), entity);
    }

    /// Drop the server copy, as a delete from another device would.
    pub fn remove_entity(&self, id: &str) {
        self.state.lock().unwrap().entities.remove(id);
    }

    fn apply(state: &mut ServerState, request: &RemoteRequest) -> RemoteResponse {
        state.revision += 1;
        let server_updated_at = base_time() + ChronoDuration::seconds(state.revision);
        state.applied.push(request.clone());

        if request.operation.starts_with("DELETE") {
            state.entities.remove(&request.entity_id);
            return RemoteResponse::default();
        }

        let mut entity = state
            .entities
            .get(&request.entity_id)
            .cloned()
            .unwrap_or_else(|| ServerEntity {
                id: request.entity_id.clone(),
                entity_type: request.entity_type,
                fields: serde_json::json!({}),
                server_updated_at,
            });
        if let (Some(target), Some(source)) =
            (entity.fields.as_object_mut(), request.fields.as_object())
        {
            for (key, value) in source {
                target.insert(key.clone(), value.clone());
            }
        }

        let rewards = match request.operation.as_str() {
            "COMPLETE_TASK" => Some(Rewards {
                xp: 25,
                streak: None,
                milestone: false,
            }),
            "TICK_HABIT" => {
                let streak = entity.fields["streak"].as_u64().unwrap_or(0) as u32 + 1;
                entity.fields["streak"] = serde_json::json!(streak);
                Some(Rewards {
                    xp: 5,
                    streak: Some(streak),
                    milestone: streak % 7 == 0,
                })
            }
            _ => None,
        };
        entity.server_updated_at = server_updated_at;
        state.entities.insert(entity.id.clone(), entity.clone());

        RemoteResponse {
            entity: Some(entity),
            rewards,
        }
    }
}

#[async_trait]
impl RemoteApi for FakeServer {
    async fn execute(
        &self,
        _ctx: &SessionContext,
        request: &RemoteRequest,
    ) -> Result<RemoteResponse, RemoteError> {
        self.state.lock().unwrap().calls.push(request.clone());
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        if let Some(previous) = state.responses.get(&request.action_id) {
            return Ok(previous.clone());
        }
        let response = Self::apply(&mut state, request);
        state
            .responses
            .insert(request.action_id.clone(), response.clone());
        Ok(response)
    }

    async fn fetch(
        &self,
        _ctx: &SessionContext,
        _entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<ServerEntity>, RemoteError> {
        Ok(self.entity(entity_id))
    }
}

pub fn base_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-04-01T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

pub fn ctx() -> SessionContext {
    SessionContext::new("user-1", "device-1")
        .unwrap()
        .with_access_token("token-1")
}

/// Settings with zero backoff so retries run inside one drain.
pub fn eager_settings(max_attempts: u32) -> SyncSettings {
    SyncSettings {
        max_attempts,
        backoff_base_ms: 0,
        ..SyncSettings::default()
    }
}

pub struct Harness {
    pub engine: Arc<SyncEngine>,
    pub server: Arc<FakeServer>,
    pub connectivity: Arc<ManualConnectivity>,
    pub tasks: TaskRepository,
    pub habits: HabitRepository,
}

impl Harness {
    pub fn new(settings: SyncSettings, online: bool) -> Self {
        let db = Arc::new(Database::open_memory().unwrap());
        Self::with_db(db, FakeServer::new(), settings, online)
    }

    pub fn at_path(path: &Path, server: Arc<FakeServer>, online: bool) -> Self {
        let db = Arc::new(Database::open_at(path).unwrap());
        Self::with_db(db, server, SyncSettings::default(), online)
    }

    fn with_db(db: Arc<Database>, server: Arc<FakeServer>, settings: SyncSettings, online: bool) -> Self {
        let queue = Arc::new(SyncQueue::open(db, settings).unwrap());
        let connectivity = Arc::new(ManualConnectivity::new(if online {
            Connectivity::Available
        } else {
            Connectivity::Unavailable
        }));
        let engine = SyncEngine::new(queue, server.clone(), connectivity.clone());
        Self {
            tasks: TaskRepository::new(Arc::clone(&engine)),
            habits: HabitRepository::new(Arc::clone(&engine)),
            engine,
            server,
            connectivity,
        }
    }
}

/// Poll `check` on the runtime clock until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
