//! Tests for sync_engine module.

#[cfg(test)]
mod tests {
    use super::super::sync_engine::*;
    use crate::session::SessionContext;
    use crate::storage::{Database, SyncSettings};
    use crate::sync::command::{HabitFields, TaskFields};
    use crate::sync::connectivity::{Connectivity, ManualConnectivity};
    use crate::sync::mutations::{HabitRepository, TaskRepository};
    use crate::sync::remote::{RemoteApi, RemoteRequest, RemoteResponse, Rewards, ServerEntity};
    use crate::sync::sync_queue::SyncQueue;
    use crate::sync::types::{
        ActionStatus, AggregateSyncState, EntitySyncStatus, EntityType, FailureKind, RemoteError,
    };
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tracing_test::traced_test;

    type Reply = Box<dyn Fn(&RemoteRequest) -> Result<RemoteResponse, RemoteError> + Send + Sync>;

    struct ScriptedRemote {
        calls: Mutex<Vec<RemoteRequest>>,
        reply: Reply,
        delay: Duration,
    }

    impl ScriptedRemote {
        fn new(reply: Reply) -> Arc<Self> {
            Self::slow(reply, Duration::ZERO)
        }

        fn slow(reply: Reply, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                reply,
                delay,
            })
        }

        fn operations(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.operation.clone())
                .collect()
        }
    }

    #[async_trait]
    impl RemoteApi for ScriptedRemote {
        async fn execute(
            &self,
            _ctx: &SessionContext,
            request: &RemoteRequest,
        ) -> Result<RemoteResponse, RemoteError> {
            self.calls.lock().unwrap().push(request.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            (self.reply)(request)
        }

        async fn fetch(
            &self,
            _ctx: &SessionContext,
            _entity_type: EntityType,
            _entity_id: &str,
        ) -> Result<Option<ServerEntity>, RemoteError> {
            Ok(None)
        }
    }

    fn server_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-05-01T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    /// Echo the request back as the server copy.
    fn echo(request: &RemoteRequest) -> Result<RemoteResponse, RemoteError> {
        if request.operation.starts_with("DELETE") {
            return Ok(RemoteResponse::default());
        }
        let mut fields = request.fields.clone();
        fields["server_seen"] = json!(true);
        Ok(RemoteResponse {
            entity: Some(ServerEntity {
                id: request.entity_id.clone(),
                entity_type: request.entity_type,
                fields,
                server_updated_at: server_time(),
            }),
            rewards: Some(Rewards {
                xp: 42,
                streak: None,
                milestone: false,
            }),
        })
    }

    struct Harness {
        engine: Arc<SyncEngine>,
        remote: Arc<ScriptedRemote>,
        connectivity: Arc<ManualConnectivity>,
        tasks: TaskRepository,
        habits: HabitRepository,
    }

    fn harness(remote: Arc<ScriptedRemote>) -> Harness {
        harness_with(remote, SyncSettings::default())
    }

    fn harness_with(remote: Arc<ScriptedRemote>, settings: SyncSettings) -> Harness {
        let db = Arc::new(Database::open_memory().unwrap());
        let queue = Arc::new(SyncQueue::open(db, settings).unwrap());
        let connectivity = Arc::new(ManualConnectivity::new(Connectivity::Available));
        let engine = SyncEngine::new(queue, remote.clone(), connectivity.clone());
        Harness {
            tasks: TaskRepository::new(Arc::clone(&engine)),
            habits: HabitRepository::new(Arc::clone(&engine)),
            engine,
            remote,
            connectivity,
        }
    }

    fn ctx() -> SessionContext {
        SessionContext::new("user-1", "device-1").unwrap()
    }

    fn task(title: &str) -> TaskFields {
        TaskFields {
            title: title.into(),
            ..TaskFields::default()
        }
    }

    #[tokio::test]
    async fn test_success_replaces_record_with_server_copy() {
        let h = harness(ScriptedRemote::new(Box::new(echo)));
        let created = h.tasks.create(&ctx(), task("Write report")).unwrap();

        let result = h.engine.sync_pending_actions(&ctx()).await;
        assert!(result.success);
        assert_eq!(result.succeeded, 1);

        let record = h.engine.store().get(&created.record.id).unwrap().unwrap();
        assert_eq!(record.sync_status, EntitySyncStatus::Synced);
        assert_eq!(record.fields["server_seen"], true);
        assert_eq!(record.server_updated_at, Some(server_time()));
        assert!(record.last_synced_at.is_some());
        assert_eq!(
            h.engine.queue().get(&created.action.id).unwrap().unwrap().status,
            ActionStatus::Succeeded
        );
        assert_eq!(h.engine.sync_state(&ctx()).unwrap(), AggregateSyncState::Synced);
    }

    #[tokio::test]
    async fn test_same_entity_actions_dispatch_in_order() {
        let h = harness(ScriptedRemote::new(Box::new(echo)));
        let created = h.tasks.create(&ctx(), task("v1")).unwrap();
        let id = created.record.id.clone();
        h.tasks.update(&ctx(), &id, task("v2")).unwrap();
        h.tasks.complete(&ctx(), &id).unwrap();
        h.tasks.delete(&ctx(), &id).unwrap();

        let result = h.engine.sync_pending_actions(&ctx()).await;
        assert_eq!(result.succeeded, 4);
        assert_eq!(
            h.remote.operations(),
            vec!["CREATE_TASK", "UPDATE_TASK", "COMPLETE_TASK", "DELETE_TASK"]
        );
        assert!(h.engine.store().get(&id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_queued_edit_survives_earlier_ack() {
        let remote = ScriptedRemote::new(Box::new(|request: &RemoteRequest| {
            if request.operation == "UPDATE_TASK" {
                Err(RemoteError::Transient("503".into()))
            } else {
                echo(request)
            }
        }));
        let h = harness(remote);
        let created = h.tasks.create(&ctx(), task("v1")).unwrap();
        let id = created.record.id.clone();
        h.tasks.update(&ctx(), &id, task("v2")).unwrap();

        let result = h.engine.sync_pending_actions(&ctx()).await;
        assert_eq!(result.succeeded, 1);
        assert!(result.success, "transient failures are not surfaced");

        let record = h.engine.store().get(&id).unwrap().unwrap();
        assert_eq!(record.sync_status, EntitySyncStatus::Pending);
        assert_eq!(record.fields["title"], "v2");
        assert_eq!(record.server_updated_at, Some(server_time()));
        assert_eq!(
            h.engine.sync_state(&ctx()).unwrap(),
            AggregateSyncState::Pending { count: 1 }
        );
    }

    #[tokio::test]
    async fn test_permanent_failure_marks_entity_failed() {
        let h = harness(ScriptedRemote::new(Box::new(|_: &RemoteRequest| {
            Err(RemoteError::Permanent {
                status: 422,
                message: "title too long".into(),
            })
        })));
        let created = h.tasks.create(&ctx(), task("x")).unwrap();

        let result = h.engine.sync_pending_actions(&ctx()).await;
        assert!(!result.success);
        assert_eq!(result.failed_count, 1);
        assert_eq!(result.errors.len(), 1);

        let record = h.engine.store().get(&created.record.id).unwrap().unwrap();
        assert_eq!(record.sync_status, EntitySyncStatus::Failed);
        assert!(matches!(
            h.engine.sync_state(&ctx()).unwrap(),
            AggregateSyncState::Failed { count: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_auth_failure_halts_and_keeps_local_edit() {
        let h = harness(ScriptedRemote::new(Box::new(|_: &RemoteRequest| {
            Err(RemoteError::Auth("token expired".into()))
        })));
        let created = h.tasks.create(&ctx(), task("x")).unwrap();
        let follow_up = h.tasks.update(&ctx(), &created.record.id, task("y")).unwrap();

        let result = h.engine.sync_pending_actions(&ctx()).await;
        assert!(result.auth_required);
        assert!(!result.success);
        assert_eq!(h.remote.operations(), vec!["CREATE_TASK"]);

        let record = h.engine.store().get(&created.record.id).unwrap().unwrap();
        assert_eq!(record.sync_status, EntitySyncStatus::Pending);
        let head = h.engine.queue().get(&created.action.id).unwrap().unwrap();
        assert_eq!(head.failure, Some(FailureKind::Auth));
        assert_eq!(
            h.engine.queue().get(&follow_up.action.id).unwrap().unwrap().status,
            ActionStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_conflict_is_logged_not_merged() {
        let h = harness(ScriptedRemote::new(Box::new(|_: &RemoteRequest| {
            Err(RemoteError::Conflict {
                message: "server copy is newer".into(),
                server_updated_at: Some(server_time()),
            })
        })));
        let created = h.tasks.create(&ctx(), task("mine")).unwrap();

        h.engine.sync_pending_actions(&ctx()).await;

        let record = h.engine.store().get(&created.record.id).unwrap().unwrap();
        assert_eq!(record.sync_status, EntitySyncStatus::Conflict);
        assert_eq!(record.fields["title"], "mine");
        let conflicts = h.engine.resolver().list_conflicts(10).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].action_id, created.action.id);
        assert_eq!(conflicts[0].server_updated_at, Some(server_time()));
    }

    #[tokio::test]
    async fn test_mismatched_response_is_a_conflict() {
        let h = harness(ScriptedRemote::new(Box::new(|request: &RemoteRequest| {
            let mut response = echo(request)?;
            if let Some(entity) = response.entity.as_mut() {
                entity.id = "someone-else".into();
            }
            Ok(response)
        })));
        let created = h.tasks.create(&ctx(), task("x")).unwrap();

        h.engine.sync_pending_actions(&ctx()).await;
        let action = h.engine.queue().get(&created.action.id).unwrap().unwrap();
        assert_eq!(action.failure, Some(FailureKind::Conflict));
        assert!(h.engine.store().get("someone-else").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_offline_drain_is_a_noop() {
        let h = harness(ScriptedRemote::new(Box::new(echo)));
        h.connectivity.set(Connectivity::Unavailable);
        h.tasks.create(&ctx(), task("x")).unwrap();

        let result = h.engine.sync_pending_actions(&ctx()).await;
        assert!(result.success);
        assert_eq!(result.succeeded, 0);
        assert!(h.remote.operations().is_empty());
        assert_eq!(h.engine.sync_state(&ctx()).unwrap(), AggregateSyncState::Offline);
    }

    #[tokio::test]
    async fn test_concurrent_drains_share_one_run() {
        let h = harness(ScriptedRemote::slow(Box::new(echo), Duration::from_millis(50)));
        h.tasks.create(&ctx(), task("a")).unwrap();
        h.habits
            .create(
                &ctx(),
                HabitFields {
                    name: "Stretch".into(),
                    ..HabitFields::default()
                },
            )
            .unwrap();

        let (ctx_a, ctx_b) = (ctx(), ctx());
        let (first, second) = tokio::join!(
            h.engine.sync_pending_actions(&ctx_a),
            h.engine.sync_pending_actions(&ctx_b)
        );
        assert_eq!(first, second);
        assert_eq!(first.succeeded, 2);
        assert_eq!(h.remote.operations().len(), 2);
    }

    #[tokio::test]
    async fn test_state_subscribers_see_drain_result() {
        let h = harness(ScriptedRemote::new(Box::new(echo)));
        let mut states = h.engine.subscribe_state();
        h.tasks.create(&ctx(), task("x")).unwrap();
        h.engine.sync_state(&ctx()).unwrap();
        assert_eq!(*states.borrow_and_update(), AggregateSyncState::Pending { count: 1 });

        h.engine.sync_pending_actions(&ctx()).await;
        assert_eq!(*states.borrow_and_update(), AggregateSyncState::Synced);
    }

    #[tokio::test]
    async fn test_retry_failed_resends_exhausted_actions() {
        let settings = SyncSettings {
            max_attempts: 1,
            ..SyncSettings::default()
        };
        let h = harness_with(
            ScriptedRemote::new(Box::new(|_: &RemoteRequest| {
                Err(RemoteError::Transient("down".into()))
            })),
            settings,
        );
        let created = h.tasks.create(&ctx(), task("x")).unwrap();

        let first = h.engine.sync_pending_actions(&ctx()).await;
        assert_eq!(first.failed_count, 1);
        assert_eq!(
            h.engine.queue().get(&created.action.id).unwrap().unwrap().failure,
            Some(FailureKind::Exhausted)
        );

        // Nothing is resent until asked.
        h.engine.sync_pending_actions(&ctx()).await;
        assert_eq!(h.remote.operations().len(), 1);

        let retried = h.engine.retry_failed(&ctx()).await.unwrap();
        assert_eq!(retried.failed_count, 1);
        assert_eq!(h.remote.operations().len(), 2);
    }

    #[tokio::test]
    async fn test_cleanup_removes_succeeded_actions() {
        let h = harness(ScriptedRemote::new(Box::new(echo)));
        h.tasks.create(&ctx(), task("x")).unwrap();
        h.engine.sync_pending_actions(&ctx()).await;

        let report = h.engine.cleanup(&ctx()).unwrap();
        assert_eq!(
            report,
            CleanupReport {
                succeeded_removed: 1,
                failed_removed: 0
            }
        );
        assert!(h.engine.queue().list(&ctx(), None).unwrap().is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_dispatch_is_logged_with_action_fields() {
        let h = harness(ScriptedRemote::new(Box::new(echo)));
        let created = h.tasks.create(&ctx(), task("x")).unwrap();
        h.engine.sync_pending_actions(&ctx()).await;

        assert!(logs_contain("synced"));
        assert!(logs_contain(&created.action.id));
        assert!(logs_contain("drain finished"));
    }
}
