//! Sync orchestrator.
//!
//! Drains the queue against the remote, applies outcomes to the entity
//! store and derives the aggregate sync state shown to the user.

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, StreamExt};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn, Instrument, Span};

use crate::error::{Result, ValidationError};
use crate::session::SessionContext;
use crate::sync::conflict_resolver::{self, ConflictResolver};
use crate::sync::connectivity::{Connectivity, ConnectivityMonitor};
use crate::sync::entity_store::{self, EntityStore};
use crate::sync::optimistic::{estimate_rewards, DispatchOutcome, OptimisticOutcome, ResolveGate};
use crate::sync::remote::{RemoteApi, RemoteRequest, RemoteResponse, Rewards};
use crate::sync::sync_queue::{self, SyncQueue};
use crate::sync::types::{
    ActionStatus, ActionType, AggregateSyncState, EntitySyncStatus, FailureKind, RemoteError,
    SyncAction, SyncResult,
};

type SharedDrain = Shared<BoxFuture<'static, SyncResult>>;

/// What a dispatch did to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Synced,
    /// The action was no longer IN_FLIGHT; the outcome was dropped.
    Ignored,
    Failed(FailureKind),
}

struct Dispatched {
    action: SyncAction,
    outcome: DispatchOutcome,
    applied: Applied,
}

/// Rows removed by [`SyncEngine::cleanup`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub succeeded_removed: usize,
    pub failed_removed: usize,
}

/// Sync orchestrator.
pub struct SyncEngine {
    queue: Arc<SyncQueue>,
    store: EntityStore,
    resolver: Arc<ConflictResolver>,
    remote: Arc<dyn RemoteApi>,
    connectivity: Arc<dyn ConnectivityMonitor>,
    gate: ResolveGate,
    /// Running drain per owner; later callers join it.
    drains: Mutex<HashMap<String, SharedDrain>>,
    /// (dispatched, total) of the running drain per owner.
    progress: Mutex<HashMap<String, (usize, usize)>>,
    state_tx: watch::Sender<AggregateSyncState>,
    wake: Notify,
}

impl SyncEngine {
    pub fn new(
        queue: Arc<SyncQueue>,
        remote: Arc<dyn RemoteApi>,
        connectivity: Arc<dyn ConnectivityMonitor>,
    ) -> Arc<Self> {
        let db = Arc::clone(queue.database());
        let (state_tx, _) = watch::channel(AggregateSyncState::Synced);
        Arc::new(Self {
            store: EntityStore::new(Arc::clone(&db)),
            resolver: Arc::new(ConflictResolver::new(db, Arc::clone(&remote))),
            queue,
            remote,
            connectivity,
            gate: ResolveGate::new(),
            drains: Mutex::default(),
            progress: Mutex::default(),
            state_tx,
            wake: Notify::new(),
        })
    }

    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn resolver(&self) -> &Arc<ConflictResolver> {
        &self.resolver
    }

    pub fn connectivity(&self) -> Connectivity {
        self.connectivity.current()
    }

    pub(crate) fn connectivity_monitor(&self) -> &Arc<dyn ConnectivityMonitor> {
        &self.connectivity
    }

    /// Ask the background scheduler for a drain as soon as possible.
    pub fn request_drain(&self) {
        self.wake.notify_one();
    }

    pub(crate) async fn drain_requested(&self) {
        self.wake.notified().await;
    }

    /// Drain the queue for `ctx.owner_id`.
    ///
    /// Single-flight: while a drain is running for the owner, further calls
    /// await that drain's result instead of starting another. The drain runs
    /// in its own task and completes even if every caller goes away.
    ///
    /// Remote failures never escape as errors; they are counted in the
    /// result and reflected in the aggregate state.
    pub async fn sync_pending_actions(self: &Arc<Self>, ctx: &SessionContext) -> SyncResult {
        let drain = {
            let mut drains = lock(&self.drains);
            match drains.get(&ctx.owner_id) {
                Some(running) => {
                    debug!(owner_id = %ctx.owner_id, "joining running drain");
                    running.clone()
                }
                None => {
                    let drain = self.spawn_drain(ctx);
                    drains.insert(ctx.owner_id.clone(), drain.clone());
                    drain
                }
            }
        };
        drain.await
    }

    fn spawn_drain(self: &Arc<Self>, ctx: &SessionContext) -> SharedDrain {
        let engine = Arc::clone(self);
        let owned_ctx = ctx.clone();
        let task = tokio::spawn(
            async move {
                let result = engine.drain(&owned_ctx).await;
                lock(&engine.drains).remove(&owned_ctx.owner_id);
                engine.publish_state(&owned_ctx);
                result
            }
            .instrument(Span::current()),
        );

        let engine = Arc::clone(self);
        let owner_id = ctx.owner_id.clone();
        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    lock(&engine.drains).remove(&owner_id);
                    error!(error = %e, "drain task failed");
                    SyncResult {
                        success: false,
                        errors: vec![format!("drain task failed: {e}")],
                        ..SyncResult::default()
                    }
                }
            }
        }
        .boxed()
        .shared()
    }

    async fn drain(&self, ctx: &SessionContext) -> SyncResult {
        let result = match self.try_drain(ctx).await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "drain aborted by local storage error");
                SyncResult {
                    success: false,
                    errors: vec![e.to_string()],
                    ..SyncResult::default()
                }
            }
        };
        lock(&self.progress).remove(&ctx.owner_id);
        info!(
            owner_id = %ctx.owner_id,
            succeeded = result.succeeded,
            failed = result.failed_count,
            auth_required = result.auth_required,
            "drain finished"
        );
        result
    }

    async fn try_drain(&self, ctx: &SessionContext) -> Result<SyncResult> {
        let mut result = SyncResult::empty();
        if !self.connectivity.current().is_available() {
            debug!("offline, drain skipped");
            return Ok(result);
        }

        let settings = self.queue.settings();
        let total = self.queue.pending_count(ctx)?;
        if total == 0 {
            return Ok(result);
        }

        // Every pass either settles an action or spends one of its attempts.
        let max_passes = total
            .saturating_mul(settings.max_attempts.max(1) as usize)
            .saturating_add(1);
        let mut dispatched = 0;
        self.set_progress(ctx, dispatched, total);

        for _ in 0..max_passes {
            let batch = self.queue.dequeue_batch(ctx, settings.batch_size.max(1))?;
            if batch.is_empty() {
                break;
            }

            // At most one action per entity in a batch, so entities run in
            // parallel while each entity stays sequential.
            let dispatches: Vec<_> = batch
                .into_iter()
                .map(|action| self.dispatch_queued(ctx, action))
                .collect();
            let outcomes: Vec<Result<Option<Dispatched>>> = stream::iter(dispatches)
                .buffer_unordered(settings.max_concurrency.max(1))
                .collect()
                .await;

            for outcome in outcomes {
                if let Some(done) = outcome? {
                    dispatched += 1;
                    tally(&mut result, &done);
                }
            }
            self.set_progress(ctx, dispatched, total.max(dispatched));
            self.publish_state(ctx);

            if result.auth_required {
                warn!(owner_id = %ctx.owner_id, "credentials rejected, dispatch halted");
                break;
            }
        }
        Ok(result)
    }

    async fn dispatch_queued(&self, ctx: &SessionContext, action: SyncAction) -> Result<Option<Dispatched>> {
        if !self.queue.mark_in_flight(&action.id)? {
            return Ok(None);
        }
        self.dispatch_claimed(ctx, action).await.map(Some)
    }

    /// Send a claimed action and apply the outcome. Every completion funnels
    /// through here, then through the resolve gate.
    async fn dispatch_claimed(&self, ctx: &SessionContext, action: SyncAction) -> Result<Dispatched> {
        self.store
            .set_status(&action.entity_id, EntitySyncStatus::Syncing)?;

        let request = RemoteRequest::from_action(&action);
        debug!(
            action_id = %action.id,
            entity_id = %action.entity_id,
            operation = %request.operation,
            attempt = action.attempt_count + 1,
            "dispatching"
        );
        let outcome = match self.remote.execute(ctx, &request).await {
            Ok(response) => match response.validate_against(&request) {
                Ok(()) => DispatchOutcome::Succeeded(response),
                Err(mismatch) => DispatchOutcome::Failed(mismatch),
            },
            Err(err) => DispatchOutcome::Failed(err),
        };

        let applied = self.apply_outcome(&action, &outcome)?;
        self.gate.resolve(&action.id, outcome.clone());
        Ok(Dispatched {
            action,
            outcome,
            applied,
        })
    }

    /// Record an outcome in the queue and the entity store atomically.
    fn apply_outcome(&self, action: &SyncAction, outcome: &DispatchOutcome) -> Result<Applied> {
        let now = Utc::now();
        let settings = self.queue.settings();
        let applied = self.queue.database().transaction(|tx| match outcome {
            DispatchOutcome::Succeeded(response) => {
                if !sync_queue::mark_succeeded_in(tx, &action.id, response)? {
                    return Ok(Applied::Ignored);
                }
                merge_success_in(tx, action, response, now)?;
                Ok(Applied::Synced)
            }
            DispatchOutcome::Failed(error) => {
                let Some(kind) = sync_queue::mark_failed_in(tx, settings, &action.id, error)? else {
                    return Ok(Applied::Ignored);
                };
                match kind {
                    FailureKind::Transient | FailureKind::Auth => {
                        entity_store::set_status_in(tx, &action.entity_id, EntitySyncStatus::Pending)?;
                    }
                    FailureKind::Permanent | FailureKind::Exhausted => {
                        entity_store::set_status_in(tx, &action.entity_id, EntitySyncStatus::Failed)?;
                    }
                    FailureKind::Conflict => {
                        let server_updated_at = match error {
                            RemoteError::Conflict {
                                server_updated_at, ..
                            } => *server_updated_at,
                            _ => None,
                        };
                        conflict_resolver::record_conflict_in(
                            tx,
                            action,
                            &error.to_string(),
                            server_updated_at,
                            now,
                        )?;
                    }
                }
                Ok(Applied::Failed(kind))
            }
        })?;

        match applied {
            Applied::Synced => info!(
                action_id = %action.id,
                entity_id = %action.entity_id,
                operation = action.command.operation(),
                "synced"
            ),
            Applied::Ignored => debug!(action_id = %action.id, "duplicate outcome ignored"),
            Applied::Failed(_) => {}
        }
        Ok(applied)
    }

    /// Try to confirm a completion or tick with the server right away.
    ///
    /// The caller waits at most `optimistic_timeout`. Past that it gets the
    /// local estimate while the network call keeps running and later settles
    /// the same action. If the queue is already dispatching the action, the
    /// caller waits for that dispatch instead of starting a second one; if
    /// the queue already settled it, the stored server answer is returned.
    pub async fn dispatch_optimistic(
        self: &Arc<Self>,
        ctx: &SessionContext,
        action: &SyncAction,
    ) -> Result<OptimisticOutcome> {
        if !matches!(action.action_type, ActionType::Complete | ActionType::Tick) {
            return Err(ValidationError::InvalidValue {
                field: "action_type".into(),
                message: format!("{} is not dispatched optimistically", action.action_type),
            }
            .into());
        }
        if action.owner_id != ctx.owner_id {
            return Err(ValidationError::ForeignOwner {
                entity_id: action.entity_id.clone(),
                owner_id: ctx.owner_id.clone(),
            }
            .into());
        }

        let record = self.store.get(&action.entity_id)?;
        let estimate = estimate_rewards(&action.command, record.as_ref());
        let estimated = || OptimisticOutcome::Estimated {
            action_id: action.id.clone(),
            rewards: estimate.clone(),
        };

        if !self.connectivity.current().is_available() {
            return Ok(estimated());
        }

        let rx = self.gate.register(&action.id);
        if self.queue.mark_in_flight(&action.id)? {
            let engine = Arc::clone(self);
            let owned_ctx = ctx.clone();
            let claimed = action.clone();
            tokio::spawn(
                async move {
                    if let Err(e) = engine.dispatch_claimed(&owned_ctx, claimed).await {
                        warn!(error = %e, "optimistic dispatch could not record its outcome");
                    }
                    engine.publish_state(&owned_ctx);
                }
                .instrument(Span::current()),
            );
        } else {
            let stored = self.queue.get(&action.id)?;
            if !stored
                .as_ref()
                .is_some_and(|a| a.status == ActionStatus::InFlight)
            {
                self.gate.forget(&action.id);
                return self.settled_outcome(action, stored.as_ref(), estimate.clone());
            }
        }

        let deadline = self.queue.settings().optimistic_timeout();
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(DispatchOutcome::Succeeded(response))) => Ok(OptimisticOutcome::Confirmed {
                action_id: action.id.clone(),
                rewards: response.rewards.unwrap_or_else(|| estimate.clone()),
                entity: response.entity,
            }),
            Ok(Ok(DispatchOutcome::Failed(error))) => match error.kind() {
                FailureKind::Permanent | FailureKind::Conflict => Ok(OptimisticOutcome::Rejected {
                    action_id: action.id.clone(),
                    error: error.to_string(),
                }),
                _ => {
                    self.request_drain();
                    Ok(estimated())
                }
            },
            Ok(Err(_closed)) => Ok(estimated()),
            Err(_elapsed) => {
                self.gate.forget(&action.id);
                debug!(action_id = %action.id, "optimistic wait timed out");
                Ok(estimated())
            }
        }
    }

    /// Outcome for an action this call could not claim: report what the
    /// queue already knows, or fall back to the estimate and wake the drain.
    fn settled_outcome(
        &self,
        action: &SyncAction,
        stored: Option<&SyncAction>,
        estimate: Rewards,
    ) -> Result<OptimisticOutcome> {
        let estimated = |rewards: Rewards| OptimisticOutcome::Estimated {
            action_id: action.id.clone(),
            rewards,
        };
        match stored {
            Some(done) if done.status == ActionStatus::Succeeded => {
                // Rows without a stored answer predate the response column.
                let Some(response) = self.queue.stored_response(&action.id)? else {
                    return Ok(estimated(estimate));
                };
                Ok(OptimisticOutcome::Confirmed {
                    action_id: action.id.clone(),
                    rewards: response.rewards.unwrap_or(estimate),
                    entity: response.entity,
                })
            }
            Some(failed)
                if failed.status == ActionStatus::Failed
                    && matches!(failed.failure, Some(FailureKind::Permanent | FailureKind::Conflict)) =>
            {
                Ok(OptimisticOutcome::Rejected {
                    action_id: action.id.clone(),
                    error: failed.last_error.clone().unwrap_or_default(),
                })
            }
            _ => {
                // Held back behind an earlier action, waiting out a backoff,
                // or already cleaned up.
                self.request_drain();
                Ok(estimated(estimate))
            }
        }
    }

    /// Manual retry: reset terminal failures (conflicts excepted) and drain.
    pub async fn retry_failed(self: &Arc<Self>, ctx: &SessionContext) -> Result<SyncResult> {
        self.queue.reset_failed(ctx)?;
        Ok(self.sync_pending_actions(ctx).await)
    }

    /// Current aggregate state for `ctx.owner_id`; also published to
    /// subscribers.
    ///
    /// Offline wins over everything, then a running drain, then terminal
    /// failures, then work still waiting.
    pub fn sync_state(&self, ctx: &SessionContext) -> Result<AggregateSyncState> {
        let running = lock(&self.progress).get(&ctx.owner_id).copied();
        let state = if !self.connectivity.current().is_available() {
            AggregateSyncState::Offline
        } else if let Some((progress, total)) = running {
            AggregateSyncState::Syncing { progress, total }
        } else {
            let failed = self.queue.failed_actions(ctx)?;
            if !failed.is_empty() {
                AggregateSyncState::Failed {
                    count: failed.len(),
                    errors: failed.into_iter().filter_map(|a| a.last_error).collect(),
                }
            } else {
                match self.queue.pending_count(ctx)? {
                    0 => AggregateSyncState::Synced,
                    count => AggregateSyncState::Pending { count },
                }
            }
        };

        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state.clone();
                true
            }
        });
        Ok(state)
    }

    /// Follow aggregate state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<AggregateSyncState> {
        self.state_tx.subscribe()
    }

    /// Recompute and publish the aggregate state, logging storage errors.
    pub fn publish_state(&self, ctx: &SessionContext) {
        if let Err(e) = self.sync_state(ctx) {
            warn!(error = %e, "could not compute sync state");
        }
    }

    /// Remove SUCCEEDED actions and terminal failures past retention.
    pub fn cleanup(&self, ctx: &SessionContext) -> Result<CleanupReport> {
        let cutoff = Utc::now() - self.queue.settings().failed_retention();
        let report = CleanupReport {
            succeeded_removed: self.queue.delete_succeeded(ctx)?,
            failed_removed: self.queue.delete_old_failed_actions(cutoff)?,
        };
        self.publish_state(ctx);
        Ok(report)
    }

    fn set_progress(&self, ctx: &SessionContext, progress: usize, total: usize) {
        lock(&self.progress).insert(ctx.owner_id.clone(), (progress, total));
    }
}

/// Merge a successful response into the entity store.
///
/// Full-record replace with SYNCED status, unless later edits of the same
/// entity are still queued: then only the server timestamps are recorded
/// and the local fields stay PENDING.
fn merge_success_in(
    conn: &Connection,
    action: &SyncAction,
    response: &RemoteResponse,
    now: chrono::DateTime<Utc>,
) -> Result<()> {
    let later = sync_queue::has_later_open_in(conn, action)?;
    match (&response.entity, action.action_type) {
        (_, ActionType::Delete) if !later => {
            entity_store::delete_in(conn, &action.entity_id)?;
        }
        (Some(server), _) if later => {
            entity_store::record_server_ack_in(conn, &server.id, server.server_updated_at, now)?;
        }
        (Some(server), _) => {
            entity_store::replace_with_server_in(conn, &action.owner_id, server, now)?;
        }
        (None, _) => {
            let status = if later {
                EntitySyncStatus::Pending
            } else {
                EntitySyncStatus::Synced
            };
            entity_store::set_status_in(conn, &action.entity_id, status)?;
        }
    }
    Ok(())
}

fn tally(result: &mut SyncResult, done: &Dispatched) {
    match (&done.applied, &done.outcome) {
        (Applied::Synced, _) => result.succeeded += 1,
        (Applied::Failed(kind), DispatchOutcome::Failed(error)) if *kind != FailureKind::Transient => {
            result.success = false;
            result.failed_count += 1;
            result.errors.push(format!(
                "{} {}: {}",
                done.action.command.operation(),
                done.action.entity_id,
                error
            ));
            if *kind == FailureKind::Auth {
                result.auth_required = true;
            }
        }
        _ => {}
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
