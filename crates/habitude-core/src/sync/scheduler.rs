//! Background drain loop.
//!
//! Drains run on start, on a fixed period, when a mutation asks for one,
//! when the earliest backoff expires and when connectivity comes back with
//! work queued. All of them go through the engine's single-flight drain.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::session::SessionContext;
use crate::sync::sync_engine::SyncEngine;

/// Floor for the backoff timer, so a due retry that cannot run (offline,
/// halted on auth) does not spin the loop.
const MIN_RETRY_WAIT: Duration = Duration::from_secs(1);

/// Handle to a running background loop.
pub struct SchedulerHandle {
    engine: Arc<SyncEngine>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Request a drain now.
    pub fn trigger_now(&self) {
        self.engine.request_drain();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the loop and wait for it. A drain in progress finishes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "sync scheduler task ended abnormally");
        }
    }
}

pub struct BackgroundScheduler;

impl BackgroundScheduler {
    /// Spawn the loop for `ctx` on the current tokio runtime.
    pub fn spawn(engine: Arc<SyncEngine>, ctx: SessionContext) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(Arc::clone(&engine), ctx, shutdown_rx));
        SchedulerHandle {
            engine,
            shutdown_tx,
            task,
        }
    }
}

async fn run(engine: Arc<SyncEngine>, ctx: SessionContext, mut shutdown_rx: watch::Receiver<bool>) {
    let period = engine.queue().settings().periodic_interval();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut connectivity = engine.connectivity_monitor().observe();
    let mut watching = true;

    info!(owner_id = %ctx.owner_id, period_secs = period.as_secs(), "sync scheduler started");
    loop {
        let retry_in = retry_wait(&engine, &ctx);

        let reason = tokio::select! {
            _ = shutdown_rx.changed() => break,
            // The first tick completes immediately: drain on start.
            _ = ticker.tick() => "periodic",
            _ = engine.drain_requested() => "requested",
            _ = sleep_for(retry_in) => "retry",
            changed = connectivity.changed(), if watching => {
                if changed.is_err() {
                    debug!("connectivity monitor gone");
                    watching = false;
                    continue;
                }
                let available = connectivity.borrow_and_update().is_available();
                if !available || !has_pending(&engine, &ctx) {
                    continue;
                }
                "reconnected"
            }
        };

        debug!(reason, "drain triggered");
        let result = engine.sync_pending_actions(&ctx).await;
        if result.auth_required {
            warn!(owner_id = %ctx.owner_id, "sync paused until credentials are refreshed");
        }
    }
    info!(owner_id = %ctx.owner_id, "sync scheduler stopped");
}

/// Time until the earliest scheduled retry, if any and if online.
fn retry_wait(engine: &SyncEngine, ctx: &SessionContext) -> Option<Duration> {
    if !engine.connectivity().is_available() {
        return None;
    }
    match engine.queue().next_retry_at(ctx) {
        Ok(at) => at.map(|at| {
            (at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .max(MIN_RETRY_WAIT)
        }),
        Err(e) => {
            warn!(error = %e, "could not read retry schedule");
            None
        }
    }
}

fn has_pending(engine: &SyncEngine, ctx: &SessionContext) -> bool {
    engine.queue().pending_count(ctx).map_or(true, |n| n > 0)
}

async fn sleep_for(wait: Option<Duration>) {
    match wait {
        Some(wait) => tokio::time::sleep(wait).await,
        None => std::future::pending::<()>().await,
    }
}
