//! Conflict resolution for cached entities.
//!
//! Two rules hold everywhere:
//! - a record with a local edit in flight (PENDING or SYNCING) is never
//!   overwritten by an independently fetched server snapshot;
//! - a conflict reported by the server is never merged automatically. It is
//!   logged and waits for a refetch or an explicit user choice.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Result, ValidationError};
use crate::session::SessionContext;
use crate::storage::database::{encode_ts, opt_ts_col, ts_col};
use crate::storage::Database;
use crate::sync::entity_store::{self, EntityRecord};
use crate::sync::remote::{RemoteApi, ServerEntity};
use crate::sync::sync_queue;
use crate::sync::types::{EntitySyncStatus, EntityType, SyncAction};

/// What to do with a server snapshot fetched outside of action dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotDecision {
    /// No local copy yet.
    Insert,
    /// Local copy is synced (or failed) and older.
    Replace,
    /// Local copy is in CONFLICT; the fresh snapshot settles it.
    ResolveConflict,
    /// Local edit not yet synced; the pending edit wins.
    KeepPending,
    /// Snapshot is older than what we already have.
    IgnoreStale,
}

impl SnapshotDecision {
    pub fn applies(&self) -> bool {
        matches!(
            self,
            SnapshotDecision::Insert | SnapshotDecision::Replace | SnapshotDecision::ResolveConflict
        )
    }
}

/// Decide how a server snapshot relates to the local copy.
pub fn decide_snapshot(local: Option<&EntityRecord>, snapshot: &ServerEntity) -> SnapshotDecision {
    let Some(local) = local else {
        return SnapshotDecision::Insert;
    };

    match local.sync_status {
        EntitySyncStatus::Pending | EntitySyncStatus::Syncing => SnapshotDecision::KeepPending,
        _ if local
            .server_updated_at
            .is_some_and(|known| snapshot.server_updated_at < known) =>
        {
            SnapshotDecision::IgnoreStale
        }
        EntitySyncStatus::Conflict => SnapshotDecision::ResolveConflict,
        EntitySyncStatus::Synced | EntitySyncStatus::Failed => SnapshotDecision::Replace,
    }
}

/// One row of the conflict log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictEntry {
    pub id: i64,
    pub action_id: String,
    pub entity_id: String,
    pub client_updated_at: Option<DateTime<Utc>>,
    pub server_updated_at: Option<DateTime<Utc>>,
    pub message: String,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<String>,
}

/// Applies snapshots and explicit conflict resolutions.
pub struct ConflictResolver {
    db: Arc<Database>,
    remote: Arc<dyn RemoteApi>,
}

impl ConflictResolver {
    pub fn new(db: Arc<Database>, remote: Arc<dyn RemoteApi>) -> Self {
        Self { db, remote }
    }

    /// Apply a server snapshot obtained by a background refresh.
    ///
    /// Read, decision and write happen in one transaction, so a local edit
    /// committed concurrently cannot be overwritten in between.
    pub fn apply_snapshot(
        &self,
        ctx: &SessionContext,
        snapshot: &ServerEntity,
    ) -> Result<SnapshotDecision> {
        let now = Utc::now();
        let decision = self.db.transaction(|tx| {
            let local = entity_store::get_in(tx, &snapshot.id)?;
            if local.as_ref().is_some_and(|r| r.owner_id != ctx.owner_id) {
                return Err(ValidationError::ForeignOwner {
                    entity_id: snapshot.id.clone(),
                    owner_id: ctx.owner_id.clone(),
                }
                .into());
            }

            let decision = decide_snapshot(local.as_ref(), snapshot);
            match decision {
                SnapshotDecision::ResolveConflict => {
                    sync_queue::discard_conflicted_in(tx, &snapshot.id)?;
                    resolve_log_in(tx, &snapshot.id, "refetch", now)?;
                    settle_in(tx, &ctx.owner_id, &snapshot.id, Some(snapshot), now)?;
                }
                SnapshotDecision::Insert | SnapshotDecision::Replace => {
                    entity_store::replace_with_server_in(tx, &ctx.owner_id, snapshot, now)?;
                }
                SnapshotDecision::KeepPending | SnapshotDecision::IgnoreStale => {}
            }
            Ok(decision)
        })?;

        debug!(entity_id = %snapshot.id, ?decision, "snapshot");
        Ok(decision)
    }

    /// Resolve a conflict in favour of the server.
    ///
    /// Refetches the entity, replaces the local copy and drops the conflicted
    /// actions. Edits queued after the conflict are still sent. Returns the
    /// new local record, `None` if the server no longer has the entity.
    pub async fn accept_server(
        &self,
        ctx: &SessionContext,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<EntityRecord>> {
        self.require_conflict(ctx, entity_id)?;
        let fetched = self.remote.fetch(ctx, entity_type, entity_id).await?;

        let now = Utc::now();
        let record = self.db.transaction(|tx| {
            let discarded = sync_queue::discard_conflicted_in(tx, entity_id)?;
            resolve_log_in(tx, entity_id, "accept_server", now)?;
            debug!(entity_id, discarded, "conflicted actions discarded");
            settle_in(tx, &ctx.owner_id, entity_id, fetched.as_ref(), now)
        })?;

        info!(entity_id, "conflict resolved with server copy");
        Ok(record)
    }

    /// Resolve a conflict in favour of the local edit.
    ///
    /// The conflicted actions are requeued with `client_updated_at` moved to
    /// now, so the next drain sends them as the newest edit. Returns the
    /// number of requeued actions.
    pub fn keep_local(&self, ctx: &SessionContext, entity_id: &str) -> Result<usize> {
        self.require_conflict(ctx, entity_id)?;
        let now = Utc::now();
        let requeued = self.db.transaction(|tx| {
            let requeued = sync_queue::rebase_conflicted_in(tx, entity_id, now)?;
            entity_store::set_status_in(tx, entity_id, EntitySyncStatus::Pending)?;
            resolve_log_in(tx, entity_id, "keep_local", now)?;
            Ok(requeued)
        })?;

        info!(entity_id, requeued, "conflict resolved with local edit");
        Ok(requeued)
    }

    /// Most recent conflicts first.
    pub fn list_conflicts(&self, limit: usize) -> Result<Vec<ConflictEntry>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, action_id, entity_id, client_updated_at, server_updated_at, message,
                        detected_at, resolved_at, resolution
                 FROM sync_conflicts
                 ORDER BY detected_at DESC, id DESC
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], conflict_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// The queue, not the record status, says whether a conflict is open.
    fn require_conflict(&self, ctx: &SessionContext, entity_id: &str) -> Result<()> {
        let (record, conflicted) = self.db.with_conn(|conn| {
            Ok((
                entity_store::get_in(conn, entity_id)?,
                sync_queue::has_conflicted_in(conn, entity_id)?,
            ))
        })?;
        if record.is_some_and(|r| r.owner_id != ctx.owner_id) {
            return Err(ValidationError::ForeignOwner {
                entity_id: entity_id.to_string(),
                owner_id: ctx.owner_id.clone(),
            }
            .into());
        }
        if !conflicted {
            return Err(ValidationError::InvalidValue {
                field: "entity_id".into(),
                message: format!("{entity_id} has no unresolved conflict"),
            }
            .into());
        }
        Ok(())
    }
}

/// Log a conflict reported for `action` and flag its entity CONFLICT.
pub(crate) fn record_conflict_in(
    conn: &Connection,
    action: &SyncAction,
    message: &str,
    server_updated_at: Option<DateTime<Utc>>,
    detected_at: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_conflicts (
            action_id, entity_id, client_updated_at, server_updated_at, message, detected_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            action.id,
            action.entity_id,
            encode_ts(action.command.client_updated_at()),
            server_updated_at.map(encode_ts),
            message,
            encode_ts(detected_at),
        ],
    )?;
    entity_store::mark_conflict_in(conn, &action.entity_id, server_updated_at)?;
    Ok(())
}

/// Take the server copy once the conflicted actions are gone.
///
/// Edits queued after the conflict keep their local fields and stay
/// PENDING; only the server timestamps move. If the server dropped the
/// entity, the local record and its queued edits go too.
fn settle_in(
    conn: &Connection,
    owner_id: &str,
    entity_id: &str,
    server: Option<&ServerEntity>,
    now: DateTime<Utc>,
) -> Result<Option<EntityRecord>> {
    match server {
        Some(server) if sync_queue::has_unsent_in(conn, entity_id)? => {
            entity_store::record_server_ack_in(conn, entity_id, server.server_updated_at, now)?;
            entity_store::get_in(conn, entity_id)
        }
        Some(server) => Ok(Some(entity_store::replace_with_server_in(
            conn, owner_id, server, now,
        )?)),
        None => {
            let dropped = sync_queue::discard_unsent_in(conn, entity_id)?;
            entity_store::delete_in(conn, entity_id)?;
            debug!(entity_id, dropped, "entity gone on server");
            Ok(None)
        }
    }
}

fn resolve_log_in(conn: &Connection, entity_id: &str, resolution: &str, at: DateTime<Utc>) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE sync_conflicts SET resolved_at = ?3, resolution = ?2
         WHERE entity_id = ?1 AND resolved_at IS NULL",
        params![entity_id, resolution, encode_ts(at)],
    )?)
}

fn conflict_from_row(row: &Row<'_>) -> rusqlite::Result<ConflictEntry> {
    Ok(ConflictEntry {
        id: row.get(0)?,
        action_id: row.get(1)?,
        entity_id: row.get(2)?,
        client_updated_at: opt_ts_col(row, 3)?,
        server_updated_at: opt_ts_col(row, 4)?,
        message: row.get(5)?,
        detected_at: ts_col(row, 6)?,
        resolved_at: opt_ts_col(row, 7)?,
        resolution: row.get(8)?,
    })
}
