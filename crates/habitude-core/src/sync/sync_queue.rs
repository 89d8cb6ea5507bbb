//! Durable sync action queue backed by SQLite.
//!
//! Every local mutation lands here as a PENDING [`SyncAction`] before the
//! call that produced it returns. The queue hands out work head-first per
//! entity: an action is only dequeued once every earlier action on the same
//! entity has reached an outcome that lets it proceed.

use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CoreError, DatabaseError, Result, ValidationError};
use crate::session::SessionContext;
use crate::storage::database::{encode_ts, json_col, opt_ts_col, parse_col, ts_col};
use crate::storage::{Database, SyncSettings};
use crate::sync::command::SyncCommand;
use crate::sync::remote::RemoteResponse;
use crate::sync::types::{
    priority, ActionStatus, EntitySyncStatus, FailureKind, RemoteError, SyncAction,
};

const ACTION_COLUMNS: &str = "id, sequence, owner_id, entity_type, entity_id, action_type, \
     command, priority, status, attempt_count, created_at, last_attempt_at, last_error, \
     failure, next_attempt_at";

/// Predicate over `p` (an earlier or later action on the same entity) that
/// holds while `p` still has to run before its neighbours.
const OPEN_ON_ENTITY: &str = "(p.status IN ('PENDING', 'IN_FLIGHT') \
     OR (p.status = 'FAILED' AND (p.next_attempt_at IS NOT NULL \
         OR p.failure IN ('auth', 'conflict'))))";

/// Durable, ordered store of pending mutations.
pub struct SyncQueue {
    db: Arc<Database>,
    settings: SyncSettings,
}

impl SyncQueue {
    /// Open the queue on `db`.
    ///
    /// Actions left IN_FLIGHT by a previous process are made retry-eligible
    /// again before the queue is handed out.
    pub fn open(db: Arc<Database>, settings: SyncSettings) -> Result<Self> {
        let queue = Self { db, settings };
        let recovered = queue.recover_in_flight()?;
        if recovered > 0 {
            info!(recovered, "re-queued actions interrupted by restart");
        }
        Ok(queue)
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Durably append a PENDING action for `command`.
    ///
    /// Returns after the insert has committed.
    pub fn enqueue(&self, ctx: &SessionContext, command: SyncCommand) -> Result<SyncAction> {
        self.db.transaction(|tx| enqueue_in(tx, ctx, command))
    }

    /// Up to `max` dispatchable actions, priority first, then creation order.
    ///
    /// Only the head action of each entity is returned, and FAILED actions
    /// only once their backoff has elapsed.
    pub fn dequeue_batch(&self, ctx: &SessionContext, max: usize) -> Result<Vec<SyncAction>> {
        let now = encode_ts(Utc::now());
        let sql = format!(
            "SELECT {ACTION_COLUMNS} FROM sync_actions
             WHERE owner_id = ?1
               AND (status = 'PENDING'
                    OR (status = 'FAILED' AND next_attempt_at IS NOT NULL AND next_attempt_at <= ?2))
               AND NOT EXISTS (
                   SELECT 1 FROM sync_actions p
                   WHERE p.entity_id = sync_actions.entity_id
                     AND p.sequence < sync_actions.sequence
                     AND {OPEN_ON_ENTITY})
             ORDER BY priority ASC, created_at ASC, sequence ASC
             LIMIT ?3"
        );
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![ctx.owner_id, now, max as i64],
                action_from_row,
            )?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Claim an action for dispatch: PENDING (or retry-due FAILED) → IN_FLIGHT.
    ///
    /// The claim is a single conditional UPDATE that also requires the action
    /// to be the head of its entity. Returns `false` when another caller got
    /// there first or an earlier action on the entity is still open.
    pub fn mark_in_flight(&self, id: &str) -> Result<bool> {
        let now = encode_ts(Utc::now());
        let sql = format!(
            "UPDATE sync_actions
             SET status = 'IN_FLIGHT', last_attempt_at = ?2, failure = NULL, next_attempt_at = NULL
             WHERE id = ?1
               AND (status = 'PENDING'
                    OR (status = 'FAILED' AND next_attempt_at IS NOT NULL AND next_attempt_at <= ?2))
               AND NOT EXISTS (
                   SELECT 1 FROM sync_actions p
                   WHERE p.entity_id = sync_actions.entity_id
                     AND p.sequence < sync_actions.sequence
                     AND {OPEN_ON_ENTITY})"
        );
        let claimed = self
            .db
            .with_conn(|conn| Ok(conn.execute(&sql, params![id, now])? == 1))?;
        debug!(action_id = id, claimed, "claim");
        Ok(claimed)
    }

    /// IN_FLIGHT → SUCCEEDED.
    ///
    /// Returns `false` (and changes nothing) when the action is not
    /// IN_FLIGHT, which makes a second delivery of the same outcome a no-op.
    pub fn mark_succeeded(&self, id: &str, response: &RemoteResponse) -> Result<bool> {
        self.db.with_conn(|conn| mark_succeeded_in(conn, id, response))
    }

    /// IN_FLIGHT → FAILED, counting the attempt and recording the error.
    ///
    /// Transient errors schedule the next attempt with exponential backoff
    /// until `max_attempts` is reached, after which the failure is terminal
    /// (`Exhausted`). Every other error is terminal straight away. Returns
    /// the recorded kind, or `None` when the action was no longer IN_FLIGHT.
    pub fn mark_failed(&self, id: &str, error: &RemoteError) -> Result<Option<FailureKind>> {
        self.db
            .transaction(|tx| mark_failed_in(tx, &self.settings, id, error))
    }

    /// Actions still waiting to reach the server: PENDING, IN_FLIGHT and
    /// FAILED with a retry scheduled.
    pub fn pending_count(&self, ctx: &SessionContext) -> Result<usize> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sync_actions
                 WHERE owner_id = ?1
                   AND (status IN ('PENDING', 'IN_FLIGHT')
                        OR (status = 'FAILED' AND next_attempt_at IS NOT NULL))",
                params![ctx.owner_id],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }

    /// Terminally failed actions (no automatic retry left), oldest first.
    pub fn failed_actions(&self, ctx: &SessionContext) -> Result<Vec<SyncAction>> {
        self.select(
            "WHERE owner_id = ?1 AND status = 'FAILED' AND next_attempt_at IS NULL
             ORDER BY sequence ASC",
            params![ctx.owner_id],
        )
    }

    /// Remove terminal failures last attempted before `cutoff`.
    ///
    /// Conflicts and auth failures are kept: they still hold a user edit that
    /// waits for resolution.
    pub fn delete_old_failed_actions(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let deleted = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM sync_actions
                 WHERE status = 'FAILED' AND next_attempt_at IS NULL
                   AND failure IN ('permanent', 'exhausted')
                   AND COALESCE(last_attempt_at, created_at) < ?1",
                params![encode_ts(cutoff)],
            )?)
        })?;
        if deleted > 0 {
            info!(deleted, "removed aged-out failed actions");
        }
        Ok(deleted)
    }

    /// Remove SUCCEEDED actions of this owner.
    ///
    /// Terminal failures those actions superseded go first, while the
    /// successors are still there to prove it.
    pub fn delete_succeeded(&self, ctx: &SessionContext) -> Result<usize> {
        self.db.transaction(|tx| {
            discard_superseded_in(tx, &ctx.owner_id)?;
            Ok(tx.execute(
                "DELETE FROM sync_actions WHERE owner_id = ?1 AND status = 'SUCCEEDED'",
                params![ctx.owner_id],
            )?)
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<SyncAction>> {
        Ok(self.select("WHERE id = ?1", params![id])?.into_iter().next())
    }

    /// The server's answer to a SUCCEEDED action, while the row is kept.
    pub fn stored_response(&self, id: &str) -> Result<Option<RemoteResponse>> {
        let raw: Option<String> = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT response FROM sync_actions WHERE id = ?1 AND status = 'SUCCEEDED'",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?
                .flatten())
        })?;
        raw.map(|raw| {
            serde_json::from_str(&raw).map_err(|e| {
                CoreError::from(DatabaseError::CorruptRow {
                    table: "sync_actions",
                    message: format!("response of {id}: {e}"),
                })
            })
        })
        .transpose()
    }

    /// All actions of this owner in append order, optionally by status.
    pub fn list(&self, ctx: &SessionContext, status: Option<ActionStatus>) -> Result<Vec<SyncAction>> {
        match status {
            Some(status) => self.select(
                "WHERE owner_id = ?1 AND status = ?2 ORDER BY sequence ASC",
                params![ctx.owner_id, status.as_str()],
            ),
            None => self.select(
                "WHERE owner_id = ?1 ORDER BY sequence ASC",
                params![ctx.owner_id],
            ),
        }
    }

    /// Reset actions interrupted mid-dispatch.
    ///
    /// IN_FLIGHT actions go back to PENDING and entities stuck in SYNCING go
    /// back to PENDING. No outcome was persisted for them, so they are
    /// retried; the idempotency key keeps a replay from double-applying.
    pub fn recover_in_flight(&self) -> Result<usize> {
        self.db.transaction(|tx| {
            let actions = tx.execute(
                "UPDATE sync_actions SET status = 'PENDING' WHERE status = 'IN_FLIGHT'",
                [],
            )?;
            tx.execute(
                "UPDATE entity_records SET sync_status = ?1 WHERE sync_status = ?2",
                params![
                    EntitySyncStatus::Pending.as_str(),
                    EntitySyncStatus::Syncing.as_str()
                ],
            )?;
            Ok(actions)
        })
    }

    /// Manual retry: give terminal failures (except conflicts) a fresh
    /// attempt budget and put their entities back to PENDING.
    ///
    /// A failure whose entity already moved on (a later action was sent) is
    /// dropped instead: replaying it would apply it after its successor.
    pub fn reset_failed(&self, ctx: &SessionContext) -> Result<usize> {
        let reset = self.db.transaction(|tx| {
            let superseded = discard_superseded_in(tx, &ctx.owner_id)?;
            if superseded > 0 {
                info!(superseded, owner_id = %ctx.owner_id, "dropped failures overtaken by later actions");
            }
            tx.execute(
                "UPDATE entity_records SET sync_status = 'PENDING'
                 WHERE sync_status = 'FAILED'
                   AND id IN (SELECT entity_id FROM sync_actions
                              WHERE owner_id = ?1 AND status = 'FAILED'
                                AND next_attempt_at IS NULL
                                AND COALESCE(failure, '') != 'conflict')",
                params![ctx.owner_id],
            )?;
            Ok(tx.execute(
                "UPDATE sync_actions
                 SET status = 'PENDING', attempt_count = 0, failure = NULL, next_attempt_at = NULL
                 WHERE owner_id = ?1 AND status = 'FAILED' AND next_attempt_at IS NULL
                   AND COALESCE(failure, '') != 'conflict'",
                params![ctx.owner_id],
            )?)
        })?;
        if reset > 0 {
            info!(reset, owner_id = %ctx.owner_id, "failed actions reset for retry");
        }
        Ok(reset)
    }

    /// Earliest scheduled retry of this owner, if any.
    pub fn next_retry_at(&self, ctx: &SessionContext) -> Result<Option<DateTime<Utc>>> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT MIN(next_attempt_at) FROM sync_actions
                 WHERE owner_id = ?1 AND status = 'FAILED' AND next_attempt_at IS NOT NULL",
                params![ctx.owner_id],
                |row| opt_ts_col(row, 0),
            )?)
        })
    }

    /// Whether an earlier action on the same entity is still open.
    pub fn has_open_predecessor(&self, action: &SyncAction) -> Result<bool> {
        self.db
            .with_conn(|conn| has_open_neighbour(conn, action, "p.sequence < ?2"))
    }

    /// Whether a later action on the same entity is still open.
    pub fn has_later_open_actions(&self, action: &SyncAction) -> Result<bool> {
        self.db.with_conn(|conn| has_later_open_in(conn, action))
    }

    /// Drop the conflicted actions of an entity.
    pub fn discard_conflicted(&self, entity_id: &str) -> Result<usize> {
        self.db.transaction(|tx| discard_conflicted_in(tx, entity_id))
    }

    /// Requeue the conflicted actions of an entity with a fresh base
    /// timestamp, so the server accepts them as the newer edit.
    pub fn rebase_conflicted(&self, entity_id: &str, client_updated_at: DateTime<Utc>) -> Result<usize> {
        self.db
            .transaction(|tx| rebase_conflicted_in(tx, entity_id, client_updated_at))
    }

    fn select(&self, clause: &str, params: impl rusqlite::Params) -> Result<Vec<SyncAction>> {
        let sql = format!("SELECT {ACTION_COLUMNS} FROM sync_actions {clause}");
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params, action_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }
}

/// Insert a PENDING action on an open connection or transaction.
pub(crate) fn enqueue_in(
    conn: &Connection,
    ctx: &SessionContext,
    command: SyncCommand,
) -> Result<SyncAction> {
    let entity_id = command.entity_id().trim().to_string();
    if entity_id.is_empty() {
        return Err(ValidationError::EmptyField("entity_id").into());
    }

    let sequence: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sequence), 0) + 1 FROM sync_actions",
        [],
        |row| row.get(0),
    )?;

    let entity_type = command.entity_type();
    let action_type = command.action_type();
    let action = SyncAction {
        id: Uuid::new_v4().to_string(),
        sequence,
        owner_id: ctx.owner_id.clone(),
        entity_type,
        entity_id,
        action_type,
        priority: priority(entity_type, action_type),
        status: ActionStatus::Pending,
        attempt_count: 0,
        // Stored with microsecond precision.
        created_at: Utc::now().trunc_subsecs(6),
        last_attempt_at: None,
        last_error: None,
        failure: None,
        next_attempt_at: None,
        command,
    };

    conn.execute(
        "INSERT INTO sync_actions (
            id, sequence, owner_id, entity_type, entity_id, action_type, command,
            priority, status, attempt_count, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10)",
        params![
            action.id,
            action.sequence,
            action.owner_id,
            action.entity_type.as_str(),
            action.entity_id,
            action.action_type.as_str(),
            serde_json::to_string(&action.command)?,
            action.priority,
            action.status.as_str(),
            encode_ts(action.created_at),
        ],
    )?;

    debug!(
        action_id = %action.id,
        entity_id = %action.entity_id,
        operation = action.command.operation(),
        sequence,
        "enqueued"
    );
    Ok(action)
}

pub(crate) fn mark_succeeded_in(
    conn: &Connection,
    id: &str,
    response: &RemoteResponse,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE sync_actions
         SET status = 'SUCCEEDED', last_error = NULL, failure = NULL, next_attempt_at = NULL,
             response = ?2
         WHERE id = ?1 AND status = 'IN_FLIGHT'",
        params![id, serde_json::to_string(response)?],
    )?;
    Ok(changed == 1)
}

pub(crate) fn mark_failed_in(
    conn: &Connection,
    settings: &SyncSettings,
    id: &str,
    error: &RemoteError,
) -> Result<Option<FailureKind>> {
    let row = conn
        .query_row(
            "SELECT status, attempt_count FROM sync_actions WHERE id = ?1",
            params![id],
            |row| Ok((parse_col::<ActionStatus>(row, 0)?, row.get::<_, u32>(1)?)),
        )
        .optional()?;
    let Some((status, attempts)) = row else {
        return Err(CoreError::ActionNotFound(id.to_string()));
    };
    if status != ActionStatus::InFlight {
        return Ok(None);
    }

    let attempt = attempts + 1;
    let (kind, next_attempt_at) = match error.kind() {
        FailureKind::Transient if attempt >= settings.max_attempts => (FailureKind::Exhausted, None),
        FailureKind::Transient => {
            let delay = chrono::Duration::from_std(settings.backoff(attempt))
                .unwrap_or_else(|_| chrono::Duration::days(1));
            (FailureKind::Transient, Some(Utc::now() + delay))
        }
        other => (other, None),
    };

    conn.execute(
        "UPDATE sync_actions
         SET status = 'FAILED', attempt_count = ?2, last_error = ?3, failure = ?4,
             next_attempt_at = ?5
         WHERE id = ?1",
        params![
            id,
            attempt,
            error.to_string(),
            kind.as_str(),
            next_attempt_at.map(encode_ts),
        ],
    )?;

    match kind {
        FailureKind::Transient => {
            debug!(action_id = id, attempt, error = %error, "transient failure, backing off")
        }
        _ => warn!(action_id = id, attempt, failure = kind.as_str(), error = %error, "action failed"),
    }
    Ok(Some(kind))
}

pub(crate) fn discard_conflicted_in(conn: &Connection, entity_id: &str) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM sync_actions
         WHERE entity_id = ?1 AND status = 'FAILED' AND failure = 'conflict'",
        params![entity_id],
    )?)
}

/// Delete terminal failures of `owner_id` that a later action on the same
/// entity has already been sent past.
pub(crate) fn discard_superseded_in(conn: &Connection, owner_id: &str) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM sync_actions
         WHERE owner_id = ?1 AND status = 'FAILED' AND next_attempt_at IS NULL
           AND failure IN ('permanent', 'exhausted')
           AND EXISTS (
               SELECT 1 FROM sync_actions later
               WHERE later.entity_id = sync_actions.entity_id
                 AND later.sequence > sync_actions.sequence
                 AND later.status IN ('SUCCEEDED', 'IN_FLIGHT'))",
        params![owner_id],
    )?)
}

/// Whether the entity still has a conflicted action waiting for resolution.
pub(crate) fn has_conflicted_in(conn: &Connection, entity_id: &str) -> Result<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sync_actions
                       WHERE entity_id = ?1 AND status = 'FAILED' AND failure = 'conflict')",
        params![entity_id],
        |row| row.get(0),
    )?;
    Ok(exists != 0)
}

/// Whether the entity has actions the server has not accepted yet.
pub(crate) fn has_unsent_in(conn: &Connection, entity_id: &str) -> Result<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sync_actions
                       WHERE entity_id = ?1 AND status IN ('PENDING', 'IN_FLIGHT', 'FAILED'))",
        params![entity_id],
        |row| row.get(0),
    )?;
    Ok(exists != 0)
}

/// Drop every action of an entity that has not reached the server.
pub(crate) fn discard_unsent_in(conn: &Connection, entity_id: &str) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM sync_actions WHERE entity_id = ?1 AND status IN ('PENDING', 'FAILED')",
        params![entity_id],
    )?)
}

pub(crate) fn rebase_conflicted_in(
    conn: &Connection,
    entity_id: &str,
    client_updated_at: DateTime<Utc>,
) -> Result<usize> {
    let sql = format!(
        "SELECT {ACTION_COLUMNS} FROM sync_actions
         WHERE entity_id = ?1 AND status = 'FAILED' AND failure = 'conflict'
         ORDER BY sequence ASC"
    );
    let conflicted = {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![entity_id], action_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    for mut action in conflicted.iter().cloned() {
        action.command.set_client_updated_at(client_updated_at);
        conn.execute(
            "UPDATE sync_actions
             SET status = 'PENDING', attempt_count = 0, failure = NULL, next_attempt_at = NULL,
                 command = ?2
             WHERE id = ?1",
            params![action.id, serde_json::to_string(&action.command)?],
        )?;
    }
    Ok(conflicted.len())
}

pub(crate) fn has_later_open_in(conn: &Connection, action: &SyncAction) -> Result<bool> {
    has_open_neighbour(conn, action, "p.sequence > ?2")
}

fn has_open_neighbour(conn: &Connection, action: &SyncAction, order: &str) -> Result<bool> {
    let sql = format!(
        "SELECT EXISTS(SELECT 1 FROM sync_actions p
                       WHERE p.entity_id = ?1 AND {order} AND {OPEN_ON_ENTITY})"
    );
    let exists: i64 = conn.query_row(&sql, params![action.entity_id, action.sequence], |row| {
        row.get(0)
    })?;
    Ok(exists != 0)
}

fn action_from_row(row: &Row<'_>) -> rusqlite::Result<SyncAction> {
    let failure = match row.get::<_, Option<String>>(13)? {
        Some(_) => Some(parse_col::<FailureKind>(row, 13)?),
        None => None,
    };
    Ok(SyncAction {
        id: row.get(0)?,
        sequence: row.get(1)?,
        owner_id: row.get(2)?,
        entity_type: parse_col(row, 3)?,
        entity_id: row.get(4)?,
        action_type: parse_col(row, 5)?,
        command: json_col(row, 6)?,
        priority: row.get(7)?,
        status: parse_col(row, 8)?,
        attempt_count: row.get(9)?,
        created_at: ts_col(row, 10)?,
        last_attempt_at: opt_ts_col(row, 11)?,
        last_error: row.get(12)?,
        failure,
        next_attempt_at: opt_ts_col(row, 14)?,
    })
}
