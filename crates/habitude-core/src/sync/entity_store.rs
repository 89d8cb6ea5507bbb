//! Cached domain records with sync bookkeeping.
//!
//! Domain fields are opaque JSON here; only the sync columns are
//! interpreted. Local mutation entry points write PENDING records, the
//! orchestrator and the conflict resolver write every other status.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{Result, ValidationError};
use crate::session::SessionContext;
use crate::storage::database::{encode_ts, json_col, opt_ts_col, parse_col, ts_col};
use crate::storage::Database;
use crate::sync::remote::ServerEntity;
use crate::sync::sync_queue;
use crate::sync::types::{EntitySyncStatus, EntityType};

const RECORD_COLUMNS: &str = "id, owner_id, entity_type, fields, sync_status, local_updated_at, \
     server_updated_at, last_synced_at";

/// Local copy of a task, habit or user profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: String,
    pub owner_id: String,
    pub entity_type: EntityType,
    pub fields: serde_json::Value,
    pub sync_status: EntitySyncStatus,
    pub local_updated_at: DateTime<Utc>,
    pub server_updated_at: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Read access to cached records, plus status updates for the orchestrator.
#[derive(Clone)]
pub struct EntityStore {
    db: Arc<Database>,
}

impl EntityStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn get(&self, id: &str) -> Result<Option<EntityRecord>> {
        self.db.with_conn(|conn| get_in(conn, id))
    }

    /// Records of this owner, optionally of one type, by id.
    pub fn list(
        &self,
        ctx: &SessionContext,
        entity_type: Option<EntityType>,
    ) -> Result<Vec<EntityRecord>> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {RECORD_COLUMNS} FROM entity_records
                 WHERE owner_id = ?1 AND (?2 IS NULL OR entity_type = ?2)
                 ORDER BY id"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![ctx.owner_id, entity_type.map(|t| t.as_str())],
                record_from_row,
            )?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Set the sync status of a record. Returns `false` if it does not exist.
    pub fn set_status(&self, id: &str, status: EntitySyncStatus) -> Result<bool> {
        self.db.with_conn(|conn| set_status_in(conn, id, status))
    }
}

pub(crate) fn get_in(conn: &Connection, id: &str) -> Result<Option<EntityRecord>> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM entity_records WHERE id = ?1");
    Ok(conn
        .query_row(&sql, params![id], record_from_row)
        .optional()?)
}

/// Write a local edit: merge `patch` into the record's fields and mark it
/// PENDING, creating the record if needed.
///
/// A record with an unresolved conflict stays CONFLICT, so the new edit
/// waits behind the conflicted one until the user resolves it.
pub(crate) fn write_local_in(
    conn: &Connection,
    ctx: &SessionContext,
    entity_type: EntityType,
    id: &str,
    patch: &serde_json::Value,
    at: DateTime<Utc>,
) -> Result<EntityRecord> {
    let existing = get_in(conn, id)?;
    if let Some(record) = &existing {
        if record.owner_id != ctx.owner_id {
            return Err(ValidationError::ForeignOwner {
                entity_id: id.to_string(),
                owner_id: ctx.owner_id.clone(),
            }
            .into());
        }
        if record.entity_type != entity_type {
            return Err(ValidationError::InvalidValue {
                field: "entity_type".into(),
                message: format!("{id} is a {}, not a {entity_type}", record.entity_type),
            }
            .into());
        }
    }

    let mut fields = existing
        .as_ref()
        .map(|r| r.fields.clone())
        .unwrap_or_else(|| serde_json::json!({}));
    merge_fields(&mut fields, patch);

    let sync_status = if sync_queue::has_conflicted_in(conn, id)? {
        EntitySyncStatus::Conflict
    } else {
        EntitySyncStatus::Pending
    };
    let record = EntityRecord {
        id: id.to_string(),
        owner_id: ctx.owner_id.clone(),
        entity_type,
        fields,
        sync_status,
        local_updated_at: at,
        server_updated_at: existing.as_ref().and_then(|r| r.server_updated_at),
        last_synced_at: existing.as_ref().and_then(|r| r.last_synced_at),
    };
    upsert_in(conn, &record)?;
    Ok(record)
}

/// Shallow-merge the keys of `patch` into `fields`.
fn merge_fields(fields: &mut serde_json::Value, patch: &serde_json::Value) {
    match (fields.as_object_mut(), patch.as_object()) {
        (Some(target), Some(source)) => {
            for (key, value) in source {
                target.insert(key.clone(), value.clone());
            }
        }
        _ => *fields = patch.clone(),
    }
}

pub(crate) fn set_status_in(conn: &Connection, id: &str, status: EntitySyncStatus) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE entity_records SET sync_status = ?2 WHERE id = ?1",
        params![id, status.as_str()],
    )?;
    Ok(changed == 1)
}

/// Full-record replace with the server copy, status SYNCED.
pub(crate) fn replace_with_server_in(
    conn: &Connection,
    owner_id: &str,
    server: &ServerEntity,
    synced_at: DateTime<Utc>,
) -> Result<EntityRecord> {
    let local_updated_at = get_in(conn, &server.id)?
        .map(|r| r.local_updated_at)
        .unwrap_or(server.server_updated_at);
    let record = EntityRecord {
        id: server.id.clone(),
        owner_id: owner_id.to_string(),
        entity_type: server.entity_type,
        fields: server.fields.clone(),
        sync_status: EntitySyncStatus::Synced,
        local_updated_at,
        server_updated_at: Some(server.server_updated_at),
        last_synced_at: Some(synced_at),
    };
    upsert_in(conn, &record)?;
    Ok(record)
}

/// Record that the server accepted an edit while newer local edits are
/// still queued: timestamps move, fields and PENDING status stay.
pub(crate) fn record_server_ack_in(
    conn: &Connection,
    id: &str,
    server_updated_at: DateTime<Utc>,
    synced_at: DateTime<Utc>,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE entity_records
         SET server_updated_at = ?2, last_synced_at = ?3, sync_status = 'PENDING'
         WHERE id = ?1",
        params![id, encode_ts(server_updated_at), encode_ts(synced_at)],
    )?;
    Ok(changed == 1)
}

/// Remember the server timestamp a conflict was reported against.
pub(crate) fn mark_conflict_in(
    conn: &Connection,
    id: &str,
    server_updated_at: Option<DateTime<Utc>>,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE entity_records
         SET sync_status = 'CONFLICT', server_updated_at = COALESCE(?2, server_updated_at)
         WHERE id = ?1",
        params![id, server_updated_at.map(encode_ts)],
    )?;
    Ok(changed == 1)
}

pub(crate) fn delete_in(conn: &Connection, id: &str) -> Result<bool> {
    Ok(conn.execute("DELETE FROM entity_records WHERE id = ?1", params![id])? == 1)
}

fn upsert_in(conn: &Connection, record: &EntityRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO entity_records (
            id, owner_id, entity_type, fields, sync_status,
            local_updated_at, server_updated_at, last_synced_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
            owner_id = excluded.owner_id,
            entity_type = excluded.entity_type,
            fields = excluded.fields,
            sync_status = excluded.sync_status,
            local_updated_at = excluded.local_updated_at,
            server_updated_at = excluded.server_updated_at,
            last_synced_at = excluded.last_synced_at",
        params![
            record.id,
            record.owner_id,
            record.entity_type.as_str(),
            serde_json::to_string(&record.fields)?,
            record.sync_status.as_str(),
            encode_ts(record.local_updated_at),
            record.server_updated_at.map(encode_ts),
            record.last_synced_at.map(encode_ts),
        ],
    )?;
    Ok(())
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<EntityRecord> {
    Ok(EntityRecord {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        entity_type: parse_col(row, 2)?,
        fields: json_col(row, 3)?,
        sync_status: parse_col(row, 4)?,
        local_updated_at: ts_col(row, 5)?,
        server_updated_at: opt_ts_col(row, 6)?,
        last_synced_at: opt_ts_col(row, 7)?,
    })
}
