use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};

use onair_types::{Broadcast, BroadcastId, BroadcastStats, BroadcastStatus, Viewer};

use crate::models::{BroadcastRow, ViewerRow, format_time};

// -- Broadcasts --

pub fn insert_broadcast(conn: &Connection, broadcast: &Broadcast) -> Result<()> {
    conn.execute(
        "INSERT INTO broadcasts (id, host_id, host_name, host_avatar_ref, title, room_id, status, started_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            broadcast.id.to_string(),
            broadcast.host_id.to_string(),
            &broadcast.host_name,
            &broadcast.host_avatar_ref,
            &broadcast.title,
            broadcast.room_id.as_str(),
            broadcast.status.as_str(),
            format_time(broadcast.started_at),
        ],
    )?;
    Ok(())
}

pub fn load_broadcast(conn: &Connection, id: BroadcastId) -> Result<Option<Broadcast>> {
    let row = conn
        .query_row(
            "SELECT id, host_id, host_name, host_avatar_ref, title, room_id, status, started_at, ended_at, peak_viewers
             FROM broadcasts WHERE id = ?1",
            [id.to_string()],
            |row| {
                Ok(BroadcastRow {
                    id: row.get(0)?,
                    host_id: row.get(1)?,
                    host_name: row.get(2)?,
                    host_avatar_ref: row.get(3)?,
                    title: row.get(4)?,
                    room_id: row.get(5)?,
                    status: row.get(6)?,
                    started_at: row.get(7)?,
                    ended_at: row.get(8)?,
                    peak_viewers: row.get(9)?,
                })
            },
        )
        .optional()?;

    let Some(row) = row else {
        return Ok(None);
    };

    let viewers = query_viewers(conn, id)?;
    Ok(Some(row.into_broadcast(viewers)?))
}

pub fn broadcast_status(conn: &Connection, id: BroadcastId) -> Result<Option<BroadcastStatus>> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM broadcasts WHERE id = ?1",
            [id.to_string()],
            |row| row.get(0),
        )
        .optional()?;

    Ok(status.as_deref().and_then(BroadcastStatus::parse))
}

/// Live -> ended transition. Returns false if the broadcast is missing or
/// already ended; an ended row is never rewritten.
pub fn mark_ended(
    conn: &Connection,
    id: BroadcastId,
    stats: BroadcastStats,
    ended_at: DateTime<Utc>,
) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE broadcasts SET status = 'ended', ended_at = ?2, peak_viewers = ?3
         WHERE id = ?1 AND status = 'live'",
        rusqlite::params![id.to_string(), format_time(ended_at), stats.peak_viewers],
    )?;
    Ok(updated > 0)
}

/// Returns false if no such broadcast existed.
pub fn delete_broadcast(conn: &Connection, id: BroadcastId) -> Result<bool> {
    let deleted = conn.execute("DELETE FROM broadcasts WHERE id = ?1", [id.to_string()])?;
    Ok(deleted > 0)
}

// -- Viewers --

/// Single-row set-union. Returns true if a row was inserted.
pub fn insert_viewer(conn: &Connection, id: BroadcastId, viewer: &Viewer) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO broadcast_viewers (broadcast_id, user_id, name, avatar_ref, joined_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            id.to_string(),
            viewer.user_id.to_string(),
            &viewer.name,
            &viewer.avatar_ref,
            format_time(viewer.joined_at),
        ],
    )?;
    Ok(inserted > 0)
}

/// Single-row set-difference by user_id. Returns true if a row was removed.
pub fn delete_viewer(conn: &Connection, id: BroadcastId, viewer: &Viewer) -> Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM broadcast_viewers WHERE broadcast_id = ?1 AND user_id = ?2",
        rusqlite::params![id.to_string(), viewer.user_id.to_string()],
    )?;
    Ok(deleted > 0)
}

fn query_viewers(conn: &Connection, id: BroadcastId) -> Result<Vec<ViewerRow>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, name, avatar_ref, joined_at FROM broadcast_viewers
         WHERE broadcast_id = ?1 ORDER BY joined_at",
    )?;

    let rows = stmt
        .query_map([id.to_string()], |row| {
            Ok(ViewerRow {
                user_id: row.get(0)?,
                name: row.get(1)?,
                avatar_ref: row.get(2)?,
                joined_at: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}
