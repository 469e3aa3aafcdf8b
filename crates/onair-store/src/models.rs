//! Database row types. These map directly to SQLite rows and are kept apart
//! from the onair-types models so the storage layer stays independent.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use onair_types::{Broadcast, BroadcastId, BroadcastStatus, RoomId, Viewer, ViewerSet};

pub struct BroadcastRow {
    pub id: String,
    pub host_id: String,
    pub host_name: String,
    pub host_avatar_ref: Option<String>,
    pub title: String,
    pub room_id: String,
    pub status: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub peak_viewers: i64,
}

pub struct ViewerRow {
    pub user_id: String,
    pub name: String,
    pub avatar_ref: Option<String>,
    pub joined_at: String,
}

impl ViewerRow {
    pub fn into_viewer(self) -> Result<Viewer> {
        Ok(Viewer {
            user_id: parse_uuid(&self.user_id)?,
            name: self.name,
            avatar_ref: self.avatar_ref,
            joined_at: parse_time(&self.joined_at)?,
        })
    }
}

impl BroadcastRow {
    pub fn into_broadcast(self, viewers: Vec<ViewerRow>) -> Result<Broadcast> {
        let status = BroadcastStatus::parse(&self.status)
            .ok_or_else(|| anyhow!("Unknown broadcast status: {}", self.status))?;
        let viewers = viewers
            .into_iter()
            .map(ViewerRow::into_viewer)
            .collect::<Result<ViewerSet>>()?;

        Ok(Broadcast {
            id: BroadcastId(parse_uuid(&self.id)?),
            host_id: parse_uuid(&self.host_id)?,
            host_name: self.host_name,
            host_avatar_ref: self.host_avatar_ref,
            title: self.title,
            room_id: RoomId::from_raw(self.room_id),
            status,
            viewers,
            started_at: parse_time(&self.started_at)?,
            ended_at: self.ended_at.as_deref().map(parse_time).transpose()?,
            peak_viewers: u32::try_from(self.peak_viewers)?,
        })
    }
}

pub fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339()
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    s.parse().map_err(|_| anyhow!("Invalid uuid in database: {}", s))
}
