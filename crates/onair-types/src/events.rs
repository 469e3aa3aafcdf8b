use serde::{Deserialize, Serialize};

use crate::models::{Broadcast, Snapshot};

/// Role a client takes when joining a media room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportRole {
    /// Publisher: owns the room, its leave ends the room.
    Host,
    /// Subscriber.
    Viewer,
}

/// Callbacks raised by the media transport for one joined session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    /// The transport confirmed the join. Fires again after a reconnect.
    Joined,
    /// The transport dropped this client from the room.
    Left,
    /// The room itself is gone.
    RoomEnded,
}

/// Frames pushed over the `/broadcasts/{id}/watch` WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WatchEvent {
    /// Full current value of the broadcast record
    Snapshot(Broadcast),

    /// The record does not exist (never did, or was removed)
    NotFound,
}

impl From<Snapshot> for WatchEvent {
    fn from(snapshot: Snapshot) -> Self {
        match snapshot {
            Snapshot::Found(broadcast) => Self::Snapshot(broadcast),
            Snapshot::NotFound => Self::NotFound,
        }
    }
}
