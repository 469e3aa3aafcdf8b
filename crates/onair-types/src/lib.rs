pub mod api;
pub mod events;
pub mod models;

pub use events::{TransportEvent, TransportRole, WatchEvent};
pub use models::{
    Broadcast, BroadcastId, BroadcastStats, BroadcastStatus, Identity, NewBroadcast, RoomId,
    Snapshot, Viewer, ViewerSet,
};
