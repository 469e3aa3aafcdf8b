use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{BroadcastId, Viewer};

// -- Broadcasts --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateBroadcastRequest {
    pub host_id: Uuid,
    pub host_name: String,
    pub host_avatar_ref: Option<String>,
    pub title: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndBroadcastRequest {
    pub peak_viewers: u32,
}

// -- Viewers --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddViewerRequest {
    pub name: String,
    pub avatar_ref: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RosterResponse {
    pub broadcast_id: BroadcastId,
    pub count: usize,
    pub viewers: Vec<Viewer>,
}
