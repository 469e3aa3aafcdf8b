use thiserror::Error;

use onair_store::StoreError;
use onair_types::{BroadcastId, RoomId};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("room {0} not found")]
    RoomNotFound(RoomId),

    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to create broadcast: {0}")]
    Create(#[source] StoreError),

    #[error("presence store error: {0}")]
    Store(#[from] StoreError),

    #[error("media transport failed: {0}")]
    Transport(#[from] TransportError),

    #[error("broadcast {0} not found")]
    BroadcastNotFound(BroadcastId),

    #[error("broadcast {0} has already ended")]
    BroadcastEnded(BroadcastId),
}
