use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use onair_types::{RoomId, TransportEvent, TransportRole};

use crate::error::TransportError;

/// Everything the media SDK needs to put a client in a room.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub room_id: RoomId,
    pub user_id: Uuid,
    pub name: String,
    pub role: TransportRole,
}

/// Releases one joined media session.
pub trait TransportHandle: Send + Sync {
    fn dispose(&self);
}

/// A joined media session: the handle to release it and the stream of
/// callbacks the SDK raises for it.
pub struct TransportSession {
    pub handle: Box<dyn TransportHandle>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// External audio/video transport. Encoding, bandwidth and chat live behind
/// this seam and are not our concern.
#[async_trait]
pub trait MediaTransport: Send + Sync + 'static {
    async fn join(&self, request: JoinRequest) -> Result<TransportSession, TransportError>;
}
