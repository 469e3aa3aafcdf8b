use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use onair_store::PresenceStore;
use onair_types::{BroadcastId, Identity, Snapshot};

use crate::error::SessionError;
use crate::transport::MediaTransport;
use crate::viewer::ViewerPresence;
use crate::watcher::BroadcastWatcher;

/// A viewer watching one broadcast: presence agent plus watcher, wired so
/// that the broadcast ending or vanishing makes the agent leave.
pub struct ViewerSession {
    presence: Arc<ViewerPresence>,
    watcher: BroadcastWatcher,
}

impl ViewerSession {
    pub async fn join(
        store: Arc<dyn PresenceStore>,
        transport: &dyn MediaTransport,
        broadcast_id: BroadcastId,
        identity: Identity,
        unload: CancellationToken,
    ) -> Result<Self, SessionError> {
        let broadcast = match store.get(broadcast_id).await? {
            Snapshot::Found(b) if b.is_live() => b,
            Snapshot::Found(_) => return Err(SessionError::BroadcastEnded(broadcast_id)),
            Snapshot::NotFound => return Err(SessionError::BroadcastNotFound(broadcast_id)),
        };

        let presence = Arc::new(
            ViewerPresence::start(store.clone(), transport, &broadcast, identity, unload).await?,
        );
        // The watcher only lives as long as the presence it serves.
        let stop = presence.left_token().child_token();
        let watcher = BroadcastWatcher::start_until(store, broadcast_id, presence.clone(), stop).await;

        Ok(Self { presence, watcher })
    }

    pub fn presence(&self) -> &ViewerPresence {
        &self.presence
    }

    pub fn watcher(&self) -> &BroadcastWatcher {
        &self.watcher
    }

    /// Navigate away.
    pub async fn leave(&self) -> bool {
        self.watcher.stop();
        self.presence.leave().await
    }
}
