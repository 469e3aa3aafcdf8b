//! Per-viewer presence agent.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use onair_store::PresenceStore;
use onair_types::{Broadcast, BroadcastId, Identity, RoomId, TransportEvent, TransportRole, Viewer};

use crate::error::SessionError;
use crate::latch::{Latch, PresenceLatch};
use crate::transport::{JoinRequest, MediaTransport, TransportHandle};
use crate::watcher::{GoneReason, LeaveAction};

/// Why a viewer stopped watching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    /// The user navigated away.
    Navigation,
    Unload,
    /// The media SDK reported the room is gone.
    RoomEnded,
    /// The watcher saw the broadcast end, vanish, or become unreachable.
    Broadcast(GoneReason),
    /// The agent was dropped without leaving.
    Dropped,
}

/// Registers one viewer's presence while they watch a broadcast.
///
/// Join and leave are guarded by a presence latch: a repeated `Joined`
/// (transport reconnect) issues no second `add_viewer`, and a repeated leave
/// issues no second `remove_viewer`.
pub struct ViewerPresence {
    inner: Arc<ViewerInner>,
}

struct ViewerInner {
    broadcast_id: BroadcastId,
    room_id: RoomId,
    identity: Identity,
    store: Arc<dyn PresenceStore>,

    presence: PresenceLatch,
    /// Serializes presence writes so this client's own add/remove reach the
    /// store in the order their latch flips happened.
    presence_ops: tokio::sync::Mutex<Option<Viewer>>,

    left: Latch,
    leave_reason: watch::Sender<Option<LeaveReason>>,
    shutdown: CancellationToken,
    transport: Mutex<Option<Box<dyn TransportHandle>>>,
}

impl ViewerPresence {
    /// Join the room as a subscriber. Presence is registered once the
    /// transport confirms the join. Transport failure is fatal.
    pub async fn start(
        store: Arc<dyn PresenceStore>,
        transport: &dyn MediaTransport,
        broadcast: &Broadcast,
        identity: Identity,
        unload: CancellationToken,
    ) -> Result<Self, SessionError> {
        let session = transport
            .join(JoinRequest {
                room_id: broadcast.room_id.clone(),
                user_id: identity.user_id,
                name: identity.name.clone(),
                role: TransportRole::Viewer,
            })
            .await
            .map_err(|e| {
                error!(
                    "{} ({}) could not join broadcast {}: {}",
                    identity.name, identity.user_id, broadcast.id, e
                );
                SessionError::Transport(e)
            })?;

        let (leave_reason, _) = watch::channel(None);
        let inner = Arc::new(ViewerInner {
            broadcast_id: broadcast.id,
            room_id: broadcast.room_id.clone(),
            identity,
            store,
            presence: PresenceLatch::new(),
            presence_ops: tokio::sync::Mutex::new(None),
            left: Latch::new(),
            leave_reason,
            shutdown: CancellationToken::new(),
            transport: Mutex::new(Some(session.handle)),
        });

        tokio::spawn(run_viewer_loop(inner.clone(), session.events, unload));

        Ok(Self { inner })
    }

    pub fn broadcast_id(&self) -> BroadcastId {
        self.inner.broadcast_id
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn is_registered(&self) -> bool {
        self.inner.presence.is_registered()
    }

    pub fn has_left(&self) -> bool {
        self.inner.left.is_tripped()
    }

    pub fn leave_reason(&self) -> Option<LeaveReason> {
        *self.inner.leave_reason.borrow()
    }

    /// Cancelled as soon as this agent leaves, for whatever reason.
    pub(crate) fn left_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Explicit navigation away. Returns true if this call did the leaving.
    pub async fn leave(&self) -> bool {
        self.inner.leave(LeaveReason::Navigation).await
    }

    pub async fn wait_left(&self) -> LeaveReason {
        let mut rx = self.inner.leave_reason.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return LeaveReason::Dropped;
            }
        }
    }
}

#[async_trait]
impl LeaveAction for ViewerPresence {
    async fn on_gone(&self, reason: GoneReason) {
        self.inner.leave(LeaveReason::Broadcast(reason)).await;
    }
}

impl Drop for ViewerPresence {
    fn drop(&mut self) {
        if self.inner.left.is_tripped() {
            return;
        }

        self.inner.release();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let inner = self.inner.clone();
                runtime.spawn(async move {
                    inner.leave(LeaveReason::Dropped).await;
                });
            }
            Err(_) => warn!(
                "{} ({}) dropped outside a runtime; presence on {} not removed",
                self.inner.identity.name, self.inner.identity.user_id, self.inner.broadcast_id
            ),
        }
    }
}

impl ViewerInner {
    async fn register(&self) {
        let mut registered = self.presence_ops.lock().await;
        if self.left.is_tripped() {
            return;
        }
        if !self.presence.try_register() {
            debug!(
                "{} already present on {}, skipping add",
                self.identity.user_id, self.broadcast_id
            );
            return;
        }

        let viewer = self.identity.to_viewer(Utc::now());
        *registered = Some(viewer.clone());
        info!(
            "{} ({}) watching broadcast {}",
            self.identity.name, self.identity.user_id, self.broadcast_id
        );
        if let Err(e) = self.store.add_viewer(self.broadcast_id, viewer).await {
            warn!(
                "Failed to register {} on broadcast {}: {}",
                self.identity.user_id, self.broadcast_id, e
            );
        }
    }

    async fn unregister(&self) {
        let mut registered = self.presence_ops.lock().await;
        if !self.presence.try_unregister() {
            debug!(
                "{} not present on {}, skipping remove",
                self.identity.user_id, self.broadcast_id
            );
            return;
        }

        let viewer = registered
            .take()
            .unwrap_or_else(|| self.identity.to_viewer(Utc::now()));
        if let Err(e) = self.store.remove_viewer(self.broadcast_id, &viewer).await {
            warn!(
                "Failed to remove {} from broadcast {}: {}",
                self.identity.user_id, self.broadcast_id, e
            );
        }
    }

    /// The store write runs on its own task, so a caller that stops
    /// waiting cannot strand a registered presence.
    async fn leave(self: &Arc<Self>, reason: LeaveReason) -> bool {
        if !self.left.trip() {
            return false;
        }

        info!(
            "{} ({}) leaving broadcast {} ({:?})",
            self.identity.name, self.identity.user_id, self.broadcast_id, reason
        );
        self.release();

        let inner = self.clone();
        let unregistered = tokio::spawn(async move {
            inner.unregister().await;
            inner.leave_reason.send_replace(Some(reason));
        });
        if let Err(e) = unregistered.await {
            error!(
                "Leaving broadcast {} for {} aborted: {}",
                self.broadcast_id, self.identity.user_id, e
            );
        }
        true
    }

    fn release(&self) {
        self.shutdown.cancel();
        let handle = self
            .transport
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.dispose();
        }
    }
}

async fn run_viewer_loop(
    inner: Arc<ViewerInner>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    unload: CancellationToken,
) {
    let shutdown = inner.shutdown.clone();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            _ = unload.cancelled() => {
                inner.leave(LeaveReason::Unload).await;
                break;
            }

            event = events.recv() => match event {
                Some(TransportEvent::Joined) => inner.register().await,
                Some(TransportEvent::Left) => {
                    debug!("{} dropped from room {}", inner.identity.user_id, inner.room_id);
                    inner.unregister().await;
                }
                Some(TransportEvent::RoomEnded) | None => {
                    inner.leave(LeaveReason::RoomEnded).await;
                    break;
                }
            },
        }
    }
}
