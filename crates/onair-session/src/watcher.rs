//! Viewer-facing broadcast watcher.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use onair_store::{PresenceStore, Subscription};
use onair_types::{Broadcast, BroadcastId, Snapshot, Viewer};

use crate::latch::Latch;

/// Why a watched broadcast is no longer watchable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoneReason {
    /// The host ended it.
    Ended,
    /// The record no longer exists.
    Deleted,
    /// The store could not be read.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchState {
    Connecting,
    Live(Broadcast),
    Gone {
        reason: GoneReason,
        last: Option<Broadcast>,
    },
}

impl WatchState {
    pub fn broadcast(&self) -> Option<&Broadcast> {
        match self {
            Self::Connecting => None,
            Self::Live(b) => Some(b),
            Self::Gone { last, .. } => last.as_ref(),
        }
    }
}

/// The "leave and navigate away" step run when a broadcast goes away.
#[async_trait]
pub trait LeaveAction: Send + Sync + 'static {
    async fn on_gone(&self, reason: GoneReason);
}

/// Follows one broadcast document for rendering and fires its
/// [`LeaveAction`] at most once when the broadcast ends or disappears.
pub struct BroadcastWatcher {
    inner: Arc<WatcherInner>,
}

struct WatcherInner {
    broadcast_id: BroadcastId,
    state: watch::Sender<WatchState>,
    fired: Latch,
    stop: CancellationToken,
    action: Arc<dyn LeaveAction>,
}

impl BroadcastWatcher {
    /// Start watching. Never fails: a store that cannot be observed is
    /// reported as [`GoneReason::Unavailable`] through the leave action.
    pub async fn start(
        store: Arc<dyn PresenceStore>,
        broadcast_id: BroadcastId,
        action: Arc<dyn LeaveAction>,
    ) -> Self {
        Self::start_until(store, broadcast_id, action, CancellationToken::new()).await
    }

    /// Like [`start`](Self::start), but also stops following the document
    /// once `stop` is cancelled.
    pub async fn start_until(
        store: Arc<dyn PresenceStore>,
        broadcast_id: BroadcastId,
        action: Arc<dyn LeaveAction>,
        stop: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(WatchState::Connecting);
        let inner = Arc::new(WatcherInner {
            broadcast_id,
            state,
            fired: Latch::new(),
            stop: stop.clone(),
            action,
        });

        match store.observe(broadcast_id).await {
            Ok(subscription) => {
                tokio::spawn(run_watch_loop(inner.clone(), subscription));
            }
            Err(e) => {
                warn!("Cannot observe broadcast {}: {}", broadcast_id, e);
                inner.gone(GoneReason::Unavailable, None).await;
                inner.stop.cancel();
            }
        }

        Self { inner }
    }

    pub fn broadcast_id(&self) -> BroadcastId {
        self.inner.broadcast_id
    }

    pub fn state(&self) -> WatchState {
        self.inner.state.borrow().clone()
    }

    /// Receiver for UI re-rendering; changes on every new snapshot.
    pub fn subscribe(&self) -> watch::Receiver<WatchState> {
        self.inner.state.subscribe()
    }

    /// Roster projection of the latest snapshot.
    pub fn roster(&self) -> Vec<Viewer> {
        self.inner
            .state
            .borrow()
            .broadcast()
            .map(|b| b.viewers.to_vec())
            .unwrap_or_default()
    }

    pub fn viewer_count(&self) -> usize {
        self.inner
            .state
            .borrow()
            .broadcast()
            .map_or(0, Broadcast::viewer_count)
    }

    /// True once the watcher no longer follows the document, whether it
    /// fired, was stopped, or was unmounted.
    pub fn is_stopped(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    pub fn is_gone(&self) -> bool {
        self.inner.fired.is_tripped()
    }

    pub async fn wait_gone(&self) -> GoneReason {
        let mut rx = self.inner.state.subscribe();
        loop {
            if let WatchState::Gone { reason, .. } = &*rx.borrow_and_update() {
                return *reason;
            }
            if rx.changed().await.is_err() {
                return GoneReason::Unavailable;
            }
        }
    }

    /// Unmount: stop following the document without firing the leave action.
    pub fn stop(&self) {
        self.inner.stop.cancel();
    }
}

impl Drop for BroadcastWatcher {
    fn drop(&mut self) {
        self.inner.stop.cancel();
    }
}

impl WatcherInner {
    async fn gone(&self, reason: GoneReason, last: Option<Broadcast>) {
        if !self.fired.trip() {
            return;
        }

        info!("Broadcast {} gone for viewer ({:?})", self.broadcast_id, reason);
        self.state.send_replace(WatchState::Gone { reason, last });
        self.action.on_gone(reason).await;
    }
}

async fn run_watch_loop(inner: Arc<WatcherInner>, mut subscription: Subscription) {
    let mut last: Option<Broadcast> = None;

    loop {
        let snapshot = tokio::select! {
            biased;
            _ = inner.stop.cancelled() => break,
            snapshot = subscription.next() => snapshot,
        };

        match snapshot {
            Some(Snapshot::Found(broadcast)) if broadcast.is_live() => {
                debug!(
                    "Broadcast {} snapshot: {} viewers",
                    broadcast.id,
                    broadcast.viewer_count()
                );
                last = Some(broadcast.clone());
                inner.state.send_replace(WatchState::Live(broadcast));
            }
            Some(Snapshot::Found(broadcast)) => {
                inner.gone(GoneReason::Ended, Some(broadcast)).await;
                break;
            }
            Some(Snapshot::NotFound) => {
                inner.gone(GoneReason::Deleted, last.take()).await;
                break;
            }
            None => {
                inner.gone(GoneReason::Unavailable, last.take()).await;
                break;
            }
        }
    }

    subscription.cancel();
    inner.stop.cancel();
}
