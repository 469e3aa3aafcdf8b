use std::collections::HashMap;
use std::sync::Mutex;

use futures_util::Stream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use onair_types::{BroadcastId, Snapshot};

/// Cancellable, push-based view of one broadcast document.
pub struct Subscription {
    broadcast_id: BroadcastId,
    rx: watch::Receiver<Snapshot>,
    cancel: CancellationToken,
    primed: bool,
}

impl Subscription {
    pub(crate) fn new(broadcast_id: BroadcastId, rx: watch::Receiver<Snapshot>) -> Self {
        Self {
            broadcast_id,
            rx,
            cancel: CancellationToken::new(),
            primed: false,
        }
    }

    /// A subscription with no document behind it: yields `snapshot` once,
    /// then ends.
    pub(crate) fn detached(broadcast_id: BroadcastId, snapshot: Snapshot) -> Self {
        let (_, rx) = watch::channel(snapshot);
        Self::new(broadcast_id, rx)
    }

    pub fn broadcast_id(&self) -> BroadcastId {
        self.broadcast_id
    }

    /// Next snapshot. The first call returns the current value without
    /// waiting. `None` once cancelled or when the store goes away.
    pub async fn next(&mut self) -> Option<Snapshot> {
        if self.cancel.is_cancelled() {
            return None;
        }

        if !self.primed {
            self.primed = true;
            return Some(self.rx.borrow_and_update().clone());
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            changed = self.rx.changed() => match changed {
                Ok(()) => Some(self.rx.borrow_and_update().clone()),
                Err(_) => None,
            },
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token that cancels this subscription from elsewhere, e.g. after the
    /// subscription itself has moved into a task.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn into_stream(self) -> impl Stream<Item = Snapshot> + Send {
        let mut subscription = self;
        async_stream::stream! {
            while let Some(snapshot) = subscription.next().await {
                yield snapshot;
            }
        }
    }
}

/// Fan-out of published snapshots for backends that have no native watch.
#[derive(Default)]
pub(crate) struct SnapshotHub {
    channels: Mutex<HashMap<BroadcastId, watch::Sender<Snapshot>>>,
}

impl SnapshotHub {
    /// Subscribe to `id`, seeding (or refreshing) the channel with `current`.
    pub(crate) fn subscribe(&self, id: BroadcastId, current: Snapshot) -> Subscription {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let sender = channels
            .entry(id)
            .or_insert_with(|| watch::channel(current.clone()).0);
        replace_if_changed(sender, current);
        Subscription::new(id, sender.subscribe())
    }

    /// Push a new value to every live subscription on `id`.
    pub(crate) fn publish(&self, id: BroadcastId, snapshot: Snapshot) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sender) = channels.get(&id) else {
            return;
        };
        if sender.receiver_count() == 0 {
            channels.remove(&id);
            return;
        }
        replace_if_changed(sender, snapshot);
    }

    /// Publish a final value for `id` and forget its channel. Open
    /// subscriptions see the value, then end.
    pub(crate) fn retire(&self, id: BroadcastId, snapshot: Snapshot) {
        let removed = self
            .channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        if let Some(sender) = removed {
            replace_if_changed(&sender, snapshot);
        }
    }

    #[cfg(test)]
    pub(crate) fn channel_count(&self) -> usize {
        self.channels.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drop every channel; open subscriptions end.
    pub(crate) fn close(&self) {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

/// Watchers are only woken when the document actually changed.
pub(crate) fn replace_if_changed(sender: &watch::Sender<Snapshot>, snapshot: Snapshot) -> bool {
    sender.send_if_modified(|value| {
        if *value == snapshot {
            false
        } else {
            *value = snapshot;
            true
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_next_yields_current_value() {
        let hub = SnapshotHub::default();
        let id = BroadcastId::new();
        let mut sub = hub.subscribe(id, Snapshot::NotFound);
        assert_eq!(sub.next().await, Some(Snapshot::NotFound));
    }

    #[tokio::test]
    async fn test_cancel_ends_subscription() {
        let hub = SnapshotHub::default();
        let id = BroadcastId::new();
        let mut sub = hub.subscribe(id, Snapshot::NotFound);
        let _ = sub.next().await;

        let token = sub.cancel_token();
        token.cancel();
        assert!(sub.is_cancelled());
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn test_close_ends_subscription() {
        let hub = SnapshotHub::default();
        let id = BroadcastId::new();
        let mut sub = hub.subscribe(id, Snapshot::NotFound);
        let _ = sub.next().await;

        hub.close();
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn test_detached_yields_once() {
        let mut sub = Subscription::detached(BroadcastId::new(), Snapshot::NotFound);
        assert_eq!(sub.next().await, Some(Snapshot::NotFound));
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn test_retire_delivers_final_value_then_ends() {
        let hub = SnapshotHub::default();
        let id = BroadcastId::new();
        let mut sub = hub.subscribe(id, Snapshot::NotFound);
        let _ = sub.next().await;

        hub.retire(id, Snapshot::NotFound);
        assert_eq!(sub.next().await, None);
        assert!(hub.channels.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_forgets_channel() {
        let hub = SnapshotHub::default();
        let id = BroadcastId::new();
        drop(hub.subscribe(id, Snapshot::NotFound));

        hub.publish(id, Snapshot::NotFound);
        assert!(hub.channels.lock().unwrap().is_empty());
    }
}
