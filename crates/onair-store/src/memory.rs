use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info};

use onair_types::{Broadcast, BroadcastId, BroadcastStats, BroadcastStatus, NewBroadcast, Snapshot, Viewer};

use crate::subscription::{Subscription, replace_if_changed};
use crate::{PresenceStore, StoreError, StoreResult};

/// In-process document store. Each document lives inside its own watch
/// channel, so a mutation and its fan-out are one atomic step.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    /// broadcast_id -> current document
    documents: RwLock<HashMap<BroadcastId, watch::Sender<Snapshot>>>,

    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shut the store down. Open subscriptions end and further calls fail
    /// with [`StoreError::Closed`].
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.documents.write().await.clear();
        info!("Memory store closed");
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Apply `f` to a live document in place. `f` returns whether it changed
    /// anything; ended documents are never handed to `f`.
    async fn mutate_live<F>(&self, id: BroadcastId, f: F) -> StoreResult<bool>
    where
        F: FnOnce(&mut Broadcast) -> bool,
    {
        self.check_open()?;
        let documents = self.inner.documents.read().await;
        let sender = documents.get(&id).ok_or(StoreError::NotFound(id))?;

        let mut found = true;
        let changed = sender.send_if_modified(|snapshot| match snapshot {
            Snapshot::Found(broadcast) if broadcast.is_live() => f(broadcast),
            Snapshot::Found(_) => false,
            Snapshot::NotFound => {
                found = false;
                false
            }
        });

        if !found {
            return Err(StoreError::NotFound(id));
        }
        Ok(changed)
    }
}

#[async_trait]
impl PresenceStore for MemoryStore {
    async fn create(&self, draft: NewBroadcast) -> StoreResult<Broadcast> {
        self.check_open()?;
        let broadcast = Broadcast::new(BroadcastId::new(), draft, Utc::now());
        let (tx, _) = watch::channel(Snapshot::Found(broadcast.clone()));
        self.inner.documents.write().await.insert(broadcast.id, tx);

        info!(
            "Broadcast {} created by {} ({}) in room {}",
            broadcast.id, broadcast.host_name, broadcast.host_id, broadcast.room_id
        );
        Ok(broadcast)
    }

    async fn get(&self, id: BroadcastId) -> StoreResult<Snapshot> {
        self.check_open()?;
        let documents = self.inner.documents.read().await;
        Ok(documents
            .get(&id)
            .map(|tx| tx.borrow().clone())
            .unwrap_or(Snapshot::NotFound))
    }

    async fn observe(&self, id: BroadcastId) -> StoreResult<Subscription> {
        self.check_open()?;
        let documents = self.inner.documents.read().await;
        Ok(match documents.get(&id) {
            Some(sender) => Subscription::new(id, sender.subscribe()),
            None => Subscription::detached(id, Snapshot::NotFound),
        })
    }

    async fn add_viewer(&self, id: BroadcastId, viewer: Viewer) -> StoreResult<()> {
        let user_id = viewer.user_id;
        let changed = self
            .mutate_live(id, move |broadcast| broadcast.viewers.insert(viewer))
            .await?;
        debug!("add_viewer {} -> {}: changed={}", user_id, id, changed);
        Ok(())
    }

    async fn remove_viewer(&self, id: BroadcastId, viewer: &Viewer) -> StoreResult<()> {
        let user_id = viewer.user_id;
        let changed = self
            .mutate_live(id, |broadcast| broadcast.viewers.remove(&user_id))
            .await?;
        debug!("remove_viewer {} -> {}: changed={}", user_id, id, changed);
        Ok(())
    }

    async fn mark_ended(&self, id: BroadcastId, stats: BroadcastStats) -> StoreResult<()> {
        self.check_open()?;
        let documents = self.inner.documents.read().await;
        let sender = documents.get(&id).ok_or(StoreError::NotFound(id))?;

        let mut found = true;
        let ended = sender.send_if_modified(|snapshot| match snapshot {
            Snapshot::Found(broadcast) if broadcast.is_live() => {
                broadcast.status = BroadcastStatus::Ended;
                broadcast.ended_at = Some(Utc::now());
                broadcast.peak_viewers = stats.peak_viewers;
                true
            }
            Snapshot::Found(_) => false,
            Snapshot::NotFound => {
                found = false;
                false
            }
        });

        if !found {
            return Err(StoreError::NotFound(id));
        }
        if ended {
            info!("Broadcast {} ended (peak {} viewers)", id, stats.peak_viewers);
        } else {
            debug!("Broadcast {} already ended, keeping final state", id);
        }
        Ok(())
    }

    async fn delete(&self, id: BroadcastId) -> StoreResult<()> {
        self.check_open()?;
        // Dropping the sender after the final NotFound ends every open
        // subscription once it has seen it.
        let removed = self.inner.documents.write().await.remove(&id);
        if let Some(sender) = removed {
            replace_if_changed(&sender, Snapshot::NotFound);
            info!("Broadcast {} deleted", id);
        }
        Ok(())
    }
}
