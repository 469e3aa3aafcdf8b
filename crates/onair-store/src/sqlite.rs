use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::Connection;
use tracing::{debug, info};

use onair_types::{Broadcast, BroadcastId, BroadcastStats, BroadcastStatus, NewBroadcast, Snapshot, Viewer};

use crate::database::Database;
use crate::queries;
use crate::subscription::{SnapshotHub, Subscription};
use crate::{PresenceStore, StoreError, StoreResult};

/// Presence store persisted in SQLite. Watchers are fed from an in-process
/// hub: each write reloads its document and publishes it before the writer
/// lock is released, so snapshots reach watchers in write order.
///
/// Statements run on the blocking pool, never on a runtime worker.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<SqliteInner>,
}

struct SqliteInner {
    db: Database,
    hub: SnapshotHub,
    closed: AtomicBool,
}

impl SqliteStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        Ok(Self::with_database(Database::open(path)?))
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Ok(Self::with_database(Database::open_in_memory()?))
    }

    pub fn with_database(db: Database) -> Self {
        Self {
            inner: Arc::new(SqliteInner {
                db,
                hub: SnapshotHub::default(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.hub.close();
        info!("SQLite store closed");
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Run `f` on the blocking pool. The task finishes even if the caller
    /// stops waiting for it.
    async fn blocking<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&SqliteInner) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.check_open()?;
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("blocking task failed: {}", e)))?
    }
}

impl SqliteInner {
    fn publish(&self, conn: &Connection, id: BroadcastId) -> anyhow::Result<()> {
        let snapshot = match queries::load_broadcast(conn, id)? {
            Some(broadcast) => Snapshot::Found(broadcast),
            None => Snapshot::NotFound,
        };
        self.hub.publish(id, snapshot);
        Ok(())
    }

    /// Run a viewer-set write against a live broadcast. `write` returns
    /// whether a row changed; ended broadcasts are left untouched.
    fn write_viewers<F>(&self, id: BroadcastId, write: F) -> StoreResult<bool>
    where
        F: FnOnce(&Connection) -> anyhow::Result<bool>,
    {
        let outcome = self.db.with_conn(|conn| {
            let Some(status) = queries::broadcast_status(conn, id)? else {
                return Ok(None);
            };
            if status != BroadcastStatus::Live {
                return Ok(Some(false));
            }
            let changed = write(conn)?;
            if changed {
                self.publish(conn, id)?;
            }
            Ok(Some(changed))
        })?;

        outcome.ok_or(StoreError::NotFound(id))
    }
}

#[async_trait]
impl PresenceStore for SqliteStore {
    async fn create(&self, draft: NewBroadcast) -> StoreResult<Broadcast> {
        let broadcast = Broadcast::new(BroadcastId::new(), draft, Utc::now());
        let row = broadcast.clone();
        self.blocking(move |inner| {
            inner.db.with_conn(|conn| queries::insert_broadcast(conn, &row))?;
            Ok(())
        })
        .await?;

        info!(
            "Broadcast {} created by {} ({}) in room {}",
            broadcast.id, broadcast.host_name, broadcast.host_id, broadcast.room_id
        );
        Ok(broadcast)
    }

    async fn get(&self, id: BroadcastId) -> StoreResult<Snapshot> {
        let broadcast = self
            .blocking(move |inner| Ok(inner.db.with_conn(|conn| queries::load_broadcast(conn, id))?))
            .await?;
        Ok(broadcast.map_or(Snapshot::NotFound, Snapshot::Found))
    }

    async fn observe(&self, id: BroadcastId) -> StoreResult<Subscription> {
        // Load and register under the writer lock so no write slips between.
        self.blocking(move |inner| {
            let subscription = inner.db.with_conn(|conn| {
                Ok(match queries::load_broadcast(conn, id)? {
                    Some(broadcast) => inner.hub.subscribe(id, Snapshot::Found(broadcast)),
                    None => Subscription::detached(id, Snapshot::NotFound),
                })
            })?;
            Ok(subscription)
        })
        .await
    }

    async fn add_viewer(&self, id: BroadcastId, viewer: Viewer) -> StoreResult<()> {
        let user_id = viewer.user_id;
        let changed = self
            .blocking(move |inner| {
                inner.write_viewers(id, |conn| queries::insert_viewer(conn, id, &viewer))
            })
            .await?;
        debug!("add_viewer {} -> {}: changed={}", user_id, id, changed);
        Ok(())
    }

    async fn remove_viewer(&self, id: BroadcastId, viewer: &Viewer) -> StoreResult<()> {
        let viewer = viewer.clone();
        let user_id = viewer.user_id;
        let changed = self
            .blocking(move |inner| {
                inner.write_viewers(id, |conn| queries::delete_viewer(conn, id, &viewer))
            })
            .await?;
        debug!("remove_viewer {} -> {}: changed={}", user_id, id, changed);
        Ok(())
    }

    async fn mark_ended(&self, id: BroadcastId, stats: BroadcastStats) -> StoreResult<()> {
        let outcome = self
            .blocking(move |inner| {
                Ok(inner.db.with_conn(|conn| {
                    let Some(status) = queries::broadcast_status(conn, id)? else {
                        return Ok(None);
                    };
                    if status != BroadcastStatus::Live {
                        return Ok(Some(false));
                    }
                    let ended = queries::mark_ended(conn, id, stats, Utc::now())?;
                    if ended {
                        inner.publish(conn, id)?;
                    }
                    Ok(Some(ended))
                })?)
            })
            .await?;

        match outcome {
            None => Err(StoreError::NotFound(id)),
            Some(true) => {
                info!("Broadcast {} ended (peak {} viewers)", id, stats.peak_viewers);
                Ok(())
            }
            Some(false) => {
                debug!("Broadcast {} already ended, keeping final state", id);
                Ok(())
            }
        }
    }

    async fn delete(&self, id: BroadcastId) -> StoreResult<()> {
        let deleted = self
            .blocking(move |inner| {
                Ok(inner.db.with_conn(|conn| {
                    let deleted = queries::delete_broadcast(conn, id)?;
                    inner.hub.retire(id, Snapshot::NotFound);
                    Ok(deleted)
                })?)
            })
            .await?;

        if deleted {
            info!("Broadcast {} deleted", id);
        }
        Ok(())
    }
}
