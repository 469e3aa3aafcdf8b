//! Presence store client contract and two document-store backends.
//!
//! Every consumer talks to a [`PresenceStore`]. Viewer-set mutations are
//! atomic at the store: backends apply a single-element union or difference
//! keyed by `user_id`, never a client-side read-modify-write of the whole set.

pub mod database;
pub mod memory;
pub mod migrations;
pub mod models;
pub mod queries;
pub mod sqlite;
pub mod subscription;

use async_trait::async_trait;
use thiserror::Error;

use onair_types::{Broadcast, BroadcastId, BroadcastStats, NewBroadcast, Snapshot, Viewer};

pub use database::Database;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use subscription::Subscription;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("broadcast {0} not found")]
    NotFound(BroadcastId),

    #[error("store backend error: {0}")]
    Backend(#[from] anyhow::Error),

    #[error("store is closed")]
    Closed,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Real-time document store holding one record per broadcast.
#[async_trait]
pub trait PresenceStore: Send + Sync + 'static {
    /// Create a new `live` record with an empty viewer set.
    async fn create(&self, draft: NewBroadcast) -> StoreResult<Broadcast>;

    /// One-shot read of the current value.
    async fn get(&self, id: BroadcastId) -> StoreResult<Snapshot>;

    /// Watch a record. The subscription yields the current value first and
    /// again after every mutation until cancelled.
    async fn observe(&self, id: BroadcastId) -> StoreResult<Subscription>;

    /// Atomic set-union of one viewer into `viewers`.
    async fn add_viewer(&self, id: BroadcastId, viewer: Viewer) -> StoreResult<()>;

    /// Atomic set-difference of one viewer, matched by `user_id`.
    async fn remove_viewer(&self, id: BroadcastId, viewer: &Viewer) -> StoreResult<()>;

    /// Write `{status: ended, ended_at: now, peak_viewers}` onto a live record.
    /// An already-ended record keeps its final state and the call succeeds.
    async fn mark_ended(&self, id: BroadcastId, stats: BroadcastStats) -> StoreResult<()>;

    /// Administrative removal. Watchers see `Snapshot::NotFound`.
    async fn delete(&self, id: BroadcastId) -> StoreResult<()>;
}
