use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Store-assigned broadcast identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BroadcastId(pub Uuid);

impl BroadcastId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BroadcastId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BroadcastId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Last stamp handed out by [`RoomId::generate`], in unix millis.
static LAST_ROOM_STAMP: AtomicI64 = AtomicI64::new(0);

/// Opaque media-transport session identifier shared by host and viewers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Derive a room id from the host's identity plus a strictly increasing
    /// millisecond stamp. Two calls in the same millisecond still differ.
    pub fn generate(host_id: Uuid) -> Self {
        let now = Utc::now().timestamp_millis();
        let (Ok(prev) | Err(prev)) =
            LAST_ROOM_STAMP.fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last + 1))
            });
        let stamp = now.max(prev + 1);
        Self(format!("{}_{}", host_id.simple(), stamp))
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastStatus {
    Live,
    Ended,
}

impl BroadcastStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Ended => "ended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "live" => Some(Self::Live),
            "ended" => Some(Self::Ended),
            _ => None,
        }
    }
}

/// Who someone is, as far as a broadcast is concerned.
/// Used for the host at creation time and for each viewer at join time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: Uuid,
    pub name: String,
    pub avatar_ref: Option<String>,
}

impl Identity {
    pub fn new(user_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            user_id,
            name: name.into(),
            avatar_ref: None,
        }
    }

    pub fn with_avatar(mut self, avatar_ref: impl Into<String>) -> Self {
        self.avatar_ref = Some(avatar_ref.into());
        self
    }

    pub fn to_viewer(&self, joined_at: DateTime<Utc>) -> Viewer {
        Viewer {
            user_id: self.user_id,
            name: self.name.clone(),
            avatar_ref: self.avatar_ref.clone(),
            joined_at,
        }
    }
}

/// One element of a broadcast's viewer set. Identity is `user_id` alone;
/// `name` and `avatar_ref` are descriptive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewer {
    pub user_id: Uuid,
    pub name: String,
    pub avatar_ref: Option<String>,
    pub joined_at: DateTime<Utc>,
}

/// Viewer set keyed by `user_id`. Serialized as a plain list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewerSet(BTreeMap<Uuid, Viewer>);

impl ViewerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set-union of a single element. An existing entry for the same
    /// `user_id` is kept as-is. Returns true if the set changed.
    pub fn insert(&mut self, viewer: Viewer) -> bool {
        match self.0.entry(viewer.user_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(viewer);
                true
            }
        }
    }

    /// Set-difference by `user_id`. Returns true if the set changed.
    pub fn remove(&mut self, user_id: &Uuid) -> bool {
        self.0.remove(user_id).is_some()
    }

    pub fn contains(&self, user_id: &Uuid) -> bool {
        self.0.contains_key(user_id)
    }

    pub fn get(&self, user_id: &Uuid) -> Option<&Viewer> {
        self.0.get(user_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Viewer> {
        self.0.values()
    }

    pub fn to_vec(&self) -> Vec<Viewer> {
        self.0.values().cloned().collect()
    }
}

impl FromIterator<Viewer> for ViewerSet {
    fn from_iter<I: IntoIterator<Item = Viewer>>(iter: I) -> Self {
        let mut set = Self::new();
        for viewer in iter {
            set.insert(viewer);
        }
        set
    }
}

impl Serialize for ViewerSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.values())
    }
}

impl<'de> Deserialize<'de> for ViewerSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let viewers = Vec::<Viewer>::deserialize(deserializer)?;
        Ok(viewers.into_iter().collect())
    }
}

/// Everything the bootstrapper supplies when creating a broadcast record.
#[derive(Debug, Clone)]
pub struct NewBroadcast {
    pub host: Identity,
    pub title: String,
    pub room_id: RoomId,
}

/// Final statistics written by the host when the broadcast ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastStats {
    pub peak_viewers: u32,
}

/// One live session record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Broadcast {
    pub id: BroadcastId,
    pub host_id: Uuid,
    pub host_name: String,
    pub host_avatar_ref: Option<String>,
    pub title: String,
    pub room_id: RoomId,
    pub status: BroadcastStatus,
    pub viewers: ViewerSet,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub peak_viewers: u32,
}

impl Broadcast {
    /// A fresh `live` record with an empty viewer set.
    pub fn new(id: BroadcastId, draft: NewBroadcast, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            host_id: draft.host.user_id,
            host_name: draft.host.name,
            host_avatar_ref: draft.host.avatar_ref,
            title: draft.title,
            room_id: draft.room_id,
            status: BroadcastStatus::Live,
            viewers: ViewerSet::new(),
            started_at,
            ended_at: None,
            peak_viewers: 0,
        }
    }

    pub fn is_live(&self) -> bool {
        self.status == BroadcastStatus::Live
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }
}

/// A point-in-time value of a broadcast document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Snapshot {
    Found(Broadcast),
    NotFound,
}

impl Snapshot {
    pub fn broadcast(&self) -> Option<&Broadcast> {
        match self {
            Self::Found(b) => Some(b),
            Self::NotFound => None,
        }
    }
}
