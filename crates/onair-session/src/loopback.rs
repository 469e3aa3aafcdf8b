use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use onair_types::{RoomId, TransportEvent, TransportRole};

use crate::error::TransportError;
use crate::transport::{JoinRequest, MediaTransport, TransportHandle, TransportSession};

/// In-process media transport. Rooms are just membership maps; nothing is
/// encoded or sent. Used by tests and the demo, and to script the SDK
/// callbacks a real transport would raise (reconnects, drops, room end).
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    inner: Arc<LoopbackInner>,
}

#[derive(Default)]
struct LoopbackInner {
    /// room_id -> room
    rooms: Mutex<HashMap<RoomId, Room>>,

    /// user_id -> number of dispose() calls
    disposals: Mutex<HashMap<Uuid, usize>>,

    fail_joins: AtomicBool,
}

struct Room {
    host_id: Uuid,
    /// user_id -> event channel
    members: HashMap<Uuid, mpsc::UnboundedSender<TransportEvent>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent join fail, as if the SDK could not initialize.
    pub fn set_fail_joins(&self, fail: bool) {
        self.inner.fail_joins.store(fail, Ordering::Release);
    }

    /// Re-send `Joined` to a member, as a reconnect would.
    pub fn reconnect(&self, room_id: &RoomId, user_id: Uuid) -> bool {
        self.send_to(room_id, user_id, TransportEvent::Joined)
    }

    /// Report a network drop to a member. The membership itself stays.
    pub fn drop_member(&self, room_id: &RoomId, user_id: Uuid) -> bool {
        self.send_to(room_id, user_id, TransportEvent::Left)
    }

    /// End the room from the SDK side: every member, host included, gets
    /// `RoomEnded` and the room is forgotten.
    pub fn end_room(&self, room_id: &RoomId) {
        let room = lock(&self.inner.rooms).remove(room_id);
        if let Some(room) = room {
            info!("Loopback room {} ended by transport ({} members)", room_id, room.members.len());
            for tx in room.members.values() {
                let _ = tx.send(TransportEvent::RoomEnded);
            }
        }
    }

    pub fn members(&self, room_id: &RoomId) -> Vec<Uuid> {
        lock(&self.inner.rooms)
            .get(room_id)
            .map(|room| room.members.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_open(&self, room_id: &RoomId) -> bool {
        lock(&self.inner.rooms).contains_key(room_id)
    }

    pub fn disposals(&self, user_id: Uuid) -> usize {
        lock(&self.inner.disposals).get(&user_id).copied().unwrap_or(0)
    }

    fn send_to(&self, room_id: &RoomId, user_id: Uuid, event: TransportEvent) -> bool {
        let rooms = lock(&self.inner.rooms);
        rooms
            .get(room_id)
            .and_then(|room| room.members.get(&user_id))
            .is_some_and(|tx| tx.send(event).is_ok())
    }
}

#[async_trait]
impl MediaTransport for LoopbackTransport {
    async fn join(&self, request: JoinRequest) -> Result<TransportSession, TransportError> {
        if self.inner.fail_joins.load(Ordering::Acquire) {
            return Err(TransportError::Unavailable("loopback joins disabled".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut rooms = lock(&self.inner.rooms);
            match request.role {
                TransportRole::Host => {
                    let room = rooms.entry(request.room_id.clone()).or_insert_with(|| Room {
                        host_id: request.user_id,
                        members: HashMap::new(),
                    });
                    room.host_id = request.user_id;
                    room.members.insert(request.user_id, tx.clone());
                }
                TransportRole::Viewer => {
                    let room = rooms
                        .get_mut(&request.room_id)
                        .ok_or_else(|| TransportError::RoomNotFound(request.room_id.clone()))?;
                    room.members.insert(request.user_id, tx.clone());
                }
            }
        }

        info!(
            "{} ({}) joined loopback room {} as {:?}",
            request.name, request.user_id, request.room_id, request.role
        );
        let _ = tx.send(TransportEvent::Joined);

        Ok(TransportSession {
            handle: Box::new(LoopbackHandle {
                transport: self.inner.clone(),
                room_id: request.room_id,
                user_id: request.user_id,
                role: request.role,
            }),
            events: rx,
        })
    }
}

struct LoopbackHandle {
    transport: Arc<LoopbackInner>,
    room_id: RoomId,
    user_id: Uuid,
    role: TransportRole,
}

impl TransportHandle for LoopbackHandle {
    fn dispose(&self) {
        *lock(&self.transport.disposals).entry(self.user_id).or_default() += 1;

        let mut rooms = lock(&self.transport.rooms);
        let Some(room) = rooms.get_mut(&self.room_id) else {
            return;
        };
        room.members.remove(&self.user_id);

        // The publisher leaving ends the room for everyone else.
        if self.role == TransportRole::Host && room.host_id == self.user_id {
            if let Some(room) = rooms.remove(&self.room_id) {
                for tx in room.members.values() {
                    let _ = tx.send(TransportEvent::RoomEnded);
                }
            }
            debug!("Loopback room {} closed by host {}", self.room_id, self.user_id);
        }
    }
}
