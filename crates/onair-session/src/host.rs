//! Host-side session lifecycle controller.
//!
//! A [`HostSession`] owns one broadcast while its host is streaming. It keeps
//! the publisher transport alive, tracks peak concurrency from presence
//! snapshots, and writes the terminal state exactly once no matter how many
//! termination triggers race (explicit stop, unload, transport room end,
//! remote removal, or the session simply being dropped).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use onair_store::{PresenceStore, Subscription};
use onair_types::{Broadcast, BroadcastId, BroadcastStats, RoomId, Snapshot, TransportEvent, TransportRole};

use crate::error::SessionError;
use crate::latch::Latch;
use crate::transport::{JoinRequest, MediaTransport, TransportHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPhase {
    Initializing,
    Live,
    Ended,
}

/// What ended the broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndTrigger {
    /// The host pressed stop.
    Stop,
    /// The process/page is going away.
    Unload,
    /// The media SDK reported the room ended or dropped the host.
    TransportEnded,
    /// The record was removed or ended by someone else.
    RemoteGone,
    /// The session handle was dropped without being stopped.
    Dropped,
}

pub struct HostSession {
    inner: Arc<HostInner>,
}

struct HostInner {
    broadcast_id: BroadcastId,
    room_id: RoomId,
    store: Arc<dyn PresenceStore>,

    ended: Latch,
    trigger: OnceLock<EndTrigger>,
    peak: AtomicU32,
    phase: watch::Sender<HostPhase>,

    /// Cancels the presence subscription and with it the event loop.
    shutdown: CancellationToken,

    transport: Mutex<Option<Box<dyn TransportHandle>>>,
}

impl HostSession {
    /// Start publishing `broadcast`: join the transport as host, then start
    /// watching presence. A transport failure is fatal and not retried.
    pub async fn start(
        store: Arc<dyn PresenceStore>,
        transport: &dyn MediaTransport,
        broadcast: &Broadcast,
        unload: CancellationToken,
    ) -> Result<Self, SessionError> {
        let (phase, _) = watch::channel(HostPhase::Initializing);

        let session = transport
            .join(JoinRequest {
                room_id: broadcast.room_id.clone(),
                user_id: broadcast.host_id,
                name: broadcast.host_name.clone(),
                role: TransportRole::Host,
            })
            .await
            .map_err(|e| {
                error!(
                    "Host {} could not start transport for broadcast {}: {}",
                    broadcast.host_id, broadcast.id, e
                );
                SessionError::Transport(e)
            })?;

        let subscription = match store.observe(broadcast.id).await {
            Ok(subscription) => subscription,
            Err(e) => {
                error!("Host could not observe broadcast {}: {}", broadcast.id, e);
                session.handle.dispose();
                return Err(SessionError::Store(e));
            }
        };

        let inner = Arc::new(HostInner {
            broadcast_id: broadcast.id,
            room_id: broadcast.room_id.clone(),
            store,
            ended: Latch::new(),
            trigger: OnceLock::new(),
            peak: AtomicU32::new(0),
            phase,
            shutdown: subscription.cancel_token(),
            transport: Mutex::new(Some(session.handle)),
        });

        inner.phase.send_replace(HostPhase::Live);
        info!(
            "Broadcast {} is live in room {} (host {})",
            broadcast.id, broadcast.room_id, broadcast.host_name
        );

        tokio::spawn(run_host_loop(inner.clone(), subscription, session.events, unload));

        Ok(Self { inner })
    }

    pub fn broadcast_id(&self) -> BroadcastId {
        self.inner.broadcast_id
    }

    pub fn room_id(&self) -> &RoomId {
        &self.inner.room_id
    }

    pub fn phase(&self) -> HostPhase {
        *self.inner.phase.borrow()
    }

    /// Highest viewer count seen so far.
    pub fn peak_viewers(&self) -> u32 {
        self.inner.peak.load(Ordering::Acquire)
    }

    /// The trigger that won, once the broadcast has ended.
    pub fn end_trigger(&self) -> Option<EndTrigger> {
        self.inner.trigger.get().copied()
    }

    /// Explicit stop. Returns true if this call performed the termination;
    /// either way the broadcast has ended by the time it returns.
    pub async fn stop(&self) -> bool {
        let performed = self.inner.terminate(EndTrigger::Stop).await;
        if !performed {
            self.wait_ended().await;
        }
        performed
    }

    pub async fn wait_ended(&self) {
        let mut rx = self.inner.phase.subscribe();
        let _ = rx.wait_for(|phase| *phase == HostPhase::Ended).await;
    }
}

impl Drop for HostSession {
    fn drop(&mut self) {
        if self.inner.ended.is_tripped() {
            return;
        }

        // Abnormal teardown: release resources now, write the final state
        // if there is still a runtime to do it on.
        self.inner.release();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let inner = self.inner.clone();
                runtime.spawn(async move {
                    inner.terminate(EndTrigger::Dropped).await;
                });
            }
            Err(_) => warn!(
                "Host session for broadcast {} dropped outside a runtime; final state not written",
                self.inner.broadcast_id
            ),
        }
    }
}

impl HostInner {
    /// Single termination path. The first caller ends the broadcast, every
    /// later caller is a no-op. The final write runs on its own task, so a
    /// caller that stops waiting cannot leave the broadcast half ended.
    async fn terminate(self: &Arc<Self>, trigger: EndTrigger) -> bool {
        if !self.ended.trip() {
            debug!(
                "Broadcast {} already ending, ignoring {:?}",
                self.broadcast_id, trigger
            );
            return false;
        }
        let _ = self.trigger.set(trigger);

        self.release();

        let inner = self.clone();
        if let Err(e) = tokio::spawn(async move { inner.finish(trigger).await }).await {
            error!("Final write for broadcast {} aborted: {}", self.broadcast_id, e);
        }
        true
    }

    async fn finish(&self, trigger: EndTrigger) {
        let stats = BroadcastStats {
            peak_viewers: self.peak.load(Ordering::Acquire),
        };
        info!(
            "Broadcast {} ending ({:?}), peak {} viewers",
            self.broadcast_id, trigger, stats.peak_viewers
        );

        // Someone else already removed or ended the record.
        if trigger != EndTrigger::RemoteGone {
            if let Err(e) = self.store.mark_ended(self.broadcast_id, stats).await {
                warn!("Failed to mark broadcast {} ended: {}", self.broadcast_id, e);
            }
        }

        self.phase.send_replace(HostPhase::Ended);
    }

    /// Cancel the subscription and dispose the transport. Safe to call more
    /// than once; the transport is disposed at most once.
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

    fn record_viewers(&self, count: usize) {
        let count = u32::try_from(count).unwrap_or(u32::MAX);
        let prev = self.peak.fetch_max(count, Ordering::AcqRel);
        if count > prev {
            debug!("Broadcast {} peak now {} viewers", self.broadcast_id, count);
        }
    }
}

async fn run_host_loop(
    inner: Arc<HostInner>,
    mut subscription: Subscription,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    unload: CancellationToken,
) {
    let shutdown = inner.shutdown.clone();
    let mut watching = true;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            _ = unload.cancelled() => {
                inner.terminate(EndTrigger::Unload).await;
                break;
            }

            event = events.recv() => match event {
                Some(TransportEvent::Joined) => {
                    debug!("Host transport joined room {}", inner.room_id);
                }
                Some(TransportEvent::Left) | Some(TransportEvent::RoomEnded) | None => {
                    inner.terminate(EndTrigger::TransportEnded).await;
                    break;
                }
            },

            snapshot = subscription.next(), if watching => match snapshot {
                Some(Snapshot::Found(broadcast)) if broadcast.is_live() => {
                    inner.record_viewers(broadcast.viewer_count());
                }
                Some(Snapshot::Found(_)) | Some(Snapshot::NotFound) => {
                    inner.terminate(EndTrigger::RemoteGone).await;
                    break;
                }
                None => {
                    // Store went away; keep the stream up, stop tracking peak.
                    warn!(
                        "Presence subscription for broadcast {} closed; peak tracking stopped at {}",
                        inner.broadcast_id,
                        inner.peak.load(Ordering::Acquire)
                    );
                    watching = false;
                }
            },
        }
    }

    subscription.cancel();
    debug!("Host loop for broadcast {} finished", inner.broadcast_id);
}
