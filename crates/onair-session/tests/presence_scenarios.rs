//! End-to-end presence scenarios: one host, several viewers, an in-memory
//! store and the loopback transport, all inside one runtime.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use onair_session::{
    BroadcastWatcher, EndTrigger, GoneReason, HostPhase, LeaveAction, LeaveReason,
    LoopbackTransport, SessionError, ViewerPresence, ViewerSession, go_live,
};
use onair_store::{MemoryStore, PresenceStore, StoreResult, Subscription};
use onair_types::{
    Broadcast, BroadcastId, BroadcastStats, BroadcastStatus, Identity, NewBroadcast, Snapshot,
    Viewer,
};

/// Memory store that counts the writes it receives.
#[derive(Default)]
struct CountingStore {
    inner: MemoryStore,
    created: Mutex<Vec<BroadcastId>>,
    adds: AtomicUsize,
    removes: AtomicUsize,
    ends: AtomicUsize,
    /// Extra latency, in milliseconds, on remove_viewer and mark_ended.
    write_delay_ms: AtomicU64,
}

impl CountingStore {
    async fn stall(&self) {
        let ms = self.write_delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

#[async_trait]
impl PresenceStore for CountingStore {
    async fn create(&self, draft: NewBroadcast) -> StoreResult<Broadcast> {
        let b = self.inner.create(draft).await?;
        self.created.lock().unwrap().push(b.id);
        Ok(b)
    }

    async fn get(&self, id: BroadcastId) -> StoreResult<Snapshot> {
        self.inner.get(id).await
    }

    async fn observe(&self, id: BroadcastId) -> StoreResult<Subscription> {
        self.inner.observe(id).await
    }

    async fn add_viewer(&self, id: BroadcastId, viewer: Viewer) -> StoreResult<()> {
        self.adds.fetch_add(1, Ordering::SeqCst);
        self.inner.add_viewer(id, viewer).await
    }

    async fn remove_viewer(&self, id: BroadcastId, viewer: &Viewer) -> StoreResult<()> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.stall().await;
        self.inner.remove_viewer(id, viewer).await
    }

    async fn mark_ended(&self, id: BroadcastId, stats: BroadcastStats) -> StoreResult<()> {
        self.ends.fetch_add(1, Ordering::SeqCst);
        self.stall().await;
        self.inner.mark_ended(id, stats).await
    }

    async fn delete(&self, id: BroadcastId) -> StoreResult<()> {
        self.inner.delete(id).await
    }
}

#[derive(Default)]
struct RecordingAction {
    reasons: Mutex<Vec<GoneReason>>,
}

#[async_trait]
impl LeaveAction for RecordingAction {
    async fn on_gone(&self, reason: GoneReason) {
        self.reasons.lock().unwrap().push(reason);
    }
}

struct Fixture {
    counting: Arc<CountingStore>,
    store: Arc<dyn PresenceStore>,
    transport: LoopbackTransport,
}

fn fixture() -> Fixture {
    let counting = Arc::new(CountingStore::default());
    Fixture {
        store: counting.clone(),
        counting,
        transport: LoopbackTransport::new(),
    }
}

fn person(name: &str) -> Identity {
    Identity::new(Uuid::new_v4(), name)
}

async fn wait_for<F: FnMut() -> bool>(what: &str, mut check: F) {
    let reached = tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for: {}", what);
}

async fn wait_for_viewers(store: &Arc<dyn PresenceStore>, id: BroadcastId, expected: &[Uuid]) {
    let mut expected = expected.to_vec();
    expected.sort();
    let reached = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let mut ids = viewer_ids(store, id).await;
            ids.sort();
            if ids == expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "viewers of {} never became {:?}", id, expected);
}

async fn wait_for_status(store: &Arc<dyn PresenceStore>, id: BroadcastId, status: BroadcastStatus) {
    let reached = tokio::time::timeout(Duration::from_secs(2), async {
        while current(store, id).await.status != status {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "broadcast {} never reached {:?}", id, status);
}

async fn current(store: &Arc<dyn PresenceStore>, id: BroadcastId) -> Broadcast {
    match store.get(id).await.unwrap() {
        Snapshot::Found(b) => b,
        Snapshot::NotFound => panic!("broadcast {} missing", id),
    }
}

async fn viewer_ids(store: &Arc<dyn PresenceStore>, id: BroadcastId) -> Vec<Uuid> {
    current(store, id).await.viewers.iter().map(|v| v.user_id).collect()
}

#[tokio::test]
async fn scenario_a_peak_survives_leave() {
    let f = fixture();
    let host = go_live(f.store.clone(), &f.transport, person("host"), "live", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(host.phase(), HostPhase::Live);
    let b = current(&f.store, host.broadcast_id()).await;

    let u1 = person("u1");
    let u2 = person("u2");
    let _p1 = ViewerPresence::start(f.store.clone(), &f.transport, &b, u1.clone(), CancellationToken::new())
        .await
        .unwrap();
    wait_for_viewers(&f.store, b.id, &[u1.user_id]).await;
    wait_for("peak 1", || host.peak_viewers() == 1).await;

    let p2 = ViewerPresence::start(f.store.clone(), &f.transport, &b, u2.clone(), CancellationToken::new())
        .await
        .unwrap();
    wait_for_viewers(&f.store, b.id, &[u1.user_id, u2.user_id]).await;
    wait_for("peak 2", || host.peak_viewers() == 2).await;

    assert!(p2.leave().await);
    wait_for_viewers(&f.store, b.id, &[u1.user_id]).await;
    assert_eq!(host.peak_viewers(), 2);
}

#[tokio::test]
async fn scenario_b_stop_and_unload_in_same_tick() {
    let f = fixture();
    let unload = CancellationToken::new();
    let host_identity = person("host");
    let host = go_live(f.store.clone(), &f.transport, host_identity.clone(), "live", unload.clone())
        .await
        .unwrap();
    let b = current(&f.store, host.broadcast_id()).await;

    let _v1 = ViewerPresence::start(f.store.clone(), &f.transport, &b, person("u1"), CancellationToken::new())
        .await
        .unwrap();
    let _v2 = ViewerPresence::start(f.store.clone(), &f.transport, &b, person("u2"), CancellationToken::new())
        .await
        .unwrap();
    wait_for("peak 2", || host.peak_viewers() == 2).await;

    let _ = tokio::join!(async { unload.cancel() }, host.stop());
    host.wait_ended().await;

    let ended = current(&f.store, b.id).await;
    assert_eq!(ended.status, BroadcastStatus::Ended);
    assert_eq!(ended.peak_viewers, 2);
    assert!(ended.ended_at.is_some());
    assert_eq!(f.counting.ends.load(Ordering::SeqCst), 1);
    assert_eq!(f.transport.disposals(host_identity.user_id), 1);
    assert!(matches!(
        host.end_trigger(),
        Some(EndTrigger::Stop) | Some(EndTrigger::Unload)
    ));
}

#[tokio::test]
async fn scenario_c_deleted_broadcast_leaves_once() {
    let f = fixture();
    let host = go_live(f.store.clone(), &f.transport, person("host"), "live", CancellationToken::new())
        .await
        .unwrap();
    let id = host.broadcast_id();

    let viewer = ViewerSession::join(f.store.clone(), &f.transport, id, person("u1"), CancellationToken::new())
        .await
        .unwrap();
    wait_for("viewer registered", || viewer.presence().is_registered()).await;

    f.store.delete(id).await.unwrap();

    let reason = viewer.presence().wait_left().await;
    assert!(matches!(
        reason,
        LeaveReason::Broadcast(GoneReason::Deleted) | LeaveReason::RoomEnded
    ));

    // Later emissions and triggers are harmless.
    f.store.delete(id).await.unwrap();
    assert!(!viewer.leave().await);
    assert!(f.counting.removes.load(Ordering::SeqCst) <= 1);
    host.wait_ended().await;
    assert_eq!(host.end_trigger(), Some(EndTrigger::RemoteGone));
    assert_eq!(f.counting.ends.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn concurrent_terminations_write_once() {
    let f = fixture();
    let unload = CancellationToken::new();
    let host_identity = person("host");
    let host = Arc::new(
        go_live(f.store.clone(), &f.transport, host_identity.clone(), "live", unload.clone())
            .await
            .unwrap(),
    );

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let host = host.clone();
        tasks.push(tokio::spawn(async move { host.stop().await }));
    }
    unload.cancel();
    f.transport.end_room(host.room_id());

    let mut performed = 0;
    for t in tasks {
        if t.await.unwrap() {
            performed += 1;
        }
    }
    host.wait_ended().await;

    assert!(performed <= 1);
    assert_eq!(f.counting.ends.load(Ordering::SeqCst), 1);
    assert_eq!(f.transport.disposals(host_identity.user_id), 1);
    assert_eq!(host.phase(), HostPhase::Ended);
}

#[tokio::test]
async fn transport_room_end_terminates_host() {
    let f = fixture();
    let host = go_live(f.store.clone(), &f.transport, person("host"), "live", CancellationToken::new())
        .await
        .unwrap();

    f.transport.end_room(host.room_id());
    host.wait_ended().await;

    assert_eq!(host.end_trigger(), Some(EndTrigger::TransportEnded));
    assert!(!host.stop().await);
    assert_eq!(f.counting.ends.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reconnect_does_not_double_register() {
    let f = fixture();
    let host = go_live(f.store.clone(), &f.transport, person("host"), "live", CancellationToken::new())
        .await
        .unwrap();
    let b = current(&f.store, host.broadcast_id()).await;
    let me = person("u1");

    let unload = CancellationToken::new();
    let presence = ViewerPresence::start(f.store.clone(), &f.transport, &b, me.clone(), unload.clone())
        .await
        .unwrap();
    wait_for("registered", || presence.is_registered()).await;

    assert!(f.transport.reconnect(&b.room_id, me.user_id));
    assert!(f.transport.reconnect(&b.room_id, me.user_id));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(f.counting.adds.load(Ordering::SeqCst), 1);
    assert_eq!(viewer_ids(&f.store, b.id).await, vec![me.user_id]);

    assert!(presence.leave().await);
    assert!(!presence.leave().await);
    unload.cancel();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(f.counting.removes.load(Ordering::SeqCst), 1);
    assert!(viewer_ids(&f.store, b.id).await.is_empty());
    assert_eq!(f.transport.disposals(me.user_id), 1);
    assert_eq!(presence.leave_reason(), Some(LeaveReason::Navigation));
}

#[tokio::test]
async fn network_drop_then_rejoin_re_registers() {
    let f = fixture();
    let host = go_live(f.store.clone(), &f.transport, person("host"), "live", CancellationToken::new())
        .await
        .unwrap();
    let b = current(&f.store, host.broadcast_id()).await;
    let me = person("u1");

    let presence = ViewerPresence::start(f.store.clone(), &f.transport, &b, me.clone(), CancellationToken::new())
        .await
        .unwrap();
    wait_for("registered", || presence.is_registered()).await;

    f.transport.drop_member(&b.room_id, me.user_id);
    wait_for_viewers(&f.store, b.id, &[]).await;
    assert!(!presence.has_left());

    f.transport.reconnect(&b.room_id, me.user_id);
    wait_for_viewers(&f.store, b.id, &[me.user_id]).await;
    assert_eq!(f.counting.adds.load(Ordering::SeqCst), 2);
    assert_eq!(f.counting.removes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn host_stop_sends_viewers_away() {
    let f = fixture();
    let host = go_live(f.store.clone(), &f.transport, person("host"), "live", CancellationToken::new())
        .await
        .unwrap();
    let id = host.broadcast_id();

    let viewer = ViewerSession::join(f.store.clone(), &f.transport, id, person("u1"), CancellationToken::new())
        .await
        .unwrap();
    wait_for("viewer registered", || viewer.presence().is_registered()).await;

    wait_for("host saw the viewer", || host.peak_viewers() == 1).await;

    assert!(host.stop().await);
    viewer.presence().wait_left().await;
    assert!(viewer.presence().has_left());
    assert_eq!(f.counting.removes.load(Ordering::SeqCst), 1);

    let ended = current(&f.store, id).await;
    assert_eq!(ended.status, BroadcastStatus::Ended);
    assert_eq!(ended.peak_viewers, 1);
}

#[tokio::test]
async fn watcher_fires_once_for_end_then_delete() {
    let f = fixture();
    let host = go_live(f.store.clone(), &f.transport, person("host"), "live", CancellationToken::new())
        .await
        .unwrap();
    let id = host.broadcast_id();

    let action = Arc::new(RecordingAction::default());
    let watcher = BroadcastWatcher::start(f.store.clone(), id, action.clone()).await;
    wait_for("watcher live", || watcher.state().broadcast().is_some()).await;

    host.stop().await;
    assert_eq!(watcher.wait_gone().await, GoneReason::Ended);
    f.store.delete(id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(*action.reasons.lock().unwrap(), vec![GoneReason::Ended]);
    assert!(watcher.is_gone());
}

#[tokio::test]
async fn watcher_roster_tracks_snapshots() {
    let f = fixture();
    let host = go_live(f.store.clone(), &f.transport, person("host"), "live", CancellationToken::new())
        .await
        .unwrap();
    let b = current(&f.store, host.broadcast_id()).await;

    let action = Arc::new(RecordingAction::default());
    let watcher = BroadcastWatcher::start(f.store.clone(), b.id, action.clone()).await;

    let u1 = person("u1");
    let _p = ViewerPresence::start(f.store.clone(), &f.transport, &b, u1.clone(), CancellationToken::new())
        .await
        .unwrap();
    wait_for("roster has u1", || {
        watcher.roster().iter().map(|v| v.user_id).collect::<Vec<_>>() == vec![u1.user_id]
    })
    .await;
    assert_eq!(watcher.viewer_count(), 1);
    assert!(action.reasons.lock().unwrap().is_empty());
}

#[tokio::test]
async fn closed_store_reads_as_unavailable() {
    let store = MemoryStore::new();
    let dyn_store: Arc<dyn PresenceStore> = Arc::new(store.clone());
    let transport = LoopbackTransport::new();
    let host = go_live(dyn_store.clone(), &transport, person("host"), "live", CancellationToken::new())
        .await
        .unwrap();

    let action = Arc::new(RecordingAction::default());
    let watcher = BroadcastWatcher::start(dyn_store.clone(), host.broadcast_id(), action.clone()).await;
    wait_for("watcher live", || watcher.state().broadcast().is_some()).await;

    store.close().await;
    assert_eq!(watcher.wait_gone().await, GoneReason::Unavailable);

    // A watcher started after the store is gone reports the same.
    let late = BroadcastWatcher::start(dyn_store, host.broadcast_id(), action.clone()).await;
    assert!(late.is_gone());
    assert_eq!(late.wait_gone().await, GoneReason::Unavailable);
}

#[tokio::test]
async fn failed_transport_leaves_no_live_record() {
    let f = fixture();
    f.transport.set_fail_joins(true);

    let result = go_live(f.store.clone(), &f.transport, person("host"), "live", CancellationToken::new()).await;
    assert!(matches!(result, Err(SessionError::Transport(_))));

    let created = f.counting.created.lock().unwrap().clone();
    assert_eq!(created.len(), 1);
    let record = current(&f.store, created[0]).await;
    assert_eq!(record.status, BroadcastStatus::Ended);
    assert_eq!(record.peak_viewers, 0);
}

#[tokio::test]
async fn joining_ended_or_missing_broadcast_fails() {
    let f = fixture();
    let host = go_live(f.store.clone(), &f.transport, person("host"), "live", CancellationToken::new())
        .await
        .unwrap();
    let id = host.broadcast_id();
    host.stop().await;

    let ended = ViewerSession::join(f.store.clone(), &f.transport, id, person("late"), CancellationToken::new()).await;
    assert!(matches!(ended, Err(SessionError::BroadcastEnded(_))));

    let missing = ViewerSession::join(
        f.store.clone(),
        &f.transport,
        BroadcastId::new(),
        person("lost"),
        CancellationToken::new(),
    )
    .await;
    assert!(matches!(missing, Err(SessionError::BroadcastNotFound(_))));
}

#[tokio::test]
async fn dropped_host_session_still_ends_broadcast() {
    let f = fixture();
    let host_identity = person("host");
    let host = go_live(f.store.clone(), &f.transport, host_identity.clone(), "live", CancellationToken::new())
        .await
        .unwrap();
    let id = host.broadcast_id();

    drop(host);

    assert_eq!(f.transport.disposals(host_identity.user_id), 1);
    wait_for_status(&f.store, id, BroadcastStatus::Ended).await;
    assert_eq!(f.counting.ends.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dropped_viewer_session_removes_presence() {
    let f = fixture();
    let host = go_live(f.store.clone(), &f.transport, person("host"), "live", CancellationToken::new())
        .await
        .unwrap();
    let id = host.broadcast_id();

    let viewer = ViewerSession::join(f.store.clone(), &f.transport, id, person("u1"), CancellationToken::new())
        .await
        .unwrap();
    wait_for("viewer registered", || viewer.presence().is_registered()).await;

    drop(viewer);
    wait_for_viewers(&f.store, id, &[]).await;
}

#[tokio::test]
async fn abandoned_stop_still_ends_broadcast() {
    let f = fixture();
    let unload = CancellationToken::new();
    let host = go_live(f.store.clone(), &f.transport, person("host"), "live", unload.clone())
        .await
        .unwrap();
    let id = host.broadcast_id();
    f.counting.write_delay_ms.store(50, Ordering::SeqCst);

    // The caller gives up while the final write is still in flight.
    let first = tokio::time::timeout(Duration::from_millis(5), host.stop()).await;
    assert!(first.is_err());

    unload.cancel();
    let second = tokio::time::timeout(Duration::from_millis(500), host.stop()).await;
    assert_eq!(second.ok(), Some(false));

    assert_eq!(host.phase(), HostPhase::Ended);
    assert_eq!(host.end_trigger(), Some(EndTrigger::Stop));
    assert_eq!(f.counting.ends.load(Ordering::SeqCst), 1);
    assert_eq!(current(&f.store, id).await.status, BroadcastStatus::Ended);
}

#[tokio::test]
async fn abandoned_leave_still_removes_presence() {
    let f = fixture();
    let host = go_live(f.store.clone(), &f.transport, person("host"), "live", CancellationToken::new())
        .await
        .unwrap();
    let b = current(&f.store, host.broadcast_id()).await;

    let presence = ViewerPresence::start(f.store.clone(), &f.transport, &b, person("u1"), CancellationToken::new())
        .await
        .unwrap();
    wait_for_viewers(&f.store, b.id, &[presence.identity().user_id]).await;
    f.counting.write_delay_ms.store(50, Ordering::SeqCst);

    let first = tokio::time::timeout(Duration::from_millis(5), presence.leave()).await;
    assert!(first.is_err());
    assert!(!presence.leave().await);

    assert_eq!(presence.wait_left().await, LeaveReason::Navigation);
    wait_for_viewers(&f.store, b.id, &[]).await;
    assert_eq!(f.counting.removes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn watcher_stops_when_presence_leaves_on_its_own() {
    let f = fixture();
    let host = go_live(f.store.clone(), &f.transport, person("host"), "live", CancellationToken::new())
        .await
        .unwrap();
    let id = host.broadcast_id();

    let unload = CancellationToken::new();
    let viewer = ViewerSession::join(f.store.clone(), &f.transport, id, person("u1"), unload.clone())
        .await
        .unwrap();
    wait_for("watcher live", || viewer.watcher().state().broadcast().is_some()).await;
    assert!(!viewer.watcher().is_stopped());

    unload.cancel();
    assert_eq!(viewer.presence().wait_left().await, LeaveReason::Unload);
    wait_for("watcher stopped", || viewer.watcher().is_stopped()).await;
    assert!(!viewer.watcher().is_gone());
    assert_eq!(host.phase(), HostPhase::Live);
}
