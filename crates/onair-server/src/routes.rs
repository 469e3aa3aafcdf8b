use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use onair_store::{PresenceStore, StoreError, Subscription};
use onair_types::api::{AddViewerRequest, CreateBroadcastRequest, EndBroadcastRequest, RosterResponse};
use onair_types::{
    Broadcast, BroadcastId, BroadcastStats, Identity, NewBroadcast, RoomId, Snapshot, Viewer,
    WatchEvent,
};

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn PresenceStore>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/broadcasts", post(create_broadcast))
        .route("/broadcasts/{id}", get(get_broadcast).delete(delete_broadcast))
        .route("/broadcasts/{id}/viewers", get(get_roster))
        .route(
            "/broadcasts/{id}/viewers/{user_id}",
            put(add_viewer).delete(remove_viewer),
        )
        .route("/broadcasts/{id}/end", post(end_broadcast))
        .route("/broadcasts/{id}/watch", get(watch_broadcast))
        .with_state(state)
}

fn store_status(e: StoreError) -> StatusCode {
    match e {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        StoreError::Backend(e) => {
            error!("Store error: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn load(state: &AppState, id: BroadcastId) -> Result<Broadcast, StatusCode> {
    match state.store.get(id).await.map_err(store_status)? {
        Snapshot::Found(broadcast) => Ok(broadcast),
        Snapshot::NotFound => Err(StatusCode::NOT_FOUND),
    }
}

// -- Broadcasts --

pub async fn create_broadcast(
    State(state): State<AppState>,
    Json(req): Json<CreateBroadcastRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.host_name.trim().is_empty() || req.title.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let host = Identity {
        user_id: req.host_id,
        name: req.host_name,
        avatar_ref: req.host_avatar_ref,
    };
    let draft = NewBroadcast {
        room_id: RoomId::generate(host.user_id),
        host,
        title: req.title,
    };
    let broadcast = state.store.create(draft).await.map_err(store_status)?;
    info!(
        "{} ({}) went live as broadcast {}",
        broadcast.host_name, broadcast.host_id, broadcast.id
    );

    Ok((StatusCode::CREATED, Json(broadcast)))
}

pub async fn get_broadcast(
    State(state): State<AppState>,
    Path(id): Path<BroadcastId>,
) -> Result<Json<Broadcast>, StatusCode> {
    load(&state, id).await.map(Json)
}

pub async fn end_broadcast(
    State(state): State<AppState>,
    Path(id): Path<BroadcastId>,
    Json(req): Json<EndBroadcastRequest>,
) -> Result<StatusCode, StatusCode> {
    let stats = BroadcastStats {
        peak_viewers: req.peak_viewers,
    };
    state.store.mark_ended(id, stats).await.map_err(store_status)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_broadcast(
    State(state): State<AppState>,
    Path(id): Path<BroadcastId>,
) -> Result<StatusCode, StatusCode> {
    state.store.delete(id).await.map_err(store_status)?;
    Ok(StatusCode::NO_CONTENT)
}

// -- Viewers --

pub async fn get_roster(
    State(state): State<AppState>,
    Path(id): Path<BroadcastId>,
) -> Result<Json<RosterResponse>, StatusCode> {
    let broadcast = load(&state, id).await?;
    Ok(Json(RosterResponse {
        broadcast_id: broadcast.id,
        count: broadcast.viewer_count(),
        viewers: broadcast.viewers.to_vec(),
    }))
}

pub async fn add_viewer(
    State(state): State<AppState>,
    Path((id, user_id)): Path<(BroadcastId, Uuid)>,
    Json(req): Json<AddViewerRequest>,
) -> Result<StatusCode, StatusCode> {
    if req.name.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let viewer = Viewer {
        user_id,
        name: req.name,
        avatar_ref: req.avatar_ref,
        joined_at: Utc::now(),
    };
    state.store.add_viewer(id, viewer).await.map_err(store_status)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn remove_viewer(
    State(state): State<AppState>,
    Path((id, user_id)): Path<(BroadcastId, Uuid)>,
) -> Result<StatusCode, StatusCode> {
    // Removal matches on user_id only.
    let viewer = Identity::new(user_id, String::new()).to_viewer(Utc::now());
    state.store.remove_viewer(id, &viewer).await.map_err(store_status)?;
    Ok(StatusCode::NO_CONTENT)
}

// -- Live updates --

pub async fn watch_broadcast(
    State(state): State<AppState>,
    Path(id): Path<BroadcastId>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, StatusCode> {
    let subscription = state.store.observe(id).await.map_err(store_status)?;
    Ok(ws.on_upgrade(move |socket| push_snapshots(socket, subscription)))
}

/// Push every snapshot to the socket until the broadcast ends or vanishes,
/// the client goes away, or the store closes.
async fn push_snapshots(socket: WebSocket, subscription: Subscription) {
    let id = subscription.broadcast_id();
    let cancel = subscription.cancel_token();
    let (mut sender, mut receiver) = socket.split();
    let mut snapshots = std::pin::pin!(subscription.into_stream());

    debug!("Watch socket opened for broadcast {}", id);

    loop {
        tokio::select! {
            snapshot = snapshots.next() => {
                let Some(snapshot) = snapshot else { break };
                let terminal = !snapshot.broadcast().is_some_and(Broadcast::is_live);

                let text = match serde_json::to_string(&WatchEvent::from(snapshot)) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode snapshot of broadcast {}: {}", id, e);
                        break;
                    }
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
                if terminal {
                    break;
                }
            }
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    cancel.cancel();
    let _ = sender.send(Message::Close(None)).await;
    debug!("Watch socket closed for broadcast {}", id);
}

pub async fn health() -> &'static str {
    "ok"
}
