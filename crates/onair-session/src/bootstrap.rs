use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use onair_store::PresenceStore;
use onair_types::{BroadcastStats, Identity, NewBroadcast, RoomId};

use crate::error::SessionError;
use crate::host::HostSession;
use crate::transport::MediaTransport;

/// Create a broadcast record and bring its host controller up, as one unit.
///
/// If the record cannot be created the attempt fails outright. If the
/// controller cannot start, the fresh record is ended again so no `live`
/// broadcast is left behind without a host.
pub async fn go_live(
    store: Arc<dyn PresenceStore>,
    transport: &dyn MediaTransport,
    host: Identity,
    title: impl Into<String>,
    unload: CancellationToken,
) -> Result<HostSession, SessionError> {
    let draft = NewBroadcast {
        room_id: RoomId::generate(host.user_id),
        host,
        title: title.into(),
    };

    let broadcast = store.create(draft).await.map_err(|e| {
        error!("Failed to create broadcast: {}", e);
        SessionError::Create(e)
    })?;
    info!(
        "Bootstrapped broadcast {} \"{}\" for {}",
        broadcast.id, broadcast.title, broadcast.host_name
    );

    match HostSession::start(store.clone(), transport, &broadcast, unload).await {
        Ok(session) => Ok(session),
        Err(e) => {
            let stats = BroadcastStats { peak_viewers: 0 };
            if let Err(end_err) = store.mark_ended(broadcast.id, stats).await {
                warn!(
                    "Broadcast {} left live after failed start: {}",
                    broadcast.id, end_err
                );
            }
            Err(e)
        }
    }
}
