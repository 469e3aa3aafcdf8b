use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Best-effort "about to terminate" signal for the current process: the
/// returned token is cancelled on Ctrl+C or SIGTERM. A hard kill never
/// fires it.
pub fn process_unload_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        wait_for_termination().await;
        trigger.cancel();
    });

    token
}

async fn wait_for_termination() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, unloading..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, unloading..."),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, unloading...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, unloading...");
    }
}
