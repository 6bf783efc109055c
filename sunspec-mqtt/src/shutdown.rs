use tracing::{info, warn};

/// Completes when the process is asked to stop: Ctrl-C, or SIGTERM on Unix.
///
/// A signal whose handler cannot be installed is never reported, so the other one still works.
pub async fn signal() {
    tokio::select! {
        _ = ctrl_c() => {
            info!("Received Ctrl-C");
        }
        _ = terminate() => {
            info!("Received SIGTERM");
        }
    }
}

async fn ctrl_c() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "Cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(error) => {
            warn!(%error, "Cannot listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
