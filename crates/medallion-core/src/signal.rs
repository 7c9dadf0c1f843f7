//! Signal handling for graceful shutdown.

use tracing::{info, warn};

/// Wait for a shutdown signal (SIGINT, SIGTERM or SIGQUIT on Unix).
///
/// If the handlers cannot be installed this falls back to Ctrl-C only.
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let handlers = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::quit()),
    );
    let (Ok(mut sigint), Ok(mut sigterm), Ok(mut sigquit)) = handlers else {
        warn!("Failed to install signal handlers, falling back to Ctrl-C");
        ctrl_c().await;
        return;
    };

    tokio::select! {
        _ = sigint.recv() => info!(message = "Signal received.", signal = "SIGINT"),
        _ = sigterm.recv() => info!(message = "Signal received.", signal = "SIGTERM"),
        _ = sigquit.recv() => info!(message = "Signal received.", signal = "SIGQUIT"),
    }
}

/// Wait for Ctrl-C.
#[cfg(not(unix))]
pub async fn shutdown_signal() {
    ctrl_c().await;
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!(message = "Signal received.", signal = "CTRL_C"),
        Err(e) => {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    }
}
