use tokio_util::sync::CancellationToken;

/// Install a shutdown handler listening for SIGTERM and ctrl-c.
///
/// Returns a `CancellationToken` cancelled when either signal arrives.
/// Hosts should wire it to `WorkerMonitor::stop_all` so every live
/// monitor persists its final state before the process exits.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let signal_token = token.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::error!(error = %err, "failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                }
                result = tokio::signal::ctrl_c() => {
                    if result.is_ok() {
                        tracing::info!("received ctrl-c, shutting down");
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received ctrl-c, shutting down");
            }
        }
        signal_token.cancel();
    });

    token
}
