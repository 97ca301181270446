use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel `token` when SIGTERM or SIGINT arrives.
///
/// Every simulation task watches the same token, so one signal stops the
/// generator, heartbeat monitor, scheduler, recovery and dashboard together.
pub fn install_shutdown_handler(token: CancellationToken) -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, stopping simulation");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, stopping simulation");
            }
            _ = token.cancelled() => return,
        }

        token.cancel();
    });

    Ok(())
}
