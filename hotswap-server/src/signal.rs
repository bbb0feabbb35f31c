//! Shutdown signal handling

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Cancels `cancel` on SIGINT or SIGTERM
///
/// Returns as soon as the token is cancelled, whoever cancelled it.
pub async fn handle_signals(cancel: CancellationToken) -> anyhow::Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => {}
        result = shutdown_signal() => {
            let signal = result?;
            info!("Received {}, shutting down", signal);
            cancel.cancel();
        }
    }
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> anyhow::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;

    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigint.recv() => Ok("SIGINT"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> anyhow::Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    Ok("ctrl-c")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_returns_when_cancelled_elsewhere() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        handle_signals(cancel).await.unwrap();
    }
}
