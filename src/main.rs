use anyhow::Result;
use log::error;
use tokio::sync::broadcast;

use sunspec_bridge::options::Options;

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::new();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    // Ctrl+C, and SIGTERM where there is one
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            error!("Failed to listen for shutdown signals: {}", e);
        }
        if let Err(e) = shutdown_tx_clone.send(()) {
            error!("Failed to send shutdown signal: {}", e);
        }
    });

    sunspec_bridge::app(shutdown_rx, options).await
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r,
        _ = term.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
