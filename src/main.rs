use log::{error, info};
use std::time::Duration;
use tokio::sync::broadcast;

use mppt_bridge::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::new();

    let (shutdown_tx, _) = broadcast::channel(1);

    // Handle Ctrl+C
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        if let Err(e) = shutdown_tx_clone.send(()) {
            error!("Failed to send shutdown signal: {}", e);
        }
    });

    if let Some(secs) = options.runtime {
        let shutdown_tx_clone = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            info!("Runtime limit of {}s reached", secs);
            let _ = shutdown_tx_clone.send(());
        });
    }

    let app_handle = tokio::spawn(mppt_bridge::app(shutdown_tx.subscribe(), options));

    if let Err(e) = app_handle.await? {
        error!("Application error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
