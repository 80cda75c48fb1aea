use std::sync::Arc;

use relay_core::observability::init_logging;
use relay_core::{RelayConfig, RelayKernel};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::load()?;
    init_logging(config.log_format);

    let listen = config.listen.clone();
    let workers = config.queue.workers.clone();
    let kernel = Arc::new(RelayKernel::from_config(config)?);

    // Background workers drain the configured queues until shutdown.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();
    for queue in workers {
        let kernel = Arc::clone(&kernel);
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            kernel.run_worker(&queue, rx).await;
        }));
    }

    let app = relay_http::router(kernel);
    let listener = TcpListener::bind(&listen).await?;
    info!(addr = %listener.local_addr()?, "relay HTTP server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }
    info!("relay HTTP server stopped");
    Ok(())
}
