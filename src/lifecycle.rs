//! Process Lifecycle
//!
//! Runs the HTTP server until a shutdown signal, then drains the listener
//! and the connection pool side by side. Both drains finish before
//! [`run_until_shutdown`] returns.

use std::future::Future;
use std::io;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

use crate::http::HttpServer;
use crate::pool::ConnectionPool;

/// Serve until `signal` resolves, then shut everything down
pub async fn run_until_shutdown<S>(
    server: HttpServer,
    pool: Arc<ConnectionPool>,
    signal: S,
) -> io::Result<()>
where
    S: Future<Output = ()>,
{
    let (shutdown_tx, _) = broadcast::channel(1);
    let server_rx = shutdown_tx.subscribe();
    let mut pool_rx = shutdown_tx.subscribe();

    let serve = server.run(server_rx);

    let drain_pool = async move {
        let _ = pool_rx.recv().await;
        info!("Closing broker connections");
        pool.close_all().await;
    };

    let trigger = async move {
        signal.await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    };

    let (served, (), ()) = tokio::join!(serve, drain_pool, trigger);
    info!("Exiting");
    served
}

/// Resolves on Ctrl+C, or SIGTERM on Unix
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
