//! HTTP listener

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::{dispatch, AppState};

/// Accepts HTTP connections until told to stop
pub struct HttpServer {
    listener: TcpListener,
    state: AppState,
    shutdown_timeout: Duration,
}

impl HttpServer {
    pub async fn bind(
        addr: SocketAddr,
        state: AppState,
        shutdown_timeout: Duration,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            state,
            shutdown_timeout,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` fires, then drain open connections.
    ///
    /// In-flight requests get up to `shutdown_timeout` to finish.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> io::Result<()> {
        info!("HTTP server listening on http://{}", self.local_addr()?);

        let graceful = GracefulShutdown::new();
        let http = http1::Builder::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Failed to accept HTTP connection: {}", e);
                            continue;
                        }
                    };
                    debug!("New HTTP connection from {}", addr);

                    let io = TokioIo::new(stream);
                    let state = self.state.clone();
                    let service = service_fn(move |req| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(dispatch(state, req).await) }
                    });

                    let conn = graceful.watch(http.serve_connection(io, service));
                    tokio::spawn(async move {
                        if let Err(e) = conn.await {
                            debug!("Error serving HTTP connection from {}: {}", addr, e);
                        }
                    });
                }
                _ = shutdown.recv() => break,
            }
        }

        drop(self.listener);
        info!("Shutting down HTTP server");
        match tokio::time::timeout(self.shutdown_timeout, graceful.shutdown()).await {
            Ok(()) => info!("HTTP server shut down"),
            Err(_) => warn!(
                "HTTP server shutdown timed out after {:?}",
                self.shutdown_timeout
            ),
        }
        Ok(())
    }
}
