//! Server lifecycle: serve, then drain sessions on shutdown.

use crate::{registry::ConnectionRegistry, router::create_router, state::AppState};
use std::{io, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle, time::timeout};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every session closed within the grace period.
    Completed,
    /// The grace period ran out with sessions still open.
    TimedOut,
}

/// A running relay server.
#[derive(Debug)]
pub struct Server {
    local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<io::Result<()>>,
}

/// Starts serving on `listener` in the background.
pub fn start(state: Arc<AppState>, listener: TcpListener) -> io::Result<Server> {
    let local_addr = listener.local_addr()?;
    let registry = state.registry.clone();
    let app = create_router(state);
    let (stop, stopped) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = stopped.await;
        })
        .await
    });

    Ok(Server {
        local_addr,
        registry,
        stop,
        task,
    })
}

impl Server {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections, asks every session to close, and waits up
    /// to `grace` for them to finish.
    pub async fn shutdown(self, grace: Duration) -> ShutdownOutcome {
        let Server {
            registry,
            stop,
            task,
            ..
        } = self;

        let signalled = registry.close_all();
        info!(sessions = signalled, "Closing active sessions");
        let _ = stop.send(());

        let drained = async {
            registry.wait_until_empty().await;
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Server exited with an error"),
                Err(e) => error!(error = %e, "Server task failed"),
            }
        };

        match timeout(grace, drained).await {
            Ok(()) => ShutdownOutcome::Completed,
            Err(_) => ShutdownOutcome::TimedOut,
        }
    }
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C. Shutting down gracefully..."),
        () = terminate => info!("Received SIGTERM. Shutting down gracefully..."),
    }
}
