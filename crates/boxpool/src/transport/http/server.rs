//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::config::{ConfigError, ENV_PREFIX, parse_var};
use crate::manager::SlotManager;

use super::routes::routes;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

impl ServerConfig {
    /// `BOXPOOL_HOST` and `BOXPOOL_PORT`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(format!("{ENV_PREFIX}{name}")).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(host) = lookup("HOST").filter(|h| !h.trim().is_empty()) {
            config.host = host.trim().to_string();
        }
        if let Some(port) = parse_var(&lookup, "PORT")? {
            config.port = port;
        }
        Ok(config)
    }
}

/// Reconcile the pool, serve until a shutdown signal, then tear every slot
/// down.
pub async fn serve(config: ServerConfig, manager: Arc<SlotManager>) -> anyhow::Result<()> {
    let shutdown_rx = manager.shutdown_rx();
    let app = routes(manager.clone());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    manager.start().await;

    info!("Starting boxpool server on {}", actual_addr);

    let draining = manager.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal(shutdown_rx).await;
            // Open liveness sockets would otherwise hold the server open.
            draining.begin_shutdown().await;
        })
        .await;

    info!("Server stopped, resetting slots");
    manager.shutdown().await;

    result?;
    info!("Server shutdown complete");
    Ok(())
}

/// Why the server is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Interrupt,
    Terminate,
    Requested,
}

/// Resolve on SIGINT, SIGTERM or a `/shutdown` request. A signal handler
/// that cannot be installed is logged and never fires.
async fn shutdown_signal(shutdown_rx: watch::Receiver<bool>) -> StopReason {
    let reason = tokio::select! {
        _ = interrupt() => StopReason::Interrupt,
        _ = terminate() => StopReason::Terminate,
        _ = requested(shutdown_rx) => StopReason::Requested,
    };
    info!(?reason, "Stopping boxpool server; draining liveness channels");
    reason
}

async fn interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Cannot listen for SIGINT");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::error!(error = %e, "Cannot listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

/// Resolves once the manager's shutdown flag is set. A dropped sender never
/// requests shutdown.
async fn requested(mut shutdown_rx: watch::Receiver<bool>) {
    if shutdown_rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
