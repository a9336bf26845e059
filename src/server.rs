//! Process lifecycle
//!
//! Binds the listener, serves the router, and on SIGINT/SIGTERM closes the
//! listener and shuts the pool down (stopping timers and killing every
//! agent subprocess) before returning.

use std::sync::Arc;

use tokio::net::TcpListener;

use crate::config::GatewayConfig;
use crate::http::{build_router, AppState};
use crate::pool::SessionPool;
use crate::routing::RouteTable;

/// Run the gateway until a termination signal arrives
///
/// # Errors
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn run(config: GatewayConfig, routes: RouteTable) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let pool = SessionPool::new(Arc::clone(&config), routes);
    let state = AppState {
        pool: pool.clone(),
        config: Arc::clone(&config),
    };

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {addr}: {e}"))?;
    log::info!(
        "kiro-gateway listening on {addr} (agent: {} {})",
        config.kiro_bin.display(),
        config.kiro_subcommand
    );

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    pool.shutdown().await;
    log::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(e) => {
            log::error!("cannot install SIGTERM handler: {e}");
            // fall back to ctrl-c only
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => log::info!("received SIGINT"),
        _ = sigterm.recv() => log::info!("received SIGTERM"),
    }
}
