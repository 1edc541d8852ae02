//! Daemon lifecycle: wire up state, start workers and the server, run until
//! a shutdown signal, then drain.

use tokio::sync::watch;

use common::source::SourceError;

use crate::config::{Config, ConfigError};
use crate::server::Server;
use crate::state::{State, StateSetupError};
use crate::worker::spawn_workers;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("state setup failed: {0}")]
    State(#[from] StateSetupError),

    #[error("source init failed: {0}")]
    Source(#[from] SourceError),

    #[error("cannot bind server socket: {0}")]
    Bind(std::io::Error),
}

impl ServiceError {
    /// Process exit code: 1 for config problems, 2 when the store is
    /// unreachable at startup.
    pub fn exit_code(&self) -> u8 {
        match self {
            ServiceError::State(StateSetupError::Store(_)) => 2,
            _ => 1,
        }
    }
}

/// Run the daemon until SIGINT/SIGTERM.
pub async fn run(config: Config) -> Result<(), ServiceError> {
    let addr = config.server_addr()?;
    let state = State::from_config(&config).await?;
    state.registry().init_all().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let workers = spawn_workers(&state, config.worker_count(), shutdown_rx.clone());
    tracing::info!("started {} workers", workers.len());

    let server = Server::bind(state.clone(), addr)
        .await
        .map_err(ServiceError::Bind)?;
    let server_task = tokio::spawn(server.run(shutdown_rx));

    wait_for_signal().await;
    tracing::info!("shutdown signal received, draining");
    let _ = shutdown_tx.send(true);

    let _ = server_task.await;
    futures::future::join_all(workers).await;
    state.registry().close_all().await;

    for (name, value) in state.metrics().counter_snapshot() {
        tracing::info!("metric {name} = {value}");
    }
    tracing::info!("shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("cannot install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
