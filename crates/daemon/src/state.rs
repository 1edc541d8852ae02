//! Shared service state: the store, the source registry, the merge policy,
//! metrics, and the advisory locks, wired up once from the config and handed
//! to the server and every worker.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use common::merge::MergePolicy;
use common::source::SourceRegistry;

use crate::config::{Config, ConfigError};
use crate::database::{Database, StoreError};
use crate::metrics::Metrics;
use crate::sources::build_registry;
use crate::worker::locks::LockRegistry;

/// Timeouts and retry limits, all config-driven.
#[derive(Debug, Clone, Copy)]
pub struct Tuning {
    /// Per data-source call.
    pub source_timeout: Duration,
    /// Per reconciliation item.
    pub reconcile_timeout: Duration,
    /// Attempts before an item is dead-lettered.
    pub retry_cap: u32,
    /// Queue lease duration, seconds. Must outlast the reconcile timeout so
    /// a live worker never loses its item.
    pub lease_secs: i64,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            source_timeout: Duration::from_secs(30),
            reconcile_timeout: Duration::from_secs(120),
            retry_cap: 5,
            lease_secs: 180,
        }
    }
}

impl Tuning {
    pub fn from_config(config: &Config) -> Self {
        let reconcile_timeout = config.reconcile_timeout();
        Self {
            source_timeout: config.source_timeout(),
            reconcile_timeout,
            retry_cap: config.retry_cap(),
            lease_secs: (reconcile_timeout.as_secs() as i64 + 60).max(60),
        }
    }
}

/// Main service state - orchestrates all components.
#[derive(Clone)]
pub struct State {
    database: Database,
    registry: Arc<SourceRegistry>,
    policy: Arc<dyn MergePolicy>,
    metrics: Metrics,
    locks: Arc<LockRegistry>,
    wake_tx: flume::Sender<()>,
    wake_rx: flume::Receiver<()>,
    tuning: Tuning,
}

#[derive(Debug, Error)]
pub enum StateSetupError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl State {
    pub async fn from_config(config: &Config) -> Result<Self, StateSetupError> {
        let policy = config.policy()?;
        let registry = Arc::new(build_registry(config)?);

        // One connection per worker plus one for the server.
        let pool_size = config.worker_count() as u32 + 1;
        tracing::info!("connecting to store at {}", config.store.dsn);
        let database = Database::connect(&config.store.dsn, pool_size).await?;

        Ok(Self::new(
            database,
            registry,
            policy,
            Tuning::from_config(config),
        ))
    }

    /// Assemble state from parts. Tests build registries and stores by hand.
    pub fn new(
        database: Database,
        registry: Arc<SourceRegistry>,
        policy: Arc<dyn MergePolicy>,
        tuning: Tuning,
    ) -> Self {
        let (wake_tx, wake_rx) = flume::unbounded();
        Self {
            database,
            registry,
            policy,
            metrics: Metrics::new(),
            locks: LockRegistry::new(),
            wake_tx,
            wake_rx,
            tuning,
        }
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn policy(&self) -> &dyn MergePolicy {
        &*self.policy
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn locks(&self) -> &Arc<LockRegistry> {
        &self.locks
    }

    pub fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    /// Nudge one idle worker; called after every enqueue.
    pub fn wake_workers(&self) {
        let _ = self.wake_tx.try_send(());
    }

    /// The wake channel end polled by workers.
    pub fn wake_receiver(&self) -> flume::Receiver<()> {
        self.wake_rx.clone()
    }
}
