//! The `DataSource` capability and the runtime source registry.
//!
//! Each configured external system implements [`DataSource`]. The daemon
//! builds a [`SourceRegistry`] at startup mapping every configured
//! `(entity, source)` pair to a driver instance; operations on pairs that
//! were never registered are refused rather than guessed at.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::document::Document;
use crate::ident::{EntityName, ForeignKey, SourceName};

/// What went wrong talking to a data source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceErrorKind {
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("no data source registered for this entity/source pair")]
    Unregistered,

    #[error("{0}")]
    Failed(String),
}

/// A data-source call failed. Carries the source it failed against.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("source {name}: {kind}")]
pub struct SourceError {
    pub name: SourceName,
    pub kind: SourceErrorKind,
}

impl SourceError {
    pub fn new(name: SourceName, kind: SourceErrorKind) -> Self {
        Self { name, kind }
    }

    pub fn failed(name: SourceName, cause: impl fmt::Display) -> Self {
        Self::new(name, SourceErrorKind::Failed(cause.to_string()))
    }
}

/// Capability set implemented by every external data source.
///
/// Sources may be slow or flaky; callers wrap every call in a timeout and
/// convert raw failures into [`SourceError`]s.
#[async_trait]
pub trait DataSource: fmt::Debug + Send + Sync {
    /// One-time setup when the daemon starts.
    async fn init(&self) -> Result<(), SourceError> {
        Ok(())
    }

    /// Fetch the current document for `fk`. `None` means the source no
    /// longer holds the entity.
    async fn get(&self, fk: &ForeignKey) -> Result<Option<Document>, SourceError>;

    /// Write `doc`. With `fk` absent the source allocates a fresh foreign
    /// key; either way the key now holding the document is returned.
    async fn set(&self, doc: &Document, fk: Option<&ForeignKey>)
        -> Result<ForeignKey, SourceError>;

    /// Remove the entity behind `fk`.
    async fn delete(&self, fk: &ForeignKey) -> Result<(), SourceError>;

    /// Counterpart to `init`, called at shutdown.
    async fn close(&self) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Wrap a data-source call in a timeout, folding the timeout into the
/// source error taxonomy.
pub async fn with_timeout<T>(
    name: &SourceName,
    limit: Duration,
    call: impl std::future::Future<Output = Result<T, SourceError>>,
) -> Result<T, SourceError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(SourceError::new(
            name.clone(),
            SourceErrorKind::Timeout(limit),
        )),
    }
}

/// Runtime registry of configured data sources.
///
/// Keeps the configured source order per entity; reconciliation iterates
/// sources in that order so fallbacks (e.g. bootstrap initial documents) are
/// deterministic.
#[derive(Debug, Default)]
pub struct SourceRegistry {
    sources: HashMap<(EntityName, SourceName), Arc<dyn DataSource>>,
    order: HashMap<EntityName, Vec<SourceName>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver for an `(entity, source)` pair. Registration order
    /// defines the source order for the entity.
    pub fn register(
        &mut self,
        entity: EntityName,
        source: SourceName,
        driver: Arc<dyn DataSource>,
    ) {
        self.order
            .entry(entity.clone())
            .or_default()
            .push(source.clone());
        self.sources.insert((entity, source), driver);
    }

    /// Look up the driver for a pair, refusing unregistered pairs.
    pub fn get(
        &self,
        entity: &EntityName,
        source: &SourceName,
    ) -> Result<&Arc<dyn DataSource>, SourceError> {
        self.sources
            .get(&(entity.clone(), source.clone()))
            .ok_or_else(|| SourceError::new(source.clone(), SourceErrorKind::Unregistered))
    }

    /// Sources configured for `entity`, in configuration order.
    pub fn sources_for(&self, entity: &EntityName) -> &[SourceName] {
        self.order.get(entity).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, entity: &EntityName, source: &SourceName) -> bool {
        self.sources.contains_key(&(entity.clone(), source.clone()))
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityName> {
        self.order.keys()
    }

    /// Run `init` on every registered driver.
    pub async fn init_all(&self) -> Result<(), SourceError> {
        for driver in self.sources.values() {
            driver.init().await?;
        }
        Ok(())
    }

    /// Run `close` on every registered driver, logging failures.
    pub async fn close_all(&self) {
        for ((entity, source), driver) in &self.sources {
            if let Err(e) = driver.close().await {
                tracing::warn!("failed to close source {}/{}: {}", entity, source, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct NullSource;

    #[async_trait]
    impl DataSource for NullSource {
        async fn get(&self, _fk: &ForeignKey) -> Result<Option<Document>, SourceError> {
            Ok(None)
        }

        async fn set(
            &self,
            _doc: &Document,
            _fk: Option<&ForeignKey>,
        ) -> Result<ForeignKey, SourceError> {
            unimplemented!("not used in these tests")
        }

        async fn delete(&self, _fk: &ForeignKey) -> Result<(), SourceError> {
            Ok(())
        }
    }

    fn entity(name: &str) -> EntityName {
        EntityName::new(name).unwrap()
    }

    fn source(name: &str) -> SourceName {
        SourceName::new(name).unwrap()
    }

    #[test]
    fn test_registry_preserves_source_order() {
        let mut registry = SourceRegistry::new();
        registry.register(entity("customer"), source("db2"), Arc::new(NullSource));
        registry.register(entity("customer"), source("db1"), Arc::new(NullSource));
        assert_eq!(
            registry.sources_for(&entity("customer")),
            &[source("db2"), source("db1")]
        );
    }

    #[test]
    fn test_unregistered_pair_is_refused() {
        let registry = SourceRegistry::new();
        let err = registry.get(&entity("customer"), &source("db1")).unwrap_err();
        assert_eq!(err.kind, SourceErrorKind::Unregistered);
    }

    #[tokio::test]
    async fn test_with_timeout_converts_elapsed() {
        let name = source("db1");
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        };
        let err = with_timeout(&name, Duration::from_millis(10), slow)
            .await
            .unwrap_err();
        assert!(matches!(err.kind, SourceErrorKind::Timeout(_)));
    }
}
