//! Data source drivers and registry construction.
//!
//! Drivers are selected per configured source by name. The only built-in
//! driver is `memory`; real adapters (e.g. the Postgres one) plug in here by
//! extending [`build_driver`].

pub mod memory;

pub use memory::MemorySource;

use std::collections::HashMap;
use std::sync::Arc;

use common::ident::{EntityName, SourceName};
use common::source::{DataSource, SourceRegistry};

use crate::config::{Config, ConfigError};

/// Instantiate the driver named in the config for one `(entity, source)`
/// pair.
fn build_driver(
    driver: &str,
    entity: &EntityName,
    source: &SourceName,
    _settings: &HashMap<String, String>,
) -> Result<Arc<dyn DataSource>, ConfigError> {
    match driver {
        "memory" => Ok(MemorySource::new(entity.clone(), source.clone())),
        other => Err(ConfigError::Invalid(format!(
            "unknown driver {other:?} for {entity}/{source}"
        ))),
    }
}

/// Build the source registry for a validated config.
pub fn build_registry(config: &Config) -> Result<SourceRegistry, ConfigError> {
    let mut registry = SourceRegistry::new();
    for entity_section in &config.entities {
        let entity = EntityName::new(entity_section.name.clone())
            .map_err(|e| ConfigError::Invalid(format!("entity name: {e}")))?;
        for source_entry in &entity_section.sources {
            let source = SourceName::new(source_entry.name.clone())
                .map_err(|e| ConfigError::Invalid(format!("source name: {e}")))?;
            let driver = build_driver(&source_entry.driver, &entity, &source, &source_entry.settings)?;
            registry.register(entity.clone(), source, driver);
        }
    }
    Ok(registry)
}
