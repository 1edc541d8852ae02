//! Daemon configuration.
//!
//! Loaded from a TOML file; `RETCON_CONFIG` overrides the `--config` flag.
//! A configuration is a list of entities, each with an ordered list of
//! sources, plus server, store, and tuning sections:
//!
//! ```toml
//! workers = 4
//! policy = "ignoreConflicts"
//!
//! [server]
//! address = "tcp://0.0.0.0:60179"
//!
//! [store]
//! dsn = "sqlite://retcon.db"
//!
//! [source]
//! timeout_ms = 30000
//!
//! [[entity]]
//! name = "customer"
//!
//!   [[entity.source]]
//!   name = "db1"
//!   driver = "memory"
//! ```

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

use common::document::DocumentPath;
use common::ident::{EntityName, SourceName};
use common::merge::{IgnoreConflicts, MergePolicy, RejectPaths, TrustSource};

/// Fatal configuration problems, surfaced at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {err}")]
    Io {
        path: PathBuf,
        err: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Worker count. Defaults to the number of CPU cores, minimum 2.
    pub workers: Option<usize>,

    #[serde(default)]
    pub policy: PolicySpec,

    pub server: ServerSection,
    pub store: StoreSection,

    #[serde(default)]
    pub source: SourceSection,

    #[serde(rename = "entity")]
    pub entities: Vec<EntitySection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    /// Listen address, e.g. `tcp://0.0.0.0:60179`.
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreSection {
    /// Store DSN, e.g. `sqlite://retcon.db`.
    pub dsn: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SourceSection {
    /// Per-source call timeout in milliseconds.
    pub timeout_ms: u64,
    /// Per-reconciliation timeout in milliseconds.
    pub reconcile_timeout_ms: u64,
    /// Attempts before an item is dead-lettered.
    pub retry_cap: u32,
}

impl Default for SourceSection {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            reconcile_timeout_ms: 120_000,
            retry_cap: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntitySection {
    pub name: String,
    #[serde(rename = "source", default)]
    pub sources: Vec<SourceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceEntry {
    pub name: String,
    /// Driver name, e.g. `memory`.
    pub driver: String,
    /// Opaque driver settings.
    #[serde(default)]
    pub settings: HashMap<String, String>,
}

/// Merge policy selection.
///
/// Written as a string: `ignoreConflicts`, `trustSource:NAME`, or
/// `reject:PATH,PATH,...` with dotted paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum PolicySpec {
    #[default]
    IgnoreConflicts,
    TrustSource(String),
    Reject(Vec<String>),
}

impl TryFrom<String> for PolicySpec {
    type Error = String;

    fn try_from(s: String) -> Result<Self, String> {
        if s == "ignoreConflicts" {
            return Ok(PolicySpec::IgnoreConflicts);
        }
        if let Some(source) = s.strip_prefix("trustSource:") {
            if source.is_empty() {
                return Err("trustSource: requires a source name".to_string());
            }
            return Ok(PolicySpec::TrustSource(source.to_string()));
        }
        if let Some(paths) = s.strip_prefix("reject:") {
            let paths: Vec<String> = paths
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
            if paths.is_empty() {
                return Err("reject: requires at least one path".to_string());
            }
            return Ok(PolicySpec::Reject(paths));
        }
        Err(format!("unknown policy {s:?}"))
    }
}

impl PolicySpec {
    /// Build the policy, validating names and paths.
    pub fn build(&self) -> Result<Arc<dyn MergePolicy>, ConfigError> {
        match self {
            PolicySpec::IgnoreConflicts => Ok(Arc::new(IgnoreConflicts::new())),
            PolicySpec::TrustSource(name) => {
                let source = SourceName::new(name.clone())
                    .map_err(|e| ConfigError::Invalid(format!("policy source: {e}")))?;
                Ok(Arc::new(TrustSource::new(source)))
            }
            PolicySpec::Reject(paths) => {
                let prefixes = paths
                    .iter()
                    .map(|p| {
                        DocumentPath::from_dotted(p)
                            .map_err(|e| ConfigError::Invalid(format!("policy path {p:?}: {e}")))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Arc::new(RejectPaths::new(prefixes)))
            }
        }
    }
}

impl Config {
    /// Read and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| ConfigError::Io {
            path: path.to_path_buf(),
            err,
        })?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a config from TOML text. Used by tests.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.entities.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one [[entity]] is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for entity in &self.entities {
            let entity_name = EntityName::new(entity.name.clone())
                .map_err(|e| ConfigError::Invalid(format!("entity name: {e}")))?;
            if entity.sources.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "entity {} has no sources",
                    entity.name
                )));
            }
            for source in &entity.sources {
                let source_name = SourceName::new(source.name.clone())
                    .map_err(|e| ConfigError::Invalid(format!("source name: {e}")))?;
                if source.driver.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "source {}/{} has no driver",
                        entity.name, source.name
                    )));
                }
                if !seen.insert((entity_name.clone(), source_name)) {
                    return Err(ConfigError::Invalid(format!(
                        "duplicate source {}/{}",
                        entity.name, source.name
                    )));
                }
            }
        }

        self.server_addr()?;
        self.policy()?;
        Ok(())
    }

    /// The socket address behind `server.address`.
    pub fn server_addr(&self) -> Result<SocketAddr, ConfigError> {
        let url = Url::parse(&self.server.address)
            .map_err(|e| ConfigError::Invalid(format!("server.address: {e}")))?;
        if url.scheme() != "tcp" {
            return Err(ConfigError::Invalid(format!(
                "server.address: unsupported scheme {:?}",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| ConfigError::Invalid("server.address: missing host".to_string()))?;
        let port = url
            .port()
            .ok_or_else(|| ConfigError::Invalid("server.address: missing port".to_string()))?;
        format!("{host}:{port}")
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("server.address: {e}")))
    }

    /// The configured merge policy.
    pub fn policy(&self) -> Result<Arc<dyn MergePolicy>, ConfigError> {
        self.policy.build()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
                .max(2)
        })
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.source.timeout_ms)
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_millis(self.source.reconcile_timeout_ms)
    }

    pub fn retry_cap(&self) -> u32 {
        self.source.retry_cap
    }
}

/// Resolve the config path: `RETCON_CONFIG` wins over `--config`.
pub fn resolve_config_path(flag: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
    if let Some(env) = std::env::var_os("RETCON_CONFIG") {
        return Ok(PathBuf::from(env));
    }
    flag.ok_or_else(|| {
        ConfigError::Invalid("no config file: pass --config or set RETCON_CONFIG".to_string())
    })
}
