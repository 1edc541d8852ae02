//! Process-wide metrics registry.
//!
//! Initialised once at startup and handed to workers and the server as an
//! owned handle. Counters and gauges are plain atomics, so recording is safe
//! from any task and has no transactional ties to the store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use common::ident::{EntityName, SourceName};

/// Shared handle to the registry. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    counters: RwLock<HashMap<String, Arc<AtomicU64>>>,
    gauges: RwLock<HashMap<String, Arc<AtomicI64>>>,
}

/// A monotonically increasing counter.
#[derive(Debug, Clone)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn increment(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A gauge holding the latest observed value.
#[derive(Debug, Clone)]
pub struct Gauge(Arc<AtomicI64>);

impl Gauge {
    pub fn set(&self, v: i64) {
        self.0.store(v, Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the counter with the given name.
    pub fn counter(&self, name: &str) -> Counter {
        if let Some(c) = self.inner.counters.read().get(name) {
            return Counter(c.clone());
        }
        let mut counters = self.inner.counters.write();
        let c = counters.entry(name.to_string()).or_default();
        Counter(c.clone())
    }

    /// Get or create the gauge with the given name.
    pub fn gauge(&self, name: &str) -> Gauge {
        if let Some(g) = self.inner.gauges.read().get(name) {
            return Gauge(g.clone());
        }
        let mut gauges = self.inner.gauges.write();
        let g = gauges.entry(name.to_string()).or_default();
        Gauge(g.clone())
    }

    /// Per-entity counter, e.g. `entity.customer.updates`.
    pub fn entity_counter(&self, entity: &EntityName, verb: &str) -> Counter {
        self.counter(&format!("entity.{entity}.{verb}"))
    }

    /// Per-source counter, e.g. `source.db1.errors`.
    pub fn source_counter(&self, source: &SourceName, verb: &str) -> Counter {
        self.counter(&format!("source.{source}.{verb}"))
    }

    /// Current counter values, sorted by name.
    pub fn counter_snapshot(&self) -> BTreeMap<String, u64> {
        self.inner
            .counters
            .read()
            .iter()
            .map(|(name, c)| (name.clone(), c.load(Ordering::Relaxed)))
            .collect()
    }

    /// Current gauge values, sorted by name.
    pub fn gauge_snapshot(&self) -> BTreeMap<String, i64> {
        self.inner
            .gauges
            .read()
            .iter()
            .map(|(name, g)| (name.clone(), g.load(Ordering::Relaxed)))
            .collect()
    }
}
