//! Shared helpers for integration tests: an in-memory store, two memory
//! sources for a `customer` entity, and direct access to the state machine.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ::common::document::{Document, DocumentPath};
use ::common::ident::{ChangeNotification, EntityName, ForeignKey, InternalKey, SourceName};
use ::common::merge::IgnoreConflicts;
use ::common::source::SourceRegistry;

use retcon_daemon::database::{Database, WorkItem};
use retcon_daemon::sources::MemorySource;
use retcon_daemon::state::{State, Tuning};
use retcon_daemon::worker::reconcile::{execute, ItemError, Outcome};

pub struct TestEnv {
    pub state: State,
    pub entity: EntityName,
    pub db1: Arc<MemorySource>,
    pub db2: Arc<MemorySource>,
}

/// Tight timeouts so failure-injection tests run quickly.
pub fn test_tuning() -> Tuning {
    Tuning {
        source_timeout: Duration::from_millis(100),
        reconcile_timeout: Duration::from_secs(5),
        retry_cap: 5,
        lease_secs: 60,
    }
}

/// An entity `customer` mirrored across memory sources `db1` and `db2`,
/// reconciled under the default policy.
pub async fn setup() -> TestEnv {
    let entity = EntityName::new("customer").unwrap();
    let db1 = MemorySource::new(entity.clone(), source("db1"));
    let db2 = MemorySource::new(entity.clone(), source("db2"));

    let mut registry = SourceRegistry::new();
    registry.register(entity.clone(), source("db1"), db1.clone());
    registry.register(entity.clone(), source("db2"), db2.clone());

    let database = Database::in_memory().await.unwrap();
    let state = State::new(
        database,
        Arc::new(registry),
        Arc::new(IgnoreConflicts::new()),
        test_tuning(),
    );

    TestEnv {
        state,
        entity,
        db1,
        db2,
    }
}

pub fn source(name: &str) -> SourceName {
    SourceName::new(name).unwrap()
}

pub fn doc(entries: &[(&str, &str)]) -> Document {
    entries
        .iter()
        .map(|(path, value)| {
            (
                DocumentPath::from_dotted(path).unwrap(),
                value.to_string(),
            )
        })
        .collect()
}

/// Run one Process cycle synchronously, as a worker would.
pub async fn notify(env: &TestEnv, source_name: &str, fid: &str) -> Result<Outcome, ItemError> {
    let item = WorkItem::Process(ChangeNotification::new(
        env.entity.clone(),
        source(source_name),
        fid,
    ));
    execute(&env.state, &item).await
}

/// The internal key bound to a foreign id, if any.
pub async fn internal_key(env: &TestEnv, source_name: &str, fid: &str) -> Option<InternalKey> {
    env.state
        .database()
        .lookup_internal(&ForeignKey::new(
            env.entity.clone(),
            source(source_name),
            fid,
        ))
        .await
        .unwrap()
}

/// The foreign id a source holds for an internal key, if any.
pub async fn foreign_fid(env: &TestEnv, ik: &InternalKey, source_name: &str) -> Option<String> {
    env.state
        .database()
        .lookup_foreign(ik, &source(source_name))
        .await
        .unwrap()
        .map(|fk| fk.fid)
}

/// Poll until `check` passes or the deadline expires.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if check() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
