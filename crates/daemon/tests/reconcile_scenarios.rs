//! End-to-end reconciliation scenarios against memory sources.

mod common;

use std::time::Duration;

use tokio::sync::watch;

use ::common::diff::DiffOp;
use ::common::ident::ChangeNotification;

use retcon_daemon::database::WorkItem;
use retcon_daemon::worker::reconcile::{execute, Outcome};
use retcon_daemon::worker::spawn_workers;

use self::common::{doc, foreign_fid, internal_key, notify, setup, source, wait_until};

/// A notification for an unknown foreign key creates the internal key and
/// fans the document out to the other source.
#[tokio::test]
async fn test_unknown_key_creates_everywhere() {
    let env = setup().await;
    env.db1.seed("1", doc(&[("name", "Alice")]));

    let outcome = notify(&env, "db1", "1").await.unwrap();
    let ik = match outcome {
        Outcome::Created(ik) => ik,
        other => panic!("expected Created, got {other:?}"),
    };

    // Both foreign keys recorded, the copy landed in db2, and the initial
    // document matches.
    let fid2 = foreign_fid(&env, &ik, "db2").await.expect("db2 binding");
    assert_eq!(env.db2.document(&fid2), Some(doc(&[("name", "Alice")])));
    assert_eq!(foreign_fid(&env, &ik, "db1").await.as_deref(), Some("1"));
    assert_eq!(
        env.state.database().get_initial(&ik).await.unwrap(),
        Some(doc(&[("name", "Alice")]))
    );
}

/// Non-conflicting edits from two sources merge and propagate to both.
#[tokio::test]
async fn test_non_conflicting_update_propagates() {
    let env = setup().await;
    env.db1.seed("1", doc(&[("name", "Alice"), ("city", "A")]));
    notify(&env, "db1", "1").await.unwrap();
    let ik = internal_key(&env, "db1", "1").await.unwrap();
    let fid2 = foreign_fid(&env, &ik, "db2").await.unwrap();

    // db1 moves the city; db2 learns the age.
    env.db1.seed("1", doc(&[("name", "Alice"), ("city", "B")]));
    env.db2.seed(
        fid2.clone(),
        doc(&[("name", "Alice"), ("city", "A"), ("age", "30")]),
    );

    let outcome = notify(&env, "db1", "1").await.unwrap();
    assert_eq!(outcome, Outcome::Updated(ik.clone()));

    let converged = doc(&[("age", "30"), ("city", "B"), ("name", "Alice")]);
    assert_eq!(env.db1.document("1"), Some(converged.clone()));
    assert_eq!(env.db2.document(&fid2), Some(converged.clone()));
    assert_eq!(
        env.state.database().get_initial(&ik).await.unwrap(),
        Some(converged)
    );
    assert!(env.state.database().list_conflicts().await.unwrap().is_empty());
}

/// Conflicting edits park a conflict record and leave both sources alone.
#[tokio::test]
async fn test_conflicting_update_parks() {
    let env = setup().await;
    env.db1.seed("1", doc(&[("x", "0")]));
    notify(&env, "db1", "1").await.unwrap();
    let ik = internal_key(&env, "db1", "1").await.unwrap();
    let fid2 = foreign_fid(&env, &ik, "db2").await.unwrap();

    env.db1.seed("1", doc(&[("x", "1")]));
    env.db2.seed(fid2.clone(), doc(&[("x", "2")]));

    let outcome = notify(&env, "db1", "1").await.unwrap();
    let diff_id = match outcome {
        Outcome::Conflicted(conflicted_ik, diff_id) => {
            assert_eq!(conflicted_ik, ik);
            diff_id
        }
        other => panic!("expected Conflicted, got {other:?}"),
    };

    // Sources untouched.
    assert_eq!(env.db1.document("1"), Some(doc(&[("x", "1")])));
    assert_eq!(env.db2.document(&fid2), Some(doc(&[("x", "2")])));

    let conflicts = env.state.database().list_conflicts().await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].diff_id, diff_id);
    assert_eq!(conflicts[0].ops.len(), 2);
    assert_eq!(conflicts[0].initial, doc(&[("x", "0")]));
}

/// Resolving a subset of a parked diff applies it everywhere and retires
/// the conflict.
#[tokio::test]
async fn test_resolve_applies_selected_ops() {
    let env = setup().await;
    env.db1.seed("1", doc(&[("x", "0")]));
    notify(&env, "db1", "1").await.unwrap();
    let ik = internal_key(&env, "db1", "1").await.unwrap();
    let fid2 = foreign_fid(&env, &ik, "db2").await.unwrap();

    env.db1.seed("1", doc(&[("x", "1")]));
    env.db2.seed(fid2.clone(), doc(&[("x", "2")]));
    notify(&env, "db1", "1").await.unwrap();

    let conflicts = env.state.database().list_conflicts().await.unwrap();
    let record = &conflicts[0];

    // Accept db1's operation (the insert of "1"), as the resolve request
    // handler would, then drain the queued Apply item like a worker.
    let (op_id, _) = record
        .ops
        .iter()
        .find(|(_, op)| matches!(op, DiffOp::Insert { value, .. } if value == "1"))
        .expect("db1's op present");
    let db = env.state.database();
    let item = db
        .resolve_and_enqueue_apply(record.diff_id, &[*op_id])
        .await
        .unwrap();

    let lease = db.try_claim(60).await.unwrap().unwrap();
    assert_eq!(lease.item, item);
    let outcome = execute(&env.state, &lease.item).await.unwrap();
    assert_eq!(outcome, Outcome::Applied(record.diff_id));
    db.complete(&lease).await.unwrap();

    let resolved = doc(&[("x", "1")]);
    assert_eq!(env.db1.document("1"), Some(resolved.clone()));
    assert_eq!(env.db2.document(&fid2), Some(resolved.clone()));
    assert_eq!(db.get_initial(&ik).await.unwrap(), Some(resolved));
    assert!(db.list_conflicts().await.unwrap().is_empty());
}

/// A parked diff usually mixes accepted and rejected ops. Resolving it must
/// apply the merge's own accepted ops alongside the operator's selection,
/// not just the selection.
#[tokio::test]
async fn test_resolve_keeps_non_conflicting_edits() {
    let env = setup().await;
    env.db1.seed("1", doc(&[("x", "0"), ("city", "A")]));
    notify(&env, "db1", "1").await.unwrap();
    let ik = internal_key(&env, "db1", "1").await.unwrap();
    let fid2 = foreign_fid(&env, &ik, "db2").await.unwrap();

    // x conflicts; the city move from db1 is clean and gets accepted when
    // the conflict parks.
    env.db1.seed("1", doc(&[("x", "1"), ("city", "B")]));
    env.db2.seed(fid2.clone(), doc(&[("x", "2"), ("city", "A")]));
    let outcome = notify(&env, "db1", "1").await.unwrap();
    assert!(matches!(outcome, Outcome::Conflicted(_, _)));

    let db = env.state.database();
    let conflicts = db.list_conflicts().await.unwrap();
    let record = &conflicts[0];

    // Only the conflicted pair is pending; the city op is already accepted.
    assert_eq!(record.ops.len(), 2);
    assert!(record
        .ops
        .iter()
        .all(|(_, op)| op.path() == &::common::document::DocumentPath::root("x")));

    let (op_id, _) = record
        .ops
        .iter()
        .find(|(_, op)| matches!(op, DiffOp::Insert { value, .. } if value == "1"))
        .expect("db1's op present");
    let item = db
        .resolve_and_enqueue_apply(record.diff_id, &[*op_id])
        .await
        .unwrap();

    let lease = db.try_claim(60).await.unwrap().unwrap();
    assert_eq!(lease.item, item);
    execute(&env.state, &lease.item).await.unwrap();
    db.complete(&lease).await.unwrap();

    // The clean city edit survives the resolution.
    let resolved = doc(&[("city", "B"), ("x", "1")]);
    assert_eq!(env.db1.document("1"), Some(resolved.clone()));
    assert_eq!(env.db2.document(&fid2), Some(resolved.clone()));
    assert_eq!(db.get_initial(&ik).await.unwrap(), Some(resolved));
    assert!(db.list_conflicts().await.unwrap().is_empty());
}

/// A document that vanished from its source is deleted from every other
/// source, and the internal key is purged.
#[tokio::test]
async fn test_vanished_source_deletes_everywhere() {
    let env = setup().await;
    env.db1.seed("1", doc(&[("name", "Alice")]));
    notify(&env, "db1", "1").await.unwrap();
    let ik = internal_key(&env, "db1", "1").await.unwrap();
    let fid2 = foreign_fid(&env, &ik, "db2").await.unwrap();

    env.db1.remove("1");
    let outcome = notify(&env, "db1", "1").await.unwrap();
    assert_eq!(outcome, Outcome::Deleted(ik.clone()));

    assert_eq!(env.db2.document(&fid2), None);
    assert!(internal_key(&env, "db1", "1").await.is_none());
    assert_eq!(env.state.database().get_initial(&ik).await.unwrap(), None);
}

/// While one worker holds an internal key's lock, a second cycle for the
/// same key is refused instead of overlapping.
#[tokio::test]
async fn test_same_key_never_runs_concurrently() {
    let env = setup().await;
    env.db1.seed("1", doc(&[("name", "Alice")]));
    notify(&env, "db1", "1").await.unwrap();
    let ik = internal_key(&env, "db1", "1").await.unwrap();

    let _guard = env
        .state
        .locks()
        .try_acquire(retcon_daemon::worker::locks::LockKey::internal(&ik))
        .unwrap();

    match notify(&env, "db1", "1").await {
        Err(retcon_daemon::worker::reconcile::ItemError::Busy) => {}
        other => panic!("expected Busy, got {other:?}"),
    }
}

/// A timed-out set abandons the item; redelivery retries it and the update
/// metric counts the successful cycle exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_source_timeout_retries_via_queue() {
    let env = setup().await;
    env.db1.seed("1", doc(&[("name", "Alice")]));
    notify(&env, "db1", "1").await.unwrap();
    let ik = internal_key(&env, "db1", "1").await.unwrap();
    let fid2 = foreign_fid(&env, &ik, "db2").await.unwrap();

    // The next db2 write stalls past the 100ms source timeout.
    env.db1.seed("1", doc(&[("name", "Bob")]));
    env.db2.delay_next_sets(1, Duration::from_millis(500));

    let item = WorkItem::Process(ChangeNotification::new(
        env.entity.clone(),
        source("db1"),
        "1",
    ));
    env.state.database().enqueue(&item).await.unwrap();
    env.state.wake_workers();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = spawn_workers(&env.state, 1, shutdown_rx);

    let db2 = env.db2.clone();
    wait_until("db2 to converge after retry", move || {
        db2.document(&fid2) == Some(doc(&[("name", "Bob")]))
    })
    .await;

    let _ = shutdown_tx.send(true);
    for worker in workers {
        let _ = worker.await;
    }

    assert_eq!(
        env.state
            .metrics()
            .counter("entity.customer.updates")
            .value(),
        1
    );
    assert_eq!(
        env.state
            .metrics()
            .counter("source.db2.timeouts")
            .value(),
        1
    );
    assert_eq!(env.state.database().queue_depth().await.unwrap(), 0);
}
