//! Reconciliation worker pool.
//!
//! Each worker runs the dequeue/process cycle against the shared durable
//! queue: claim the next item, run the state machine under the
//! per-reconciliation timeout, then complete, abandon, or dead-letter it.
//! The cancellation flag is checked at every suspension point; in-flight
//! source calls finish under their own timeout.

pub mod locks;
pub mod reconcile;

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::database::{Abandoned, Lease};
use crate::state::State;

use reconcile::{execute, ItemError};

/// How long an idle worker waits before re-polling the queue. Wake signals
/// from enqueuers cut the wait short.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Backoff after a lock collision.
const BUSY_BACKOFF: Duration = Duration::from_millis(100);

/// Base backoff when the store is unavailable; doubles per consecutive
/// failure, capped at ten seconds.
const STORE_BACKOFF: Duration = Duration::from_millis(250);
const STORE_BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Spawn `count` workers reading from the shared queue.
pub fn spawn_workers(
    state: &State,
    count: usize,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|id| {
            let state = state.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(run_worker(id, state, shutdown))
        })
        .collect()
}

async fn run_worker(id: usize, state: State, mut shutdown: watch::Receiver<bool>) {
    tracing::debug!("worker {id} started");
    let wake = state.wake_receiver();
    let mut store_failures = 0u32;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let lease = match state.database().try_claim(state.tuning().lease_secs).await {
            Ok(lease) => {
                store_failures = 0;
                lease
            }
            Err(e) => {
                // The store is shared; pause this worker and try again.
                store_failures += 1;
                let backoff = store_backoff(store_failures);
                tracing::warn!("worker {id}: store unavailable, pausing {backoff:?}: {e}");
                if wait(&mut shutdown, &wake, backoff).await {
                    break;
                }
                continue;
            }
        };

        let Some(lease) = lease else {
            if wait(&mut shutdown, &wake, POLL_INTERVAL).await {
                break;
            }
            continue;
        };

        handle_item(id, &state, lease).await;

        if let Ok(depth) = state.database().queue_depth().await {
            state.metrics().gauge("queue.depth").set(depth);
        }
    }
    tracing::debug!("worker {id} stopped");
}

async fn handle_item(id: usize, state: &State, lease: Lease) {
    let result = match tokio::time::timeout(
        state.tuning().reconcile_timeout,
        execute(state, &lease.item),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(ItemError::Timeout),
    };

    match result {
        Ok(outcome) => {
            tracing::debug!("worker {id}: item {} done: {:?}", lease.item_id, outcome);
            if let Err(e) = state.database().complete(&lease).await {
                tracing::warn!("worker {id}: completing item {} failed: {e}", lease.item_id);
            }
        }
        Err(e) if e.is_fatal() => {
            tracing::error!("worker {id}: item {} failed fatally: {e}", lease.item_id);
            state.metrics().counter("worker.fatal").increment();
            state
                .metrics()
                .entity_counter(lease.item.entity(), "failures")
                .increment();
            if let Err(e) = state.database().dead_letter(&lease, &e.to_string()).await {
                tracing::warn!(
                    "worker {id}: dead-lettering item {} failed: {e}",
                    lease.item_id
                );
            }
        }
        Err(e) => {
            if matches!(e, ItemError::Busy) {
                tokio::time::sleep(BUSY_BACKOFF).await;
            }
            match state
                .database()
                .abandon(&lease, &e.to_string(), state.tuning().retry_cap)
                .await
            {
                Ok(Abandoned::Requeued { attempts }) => {
                    tracing::debug!(
                        "worker {id}: item {} abandoned (attempt {attempts}): {e}",
                        lease.item_id
                    );
                }
                Ok(Abandoned::DeadLettered) => {
                    state.metrics().counter("worker.fatal").increment();
                    state
                        .metrics()
                        .entity_counter(lease.item.entity(), "failures")
                        .increment();
                }
                Err(store_err) => {
                    // The lease expires on its own; the item comes back.
                    tracing::warn!(
                        "worker {id}: abandoning item {} failed: {store_err}",
                        lease.item_id
                    );
                }
            }
        }
    }
}

/// Sleep until the timeout, a wake signal, or shutdown. Returns true when
/// shutting down.
async fn wait(
    shutdown: &mut watch::Receiver<bool>,
    wake: &flume::Receiver<()>,
    timeout: Duration,
) -> bool {
    tokio::select! {
        _ = shutdown.changed() => *shutdown.borrow(),
        _ = wake.recv_async() => false,
        _ = tokio::time::sleep(timeout) => false,
    }
}

fn store_backoff(failures: u32) -> Duration {
    STORE_BACKOFF
        .saturating_mul(2u32.saturating_pow(failures.saturating_sub(1).min(16)))
        .min(STORE_BACKOFF_CAP)
}
