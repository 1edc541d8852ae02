//! The per-item reconciliation state machine.
//!
//! A `Process` item resolves its foreign key and lands in one of three
//! states: *new* (never seen, copies fan out to every source), *updated*
//! (per-source diffs are merged and the result written back), or *vanished*
//! (the entity is deleted everywhere). An `Apply` item finishes a conflict
//! the operator has resolved.
//!
//! Every step runs under an advisory lock, so the effects on the external
//! sources form a linear history per internal key.

use thiserror::Error;

use common::diff::{apply, diff, Diff};
use common::document::Document;
use common::ident::{ChangeNotification, DiffId, EntityName, ForeignKey, InternalKey, SourceName};
use common::source::{with_timeout, SourceError, SourceErrorKind};

use crate::database::{StoreError, WorkItem};
use crate::state::State;

use super::locks::{LockGuard, LockKey};

/// What one item accomplished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A fresh internal key, with copies pushed to the other sources.
    Created(InternalKey),
    /// A clean merge, written back everywhere.
    Updated(InternalKey),
    /// The merge produced rejections; a conflict record was parked and no
    /// source was mutated.
    Conflicted(InternalKey, DiffId),
    /// The entity vanished from its source and was purged everywhere.
    Deleted(InternalKey),
    /// A resolved conflict was applied to every source.
    Applied(DiffId),
    /// Nothing to do.
    Skipped(&'static str),
}

/// Why an item failed. Decides between retry and dead-letter.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error("another worker holds the lock")]
    Busy,

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("reconciliation timed out")]
    Timeout,
}

impl ItemError {
    /// Fatal errors are dead-lettered immediately instead of retried.
    pub fn is_fatal(&self) -> bool {
        match self {
            ItemError::Invariant(_) => true,
            ItemError::Store(e) => !e.is_retryable(),
            ItemError::Source(e) => matches!(e.kind, SourceErrorKind::Unregistered),
            _ => false,
        }
    }
}

/// Run one work item to completion.
pub async fn execute(state: &State, item: &WorkItem) -> Result<Outcome, ItemError> {
    match item {
        WorkItem::Process(notification) => process(state, notification).await,
        WorkItem::Apply { key, diff_id, diff } => apply_resolution(state, key, *diff_id, diff).await,
    }
}

async fn process(state: &State, notification: &ChangeNotification) -> Result<Outcome, ItemError> {
    let fk = notification.foreign_key();
    if !state.registry().contains(&fk.entity, &fk.source) {
        return Err(SourceError::new(fk.source, SourceErrorKind::Unregistered).into());
    }

    match state.database().lookup_internal(&fk).await? {
        None => {
            let _guard = acquire(state, LockKey::foreign(&fk))?;
            create(state, &fk).await
        }
        Some(ik) => {
            let _guard = acquire(state, LockKey::internal(&ik))?;
            match source_get(state, &fk).await? {
                None => delete(state, &ik).await,
                Some(doc) => update(state, &ik, &fk.source, doc).await,
            }
        }
    }
}

/// First sighting of a foreign key: mint an internal key and fan the
/// document out to every other source.
///
/// A source that fails its copy is left unbound; the next notification for
/// the key heals it. Nothing is rolled back.
async fn create(state: &State, fk: &ForeignKey) -> Result<Outcome, ItemError> {
    let db = state.database();
    let ik = db.create_internal_key(&fk.entity).await?;
    db.record_foreign(&ik, fk).await?;

    // Authoritative current state, now that the key is ours.
    let Some(doc) = source_get(state, fk).await? else {
        // Vanished between the notification and the fetch.
        db.delete_internal(&ik).await?;
        return Ok(Outcome::Skipped("vanished before create"));
    };
    db.put_initial(&ik, &doc).await?;

    for source in state.registry().sources_for(&fk.entity) {
        if source == &fk.source {
            continue;
        }
        match source_set(state, &fk.entity, source, &doc, None).await {
            Ok(new_fk) => db.record_foreign(&ik, &new_fk).await?,
            Err(e) => {
                // Healed by the update path on the next notification.
                tracing::warn!("create: copy to {} failed, will retry later: {}", source, e);
            }
        }
    }

    tracing::info!("created {} from {}", ik, fk);
    state.metrics().entity_counter(&ik.entity, "creates").increment();
    Ok(Outcome::Created(ik))
}

/// A known key changed: fetch every copy, merge the per-source diffs, and
/// either write the merged document back everywhere or park a conflict.
async fn update(
    state: &State,
    ik: &InternalKey,
    trigger: &SourceName,
    trigger_doc: Document,
) -> Result<Outcome, ItemError> {
    let db = state.database();
    let sources = state.registry().sources_for(&ik.entity);
    if sources.is_empty() {
        return Err(ItemError::Invariant(format!("{ik} has no configured sources")));
    }

    // Current documents in configured source order. Sources that fail their
    // fetch drop out of this round; sources with no binding yet (a partial
    // create) or whose copy went missing take no part in the merge and are
    // rewritten from its result below.
    let mut docs: Vec<(SourceName, ForeignKey, Document)> = Vec::new();
    let mut unbound: Vec<SourceName> = Vec::new();
    let mut lost: Vec<(SourceName, ForeignKey)> = Vec::new();
    for source in sources {
        if source == trigger {
            let fk = db.lookup_foreign(ik, source).await?.ok_or_else(|| {
                ItemError::Invariant(format!("{ik} has no foreign key for trigger {source}"))
            })?;
            docs.push((source.clone(), fk, trigger_doc.clone()));
            continue;
        }
        match db.lookup_foreign(ik, source).await? {
            None => unbound.push(source.clone()),
            Some(fk) => match source_get(state, &fk).await {
                Ok(Some(doc)) => docs.push((source.clone(), fk, doc)),
                Ok(None) => lost.push((source.clone(), fk)),
                Err(e) => {
                    tracing::warn!("update: fetch from {} failed: {}", source, e);
                }
            },
        }
    }

    let initial = match db.get_initial(ik).await? {
        Some(doc) => doc,
        None => {
            // Bootstrap: adopt the first available document as the baseline.
            let doc = docs[0].2.clone();
            db.put_initial(ik, &doc).await?;
            doc
        }
    };

    let diffs: Vec<Diff<SourceName>> = docs
        .iter()
        .map(|(source, _, doc)| diff(&initial, doc).map_label(|()| source.clone()))
        .collect();
    let merged = state.policy().merge(&initial, &diffs);

    if !merged.is_clean() {
        // Park the conflict; sources stay untouched until an operator
        // resolves it.
        let mut ops = merged.accepted.ops.clone();
        let mut flags = vec![true; ops.len()];
        for rejected in &merged.rejected {
            ops.extend(rejected.ops.iter().cloned());
            flags.extend(std::iter::repeat(false).take(rejected.ops.len()));
        }
        let (diff_id, _) = db.put_diff(ik, &Diff::new((), ops), &flags).await?;
        tracing::info!("parked conflict {} for {}", diff_id, ik);
        state.metrics().entity_counter(&ik.entity, "conflicts").increment();
        return Ok(Outcome::Conflicted(ik.clone(), diff_id));
    }

    if merged.accepted.is_empty() && unbound.is_empty() && lost.is_empty() {
        return Ok(Outcome::Skipped("no changes"));
    }

    let new_doc = apply(&merged.accepted, &initial);

    // Write back everywhere. Any failure abandons the item; the whole
    // update is recomputed on redelivery, which converges because sources
    // already written now diff to the accepted ops.
    for (source, fk, _) in &docs {
        source_set(state, &ik.entity, source, &new_doc, Some(fk)).await?;
    }
    for (source, fk) in &lost {
        source_set(state, &ik.entity, source, &new_doc, Some(fk)).await?;
    }
    for source in &unbound {
        let new_fk = source_set(state, &ik.entity, source, &new_doc, None).await?;
        db.record_foreign(ik, &new_fk).await?;
    }

    db.put_initial(ik, &new_doc).await?;
    if !merged.accepted.is_empty() {
        let flags = vec![true; merged.accepted.ops.len()];
        db.put_diff(ik, &merged.accepted, &flags).await?;
    }

    tracing::info!("updated {} across {} sources", ik, docs.len() + unbound.len());
    state.metrics().entity_counter(&ik.entity, "updates").increment();
    Ok(Outcome::Updated(ik.clone()))
}

/// The entity vanished from its source: delete every other copy, then purge
/// the key and its archives.
async fn delete(state: &State, ik: &InternalKey) -> Result<Outcome, ItemError> {
    let db = state.database();
    for source in state.registry().sources_for(&ik.entity) {
        if let Some(fk) = db.lookup_foreign(ik, source).await? {
            source_delete(state, &fk).await?;
        }
    }
    db.delete_internal(ik).await?;

    tracing::info!("deleted {} everywhere", ik);
    state.metrics().entity_counter(&ik.entity, "deletes").increment();
    Ok(Outcome::Deleted(ik.clone()))
}

/// Apply an operator-selected subset of a parked diff: rebuild the document
/// from the stored initial, push it to every source, and retire the diff.
async fn apply_resolution(
    state: &State,
    ik: &InternalKey,
    diff_id: DiffId,
    resolution: &Diff<()>,
) -> Result<Outcome, ItemError> {
    let _guard = acquire(state, LockKey::internal(ik))?;
    let db = state.database();

    let initial = db.get_initial(ik).await?.ok_or_else(|| {
        ItemError::Invariant(format!("apply {diff_id}: {ik} has no initial document"))
    })?;
    let new_doc = apply(resolution, &initial);

    for source in state.registry().sources_for(&ik.entity) {
        match db.lookup_foreign(ik, source).await? {
            Some(fk) => {
                source_set(state, &ik.entity, source, &new_doc, Some(&fk)).await?;
            }
            None => {
                let new_fk = source_set(state, &ik.entity, source, &new_doc, None).await?;
                db.record_foreign(ik, &new_fk).await?;
            }
        }
    }

    db.put_initial(ik, &new_doc).await?;
    db.mark_diff_applied(diff_id).await?;

    tracing::info!("applied resolution {} for {}", diff_id, ik);
    state.metrics().entity_counter(&ik.entity, "applies").increment();
    Ok(Outcome::Applied(diff_id))
}

fn acquire(state: &State, key: LockKey) -> Result<LockGuard, ItemError> {
    state.locks().try_acquire(key).ok_or(ItemError::Busy)
}

async fn source_get(state: &State, fk: &ForeignKey) -> Result<Option<Document>, SourceError> {
    let driver = state.registry().get(&fk.entity, &fk.source)?;
    let result = with_timeout(
        &fk.source,
        state.tuning().source_timeout,
        driver.get(fk),
    )
    .await;
    observe(state, &fk.source, &result);
    result
}

async fn source_set(
    state: &State,
    entity: &EntityName,
    source: &SourceName,
    doc: &Document,
    fk: Option<&ForeignKey>,
) -> Result<ForeignKey, SourceError> {
    let driver = state.registry().get(entity, source)?;
    let result = with_timeout(source, state.tuning().source_timeout, driver.set(doc, fk)).await;
    observe(state, source, &result);
    result
}

async fn source_delete(state: &State, fk: &ForeignKey) -> Result<(), SourceError> {
    let driver = state.registry().get(&fk.entity, &fk.source)?;
    let result = with_timeout(
        &fk.source,
        state.tuning().source_timeout,
        driver.delete(fk),
    )
    .await;
    observe(state, &fk.source, &result);
    result
}

fn observe<T>(state: &State, source: &SourceName, result: &Result<T, SourceError>) {
    if let Err(e) = result {
        let verb = match e.kind {
            SourceErrorKind::Timeout(_) => "timeouts",
            _ => "errors",
        };
        state.metrics().source_counter(source, verb).increment();
    }
}
