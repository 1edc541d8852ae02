//! Diff archive, conflict listing, and resolution.
//!
//! Every merge is archived: clean merges with all ops accepted, conflicted
//! merges with the rejected ops left unaccepted. A diff surfaces in the
//! conflict list while it is unresolved and still has at least one
//! unaccepted op.

use sqlx::{Row, Sqlite, Transaction};

use common::conflict::ConflictRecord;
use common::diff::{Diff, DiffOp};
use common::document::Document;
use common::ident::{DiffId, DiffOpId, EntityName, InternalKey};

use super::queue_queries::encode_item;
use super::{unix_now, Database, StoreError, WorkItem};

/// A diff as stored, with per-op ids and accepted flags.
#[derive(Debug, Clone)]
pub struct StoredDiff {
    pub diff_id: DiffId,
    pub key: InternalKey,
    pub is_resolved: bool,
    pub ops: Vec<(DiffOpId, DiffOp, bool)>,
}

impl StoredDiff {
    /// The full edit script, in stored op order.
    pub fn diff(&self) -> Diff<()> {
        Diff::new((), self.ops.iter().map(|(_, op, _)| op.clone()).collect())
    }

    /// The ops still awaiting a decision.
    pub fn pending_ops(&self) -> Vec<(DiffOpId, DiffOp)> {
        self.ops
            .iter()
            .filter(|(_, _, accepted)| !accepted)
            .map(|(id, op, _)| (*id, op.clone()))
            .collect()
    }
}

fn decode_op(json: &str) -> Result<DiffOp, StoreError> {
    serde_json::from_str(json).map_err(|e| StoreError::Corrupt {
        table: "diff_ops",
        detail: format!("decode op: {e}"),
    })
}

/// Shared resolve step: validate the diff and the chosen ops, mark the
/// chosen ops accepted, and retire the diff. Returns the diff's key and its
/// ops with their pre-resolve accepted flags, in stored order.
async fn resolve_ops(
    tx: &mut Transaction<'_, Sqlite>,
    diff_id: DiffId,
    accepted_op_ids: &[DiffOpId],
) -> Result<(InternalKey, Vec<(DiffOpId, DiffOp, bool)>), StoreError> {
    let header = sqlx::query(
        r#"
        SELECT entity, internal_id, is_resolved FROM diffs WHERE diff_id = ?1
        "#,
    )
    .bind(diff_id.0)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(StoreError::UnknownDiff(diff_id))?;
    if header.get::<i64, _>("is_resolved") != 0 {
        return Err(StoreError::AlreadyResolved(diff_id));
    }
    let entity: String = header.get("entity");
    let entity = EntityName::new(entity).map_err(|e| StoreError::Corrupt {
        table: "diffs",
        detail: format!("bad entity label: {e}"),
    })?;
    let key = InternalKey::new(entity, header.get::<i64, _>("internal_id") as u64);

    let rows = sqlx::query(
        r#"
        SELECT op_id, accepted, op FROM diff_ops
        WHERE diff_id = ?1
        ORDER BY op_id
        "#,
    )
    .bind(diff_id.0)
    .fetch_all(&mut **tx)
    .await?;
    let mut ops = Vec::with_capacity(rows.len());
    for row in rows {
        ops.push((
            DiffOpId(row.get("op_id")),
            decode_op(&row.get::<String, _>("op"))?,
            row.get::<i64, _>("accepted") != 0,
        ));
    }

    for op_id in accepted_op_ids {
        if !ops.iter().any(|(id, _, _)| id == op_id) {
            return Err(StoreError::ForeignOp {
                diff: diff_id,
                op: *op_id,
            });
        }
        sqlx::query("UPDATE diff_ops SET accepted = 1 WHERE op_id = ?1")
            .bind(op_id.0)
            .execute(&mut **tx)
            .await?;
    }

    sqlx::query("UPDATE diffs SET is_resolved = 1 WHERE diff_id = ?1")
        .bind(diff_id.0)
        .execute(&mut **tx)
        .await?;

    Ok((key, ops))
}

impl Database {
    /// Archive a diff for `ik`, recording each op with its accepted flag.
    ///
    /// `accepted` must align with `diff.ops`; ops marked `false` make the
    /// diff a pending conflict.
    pub async fn put_diff(
        &self,
        ik: &InternalKey,
        diff: &Diff<()>,
        accepted: &[bool],
    ) -> Result<(DiffId, Vec<DiffOpId>), StoreError> {
        debug_assert_eq!(diff.ops.len(), accepted.len());
        let mut tx = self.begin().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO diffs (entity, internal_id, created_at)
            VALUES (?1, ?2, ?3)
            RETURNING diff_id
            "#,
        )
        .bind(ik.entity.as_str())
        .bind(ik.id as i64)
        .bind(unix_now())
        .fetch_one(&mut *tx)
        .await?;
        let diff_id = DiffId(row.get("diff_id"));

        let mut op_ids = Vec::with_capacity(diff.ops.len());
        for (op, accepted) in diff.ops.iter().zip(accepted) {
            let json = serde_json::to_string(op).map_err(|e| StoreError::Corrupt {
                table: "diff_ops",
                detail: format!("encode op: {e}"),
            })?;
            let row = sqlx::query(
                r#"
                INSERT INTO diff_ops (diff_id, accepted, op)
                VALUES (?1, ?2, ?3)
                RETURNING op_id
                "#,
            )
            .bind(diff_id.0)
            .bind(*accepted as i64)
            .bind(json)
            .fetch_one(&mut *tx)
            .await?;
            op_ids.push(DiffOpId(row.get("op_id")));
        }

        tx.commit().await?;
        Ok((diff_id, op_ids))
    }

    /// Load one stored diff with its ops, in op order.
    pub async fn get_diff(&self, diff_id: DiffId) -> Result<Option<StoredDiff>, StoreError> {
        let header = sqlx::query(
            r#"
            SELECT entity, internal_id, is_resolved FROM diffs WHERE diff_id = ?1
            "#,
        )
        .bind(diff_id.0)
        .fetch_optional(&**self)
        .await?;

        let Some(header) = header else {
            return Ok(None);
        };
        let entity: String = header.get("entity");
        let entity = EntityName::new(entity).map_err(|e| StoreError::Corrupt {
            table: "diffs",
            detail: format!("bad entity label: {e}"),
        })?;
        let key = InternalKey::new(entity, header.get::<i64, _>("internal_id") as u64);

        let rows = sqlx::query(
            r#"
            SELECT op_id, accepted, op FROM diff_ops
            WHERE diff_id = ?1
            ORDER BY op_id
            "#,
        )
        .bind(diff_id.0)
        .fetch_all(&**self)
        .await?;

        let mut ops = Vec::with_capacity(rows.len());
        for row in rows {
            ops.push((
                DiffOpId(row.get("op_id")),
                decode_op(&row.get::<String, _>("op"))?,
                row.get::<i64, _>("accepted") != 0,
            ));
        }

        Ok(Some(StoredDiff {
            diff_id,
            key,
            is_resolved: header.get::<i64, _>("is_resolved") != 0,
            ops,
        }))
    }

    /// Unresolved diffs that still carry at least one unaccepted op, with
    /// the initial document they were computed against.
    pub async fn list_conflicts(&self) -> Result<Vec<ConflictRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT d.diff_id, i.document
            FROM diffs d
            JOIN initial_documents i
              ON i.entity = d.entity AND i.internal_id = d.internal_id
            WHERE d.is_resolved = 0
              AND EXISTS (
                  SELECT 1 FROM diff_ops o
                  WHERE o.diff_id = d.diff_id AND o.accepted = 0
              )
            ORDER BY d.diff_id
            "#,
        )
        .fetch_all(&**self)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let diff_id = DiffId(row.get("diff_id"));
            let initial: Document = serde_json::from_str(&row.get::<String, _>("document"))
                .map_err(|e| StoreError::Corrupt {
                    table: "initial_documents",
                    detail: format!("decode document: {e}"),
                })?;
            let stored = self
                .get_diff(diff_id)
                .await?
                .ok_or(StoreError::UnknownDiff(diff_id))?;
            records.push(ConflictRecord {
                diff_id,
                key: stored.key.clone(),
                initial,
                diff: stored.diff(),
                ops: stored.pending_ops(),
            });
        }
        Ok(records)
    }

    /// Resolve a conflict: mark the chosen ops accepted and retire the diff
    /// from the conflict list.
    ///
    /// Validates that the diff exists, is still unresolved, and that every
    /// chosen op belongs to it.
    pub async fn mark_resolved(
        &self,
        diff_id: DiffId,
        accepted_op_ids: &[DiffOpId],
    ) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        resolve_ops(&mut tx, diff_id, accepted_op_ids).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Resolve a conflict and queue its application in one transaction.
    ///
    /// The chosen ops are marked accepted, the diff retired from the
    /// conflict list, and the `Apply` work item enqueued under the same
    /// commit, so a crash between the two can never close the conflict
    /// without queueing the write-back.
    ///
    /// The Apply diff carries every accepted op: the ones the merge already
    /// accepted when the conflict was parked plus the operator's selection,
    /// in stored op order.
    pub async fn resolve_and_enqueue_apply(
        &self,
        diff_id: DiffId,
        accepted_op_ids: &[DiffOpId],
    ) -> Result<WorkItem, StoreError> {
        let mut tx = self.begin().await?;
        let (key, ops) = resolve_ops(&mut tx, diff_id, accepted_op_ids).await?;

        let accepted: Vec<DiffOp> = ops
            .iter()
            .filter(|(id, _, accepted)| *accepted || accepted_op_ids.contains(id))
            .map(|(_, op, _)| op.clone())
            .collect();
        let item = WorkItem::Apply {
            key,
            diff_id,
            diff: Diff::new((), accepted),
        };

        sqlx::query(
            r#"
            INSERT INTO work_queue (ordering_key, payload, created_at)
            VALUES (?1, ?2, ?3)
            "#,
        )
        .bind(item.ordering_key())
        .bind(encode_item(&item)?)
        .bind(unix_now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(item)
    }

    /// Mark every op of a diff accepted. The final step of applying a
    /// resolution.
    pub async fn mark_diff_applied(&self, diff_id: DiffId) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        sqlx::query("UPDATE diff_ops SET accepted = 1 WHERE diff_id = ?1")
            .bind(diff_id.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE diffs SET is_resolved = 1 WHERE diff_id = ?1")
            .bind(diff_id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
