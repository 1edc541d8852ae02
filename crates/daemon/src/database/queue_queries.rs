//! Durable FIFO work queue.
//!
//! Items live in the same store as the identifier tables, so an enqueue can
//! share a transaction with any other store write. Delivery is strictly
//! first-in-first-out per ordering key: only the oldest live item of a key
//! can be claimed, so same-key items never overlap or reorder. Items for
//! different keys interleave arbitrarily.

use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

use common::diff::Diff;
use common::ident::{ChangeNotification, DiffId, EntityName, InternalKey};

use super::{unix_now, Database, StoreError};

/// A unit of worker activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkItem {
    /// Run one reconciliation cycle for a change notification.
    Process(ChangeNotification),
    /// Apply a resolved subset of a parked diff to every source.
    Apply {
        key: InternalKey,
        diff_id: DiffId,
        diff: Diff<()>,
    },
}

impl WorkItem {
    /// Items sharing an ordering key are delivered in enqueue order.
    pub fn ordering_key(&self) -> String {
        match self {
            WorkItem::Process(n) => format!("{}/{}/{}", n.entity, n.source, n.fid),
            WorkItem::Apply { key, .. } => format!("{}#{}", key.entity, key.id),
        }
    }

    /// The entity this item works on.
    pub fn entity(&self) -> &EntityName {
        match self {
            WorkItem::Process(n) => &n.entity,
            WorkItem::Apply { key, .. } => &key.entity,
        }
    }
}

/// A claimed item. Hidden from other consumers until completed, abandoned,
/// or the lease expires.
#[derive(Debug, Clone)]
pub struct Lease {
    pub item_id: i64,
    pub lease_id: Uuid,
    pub attempts: u32,
    pub item: WorkItem,
}

/// What `abandon` did with the item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Abandoned {
    /// Back at the head of its key's queue, with the attempt counted.
    Requeued { attempts: u32 },
    /// Retry cap reached; the item moved to the dead-letter table.
    DeadLettered,
}

pub(crate) fn encode_item(item: &WorkItem) -> Result<String, StoreError> {
    serde_json::to_string(item).map_err(|e| StoreError::Corrupt {
        table: "work_queue",
        detail: format!("encode item: {e}"),
    })
}

fn decode_item(json: &str) -> Result<WorkItem, StoreError> {
    serde_json::from_str(json).map_err(|e| StoreError::Corrupt {
        table: "work_queue",
        detail: format!("decode item: {e}"),
    })
}

impl Database {
    /// Append an item to the queue.
    pub async fn enqueue(&self, item: &WorkItem) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO work_queue (ordering_key, payload, created_at)
            VALUES (?1, ?2, ?3)
            "#,
        )
        .bind(item.ordering_key())
        .bind(encode_item(item)?)
        .bind(unix_now())
        .execute(&**self)
        .await?;
        Ok(())
    }

    /// Claim the next deliverable item, if any.
    ///
    /// An item is deliverable when its lease is free or expired and no older
    /// item for the same ordering key is still queued. The claim is
    /// optimistic: a racing consumer makes the guarded update a no-op and we
    /// report nothing claimed.
    pub async fn try_claim(&self, lease_secs: i64) -> Result<Option<Lease>, StoreError> {
        let now = unix_now();
        let row = sqlx::query(
            r#"
            SELECT item_id, payload, attempts FROM work_queue AS w
            WHERE (w.lease_expires_at IS NULL OR w.lease_expires_at <= ?1)
              AND NOT EXISTS (
                  SELECT 1 FROM work_queue AS prior
                  WHERE prior.ordering_key = w.ordering_key
                    AND prior.item_id < w.item_id
              )
            ORDER BY w.item_id
            LIMIT 1
            "#,
        )
        .bind(now)
        .fetch_optional(&**self)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let item_id: i64 = row.get("item_id");
        let lease_id = Uuid::new_v4();

        let claimed = sqlx::query(
            r#"
            UPDATE work_queue
            SET lease_id = ?1, lease_expires_at = ?2
            WHERE item_id = ?3
              AND (lease_expires_at IS NULL OR lease_expires_at <= ?4)
            "#,
        )
        .bind(lease_id.to_string())
        .bind(now + lease_secs)
        .bind(item_id)
        .bind(now)
        .execute(&**self)
        .await?
        .rows_affected();

        if claimed == 0 {
            return Ok(None);
        }

        Ok(Some(Lease {
            item_id,
            lease_id,
            attempts: row.get::<i64, _>("attempts") as u32,
            item: decode_item(&row.get::<String, _>("payload"))?,
        }))
    }

    /// Remove a completed item.
    pub async fn complete(&self, lease: &Lease) -> Result<(), StoreError> {
        let removed = sqlx::query(
            r#"
            DELETE FROM work_queue WHERE item_id = ?1 AND lease_id = ?2
            "#,
        )
        .bind(lease.item_id)
        .bind(lease.lease_id.to_string())
        .execute(&**self)
        .await?
        .rows_affected();

        if removed == 0 {
            tracing::warn!(
                "completed item {} after its lease expired; it may run twice",
                lease.item_id
            );
        }
        Ok(())
    }

    /// Return an item to the queue with the attempt counted; at the retry
    /// cap the item moves to the dead-letter table instead.
    pub async fn abandon(
        &self,
        lease: &Lease,
        error: &str,
        retry_cap: u32,
    ) -> Result<Abandoned, StoreError> {
        let attempts = lease.attempts + 1;
        if attempts >= retry_cap {
            self.dead_letter(lease, error).await?;
            return Ok(Abandoned::DeadLettered);
        }

        sqlx::query(
            r#"
            UPDATE work_queue
            SET attempts = ?1, lease_id = NULL, lease_expires_at = NULL
            WHERE item_id = ?2 AND lease_id = ?3
            "#,
        )
        .bind(attempts as i64)
        .bind(lease.item_id)
        .bind(lease.lease_id.to_string())
        .execute(&**self)
        .await?;

        Ok(Abandoned::Requeued { attempts })
    }

    /// Record a processing failure and drop the item from the live queue.
    pub async fn dead_letter(&self, lease: &Lease, error: &str) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO dead_letters (item_id, ordering_key, payload, attempts, error, failed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(lease.item_id)
        .bind(lease.item.ordering_key())
        .bind(encode_item(&lease.item)?)
        .bind((lease.attempts + 1) as i64)
        .bind(error)
        .bind(unix_now())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM work_queue WHERE item_id = ?1")
            .bind(lease.item_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        tracing::error!(
            "item {} dead-lettered after {} attempts: {}",
            lease.item_id,
            lease.attempts + 1,
            error
        );
        Ok(())
    }

    /// Number of items waiting or in flight.
    pub async fn queue_depth(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS depth FROM work_queue")
            .fetch_one(&**self)
            .await?;
        Ok(row.get("depth"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ident::{EntityName, SourceName};

    fn notification(fid: &str) -> ChangeNotification {
        ChangeNotification::new(
            EntityName::new("customer").unwrap(),
            SourceName::new("db1").unwrap(),
            fid,
        )
    }

    #[tokio::test]
    async fn test_fifo_per_ordering_key() {
        let db = Database::in_memory().await.unwrap();
        db.enqueue(&WorkItem::Process(notification("a"))).await.unwrap();
        db.enqueue(&WorkItem::Process(notification("a"))).await.unwrap();

        // The older item is claimed first, and while it is leased the
        // younger one for the same key is not deliverable.
        let first = db.try_claim(60).await.unwrap().unwrap();
        assert!(db.try_claim(60).await.unwrap().is_none());

        db.complete(&first).await.unwrap();
        let second = db.try_claim(60).await.unwrap().unwrap();
        assert!(second.item_id > first.item_id);
    }

    #[tokio::test]
    async fn test_different_keys_interleave() {
        let db = Database::in_memory().await.unwrap();
        db.enqueue(&WorkItem::Process(notification("a"))).await.unwrap();
        db.enqueue(&WorkItem::Process(notification("b"))).await.unwrap();

        let one = db.try_claim(60).await.unwrap().unwrap();
        let two = db.try_claim(60).await.unwrap().unwrap();
        assert_ne!(one.item.ordering_key(), two.item.ordering_key());
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimable() {
        let db = Database::in_memory().await.unwrap();
        db.enqueue(&WorkItem::Process(notification("a"))).await.unwrap();

        let stale = db.try_claim(0).await.unwrap().unwrap();
        // Lease of zero seconds expired immediately.
        let retaken = db.try_claim(60).await.unwrap().unwrap();
        assert_eq!(retaken.item_id, stale.item_id);
        assert_ne!(retaken.lease_id, stale.lease_id);
    }

    #[tokio::test]
    async fn test_abandon_requeues_then_dead_letters() {
        let db = Database::in_memory().await.unwrap();
        db.enqueue(&WorkItem::Process(notification("a"))).await.unwrap();

        for expected in 1..3u32 {
            let lease = db.try_claim(60).await.unwrap().unwrap();
            let outcome = db.abandon(&lease, "source flapped", 3).await.unwrap();
            assert_eq!(outcome, Abandoned::Requeued { attempts: expected });
        }

        let lease = db.try_claim(60).await.unwrap().unwrap();
        let outcome = db.abandon(&lease, "source flapped", 3).await.unwrap();
        assert_eq!(outcome, Abandoned::DeadLettered);
        assert!(db.try_claim(60).await.unwrap().is_none());
        assert_eq!(db.queue_depth().await.unwrap(), 0);

        let row: (i64, String) =
            sqlx::query_as("SELECT attempts, error FROM dead_letters LIMIT 1")
                .fetch_one(&*db)
                .await
                .unwrap();
        assert_eq!(row.0, 3);
        assert_eq!(row.1, "source flapped");
    }

    #[tokio::test]
    async fn test_item_round_trips_through_queue() {
        let db = Database::in_memory().await.unwrap();
        let item = WorkItem::Process(notification("row-1"));
        db.enqueue(&item).await.unwrap();
        let lease = db.try_claim(60).await.unwrap().unwrap();
        assert_eq!(lease.item, item);
        assert_eq!(lease.attempts, 0);
    }
}
