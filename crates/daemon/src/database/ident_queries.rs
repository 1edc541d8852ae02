//! Internal/foreign key mapping and the initial-document archive.

use sqlx::Row;

use common::document::Document;
use common::ident::{EntityName, ForeignKey, InternalKey, SourceName};

use super::{unix_now, Database, StoreError};

impl Database {
    /// Mint a fresh internal key for `entity`.
    ///
    /// Ids are allocated per entity, starting at 1. The allocation is a
    /// single statement, so concurrent creators cannot collide.
    pub async fn create_internal_key(
        &self,
        entity: &EntityName,
    ) -> Result<InternalKey, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO internal_keys (entity, id, created_at)
            VALUES (
                ?1,
                COALESCE((SELECT MAX(id) FROM internal_keys WHERE entity = ?1), 0) + 1,
                ?2
            )
            RETURNING id
            "#,
        )
        .bind(entity.as_str())
        .bind(unix_now())
        .fetch_one(&**self)
        .await?;

        let id: i64 = row.get("id");
        Ok(InternalKey::new(entity.clone(), id as u64))
    }

    /// Resolve a foreign key to the internal key it is bound to, if any.
    pub async fn lookup_internal(
        &self,
        fk: &ForeignKey,
    ) -> Result<Option<InternalKey>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT internal_id FROM foreign_keys
            WHERE entity = ?1 AND source = ?2 AND fid = ?3
            "#,
        )
        .bind(fk.entity.as_str())
        .bind(fk.source.as_str())
        .bind(&fk.fid)
        .fetch_optional(&**self)
        .await?;

        Ok(row.map(|r| {
            let id: i64 = r.get("internal_id");
            InternalKey::new(fk.entity.clone(), id as u64)
        }))
    }

    /// Bind `fk` to `ik`.
    ///
    /// Idempotent for an identical binding. Refuses to rebind when the
    /// `(internal key, source)` pair already points at a different foreign
    /// key, or the foreign key already belongs to a different internal key.
    pub async fn record_foreign(
        &self,
        ik: &InternalKey,
        fk: &ForeignKey,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;

        let bound_fid: Option<String> = sqlx::query(
            r#"
            SELECT fid FROM foreign_keys
            WHERE entity = ?1 AND source = ?2 AND internal_id = ?3
            "#,
        )
        .bind(ik.entity.as_str())
        .bind(fk.source.as_str())
        .bind(ik.id as i64)
        .fetch_optional(&mut *tx)
        .await?
        .map(|r| r.get("fid"));

        match bound_fid {
            Some(fid) if fid == fk.fid => return Ok(()),
            Some(_) => {
                return Err(StoreError::ForeignKeyConflict {
                    entity: ik.entity.clone(),
                    source_name: fk.source.clone(),
                })
            }
            None => {}
        }

        let bound_ik: Option<i64> = sqlx::query(
            r#"
            SELECT internal_id FROM foreign_keys
            WHERE entity = ?1 AND source = ?2 AND fid = ?3
            "#,
        )
        .bind(fk.entity.as_str())
        .bind(fk.source.as_str())
        .bind(&fk.fid)
        .fetch_optional(&mut *tx)
        .await?
        .map(|r| r.get("internal_id"));

        if let Some(other) = bound_ik {
            if other as u64 != ik.id {
                return Err(StoreError::ForeignKeyConflict {
                    entity: ik.entity.clone(),
                    source_name: fk.source.clone(),
                });
            }
        }

        sqlx::query(
            r#"
            INSERT INTO foreign_keys (entity, source, fid, internal_id)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(fk.entity.as_str())
        .bind(fk.source.as_str())
        .bind(&fk.fid)
        .bind(ik.id as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// The foreign key bound to `(ik, source)`, if any.
    pub async fn lookup_foreign(
        &self,
        ik: &InternalKey,
        source: &SourceName,
    ) -> Result<Option<ForeignKey>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT fid FROM foreign_keys
            WHERE entity = ?1 AND source = ?2 AND internal_id = ?3
            "#,
        )
        .bind(ik.entity.as_str())
        .bind(source.as_str())
        .bind(ik.id as i64)
        .fetch_optional(&**self)
        .await?;

        Ok(row.map(|r| {
            ForeignKey::new(
                ik.entity.clone(),
                source.clone(),
                r.get::<String, _>("fid"),
            )
        }))
    }

    /// Drop an internal key and everything hanging off it: foreign keys,
    /// initial document, diffs with their ops. Returns the number of rows
    /// removed across all tables.
    pub async fn delete_internal(&self, ik: &InternalKey) -> Result<u64, StoreError> {
        let mut tx = self.begin().await?;
        let entity = ik.entity.as_str();
        let id = ik.id as i64;
        let mut removed = 0u64;

        removed += sqlx::query(
            r#"
            DELETE FROM diff_ops WHERE diff_id IN
                (SELECT diff_id FROM diffs WHERE entity = ?1 AND internal_id = ?2)
            "#,
        )
        .bind(entity)
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        for sql in [
            "DELETE FROM diffs WHERE entity = ?1 AND internal_id = ?2",
            "DELETE FROM initial_documents WHERE entity = ?1 AND internal_id = ?2",
            "DELETE FROM foreign_keys WHERE entity = ?1 AND internal_id = ?2",
            "DELETE FROM internal_keys WHERE entity = ?1 AND id = ?2",
        ] {
            removed += sqlx::query(sql)
                .bind(entity)
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        tx.commit().await?;
        Ok(removed)
    }

    /// Upsert the initial (last converged) document for `ik`.
    pub async fn put_initial(&self, ik: &InternalKey, doc: &Document) -> Result<(), StoreError> {
        let json = serde_json::to_string(doc).map_err(|e| StoreError::Corrupt {
            table: "initial_documents",
            detail: format!("encode document: {e}"),
        })?;

        sqlx::query(
            r#"
            INSERT INTO initial_documents (entity, internal_id, document, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (entity, internal_id)
            DO UPDATE SET document = excluded.document, updated_at = excluded.updated_at
            "#,
        )
        .bind(ik.entity.as_str())
        .bind(ik.id as i64)
        .bind(json)
        .bind(unix_now())
        .execute(&**self)
        .await?;

        Ok(())
    }

    /// The initial document for `ik`, if one has been stored.
    pub async fn get_initial(&self, ik: &InternalKey) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT document FROM initial_documents
            WHERE entity = ?1 AND internal_id = ?2
            "#,
        )
        .bind(ik.entity.as_str())
        .bind(ik.id as i64)
        .fetch_optional(&**self)
        .await?;

        row.map(|r| {
            serde_json::from_str(&r.get::<String, _>("document")).map_err(|e| {
                StoreError::Corrupt {
                    table: "initial_documents",
                    detail: format!("decode document: {e}"),
                }
            })
        })
        .transpose()
    }
}
