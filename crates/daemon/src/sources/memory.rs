//! In-memory data source driver.
//!
//! The reference driver: a process-local table of documents keyed by foreign
//! id. Used by tests and demos, and as the template for writing real
//! adapters. Failure and latency injection hooks let tests exercise the
//! worker's retry paths.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use common::document::Document;
use common::ident::{EntityName, ForeignKey, SourceName};
use common::source::{DataSource, SourceError, SourceErrorKind};

#[derive(Debug)]
pub struct MemorySource {
    entity: EntityName,
    name: SourceName,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    docs: HashMap<String, Document>,
    next_fid: u64,
    fail_sets: u32,
    delayed_sets: u32,
    set_delay: Duration,
}

impl MemorySource {
    pub fn new(entity: EntityName, name: SourceName) -> Arc<Self> {
        Arc::new(Self {
            entity,
            name,
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Insert a document under a caller-chosen foreign id.
    pub fn seed(&self, fid: impl Into<String>, doc: Document) {
        self.inner.lock().docs.insert(fid.into(), doc);
    }

    /// The document currently stored under `fid`.
    pub fn document(&self, fid: &str) -> Option<Document> {
        self.inner.lock().docs.get(fid).cloned()
    }

    /// Remove a document, simulating an external deletion.
    pub fn remove(&self, fid: &str) {
        self.inner.lock().docs.remove(fid);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().docs.is_empty()
    }

    /// Make the next `n` `set` calls fail.
    pub fn fail_next_sets(&self, n: u32) {
        self.inner.lock().fail_sets = n;
    }

    /// Make the next `n` `set` calls sleep for `delay` before completing.
    pub fn delay_next_sets(&self, n: u32, delay: Duration) {
        let mut inner = self.inner.lock();
        inner.delayed_sets = n;
        inner.set_delay = delay;
    }

    fn check_fk(&self, fk: &ForeignKey) -> Result<(), SourceError> {
        if fk.entity != self.entity || fk.source != self.name {
            return Err(SourceError::new(
                self.name.clone(),
                SourceErrorKind::Failed(format!("foreign key {fk} belongs to another source")),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl DataSource for MemorySource {
    async fn get(&self, fk: &ForeignKey) -> Result<Option<Document>, SourceError> {
        self.check_fk(fk)?;
        Ok(self.inner.lock().docs.get(&fk.fid).cloned())
    }

    async fn set(
        &self,
        doc: &Document,
        fk: Option<&ForeignKey>,
    ) -> Result<ForeignKey, SourceError> {
        let delay = {
            let mut inner = self.inner.lock();
            if inner.delayed_sets > 0 {
                inner.delayed_sets -= 1;
                Some(inner.set_delay)
            } else {
                None
            }
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock();
        if inner.fail_sets > 0 {
            inner.fail_sets -= 1;
            return Err(SourceError::new(
                self.name.clone(),
                SourceErrorKind::Failed("injected set failure".to_string()),
            ));
        }

        let fk = match fk {
            Some(fk) => {
                self.check_fk(fk)?;
                fk.clone()
            }
            None => {
                inner.next_fid += 1;
                ForeignKey::new(
                    self.entity.clone(),
                    self.name.clone(),
                    format!("mem-{}", inner.next_fid),
                )
            }
        };
        inner.docs.insert(fk.fid.clone(), doc.clone());
        Ok(fk)
    }

    async fn delete(&self, fk: &ForeignKey) -> Result<(), SourceError> {
        self.check_fk(fk)?;
        // Deleting an absent row is fine: deletes are retried.
        self.inner.lock().docs.remove(&fk.fid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::document::DocumentPath;

    fn source() -> Arc<MemorySource> {
        MemorySource::new(
            EntityName::new("customer").unwrap(),
            SourceName::new("db1").unwrap(),
        )
    }

    fn doc(value: &str) -> Document {
        let mut d = Document::new();
        d.set(DocumentPath::root("name"), value);
        d
    }

    #[tokio::test]
    async fn test_set_without_key_allocates_one() {
        let src = source();
        let fk = src.set(&doc("Alice"), None).await.unwrap();
        assert_eq!(src.get(&fk).await.unwrap(), Some(doc("Alice")));
    }

    #[tokio::test]
    async fn test_set_with_key_overwrites() {
        let src = source();
        let fk = src.set(&doc("Alice"), None).await.unwrap();
        src.set(&doc("Bob"), Some(&fk)).await.unwrap();
        assert_eq!(src.get(&fk).await.unwrap(), Some(doc("Bob")));
        assert_eq!(src.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_then_get_is_missing() {
        let src = source();
        let fk = src.set(&doc("Alice"), None).await.unwrap();
        src.delete(&fk).await.unwrap();
        assert_eq!(src.get(&fk).await.unwrap(), None);
        // Idempotent.
        src.delete(&fk).await.unwrap();
    }

    #[tokio::test]
    async fn test_foreign_key_from_other_source_refused() {
        let src = source();
        let alien = ForeignKey::new(
            EntityName::new("customer").unwrap(),
            SourceName::new("db2").unwrap(),
            "1",
        );
        assert!(src.get(&alien).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let src = source();
        src.fail_next_sets(1);
        assert!(src.set(&doc("Alice"), None).await.is_err());
        assert!(src.set(&doc("Alice"), None).await.is_ok());
    }
}
