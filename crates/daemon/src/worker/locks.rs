//! Advisory locks serialising reconciliation per key.
//!
//! At most one reconciliation step may run for an internal key at a time.
//! Keys not yet mapped (the create path) are locked on their foreign triple
//! instead. Contention is rare; a failed acquisition abandons the item with
//! a short backoff rather than blocking a worker.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use common::ident::{EntityName, ForeignKey, InternalKey, SourceName};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    Internal(EntityName, u64),
    Foreign(EntityName, SourceName, String),
}

impl LockKey {
    pub fn internal(ik: &InternalKey) -> Self {
        LockKey::Internal(ik.entity.clone(), ik.id)
    }

    pub fn foreign(fk: &ForeignKey) -> Self {
        LockKey::Foreign(fk.entity.clone(), fk.source.clone(), fk.fid.clone())
    }
}

#[derive(Debug, Default)]
pub struct LockRegistry {
    held: Mutex<HashSet<LockKey>>,
}

impl LockRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Try to take the lock. `None` means another worker holds it.
    pub fn try_acquire(self: &Arc<Self>, key: LockKey) -> Option<LockGuard> {
        let mut held = self.held.lock();
        if !held.insert(key.clone()) {
            return None;
        }
        Some(LockGuard {
            registry: self.clone(),
            key,
        })
    }
}

/// Held lock; released on drop.
#[derive(Debug)]
pub struct LockGuard {
    registry: Arc<LockRegistry>,
    key: LockKey,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.registry.held.lock().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: u64) -> LockKey {
        LockKey::Internal(EntityName::new("customer").unwrap(), id)
    }

    #[test]
    fn test_second_acquire_fails_while_held() {
        let registry = LockRegistry::new();
        let guard = registry.try_acquire(key(1)).unwrap();
        assert!(registry.try_acquire(key(1)).is_none());
        assert!(registry.try_acquire(key(2)).is_some());
        drop(guard);
        assert!(registry.try_acquire(key(1)).is_some());
    }
}
