//! Parked conflicts awaiting operator resolution.

use serde::{Deserialize, Serialize};

use crate::diff::{Diff, DiffOp};
use crate::document::Document;
use crate::ident::{DiffId, DiffOpId, InternalKey};

/// A diff whose merge produced rejected operations, persisted for an
/// operator to resolve.
///
/// `ops` lists the operations still awaiting a decision (the unaccepted
/// ones), each with its store-assigned id; `resolve` selects a subset of
/// those ids to apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub diff_id: DiffId,
    pub key: InternalKey,
    pub initial: Document,
    pub diff: Diff<()>,
    pub ops: Vec<(DiffOpId, DiffOp)>,
}

impl ConflictRecord {
    /// Whether `op_id` belongs to this record's pending operations.
    pub fn owns(&self, op_id: DiffOpId) -> bool {
        self.ops.iter().any(|(id, _)| *id == op_id)
    }
}
