//! Edit scripts over documents.
//!
//! A [`Diff`] is an ordered list of per-path operations plus a label. The
//! label carries provenance while diffs travel through the merge pipeline
//! (per-source diffs are labelled with their [`SourceName`]); at every
//! persistence and wire boundary diffs are stripped to `Diff<()>`.
//!
//! [`diff`] emits a deterministic script: all deletes in lexicographic path
//! order, then all inserts in lexicographic path order. Merging relies on
//! that determinism to give corresponding operations a stable identity across
//! sources.
//!
//! [`SourceName`]: crate::ident::SourceName

use serde::{Deserialize, Serialize};

use crate::document::{Document, DocumentPath};

/// A single edit: set or unset one path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum DiffOp {
    /// Set `path` to `value`, overwriting any existing value.
    Insert { path: DocumentPath, value: String },
    /// Unset `path`. Deleting an absent path is a no-op.
    Delete { path: DocumentPath },
}

impl DiffOp {
    pub fn insert(path: DocumentPath, value: impl Into<String>) -> Self {
        DiffOp::Insert {
            path,
            value: value.into(),
        }
    }

    pub fn delete(path: DocumentPath) -> Self {
        DiffOp::Delete { path }
    }

    /// The path this operation touches.
    pub fn path(&self) -> &DocumentPath {
        match self {
            DiffOp::Insert { path, .. } => path,
            DiffOp::Delete { path } => path,
        }
    }

    /// Apply this single operation to `doc` in place.
    pub fn apply_to(&self, doc: &mut Document) {
        match self {
            DiffOp::Insert { path, value } => doc.set(path.clone(), value.clone()),
            DiffOp::Delete { path } => doc.unset(path),
        }
    }
}

/// A labelled, ordered edit script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff<L = ()> {
    pub label: L,
    pub ops: Vec<DiffOp>,
}

impl<L> Diff<L> {
    pub fn new(label: L, ops: Vec<DiffOp>) -> Self {
        Self { label, ops }
    }

    /// A diff with no operations.
    pub fn empty(label: L) -> Self {
        Self { label, ops: vec![] }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Replace the label, keeping the operations.
    pub fn map_label<M>(self, f: impl FnOnce(L) -> M) -> Diff<M> {
        Diff {
            label: f(self.label),
            ops: self.ops,
        }
    }

    /// Forget the label. Used at persistence and wire boundaries.
    pub fn unlabelled(self) -> Diff<()> {
        self.map_label(|_| ())
    }
}

/// Compute the edit script turning `from` into `to`.
///
/// Deletes for paths present in `from` and absent in `to`, then inserts for
/// paths whose value is new or changed, each group in lexicographic path
/// order. Satisfies `apply(&diff(a, b), a) == b` for all documents.
pub fn diff(from: &Document, to: &Document) -> Diff<()> {
    let mut ops = Vec::new();
    for (path, _) in from.iter() {
        if !to.contains(path) {
            ops.push(DiffOp::delete(path.clone()));
        }
    }
    for (path, value) in to.iter() {
        if from.get(path) != Some(value) {
            ops.push(DiffOp::insert(path.clone(), value));
        }
    }
    Diff::new((), ops)
}

/// Apply a diff: the left fold of its operations over `doc`.
pub fn apply<L>(d: &Diff<L>, doc: &Document) -> Document {
    let mut out = doc.clone();
    for op in &d.ops {
        op.apply_to(&mut out);
    }
    out
}
