//! Merge policies for per-source diffs.
//!
//! Given one diff per source, all computed against the same initial document,
//! a policy partitions the operations into an *accepted* diff (applied to
//! every source) and per-source *rejected* diffs (parked as a conflict for
//! operator resolution).
//!
//! # Built-in policies
//!
//! - **[`IgnoreConflicts`]**: reject every operation on a conflicted path,
//!   accept the rest. The default; total over all inputs.
//! - **[`TrustSource`]**: on conflicted paths the named source wins.
//! - **[`RejectPaths`]**: operations under the given path prefixes are never
//!   accepted.
//!
//! # Custom policies
//!
//! Implement the [`MergePolicy`] trait. Policies are pure: they may inspect
//! only the diffs and the initial document.

mod ignore_conflicts;
mod reject_paths;
mod trust_source;

pub use ignore_conflicts::IgnoreConflicts;
pub use reject_paths::RejectPaths;
pub use trust_source::TrustSource;

use std::collections::{BTreeMap, BTreeSet};

use crate::diff::{Diff, DiffOp};
use crate::document::{Document, DocumentPath};
use crate::ident::SourceName;

/// Outcome of a merge: one accepted diff plus one rejected diff per input
/// source, aligned with the input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Merged {
    pub accepted: Diff<()>,
    pub rejected: Vec<Diff<SourceName>>,
}

impl Merged {
    /// Whether every rejected diff is empty, i.e. the merge is clean.
    pub fn is_clean(&self) -> bool {
        self.rejected.iter().all(Diff::is_empty)
    }
}

/// Trait for merge policies.
pub trait MergePolicy: std::fmt::Debug + Send + Sync {
    /// Partition the operations of `diffs` into accepted and rejected.
    ///
    /// `initial` is the document all diffs were computed against. Every
    /// operation of every input must end up accepted or in its source's
    /// rejected diff; nothing may be silently dropped.
    fn merge(&self, initial: &Document, diffs: &[Diff<SourceName>]) -> Merged;
}

/// Paths on which two sources disagree.
///
/// A path is conflicted iff two different sources carry non-identical
/// operations on it: an insert with a different value, or a delete against an
/// insert. Identical operations from several sources never conflict.
pub fn conflicted_paths(diffs: &[Diff<SourceName>]) -> BTreeSet<DocumentPath> {
    let mut first_seen: BTreeMap<&DocumentPath, (usize, &DiffOp)> = BTreeMap::new();
    let mut conflicted = BTreeSet::new();
    for (idx, d) in diffs.iter().enumerate() {
        for op in &d.ops {
            match first_seen.get(op.path()) {
                None => {
                    first_seen.insert(op.path(), (idx, op));
                }
                Some((seen_idx, seen_op)) => {
                    if *seen_idx != idx && *seen_op != op {
                        conflicted.insert(op.path().clone());
                    }
                }
            }
        }
    }
    conflicted
}

/// Shared partition engine for the built-in policies.
///
/// `verdict` decides acceptance per operation; rejected operations stay with
/// their source in input order, accepted ones are deduplicated by path and
/// re-emitted in the canonical deletes-then-inserts, lexicographic order.
pub(crate) fn partition(
    diffs: &[Diff<SourceName>],
    mut verdict: impl FnMut(&SourceName, &DiffOp, bool) -> bool,
) -> Merged {
    let conflicted = conflicted_paths(diffs);

    let mut deletes: BTreeMap<DocumentPath, DiffOp> = BTreeMap::new();
    let mut inserts: BTreeMap<DocumentPath, DiffOp> = BTreeMap::new();
    let mut rejected = Vec::with_capacity(diffs.len());

    for d in diffs {
        let mut refused = Vec::new();
        for op in &d.ops {
            if verdict(&d.label, op, conflicted.contains(op.path())) {
                let slot = match op {
                    DiffOp::Delete { .. } => &mut deletes,
                    DiffOp::Insert { .. } => &mut inserts,
                };
                slot.insert(op.path().clone(), op.clone());
            } else {
                refused.push(op.clone());
            }
        }
        rejected.push(Diff::new(d.label.clone(), refused));
    }

    let ops = deletes.into_values().chain(inserts.into_values()).collect();
    Merged {
        accepted: Diff::new((), ops),
        rejected,
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    pub fn path(dotted: &str) -> DocumentPath {
        DocumentPath::from_dotted(dotted).unwrap()
    }

    pub fn source(name: &str) -> SourceName {
        SourceName::new(name).unwrap()
    }

    pub fn labelled(name: &str, ops: Vec<DiffOp>) -> Diff<SourceName> {
        Diff::new(source(name), ops)
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn test_no_conflict_on_disjoint_paths() {
        let d1 = labelled("db1", vec![DiffOp::insert(path("city"), "B")]);
        let d2 = labelled("db2", vec![DiffOp::insert(path("age"), "30")]);
        assert!(conflicted_paths(&[d1, d2]).is_empty());
    }

    #[test]
    fn test_no_conflict_on_identical_ops() {
        let op = DiffOp::insert(path("city"), "B");
        let d1 = labelled("db1", vec![op.clone()]);
        let d2 = labelled("db2", vec![op]);
        assert!(conflicted_paths(&[d1, d2]).is_empty());
    }

    #[test]
    fn test_conflict_on_differing_inserts() {
        let d1 = labelled("db1", vec![DiffOp::insert(path("x"), "1")]);
        let d2 = labelled("db2", vec![DiffOp::insert(path("x"), "2")]);
        let conflicted = conflicted_paths(&[d1, d2]);
        assert_eq!(conflicted.into_iter().collect::<Vec<_>>(), vec![path("x")]);
    }

    #[test]
    fn test_conflict_on_insert_vs_delete() {
        let d1 = labelled("db1", vec![DiffOp::insert(path("x"), "1")]);
        let d2 = labelled("db2", vec![DiffOp::delete(path("x"))]);
        assert_eq!(conflicted_paths(&[d1, d2]).len(), 1);
    }

    #[test]
    fn test_same_source_never_conflicts_with_itself() {
        let d1 = labelled(
            "db1",
            vec![DiffOp::insert(path("x"), "1"), DiffOp::insert(path("y"), "2")],
        );
        assert!(conflicted_paths(&[d1]).is_empty());
    }
}
