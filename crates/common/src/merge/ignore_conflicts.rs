//! Default merge policy: park everything contentious.

use crate::diff::Diff;
use crate::document::Document;
use crate::ident::SourceName;

use super::{partition, MergePolicy, Merged};

/// Reject every operation on a conflicted path, accept all others.
///
/// Total over all inputs: it never fails and never guesses, so it is the
/// default policy. Conflicted operations end up parked for an operator.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreConflicts;

impl IgnoreConflicts {
    pub fn new() -> Self {
        Self
    }
}

impl MergePolicy for IgnoreConflicts {
    fn merge(&self, _initial: &Document, diffs: &[Diff<SourceName>]) -> Merged {
        partition(diffs, |_, _, conflicted| !conflicted)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;
    use crate::diff::DiffOp;

    #[test]
    fn test_single_source_is_never_conflicted() {
        // Canonical op order (deletes then inserts) as `diff` emits it.
        let d = labelled(
            "db1",
            vec![DiffOp::delete(path("b")), DiffOp::insert(path("a"), "1")],
        );
        let merged = IgnoreConflicts.merge(&Document::new(), &[d.clone()]);
        assert_eq!(merged.accepted.ops, d.ops);
        assert_eq!(merged.rejected, vec![Diff::empty(source("db1"))]);
        assert!(merged.is_clean());
    }

    #[test]
    fn test_identical_diffs_never_conflict() {
        let ops = vec![DiffOp::delete(path("b")), DiffOp::insert(path("a"), "1")];
        let d1 = labelled("db1", ops.clone());
        let d2 = labelled("db2", ops.clone());
        let merged = IgnoreConflicts.merge(&Document::new(), &[d1, d2]);
        assert_eq!(merged.accepted.ops, ops);
        assert!(merged.is_clean());
        assert_eq!(merged.rejected.len(), 2);
    }

    #[test]
    fn test_disjoint_edits_all_accepted() {
        let d1 = labelled("db1", vec![DiffOp::insert(path("city"), "B")]);
        let d2 = labelled("db2", vec![DiffOp::insert(path("age"), "30")]);
        let merged = IgnoreConflicts.merge(&Document::new(), &[d1, d2]);
        assert_eq!(
            merged.accepted.ops,
            vec![
                DiffOp::insert(path("age"), "30"),
                DiffOp::insert(path("city"), "B"),
            ]
        );
        assert!(merged.is_clean());
    }

    #[test]
    fn test_conflicting_edits_all_rejected() {
        let d1 = labelled("db1", vec![DiffOp::insert(path("x"), "1")]);
        let d2 = labelled("db2", vec![DiffOp::insert(path("x"), "2")]);
        let merged = IgnoreConflicts.merge(&Document::new(), &[d1.clone(), d2.clone()]);
        assert!(merged.accepted.is_empty());
        assert_eq!(merged.rejected, vec![d1, d2]);
    }

    #[test]
    fn test_mixed_edits_partition_per_path() {
        let d1 = labelled(
            "db1",
            vec![
                DiffOp::insert(path("x"), "1"),
                DiffOp::insert(path("city"), "B"),
            ],
        );
        let d2 = labelled("db2", vec![DiffOp::insert(path("x"), "2")]);
        let merged = IgnoreConflicts.merge(&Document::new(), &[d1, d2]);
        assert_eq!(merged.accepted.ops, vec![DiffOp::insert(path("city"), "B")]);
        assert_eq!(merged.rejected[0].ops, vec![DiffOp::insert(path("x"), "1")]);
        assert_eq!(merged.rejected[1].ops, vec![DiffOp::insert(path("x"), "2")]);
    }
}
