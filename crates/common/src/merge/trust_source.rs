//! Merge policy that lets one source win conflicts.

use crate::diff::Diff;
use crate::document::Document;
use crate::ident::SourceName;

use super::{partition, MergePolicy, Merged};

/// On conflicted paths, accept the trusted source's operation and reject the
/// others. Non-conflicted operations are accepted as usual.
#[derive(Debug, Clone)]
pub struct TrustSource {
    trusted: SourceName,
}

impl TrustSource {
    pub fn new(trusted: SourceName) -> Self {
        Self { trusted }
    }
}

impl MergePolicy for TrustSource {
    fn merge(&self, _initial: &Document, diffs: &[Diff<SourceName>]) -> Merged {
        partition(diffs, |source, _, conflicted| {
            !conflicted || source == &self.trusted
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;
    use crate::diff::DiffOp;

    #[test]
    fn test_trusted_source_wins_conflicts() {
        let d1 = labelled("db1", vec![DiffOp::insert(path("x"), "1")]);
        let d2 = labelled("db2", vec![DiffOp::insert(path("x"), "2")]);
        let merged = TrustSource::new(source("db1")).merge(&Document::new(), &[d1, d2]);
        assert_eq!(merged.accepted.ops, vec![DiffOp::insert(path("x"), "1")]);
        assert!(merged.rejected[0].is_empty());
        assert_eq!(merged.rejected[1].ops, vec![DiffOp::insert(path("x"), "2")]);
    }

    #[test]
    fn test_trusted_delete_wins_over_insert() {
        let d1 = labelled("db1", vec![DiffOp::delete(path("x"))]);
        let d2 = labelled("db2", vec![DiffOp::insert(path("x"), "2")]);
        let merged = TrustSource::new(source("db1")).merge(&Document::new(), &[d1, d2]);
        assert_eq!(merged.accepted.ops, vec![DiffOp::delete(path("x"))]);
        assert_eq!(merged.rejected[1].ops, vec![DiffOp::insert(path("x"), "2")]);
    }

    #[test]
    fn test_conflict_without_trusted_op_rejects_all() {
        // db3 is trusted but silent on the conflicted path: nobody wins.
        let d1 = labelled("db1", vec![DiffOp::insert(path("x"), "1")]);
        let d2 = labelled("db2", vec![DiffOp::insert(path("x"), "2")]);
        let merged = TrustSource::new(source("db3")).merge(&Document::new(), &[d1, d2]);
        assert!(merged.accepted.is_empty());
        assert!(!merged.is_clean());
    }

    #[test]
    fn test_non_conflicted_ops_unaffected() {
        let d1 = labelled("db1", vec![DiffOp::insert(path("a"), "1")]);
        let d2 = labelled("db2", vec![DiffOp::insert(path("b"), "2")]);
        let merged = TrustSource::new(source("db1")).merge(&Document::new(), &[d1, d2]);
        assert_eq!(merged.accepted.ops.len(), 2);
        assert!(merged.is_clean());
    }
}
