//! Merge policy that quarantines configured path prefixes.

use crate::diff::Diff;
use crate::document::{Document, DocumentPath};
use crate::ident::SourceName;

use super::{partition, MergePolicy, Merged};

/// Never accept operations touching the given path prefixes.
///
/// Operations outside the prefixes follow the [`IgnoreConflicts`] rule:
/// accepted unless their path is conflicted.
///
/// [`IgnoreConflicts`]: super::IgnoreConflicts
#[derive(Debug, Clone)]
pub struct RejectPaths {
    prefixes: Vec<DocumentPath>,
}

impl RejectPaths {
    pub fn new(prefixes: Vec<DocumentPath>) -> Self {
        Self { prefixes }
    }

    fn is_quarantined(&self, path: &DocumentPath) -> bool {
        self.prefixes.iter().any(|prefix| path.starts_with(prefix))
    }
}

impl MergePolicy for RejectPaths {
    fn merge(&self, _initial: &Document, diffs: &[Diff<SourceName>]) -> Merged {
        partition(diffs, |_, op, conflicted| {
            !conflicted && !self.is_quarantined(op.path())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;
    use crate::diff::DiffOp;

    #[test]
    fn test_quarantined_prefix_always_rejected() {
        let d = labelled(
            "db1",
            vec![
                DiffOp::insert(path("secret.token"), "abc"),
                DiffOp::insert(path("name"), "Alice"),
            ],
        );
        let policy = RejectPaths::new(vec![path("secret")]);
        let merged = policy.merge(&Document::new(), &[d]);
        assert_eq!(merged.accepted.ops, vec![DiffOp::insert(path("name"), "Alice")]);
        assert_eq!(
            merged.rejected[0].ops,
            vec![DiffOp::insert(path("secret.token"), "abc")]
        );
    }

    #[test]
    fn test_exact_path_counts_as_prefix() {
        let d = labelled("db1", vec![DiffOp::delete(path("secret"))]);
        let policy = RejectPaths::new(vec![path("secret")]);
        let merged = policy.merge(&Document::new(), &[d]);
        assert!(merged.accepted.is_empty());
        assert!(!merged.is_clean());
    }

    #[test]
    fn test_conflicts_outside_prefixes_still_rejected() {
        let d1 = labelled("db1", vec![DiffOp::insert(path("x"), "1")]);
        let d2 = labelled("db2", vec![DiffOp::insert(path("x"), "2")]);
        let policy = RejectPaths::new(vec![path("secret")]);
        let merged = policy.merge(&Document::new(), &[d1, d2]);
        assert!(merged.accepted.is_empty());
        assert!(!merged.is_clean());
    }
}
