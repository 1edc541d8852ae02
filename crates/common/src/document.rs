//! Ordered path-to-value documents.
//!
//! A [`Document`] maps a [`DocumentPath`] (a non-empty ordered sequence of
//! string segments) to a string value. Equality is pathwise, duplicate paths
//! cannot be represented, and iteration is always in lexicographic path
//! order. A missing path is distinct from an empty string value.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when constructing a malformed path or document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("document path is empty")]
    EmptyPath,

    #[error("duplicate path in document: {0}")]
    DuplicatePath(DocumentPath),
}

/// A non-empty ordered sequence of path segments addressing one value.
///
/// Ordering is lexicographic over the segment sequence, which makes path
/// order in a [`Document`] deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct DocumentPath(Vec<String>);

impl DocumentPath {
    pub fn new(segments: Vec<String>) -> Result<Self, PathError> {
        if segments.is_empty() {
            return Err(PathError::EmptyPath);
        }
        Ok(Self(segments))
    }

    /// Build a single-segment path. Convenient for flat documents.
    pub fn root(segment: impl Into<String>) -> Self {
        Self(vec![segment.into()])
    }

    /// Split a dotted representation (`a.b.c`) into a path.
    pub fn from_dotted(dotted: &str) -> Result<Self, PathError> {
        Self::new(dotted.split('.').map(str::to_string).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Whether `prefix` is a leading subsequence of this path.
    pub fn starts_with(&self, prefix: &DocumentPath) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }
}

impl TryFrom<Vec<String>> for DocumentPath {
    type Error = PathError;

    fn try_from(segments: Vec<String>) -> Result<Self, PathError> {
        Self::new(segments)
    }
}

impl From<DocumentPath> for Vec<String> {
    fn from(path: DocumentPath) -> Vec<String> {
        path.0
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// An ordered mapping from paths to string values.
///
/// Serialized as a sequence of `(path, value)` pairs; deserialization rejects
/// duplicate paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<(DocumentPath, String)>", into = "Vec<(DocumentPath, String)>")]
pub struct Document(BTreeMap<DocumentPath, String>);

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &DocumentPath) -> Option<&str> {
        self.0.get(path).map(String::as_str)
    }

    pub fn contains(&self, path: &DocumentPath) -> bool {
        self.0.contains_key(path)
    }

    /// Set `path` to `value`, overwriting any existing value.
    pub fn set(&mut self, path: DocumentPath, value: impl Into<String>) {
        self.0.insert(path, value.into());
    }

    /// Unset `path`. Removing an absent path is a no-op.
    pub fn unset(&mut self, path: &DocumentPath) {
        self.0.remove(path);
    }

    /// Iterate entries in lexicographic path order.
    pub fn iter(&self) -> impl Iterator<Item = (&DocumentPath, &str)> {
        self.0.iter().map(|(p, v)| (p, v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<Vec<(DocumentPath, String)>> for Document {
    type Error = PathError;

    fn try_from(entries: Vec<(DocumentPath, String)>) -> Result<Self, PathError> {
        let mut doc = Document::new();
        for (path, value) in entries {
            if doc.contains(&path) {
                return Err(PathError::DuplicatePath(path));
            }
            doc.set(path, value);
        }
        Ok(doc)
    }
}

impl From<Document> for Vec<(DocumentPath, String)> {
    fn from(doc: Document) -> Self {
        doc.0.into_iter().collect()
    }
}

impl FromIterator<(DocumentPath, String)> for Document {
    /// Collect entries into a document. Later duplicates overwrite earlier
    /// ones; use `TryFrom` when duplicates must be rejected.
    fn from_iter<I: IntoIterator<Item = (DocumentPath, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
