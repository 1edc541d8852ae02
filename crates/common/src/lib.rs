//! Core data model and algebra for Retcon.
//!
//! Retcon reconciles structured documents mirrored across external data
//! sources. This crate holds everything that is independent of any particular
//! store or transport:
//!
//! - [`document`]: ordered path-to-value documents
//! - [`diff`]: edit scripts over documents, with `diff` and `apply`
//! - [`merge`]: pluggable policies partitioning edits into accepted/rejected
//! - [`ident`]: entity, source, and key identifiers
//! - [`conflict`]: parked conflict records awaiting operator resolution
//! - [`source`]: the `DataSource` capability and the runtime registry
//! - [`protocol`]: the framed request/reply wire protocol

pub mod conflict;
pub mod diff;
pub mod document;
pub mod ident;
pub mod merge;
pub mod protocol;
pub mod source;

pub use conflict::ConflictRecord;
pub use diff::{apply, diff, Diff, DiffOp};
pub use document::{Document, DocumentPath, PathError};
pub use ident::{
    ChangeNotification, DiffId, DiffOpId, EntityName, ForeignKey, InternalKey, LabelError,
    SourceName,
};
pub use merge::{IgnoreConflicts, MergePolicy, Merged, RejectPaths, TrustSource};
pub use source::{DataSource, SourceError, SourceErrorKind, SourceRegistry};
