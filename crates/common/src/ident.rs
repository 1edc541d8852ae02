//! Entity, source, and key identifiers.
//!
//! A configured data source is addressed by an `(EntityName, SourceName)`
//! pair. External systems hand out [`ForeignKey`]s; Retcon mints one
//! [`InternalKey`] per logical entity instance and maps every foreign key
//! onto it.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum length of an entity or source label, in bytes.
const MAX_LABEL_LEN: usize = 64;

/// Error returned when an entity or source label is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LabelError {
    #[error("label is empty")]
    Empty,

    #[error("label is longer than {MAX_LABEL_LEN} bytes: {0:?}")]
    TooLong(String),

    #[error("label contains invalid character {1:?}: {0:?}")]
    InvalidChar(String, char),
}

fn validate_label(s: &str) -> Result<(), LabelError> {
    if s.is_empty() {
        return Err(LabelError::Empty);
    }
    if s.len() > MAX_LABEL_LEN {
        return Err(LabelError::TooLong(s.to_string()));
    }
    if let Some(c) = s
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(LabelError::InvalidChar(s.to_string(), c));
    }
    Ok(())
}

macro_rules! label_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Validate and wrap a label.
            pub fn new(s: impl Into<String>) -> Result<Self, LabelError> {
                let s = s.into();
                validate_label(&s)?;
                Ok(Self(s))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = LabelError;

            fn try_from(s: String) -> Result<Self, LabelError> {
                Self::new(s)
            }
        }

        impl From<$name> for String {
            fn from(v: $name) -> String {
                v.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = LabelError;

            fn from_str(s: &str) -> Result<Self, LabelError> {
                Self::new(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

label_newtype! {
    /// The kind of business object being mirrored, e.g. `customer`.
    EntityName
}

label_newtype! {
    /// One configured external system holding a copy of an entity.
    SourceName
}

/// Identifier assigned by an external source. Opaque to Retcon.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForeignKey {
    pub entity: EntityName,
    pub source: SourceName,
    pub fid: String,
}

impl ForeignKey {
    pub fn new(entity: EntityName, source: SourceName, fid: impl Into<String>) -> Self {
        Self {
            entity,
            source,
            fid: fid.into(),
        }
    }
}

impl fmt::Display for ForeignKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.entity, self.source, self.fid)
    }
}

/// Identifier minted by Retcon, unique within an entity and stable across
/// sources.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InternalKey {
    pub entity: EntityName,
    pub id: u64,
}

impl InternalKey {
    pub fn new(entity: EntityName, id: u64) -> Self {
        Self { entity, id }
    }
}

impl fmt::Display for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity, self.id)
    }
}

/// Store-assigned identifier of a persisted diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiffId(pub i64);

impl fmt::Display for DiffId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-assigned identifier of one operation within a persisted diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiffOpId(pub i64);

impl fmt::Display for DiffOpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An external "something changed" event for one foreign key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub entity: EntityName,
    pub source: SourceName,
    pub fid: String,
}

impl ChangeNotification {
    pub fn new(entity: EntityName, source: SourceName, fid: impl Into<String>) -> Self {
        Self {
            entity,
            source,
            fid: fid.into(),
        }
    }

    /// The foreign key this notification refers to.
    pub fn foreign_key(&self) -> ForeignKey {
        ForeignKey::new(self.entity.clone(), self.source.clone(), self.fid.clone())
    }
}

impl fmt::Display for ChangeNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.entity, self.source, self.fid)
    }
}
