//! Field path expressions used by mapping rules

use serde::{Deserialize, Serialize};

/// Prefixes that point a path at the record being built instead of the source
pub const SELF_PREFIXES: [&str; 2] = ["self", "sf"];

/// Where a path starts resolving
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PathRoot {
    /// The source record
    Source,
    /// Output records already built for the current source record
    SelfRef,
}

/// A parsed dotted path
///
/// Examples:
/// - "personId" -> scalar on the source record
/// - "names.firstName" -> field of a branch in the `names` list
/// - "employment.department.code" -> nested object traversal
/// - "self.Contact.Id" -> field of the Contact record built in this pass
/// - "sf.Email" -> field already resolved on the current output record
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath {
    root: PathRoot,
    segments: Vec<String>,
}

/// Error when parsing a field path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldPathError {
    /// Path is empty
    Empty,
    /// Segment is empty
    EmptySegment { path: String },
    /// `self` with nothing after it
    BareSelfReference { path: String },
}

impl std::fmt::Display for FieldPathError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldPathError::Empty => write!(f, "field path cannot be empty"),
            FieldPathError::EmptySegment { path } => {
                write!(f, "field path '{}' contains an empty segment", path)
            }
            FieldPathError::BareSelfReference { path } => {
                write!(f, "field path '{}' must name a field after the self prefix", path)
            }
        }
    }
}

impl std::error::Error for FieldPathError {}

impl FieldPath {
    /// Parse a field path from a string
    pub fn parse(path: &str) -> Result<Self, FieldPathError> {
        let path = path.trim();
        if path.is_empty() {
            return Err(FieldPathError::Empty);
        }

        let mut segments: Vec<String> = path.split('.').map(|s| s.to_string()).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(FieldPathError::EmptySegment {
                path: path.to_string(),
            });
        }

        let root = if SELF_PREFIXES.contains(&segments[0].as_str()) {
            segments.remove(0);
            if segments.is_empty() {
                return Err(FieldPathError::BareSelfReference {
                    path: path.to_string(),
                });
            }
            PathRoot::SelfRef
        } else {
            PathRoot::Source
        };

        Ok(FieldPath { root, segments })
    }

    /// Create a single-field source path (no validation needed)
    pub fn simple(field: impl Into<String>) -> Self {
        FieldPath {
            root: PathRoot::Source,
            segments: vec![field.into()],
        }
    }

    /// Where this path starts resolving
    pub fn root(&self) -> PathRoot {
        self.root
    }

    /// Check if this path references the record being built
    pub fn is_self_ref(&self) -> bool {
        self.root == PathRoot::SelfRef
    }

    /// First segment
    pub fn head(&self) -> &str {
        &self.segments[0]
    }

    /// Segments after the first
    pub fn tail(&self) -> &[String] {
        &self.segments[1..]
    }

    /// Get all segments (without the self prefix)
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Check whether this path begins with the given segments
    pub fn starts_with(&self, prefix: &[String]) -> bool {
        self.root == PathRoot::Source
            && self.segments.len() > prefix.len()
            && self.segments[..prefix.len()] == *prefix
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_self_ref() {
            write!(f, "self.")?;
        }
        write!(f, "{}", self.segments.join("."))
    }
}

impl TryFrom<&str> for FieldPath {
    type Error = FieldPathError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        FieldPath::parse(value)
    }
}

impl TryFrom<String> for FieldPath {
    type Error = FieldPathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        FieldPath::parse(&value)
    }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> Self {
        path.to_string()
    }
}
