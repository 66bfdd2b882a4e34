//! Field rules: how a target field gets its value

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{FieldPath, Value};

/// A rule that produces a target field value from a source record
///
/// In a mapping file:
/// - `"names.firstName"` -> `Direct`
/// - `["workEmail", "privateEmail"]` -> `AnyOf`
/// - `{ path = "names.firstName", when = { "names.type" = ["Preferred", "Legal"] } }`
///   -> `Conditional`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldRule {
    /// Copy the value at a path
    Direct(FieldPath),
    /// First path that resolves to a non-null value wins
    AnyOf(Vec<FieldPath>),
    /// Copy the value at a path from the branch matching a predicate
    Conditional { path: FieldPath, when: When },
}

impl FieldRule {
    /// All paths this rule reads from (not including `when` paths)
    pub fn paths(&self) -> Vec<&FieldPath> {
        match self {
            FieldRule::Direct(path) => vec![path],
            FieldRule::AnyOf(paths) => paths.iter().collect(),
            FieldRule::Conditional { path, .. } => vec![path],
        }
    }

    /// Whether any of the rule's paths read from the record being built
    pub fn references_self(&self) -> bool {
        self.paths().iter().any(|p| p.is_self_ref())
    }

    /// Get a human-readable description of this rule
    pub fn describe(&self) -> String {
        match self {
            FieldRule::Direct(path) => format!("copy({})", path),
            FieldRule::AnyOf(paths) => {
                let paths: Vec<String> = paths.iter().map(|p| p.to_string()).collect();
                format!("any({})", paths.join(", "))
            }
            FieldRule::Conditional { path, when } => format!("copy({}) when {}", path, when),
        }
    }
}

/// Allowed value(s) for one `when` predicate entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Allowed {
    /// Must equal exactly
    One(Value),
    /// Priority list: earlier entries outrank later ones
    Priority(Vec<Value>),
}

impl Allowed {
    /// Rank of a value against this predicate (lower is better)
    ///
    /// `None` means the value is not eligible.
    pub fn rank(&self, actual: &Value) -> Option<usize> {
        match self {
            Allowed::One(expected) => expected.matches(actual).then_some(0),
            Allowed::Priority(entries) => entries.iter().position(|e| e.matches(actual)),
        }
    }
}

impl std::fmt::Display for Allowed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Allowed::One(value) => write!(f, "{}", value),
            Allowed::Priority(entries) => {
                let entries: Vec<String> = entries.iter().map(|e| e.to_string()).collect();
                write!(f, "[{}]", entries.join(" > "))
            }
        }
    }
}

/// A branch predicate: every path must match its allowed value(s)
///
/// Entries are evaluated in path order; when several entries are priority
/// lists, ranks compare lexicographically in that same order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct When(BTreeMap<FieldPath, Allowed>);

impl When {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a predicate entry (builder style)
    pub fn with(mut self, path: FieldPath, allowed: Allowed) -> Self {
        self.0.insert(path, allowed);
        self
    }

    pub fn entries(&self) -> impl Iterator<Item = (&FieldPath, &Allowed)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for When {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(path, allowed)| format!("{} = {}", path, allowed))
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}
