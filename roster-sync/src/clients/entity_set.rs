//! Target object name -> Dataverse logical and entity set names

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Naming rules for target objects
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityNames {
    /// Explicit entity set names, keyed by object name
    pub overrides: BTreeMap<String, String>,
    /// Plural by appending s/es only (non-English custom tables)
    pub simple_plurals: bool,
}

impl EntityNames {
    /// Logical name of an object: `Contact` -> `contact`
    pub fn logical_name(&self, object: &str) -> String {
        object.to_lowercase()
    }

    /// Web API entity set of an object: `Contact` -> `contacts`
    pub fn entity_set(&self, object: &str) -> String {
        if let Some(set) = self.overrides.get(object) {
            return set.clone();
        }
        pluralize(&self.logical_name(object), self.simple_plurals)
    }
}

/// English plural of a logical name, the way Dataverse derives entity sets
pub fn pluralize(name: &str, simple: bool) -> String {
    if name.is_empty() {
        return String::new();
    }
    let lower = name.to_lowercase();

    if ["s", "sh", "ch", "x"].iter().any(|end| lower.ends_with(end)) {
        return format!("{}es", name);
    }
    if simple {
        return format!("{}s", name);
    }

    let mut chars = lower.chars().rev();
    let last = chars.next();
    let before_last = chars.next();
    let after_consonant = before_last.is_some_and(|c| !"aeiou".contains(c));

    match last {
        Some('z') if !lower.ends_with("tz") => format!("{}zes", name),
        Some('y') if after_consonant => format!("{}ies", &name[..name.len() - 1]),
        Some('e') if lower.ends_with("fe") => format!("{}ves", &name[..name.len() - 2]),
        Some('f') => format!("{}ves", &name[..name.len() - 1]),
        Some('o') if after_consonant => format!("{}es", name),
        _ => format!("{}s", name),
    }
}
