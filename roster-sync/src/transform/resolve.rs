//! FieldPath resolution against source records and the record being built

use std::collections::BTreeMap;

use serde_json::Value as Json;

use crate::error::{Result, SyncError};
use crate::mapping::{FieldPath, Value};

use super::OutputRecord;

/// Outcome of resolving a source path
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<'a> {
    /// A non-null scalar
    Found(Value),
    /// Absent, null, or not a scalar
    Missing,
    /// The path crosses a list; a branch has to be chosen first
    Branched {
        /// Segments naming the list (e.g. `["names"]`)
        list: &'a [String],
        branches: &'a [Json],
        /// Segments to read inside the chosen branch
        rest: &'a [String],
    },
}

/// Resolve a source-rooted path against a source record
///
/// Keys are matched exactly first, then case-insensitively.
pub fn resolve_source<'a>(record: &'a Json, path: &'a FieldPath) -> Resolution<'a> {
    let segments = path.segments();
    let mut current = record;

    for (i, segment) in segments.iter().enumerate() {
        let Some(next) = lookup_key(current, segment) else {
            return Resolution::Missing;
        };

        if let Json::Array(branches) = next {
            let rest = &segments[i + 1..];
            if rest.is_empty() {
                log::debug!("Path '{}' addresses a list, not a scalar", path);
                return Resolution::Missing;
            }
            return Resolution::Branched {
                list: &segments[..=i],
                branches,
                rest,
            };
        }
        current = next;
    }

    scalar(current).map_or(Resolution::Missing, Resolution::Found)
}

/// Locate the list a path of segments names on a source record
///
/// Absent lists and non-list values yield no branches.
pub fn branches_at<'a>(record: &'a Json, list: &[String]) -> &'a [Json] {
    let mut current = record;
    for segment in list {
        match lookup_key(current, segment) {
            Some(next) => current = next,
            None => return &[],
        }
    }
    match current {
        Json::Array(branches) => branches,
        _ => &[],
    }
}

/// Read a value inside one branch
///
/// `Some(Value::Null)` means the field exists but is null; `None` means it is
/// absent. When absent, the leading segment is stripped once and the lookup
/// retried, so a redundantly qualified path (`name.first` on a branch that
/// only has `first`) still resolves.
pub fn branch_value(branch: &Json, rest: &[String]) -> Option<Value> {
    lookup_nested(branch, rest).or_else(|| {
        if rest.len() > 1 {
            lookup_nested(branch, &rest[1..])
        } else {
            None
        }
    })
}

/// Segments of `path` relative to a branch of `list`
pub fn relative_to<'a>(path: &'a FieldPath, list: &[String]) -> &'a [String] {
    if path.starts_with(list) {
        &path.segments()[list.len()..]
    } else {
        path.segments()
    }
}

fn lookup_nested(value: &Json, segments: &[String]) -> Option<Value> {
    let mut current = value;
    for segment in segments {
        current = lookup_key(current, segment)?;
    }
    match current {
        Json::Null => Some(Value::Null),
        other => Value::from_json(other),
    }
}

fn scalar(value: &Json) -> Option<Value> {
    Value::from_json(value).filter(|v| !v.is_null())
}

fn lookup_key<'a>(value: &'a Json, key: &str) -> Option<&'a Json> {
    let obj = value.as_object()?;
    if let Some(found) = obj.get(key) {
        return Some(found);
    }
    let key_lower = key.to_lowercase();
    obj.iter()
        .find(|(k, _)| k.to_lowercase() == key_lower)
        .map(|(_, v)| v)
}

/// Records already built for the current source record
///
/// `self.<Object>.<field>` reads a flat record built (or seeded) earlier in
/// dependency order; `self.<field>` reads the record under construction.
#[derive(Debug, Default)]
pub struct SelfView {
    objects: BTreeMap<String, OutputRecord>,
}

impl SelfView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, object: impl Into<String>, record: OutputRecord) {
        self.objects.insert(object.into(), record);
    }

    pub fn get(&self, object: &str) -> Option<&OutputRecord> {
        self.objects.get(object)
    }

    /// Resolve a `self` path for `object`; absence is an error
    pub fn resolve(&self, path: &FieldPath, object: &str, current: &OutputRecord) -> Result<Value> {
        let segments = path.segments();

        let found = match segments {
            [other, field] if other.as_str() != object && self.objects.contains_key(other) => {
                self.objects.get(other).and_then(|record| record.get(field))
            }
            [field] => current.get(field),
            _ => None,
        };

        found
            .filter(|v| !v.is_null())
            .cloned()
            .ok_or_else(|| SyncError::RequiredCrossReferenceMissing {
                object: object.to_string(),
                path: path.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(s: &str) -> FieldPath {
        FieldPath::parse(s).unwrap()
    }

    fn person() -> Json {
        json!({
            "personId": "P-1",
            "Active": true,
            "middleName": null,
            "employment": { "department": { "code": "FIN" } },
            "names": [
                { "nameId": "N-1", "firstName": "Ann", "type": "Legal" },
                { "nameId": "N-2", "firstName": "Annie", "type": "Preferred" }
            ]
        })
    }

    #[test]
    fn test_resolve_scalar_and_nested() {
        let record = person();
        let p = path("personId");
        assert_eq!(resolve_source(&record, &p), Resolution::Found(Value::from("P-1")));

        let p = path("employment.department.code");
        assert_eq!(resolve_source(&record, &p), Resolution::Found(Value::from("FIN")));

        // case-insensitive fallback
        let p = path("active");
        assert_eq!(resolve_source(&record, &p), Resolution::Found(Value::Bool(true)));
    }

    #[test]
    fn test_resolve_missing_and_null() {
        let record = person();
        for p in ["nickname", "middleName", "employment", "employment.site.code"] {
            let p = path(p);
            assert_eq!(resolve_source(&record, &p), Resolution::Missing, "{}", p);
        }
    }

    #[test]
    fn test_resolve_signals_branched() {
        let record = person();
        let p = path("names.firstName");
        let Resolution::Branched { list, branches, rest } = resolve_source(&record, &p) else {
            panic!("expected branched resolution");
        };
        assert_eq!(list, ["names".to_string()]);
        assert_eq!(branches.len(), 2);
        assert_eq!(rest, ["firstName".to_string()]);

        // the list itself is not a scalar
        assert_eq!(resolve_source(&record, &path("names")), Resolution::Missing);
    }

    #[test]
    fn test_branch_value_strips_leading_segment_once() {
        let branch = json!({ "first": "Ann", "suffix": null });
        let rest = |s: &str| -> Vec<String> { s.split('.').map(String::from).collect() };

        assert_eq!(branch_value(&branch, &rest("first")), Some(Value::from("Ann")));
        assert_eq!(branch_value(&branch, &rest("name.first")), Some(Value::from("Ann")));
        assert_eq!(branch_value(&branch, &rest("suffix")), Some(Value::Null));
        assert_eq!(branch_value(&branch, &rest("a.b.first")), None);
        assert_eq!(branch_value(&branch, &rest("last")), None);
    }

    #[test]
    fn test_branches_at() {
        let record = person();
        assert_eq!(branches_at(&record, &["names".to_string()]).len(), 2);
        assert!(branches_at(&record, &["emails".to_string()]).is_empty());
        assert!(branches_at(&record, &["personId".to_string()]).is_empty());
    }

    #[test]
    fn test_self_view_resolution() {
        let mut view = SelfView::new();
        let mut contact = OutputRecord::new();
        contact.insert("contactid".into(), Value::from("c-guid"));
        view.insert("Contact", contact);

        let mut current = OutputRecord::new();
        current.insert("Email".into(), Value::from("ann@example.com"));

        assert_eq!(
            view.resolve(&path("self.Contact.contactid"), "Name", &current).unwrap(),
            Value::from("c-guid")
        );
        assert_eq!(
            view.resolve(&path("sf.Email"), "Name", &current).unwrap(),
            Value::from("ann@example.com")
        );

        let err = view
            .resolve(&path("self.Contact.HR_Id"), "Name", &current)
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::RequiredCrossReferenceMissing { ref object, ref path }
                if object == "Name" && path == "self.Contact.HR_Id"
        ));
    }
}
