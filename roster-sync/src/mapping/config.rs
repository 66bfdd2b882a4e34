//! Mapping configuration: one `ObjectConfig` per target object

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use super::graph::DependencyGraph;
use super::{FieldPath, FieldRule, When};
use crate::error::{Result, SyncError};

/// Default name of the originating system
pub const DEFAULT_SOURCE: &str = "hr";

/// Default branch ordering field used for tie-breaks
pub const DEFAULT_ORDERING_FIELD: &str = "updateDate";

/// How source ids map onto target ids
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdMapping {
    /// Candidate source id paths; the first that resolves wins
    #[serde(deserialize_with = "one_or_many")]
    pub source: Vec<FieldPath>,
    /// Target field holding the source id (the upsert key)
    pub target: String,
    /// Target's native record id field (defaults to `<object>id`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native: Option<String>,
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<FieldPath>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(FieldPath),
        Many(Vec<FieldPath>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(path) => vec![path],
        OneOrMany::Many(paths) => paths,
    })
}

/// Configuration for one target object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectConfig {
    /// Target object name (filled from the table key)
    #[serde(skip)]
    pub name: String,
    /// Originating system; empty means the mapping's default source
    #[serde(default)]
    pub source: String,
    /// At most one record per source record (true) or one per branch (false)
    #[serde(default = "default_flat")]
    pub flat: bool,
    /// Ordering tie-break among objects with no dependency between them
    #[serde(default)]
    pub priority: u32,
    pub id_mapping: IdMapping,
    /// Object-scoped branch predicate (branched objects only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<When>,
    /// Target field -> rule
    #[serde(default)]
    pub fields: BTreeMap<String, FieldRule>,
}

fn default_flat() -> bool {
    true
}

impl ObjectConfig {
    /// Create a flat object config with no fields
    pub fn flat(name: impl Into<String>, source_id: &str, target_id: impl Into<String>) -> Self {
        Self::with_mode(name, source_id, target_id, true)
    }

    /// Create a branched object config with no fields
    ///
    /// `source_id` must point into a branch list, e.g. `names.nameId`.
    pub fn branched(name: impl Into<String>, source_id: &str, target_id: impl Into<String>) -> Self {
        Self::with_mode(name, source_id, target_id, false)
    }

    fn with_mode(name: impl Into<String>, source_id: &str, target_id: impl Into<String>, flat: bool) -> Self {
        let source = FieldPath::parse(source_id).unwrap_or_else(|_| FieldPath::simple(source_id));
        ObjectConfig {
            name: name.into(),
            source: String::new(),
            flat,
            priority: 0,
            id_mapping: IdMapping {
                source: vec![source],
                target: target_id.into(),
                native: None,
            },
            when: None,
            fields: BTreeMap::new(),
        }
    }

    /// Add a field rule (builder style)
    pub fn field(mut self, target_field: impl Into<String>, rule: FieldRule) -> Self {
        self.fields.insert(target_field.into(), rule);
        self
    }

    /// Set the object-scoped predicate (builder style)
    pub fn with_when(mut self, when: When) -> Self {
        self.when = Some(when);
        self
    }

    /// Target field holding the source id
    pub fn target_id_field(&self) -> &str {
        &self.id_mapping.target
    }

    /// Target's native id field
    pub fn native_id_field(&self) -> String {
        self.id_mapping
            .native
            .clone()
            .unwrap_or_else(|| format!("{}id", self.name.to_lowercase()))
    }

    /// Segments naming the branch list a branched object iterates
    ///
    /// This is the id path without its last segment, e.g. `names` for
    /// `names.nameId`. Flat objects have no branch list.
    pub fn branch_list(&self) -> Option<&[String]> {
        if self.flat {
            return None;
        }
        let segments = self.id_mapping.source.first()?.segments();
        if segments.len() < 2 {
            return None;
        }
        Some(&segments[..segments.len() - 1])
    }

    /// All `self`-rooted paths read by this object's rules
    pub fn self_paths(&self) -> impl Iterator<Item = &FieldPath> {
        self.fields
            .values()
            .flat_map(|rule| rule.paths())
            .filter(|p| p.is_self_ref())
    }
}

/// Declared shape of the source record's top-level fields
///
/// Optional. When present, every source path is checked against it when the
/// mapping loads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceSchema {
    #[serde(default)]
    pub scalars: BTreeSet<String>,
    #[serde(default)]
    pub objects: BTreeSet<String>,
    #[serde(default)]
    pub branches: BTreeSet<String>,
}

impl SourceSchema {
    fn check(&self, path: &FieldPath, context: &str) -> Result<()> {
        let head = path.head();
        if self.scalars.contains(head) {
            if path.segments().len() > 1 {
                return Err(SyncError::Config(format!(
                    "{}: '{}' traverses scalar field '{}'",
                    context, path, head
                )));
            }
            return Ok(());
        }
        if self.objects.contains(head) || self.branches.contains(head) {
            return Ok(());
        }
        Err(SyncError::Config(format!(
            "{}: '{}' references undeclared source field '{}'",
            context, path, head
        )))
    }
}

/// Which target objects a pass builds
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectFilter {
    /// Only objects fed by this source system
    pub source: Option<String>,
    /// Only these objects (empty means all)
    pub only: BTreeSet<String>,
    /// Never these objects
    pub exclude: BTreeSet<String>,
}

impl ObjectFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn only<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ObjectFilter {
            only: names.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn includes(&self, object: &ObjectConfig) -> bool {
        if let Some(source) = &self.source {
            if &object.source != source {
                return false;
            }
        }
        if !self.only.is_empty() && !self.only.contains(&object.name) {
            return false;
        }
        !self.exclude.contains(&object.name)
    }
}

/// How an object takes part in a transform pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Records are built and upserted
    Build,
    /// Not selected, but referenced by a built object: only its identity is seeded
    Seed,
}

#[derive(Debug, Deserialize)]
struct MappingFile {
    domain: String,
    #[serde(default = "default_source")]
    source: String,
    #[serde(default = "default_ordering_field")]
    ordering_field: String,
    #[serde(default)]
    schema: Option<SourceSchema>,
    #[serde(default)]
    objects: BTreeMap<String, ObjectConfig>,
}

fn default_source() -> String {
    DEFAULT_SOURCE.to_string()
}

fn default_ordering_field() -> String {
    DEFAULT_ORDERING_FIELD.to_string()
}

/// Validated, immutable mapping for one sync domain
#[derive(Debug, Clone)]
pub struct MappingConfig {
    /// Sync domain (watermark key and source resource), e.g. "person"
    pub domain: String,
    /// Default originating system
    pub source: String,
    /// Branch field used for "latest wins" tie-breaks
    pub ordering_field: String,
    pub schema: Option<SourceSchema>,
    objects: BTreeMap<String, ObjectConfig>,
    order: Vec<String>,
}

impl MappingConfig {
    /// Build and validate a mapping from object configs
    pub fn new(domain: impl Into<String>, objects: Vec<ObjectConfig>) -> Result<Self> {
        let objects = objects.into_iter().map(|o| (o.name.clone(), o)).collect();
        Self::assemble(
            domain.into(),
            default_source(),
            default_ordering_field(),
            None,
            objects,
        )
    }

    /// Same as `new`, checking source paths against a declared schema
    pub fn with_schema(
        domain: impl Into<String>,
        schema: SourceSchema,
        objects: Vec<ObjectConfig>,
    ) -> Result<Self> {
        let objects = objects.into_iter().map(|o| (o.name.clone(), o)).collect();
        Self::assemble(
            domain.into(),
            default_source(),
            default_ordering_field(),
            Some(schema),
            objects,
        )
    }

    /// Parse and validate a TOML mapping
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: MappingFile = toml::from_str(content)
            .map_err(|e| SyncError::Config(format!("invalid mapping file: {}", e)))?;
        Self::assemble(
            file.domain,
            file.source,
            file.ordering_field,
            file.schema,
            file.objects,
        )
    }

    /// Load a mapping file from disk
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("failed to read mapping '{}': {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    fn assemble(
        domain: String,
        source: String,
        ordering_field: String,
        schema: Option<SourceSchema>,
        mut objects: BTreeMap<String, ObjectConfig>,
    ) -> Result<Self> {
        if domain.trim().is_empty() {
            return Err(SyncError::Config("mapping domain cannot be empty".into()));
        }
        if objects.is_empty() {
            return Err(SyncError::Config("mapping defines no objects".into()));
        }

        for (name, object) in objects.iter_mut() {
            object.name = name.clone();
            if object.source.is_empty() {
                object.source = source.clone();
            }
        }

        let order = DependencyGraph::build(&objects).topological_sort()?;

        let config = MappingConfig {
            domain,
            source,
            ordering_field,
            schema,
            objects,
            order,
        };
        config.validate()?;

        log::debug!(
            "Mapping '{}' loaded: {} objects, order {:?}",
            config.domain,
            config.objects.len(),
            config.order
        );

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for object in self.objects.values() {
            self.validate_id_mapping(object)?;
            self.validate_rules(object)?;
        }
        Ok(())
    }

    fn validate_id_mapping(&self, object: &ObjectConfig) -> Result<()> {
        let ctx = format!("object '{}'", object.name);
        let ids = &object.id_mapping;

        if ids.target.trim().is_empty() {
            return Err(SyncError::Config(format!("{}: id_mapping.target is empty", ctx)));
        }
        if ids.source.is_empty() {
            return Err(SyncError::Config(format!("{}: id_mapping.source is empty", ctx)));
        }
        if let Some(path) = ids.source.iter().find(|p| p.is_self_ref()) {
            return Err(SyncError::Config(format!(
                "{}: id source '{}' cannot reference self",
                ctx, path
            )));
        }

        if object.flat {
            if object.when.is_some() {
                return Err(SyncError::Config(format!(
                    "{}: object-scoped 'when' requires a branched object",
                    ctx
                )));
            }
        } else {
            let Some(list) = object.branch_list() else {
                return Err(SyncError::Config(format!(
                    "{}: branched id source '{}' must point into a branch list (e.g. 'names.nameId')",
                    ctx, ids.source[0]
                )));
            };
            let list = list.to_vec();
            if let Some(other) = ids.source.iter().find(|p| !p.starts_with(&list)) {
                return Err(SyncError::Config(format!(
                    "{}: id candidate '{}' is not in branch list '{}'",
                    ctx,
                    other,
                    list.join(".")
                )));
            }
            if let Some(schema) = &self.schema {
                if !schema.branches.contains(&list[0]) {
                    return Err(SyncError::Config(format!(
                        "{}: '{}' is not a declared branch list",
                        ctx, list[0]
                    )));
                }
            }
        }

        if let Some(when) = &object.when {
            if let Some((path, _)) = when.entries().find(|(p, _)| p.is_self_ref()) {
                return Err(SyncError::Config(format!(
                    "{}: predicate path '{}' cannot reference self",
                    ctx, path
                )));
            }
        }

        if let Some(schema) = &self.schema {
            for path in &ids.source {
                schema.check(path, &ctx)?;
            }
        }

        Ok(())
    }

    fn validate_rules(&self, object: &ObjectConfig) -> Result<()> {
        for (field, rule) in &object.fields {
            let ctx = format!("field '{}.{}'", object.name, field);

            if let FieldRule::AnyOf(paths) = rule {
                if paths.is_empty() {
                    return Err(SyncError::Config(format!("{}: empty path list", ctx)));
                }
            }

            if let FieldRule::Conditional { when, .. } = rule {
                if when.is_empty() {
                    return Err(SyncError::Config(format!("{}: empty 'when'", ctx)));
                }
                if let Some((path, _)) = when.entries().find(|(p, _)| p.is_self_ref()) {
                    return Err(SyncError::Config(format!(
                        "{}: predicate path '{}' cannot reference self",
                        ctx, path
                    )));
                }
            }

            for path in rule.paths() {
                if path.is_self_ref() {
                    self.validate_self_path(object, path, &ctx)?;
                } else if let Some(schema) = &self.schema {
                    schema.check(path, &ctx)?;
                }
            }
        }
        Ok(())
    }

    fn validate_self_path(&self, object: &ObjectConfig, path: &FieldPath, ctx: &str) -> Result<()> {
        let head = path.head();

        if let Some(target) = self.objects.get(head).filter(|_| head != object.name) {
            if path.segments().len() != 2 {
                return Err(SyncError::Config(format!(
                    "{}: '{}' must name exactly one field of '{}'",
                    ctx, path, head
                )));
            }
            if !target.flat {
                return Err(SyncError::Config(format!(
                    "{}: '{}' references branched object '{}'",
                    ctx, path, head
                )));
            }
            return Ok(());
        }

        // Reference to a field of the record being built
        if path.segments().len() != 1 {
            return Err(SyncError::Config(format!(
                "{}: '{}' references unknown object '{}'",
                ctx, path, head
            )));
        }
        let is_identity = head == object.target_id_field() || head == object.native_id_field();
        match object.fields.get(head) {
            Some(rule) if rule.references_self() => Err(SyncError::Config(format!(
                "{}: '{}' points at another self-referencing field",
                ctx, path
            ))),
            Some(_) => Ok(()),
            None if is_identity => Ok(()),
            None => Err(SyncError::Config(format!(
                "{}: '{}' references unknown field '{}'",
                ctx, path, head
            ))),
        }
    }

    /// Look up an object config by name
    pub fn object(&self, name: &str) -> Option<&ObjectConfig> {
        self.objects.get(name)
    }

    /// Object names in dependency order
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Object configs in dependency order
    pub fn objects(&self) -> impl Iterator<Item = &ObjectConfig> {
        self.order.iter().filter_map(|name| self.objects.get(name))
    }

    /// Reject filters naming objects this mapping does not define
    pub fn check_filter(&self, filter: &ObjectFilter) -> Result<()> {
        for name in filter.only.iter().chain(filter.exclude.iter()) {
            if !self.objects.contains_key(name) {
                return Err(SyncError::Config(format!("unknown target object '{}'", name)));
            }
        }
        Ok(())
    }

    /// Objects taking part in a pass under the given filter, in dependency order
    pub fn plan(&self, filter: &ObjectFilter) -> Vec<(&ObjectConfig, Role)> {
        let built: BTreeSet<&str> = self
            .objects()
            .filter(|o| filter.includes(o))
            .map(|o| o.name.as_str())
            .collect();

        let seeded: BTreeSet<&str> = built
            .iter()
            .filter_map(|name| self.objects.get(*name))
            .flat_map(|o| o.self_paths())
            .map(|p| p.head())
            .filter(|head| self.objects.contains_key(*head) && !built.contains(head))
            .collect();

        self.objects()
            .filter_map(|o| {
                if built.contains(o.name.as_str()) {
                    Some((o, Role::Build))
                } else if seeded.contains(o.name.as_str()) {
                    Some((o, Role::Seed))
                } else {
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPPING: &str = r#"
        domain = "person"
        source = "hr"

        [schema]
        scalars = ["personId", "updateDate", "active"]
        objects = ["employment"]
        branches = ["names", "emails"]

        [objects.Contact]
        id_mapping = { source = "personId", target = "HR_Person_Id", native = "contactid" }

        [objects.Contact.fields]
        LastName = "names.lastName"
        FirstName = { path = "names.firstName", when = { "names.type" = ["Preferred", "Legal"] } }
        Email = ["emails.address", "employment.email"]
        Active = "active"

        [objects.Name]
        flat = false
        id_mapping = { source = "names.nameId", target = "HR_Name_Id" }

        [objects.Name.fields]
        Contact = "self.Contact.contactid"
        First = "names.firstName"
        Type = "names.type"
    "#;

    #[test]
    fn test_load_mapping() {
        let config = MappingConfig::from_toml_str(MAPPING).unwrap();

        assert_eq!(config.domain, "person");
        assert_eq!(config.ordering_field, DEFAULT_ORDERING_FIELD);
        assert_eq!(config.order(), ["Contact".to_string(), "Name".to_string()]);

        let contact = config.object("Contact").unwrap();
        assert!(contact.flat);
        assert_eq!(contact.name, "Contact");
        assert_eq!(contact.source, "hr");
        assert_eq!(contact.native_id_field(), "contactid");
        assert_eq!(contact.fields.len(), 4);

        let name = config.object("Name").unwrap();
        assert!(!name.flat);
        assert_eq!(name.branch_list(), Some(&["names".to_string()][..]));
        assert_eq!(name.native_id_field(), "nameid");
    }

    #[test]
    fn test_id_source_accepts_list() {
        let config = MappingConfig::from_toml_str(
            r#"
            domain = "department"
            [objects.Department]
            id_mapping = { source = ["departmentId", "legacyCode"], target = "HR_Dept_Id" }
            "#,
        )
        .unwrap();
        assert_eq!(config.object("Department").unwrap().id_mapping.source.len(), 2);
    }

    #[test]
    fn test_undeclared_schema_field_rejected() {
        let mapping = MAPPING.replace("Active = \"active\"", "Active = \"isActive\"");
        let err = MappingConfig::from_toml_str(&mapping).unwrap_err();
        assert!(matches!(err, SyncError::Config(msg) if msg.contains("undeclared source field 'isActive'")));
    }

    #[test]
    fn test_scalar_traversal_rejected() {
        let mapping = MAPPING.replace("Active = \"active\"", "Active = \"active.flag\"");
        let err = MappingConfig::from_toml_str(&mapping).unwrap_err();
        assert!(matches!(err, SyncError::Config(msg) if msg.contains("traverses scalar")));
    }

    #[test]
    fn test_empty_target_id_rejected() {
        let objects = vec![ObjectConfig::flat("Contact", "personId", "")];
        let err = MappingConfig::new("person", objects).unwrap_err();
        assert!(matches!(err, SyncError::Config(msg) if msg.contains("id_mapping.target is empty")));
    }

    #[test]
    fn test_branched_id_must_point_into_list() {
        let objects = vec![ObjectConfig::branched("Name", "nameId", "HR_Name_Id")];
        let err = MappingConfig::new("person", objects).unwrap_err();
        assert!(matches!(err, SyncError::Config(msg) if msg.contains("must point into a branch list")));
    }

    #[test]
    fn test_self_reference_to_branched_object_rejected() {
        let objects = vec![
            ObjectConfig::branched("Name", "names.nameId", "HR_Name_Id"),
            ObjectConfig::flat("Contact", "personId", "HR_Id").field(
                "FirstNameId",
                FieldRule::Direct(FieldPath::parse("self.Name.HR_Name_Id").unwrap()),
            ),
        ];
        let err = MappingConfig::new("person", objects).unwrap_err();
        assert!(matches!(err, SyncError::Config(msg) if msg.contains("branched object 'Name'")));
    }

    #[test]
    fn test_self_reference_cycle_rejected() {
        let objects = vec![
            ObjectConfig::flat("A", "personId", "HR_Id")
                .field("B", FieldRule::Direct(FieldPath::parse("sf.B.HR_Id").unwrap())),
            ObjectConfig::flat("B", "personId", "HR_Id")
                .field("A", FieldRule::Direct(FieldPath::parse("sf.A.HR_Id").unwrap())),
        ];
        let err = MappingConfig::new("person", objects).unwrap_err();
        assert!(matches!(err, SyncError::Config(msg) if msg.contains("circular")));
    }

    #[test]
    fn test_own_field_reference_validation() {
        let ok = vec![
            ObjectConfig::flat("Contact", "personId", "HR_Id")
                .field("Email", FieldRule::Direct(FieldPath::simple("email")))
                .field("Username", FieldRule::Direct(FieldPath::parse("self.Email").unwrap()))
                .field("Key", FieldRule::Direct(FieldPath::parse("self.HR_Id").unwrap())),
        ];
        assert!(MappingConfig::new("person", ok).is_ok());

        let unknown = vec![
            ObjectConfig::flat("Contact", "personId", "HR_Id")
                .field("Username", FieldRule::Direct(FieldPath::parse("self.Email").unwrap())),
        ];
        let err = MappingConfig::new("person", unknown).unwrap_err();
        assert!(matches!(err, SyncError::Config(msg) if msg.contains("unknown field 'Email'")));
    }

    #[test]
    fn test_plan_seeds_referenced_objects() {
        let config = MappingConfig::from_toml_str(MAPPING).unwrap();

        let plan = config.plan(&ObjectFilter::only(["Name"]));
        let plan: Vec<(&str, Role)> = plan.iter().map(|(o, r)| (o.name.as_str(), *r)).collect();
        assert_eq!(plan, vec![("Contact", Role::Seed), ("Name", Role::Build)]);

        let mut filter = ObjectFilter::all();
        filter.exclude.insert("Name".to_string());
        let plan = config.plan(&filter);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].1, Role::Build);

        let mut filter = ObjectFilter::all();
        filter.source = Some("payroll".to_string());
        assert!(config.plan(&filter).is_empty());
    }

    #[test]
    fn test_check_filter_unknown_object() {
        let config = MappingConfig::from_toml_str(MAPPING).unwrap();
        assert!(config.check_filter(&ObjectFilter::only(["Contact"])).is_ok());
        assert!(config.check_filter(&ObjectFilter::only(["Account"])).is_err());
    }
}
