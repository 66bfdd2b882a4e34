//! Record transformer: source records to per-object output records

use serde_json::Value as Json;

use crate::error::Result;
use crate::mapping::{FieldPath, FieldRule, MappingConfig, ObjectConfig, ObjectFilter, Role, Value, When};

use super::branch::{BranchCache, BranchSelector};
use super::identity::{HashedIdMap, IdMaps, source_id};
use super::resolve::{Resolution, SelfView, branch_value, branches_at, relative_to, resolve_source};
use super::{OutputRecord, TransformOutput};

/// The branch a branched object's record is being built from
#[derive(Clone, Copy)]
struct BranchContext<'a> {
    list: &'a [String],
    branches: &'a [Json],
    index: usize,
}

impl<'a> BranchContext<'a> {
    fn branch(&self) -> &'a Json {
        &self.branches[self.index]
    }
}

/// Per-source-record transform state
struct RecordScope<'a> {
    record: &'a Json,
    view: SelfView,
    cache: BranchCache,
}

/// Turns batches of source records into target records
///
/// Objects are visited in dependency order so every `self.<Object>` reference
/// reads a record that was already built (or seeded) for the same source
/// record.
pub struct RecordTransformer<'a> {
    mapping: &'a MappingConfig,
    ids: &'a IdMaps,
    selector: BranchSelector<'a>,
}

impl<'a> RecordTransformer<'a> {
    pub fn new(mapping: &'a MappingConfig, ids: &'a IdMaps) -> Self {
        RecordTransformer {
            mapping,
            ids,
            selector: BranchSelector::new(&mapping.ordering_field),
        }
    }

    /// Transform a batch; the first record-level error aborts the batch
    pub fn transform(&self, records: &[Json], filter: &ObjectFilter) -> Result<TransformOutput> {
        let plan = self.mapping.plan(filter);
        let mut output = TransformOutput::new();
        for (object, role) in &plan {
            if *role == Role::Build {
                output.entry(object.name.clone()).or_default();
            }
        }

        let mut cache_hits = 0;
        for record in records {
            let mut scope = RecordScope {
                record,
                view: SelfView::new(),
                cache: BranchCache::new(),
            };

            for (object, role) in &plan {
                match role {
                    Role::Seed => self.seed(object, &mut scope)?,
                    Role::Build if object.flat => {
                        if let Some(built) = self.build_flat(object, &mut scope)? {
                            output.entry(object.name.clone()).or_default().push(built);
                        }
                    }
                    Role::Build => {
                        let built = self.build_branched(object, &mut scope)?;
                        output.entry(object.name.clone()).or_default().extend(built);
                    }
                }
            }
            cache_hits += scope.cache.hits();
        }

        log::debug!(
            "Transformed {} source records into {} output records ({} cached branch selections reused)",
            records.len(),
            output.values().map(Vec::len).sum::<usize>(),
            cache_hits
        );

        Ok(output)
    }

    fn id_map(&self, object: &ObjectConfig) -> HashedIdMap {
        self.ids
            .get(&object.name)
            .cloned()
            .unwrap_or_else(|| HashedIdMap::new(object.target_id_field(), object.native_id_field()))
    }

    /// Identity-only record for an object referenced but not built this pass
    fn seed(&self, object: &ObjectConfig, scope: &mut RecordScope<'_>) -> Result<()> {
        if let Some(id) = source_id(object, scope.record, None)? {
            let mut record = OutputRecord::new();
            self.id_map(object).set_id(&mut record, &id);
            scope.view.insert(object.name.clone(), record);
        }
        Ok(())
    }

    fn build_flat(&self, object: &ObjectConfig, scope: &mut RecordScope<'_>) -> Result<Option<OutputRecord>> {
        let Some(id) = source_id(object, scope.record, None)? else {
            return Ok(None);
        };
        let ids = self.id_map(object);
        let built = self.build_record(object, scope, None, &ids, &id)?;
        scope.view.insert(object.name.clone(), built.clone());
        Ok(Some(built))
    }

    fn build_branched(&self, object: &ObjectConfig, scope: &mut RecordScope<'_>) -> Result<Vec<OutputRecord>> {
        let Some(list) = object.branch_list() else {
            return Ok(Vec::new());
        };
        let branches = branches_at(scope.record, list);
        let selected = self
            .selector
            .select_all(branches, object.when.as_ref(), list)?;

        let ids = self.id_map(object);
        let mut built = Vec::with_capacity(selected.len());
        for index in selected {
            let ctx = BranchContext {
                list,
                branches,
                index,
            };
            let Some(id) = source_id(object, scope.record, Some(ctx.branch()))? else {
                continue;
            };
            built.push(self.build_record(object, scope, Some(ctx), &ids, &id)?);
        }
        Ok(built)
    }

    /// Resolve plain rules, stamp identity, then resolve `self` rules
    fn build_record(
        &self,
        object: &ObjectConfig,
        scope: &mut RecordScope<'_>,
        branch: Option<BranchContext<'_>>,
        ids: &HashedIdMap,
        id: &str,
    ) -> Result<OutputRecord> {
        let mut record = OutputRecord::new();

        for (field, rule) in object.fields.iter().filter(|(_, r)| !r.references_self()) {
            if let Some(value) = self.resolve_rule(rule, scope, branch)? {
                record.insert(field.clone(), value);
            }
        }

        ids.set_id(&mut record, id);

        for (field, rule) in object.fields.iter().filter(|(_, r)| r.references_self()) {
            let mut resolved = None;
            for path in rule.paths() {
                let value = if path.is_self_ref() {
                    Some(scope.view.resolve(path, &object.name, &record)?)
                } else {
                    self.resolve_path(path, scope, branch)?
                };
                if value.is_some() {
                    resolved = value;
                    break;
                }
            }
            if let Some(value) = resolved.and_then(Value::into_target) {
                record.insert(field.clone(), value);
            }
        }

        Ok(record)
    }

    fn resolve_rule(
        &self,
        rule: &FieldRule,
        scope: &mut RecordScope<'_>,
        branch: Option<BranchContext<'_>>,
    ) -> Result<Option<Value>> {
        let value = match rule {
            FieldRule::Direct(path) => self.resolve_path(path, scope, branch)?,
            FieldRule::AnyOf(paths) => {
                let mut found = None;
                for path in paths {
                    found = self.resolve_path(path, scope, branch)?;
                    if found.is_some() {
                        break;
                    }
                }
                found
            }
            FieldRule::Conditional { path, when } => self.resolve_conditional(path, when, scope, branch)?,
        };
        Ok(value.and_then(Value::into_target))
    }

    /// Non-null value at a source path
    fn resolve_path(
        &self,
        path: &FieldPath,
        scope: &mut RecordScope<'_>,
        branch: Option<BranchContext<'_>>,
    ) -> Result<Option<Value>> {
        if let Some(ctx) = branch.filter(|ctx| path.starts_with(ctx.list)) {
            return Ok(non_null(branch_value(ctx.branch(), relative_to(path, ctx.list))));
        }

        match resolve_source(scope.record, path) {
            Resolution::Found(value) => Ok(Some(value)),
            Resolution::Missing => Ok(None),
            Resolution::Branched { list, branches, rest } => {
                let best = scope.cache.best(&self.selector, branches, None, list)?;
                Ok(best.and_then(|i| non_null(branch_value(&branches[i], rest))))
            }
        }
    }

    fn resolve_conditional(
        &self,
        path: &FieldPath,
        when: &When,
        scope: &mut RecordScope<'_>,
        branch: Option<BranchContext<'_>>,
    ) -> Result<Option<Value>> {
        // Own list: the current branch must itself satisfy the predicate
        if let Some(ctx) = branch.filter(|ctx| path.starts_with(ctx.list)) {
            let eligible = self.selector.select_all(ctx.branches, Some(when), ctx.list)?;
            if !eligible.contains(&ctx.index) {
                return Ok(None);
            }
            return Ok(non_null(branch_value(ctx.branch(), relative_to(path, ctx.list))));
        }

        match resolve_source(scope.record, path) {
            Resolution::Found(value) => Ok(self.root_matches(scope.record, when).then_some(value)),
            Resolution::Missing => Ok(None),
            Resolution::Branched { list, branches, rest } => {
                let best = scope.cache.best(&self.selector, branches, Some(when), list)?;
                Ok(best.and_then(|i| non_null(branch_value(&branches[i], rest))))
            }
        }
    }

    /// Predicate over plain (non-list) source fields
    fn root_matches(&self, record: &Json, when: &When) -> bool {
        when.entries().all(|(path, allowed)| match resolve_source(record, path) {
            Resolution::Found(value) => allowed.rank(&value).is_some(),
            _ => false,
        })
    }
}

fn non_null(value: Option<Value>) -> Option<Value> {
    value.filter(|v| !v.is_null())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::mapping::Allowed;
    use serde_json::json;

    const MAPPING: &str = r#"
        domain = "person"

        [objects.Contact]
        id_mapping = { source = "personId", target = "HR_Person_Id" }

        [objects.Contact.fields]
        LastName = "names.lastName"
        FirstName = { path = "names.firstName", when = { "names.type" = ["Preferred", "Legal"] } }
        Email = ["workEmail", "privateEmail"]
        Active = "active"
        Department = "employment.department.code"

        [objects.Name]
        flat = false
        id_mapping = { source = "names.nameId", target = "HR_Name_Id" }

        [objects.Name.fields]
        Contact = "self.Contact.HR_Person_Id"
        First = "names.firstName"
        Type = "names.type"
        IsLegal = { path = "names.type", when = { "names.type" = "Legal" } }
    "#;

    fn mapping() -> MappingConfig {
        MappingConfig::from_toml_str(MAPPING).unwrap()
    }

    fn person(id: &str) -> Json {
        json!({
            "personId": id,
            "active": true,
            "privateEmail": "ann@example.com",
            "employment": { "department": { "code": "FIN" } },
            "names": [
                { "nameId": format!("{}-N1", id), "type": "Legal", "firstName": "Ann", "lastName": "Smith", "updateDate": "2024-01-01" },
                { "nameId": format!("{}-N2", id), "type": "Preferred", "firstName": "Annie", "lastName": "Smith-Jones", "updateDate": "2023-01-01" },
                { "nameId": format!("{}-N3", id), "type": "Birth", "firstName": "Anna", "lastName": "Berg", "updateDate": "2024-06-01" }
            ]
        })
    }

    fn transform(config: &MappingConfig, ids: &IdMaps, records: &[Json], filter: &ObjectFilter) -> Result<TransformOutput> {
        RecordTransformer::new(config, ids).transform(records, filter)
    }

    #[test]
    fn test_flat_object_fields() {
        let config = mapping();
        let out = transform(&config, &IdMaps::new(), &[person("P-1")], &ObjectFilter::all()).unwrap();

        let contacts = &out["Contact"];
        assert_eq!(contacts.len(), 1);
        let contact = &contacts[0];

        // Preferred outranks Legal despite being older
        assert_eq!(contact["FirstName"], Value::from("Annie"));
        // No predicate: latest branch
        assert_eq!(contact["LastName"], Value::from("Berg"));
        // AnyOf falls through to the second path
        assert_eq!(contact["Email"], Value::from("ann@example.com"));
        // Booleans become Y/N
        assert_eq!(contact["Active"], Value::from("Y"));
        assert_eq!(contact["Department"], Value::from("FIN"));
        assert_eq!(contact["HR_Person_Id"], Value::from("P-1"));
        assert!(!contact.contains_key("contactid"));
    }

    #[test]
    fn test_flat_yields_at_most_one_record_per_source_record() {
        let config = mapping();
        let records = vec![person("P-1"), person("P-2"), json!({ "names": [] })];
        let out = transform(&config, &IdMaps::new(), &records, &ObjectFilter::all()).unwrap();
        assert_eq!(out["Contact"].len(), 2);
    }

    #[test]
    fn test_branched_yields_one_record_per_branch() {
        let config = mapping();
        let out = transform(&config, &IdMaps::new(), &[person("P-1")], &ObjectFilter::all()).unwrap();

        let names = &out["Name"];
        assert_eq!(names.len(), 3);
        let ids: Vec<&Value> = names.iter().map(|n| &n["HR_Name_Id"]).collect();
        assert_eq!(ids, vec![&Value::from("P-1-N1"), &Value::from("P-1-N2"), &Value::from("P-1-N3")]);

        for name in names {
            assert_eq!(name["Contact"], Value::from("P-1"));
        }
        // Per-field predicate on the own list applies to the current branch
        assert_eq!(names[0]["IsLegal"], Value::from("Legal"));
        assert!(!names[1].contains_key("IsLegal"));
    }

    #[test]
    fn test_object_scoped_when_filters_branches() {
        let when = When::new().with(
            FieldPath::parse("names.type").unwrap(),
            Allowed::Priority(vec![Value::from("Legal"), Value::from("Preferred")]),
        );
        let config = MappingConfig::new(
            "person",
            vec![
                ObjectConfig::branched("Name", "names.nameId", "HR_Name_Id")
                    .with_when(when)
                    .field("First", FieldRule::Direct(FieldPath::parse("names.firstName").unwrap())),
            ],
        )
        .unwrap();

        let out = transform(&config, &IdMaps::new(), &[person("P-1")], &ObjectFilter::all()).unwrap();
        let firsts: Vec<&Value> = out["Name"].iter().map(|n| &n["First"]).collect();
        // Branched mode: every eligible branch, source order, no tie-break
        assert_eq!(firsts, vec![&Value::from("Ann"), &Value::from("Annie")]);
    }

    #[test]
    fn test_when_path_absent_on_every_branch() {
        let mapping = MAPPING.replace(
            r#"when = { "names.type" = "Legal" }"#,
            r#"when = { "names.kind" = "Legal" }"#,
        );
        let config = MappingConfig::from_toml_str(&mapping).unwrap();
        let err = transform(&config, &IdMaps::new(), &[person("P-1")], &ObjectFilter::all()).unwrap_err();
        assert!(matches!(err, SyncError::InvalidBranchReference { .. }));
    }

    #[test]
    fn test_native_id_stamped_only_when_known() {
        let config = mapping();
        let mut contact_ids = HashedIdMap::new("HR_Person_Id", "contactid");
        contact_ids.insert("P-1", "guid-1");
        let mut ids = IdMaps::new();
        ids.insert("Contact".to_string(), contact_ids);

        let out = transform(&config, &ids, &[person("P-1"), person("P-2")], &ObjectFilter::all()).unwrap();
        let contacts = &out["Contact"];
        assert_eq!(contacts[0]["contactid"], Value::from("guid-1"));
        assert!(!contacts[1].contains_key("contactid"));
    }

    #[test]
    fn test_transform_is_idempotent() {
        let config = mapping();
        let mut contact_ids = HashedIdMap::new("HR_Person_Id", "contactid");
        contact_ids.insert("P-2", "guid-2");
        let mut ids = IdMaps::new();
        ids.insert("Contact".to_string(), contact_ids);
        let records = vec![person("P-1"), person("P-2")];

        let first = transform(&config, &ids, &records, &ObjectFilter::all()).unwrap();
        let second = transform(&config, &ids, &records, &ObjectFilter::all()).unwrap();
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }

    #[test]
    fn test_excluded_referenced_object_is_seeded() {
        let config = mapping();
        let out = transform(&config, &IdMaps::new(), &[person("P-1")], &ObjectFilter::only(["Name"])).unwrap();

        assert!(!out.contains_key("Contact"));
        assert_eq!(out["Name"].len(), 3);
        assert_eq!(out["Name"][0]["Contact"], Value::from("P-1"));
    }

    #[test]
    fn test_missing_cross_reference_fails_record() {
        let config = MappingConfig::new(
            "person",
            vec![
                ObjectConfig::flat("Contact", "personId", "HR_Id"),
                ObjectConfig::branched("Name", "names.nameId", "HR_Name_Id").field(
                    "ContactGuid",
                    FieldRule::Direct(FieldPath::parse("self.Contact.contactid").unwrap()),
                ),
            ],
        )
        .unwrap();

        let err = transform(&config, &IdMaps::new(), &[person("P-1")], &ObjectFilter::all()).unwrap_err();
        assert!(matches!(
            err,
            SyncError::RequiredCrossReferenceMissing { ref object, .. } if object == "Name"
        ));
    }

    #[test]
    fn test_own_field_reference() {
        let config = MappingConfig::new(
            "person",
            vec![
                ObjectConfig::flat("Contact", "personId", "HR_Id")
                    .field("Email", FieldRule::AnyOf(vec![FieldPath::simple("workEmail"), FieldPath::simple("privateEmail")]))
                    .field("Username", FieldRule::Direct(FieldPath::parse("sf.Email").unwrap())),
            ],
        )
        .unwrap();

        let out = transform(&config, &IdMaps::new(), &[person("P-1")], &ObjectFilter::all()).unwrap();
        assert_eq!(out["Contact"][0]["Username"], Value::from("ann@example.com"));
    }

    #[test]
    fn test_demo_mapping() {
        let config = MappingConfig::from_toml_str(include_str!("../../../demos/person.toml")).unwrap();
        let records: Vec<Json> = serde_json::from_str(include_str!("../../../demos/people.json")).unwrap();

        let out = transform(&config, &IdMaps::new(), &records, &ObjectFilter::all()).unwrap();

        assert_eq!(out["Contact"][0]["firstname"], Value::from("Annie"));
        assert_eq!(out["Contact"][0]["hr_active"], Value::from("Y"));
        assert_eq!(out["hr_personname"].len(), 2);
        assert_eq!(out["hr_personname"][1]["hr_personnumber"], Value::from("P-1001"));

        // Work address is filtered out by the object predicate
        let addresses = &out["hr_address"];
        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses[0]["hr_ishome"], Value::from("Home"));
    }

    #[test]
    fn test_source_filter_skips_other_systems() {
        let config = mapping();
        let filter = ObjectFilter {
            source: Some("payroll".into()),
            ..ObjectFilter::default()
        };
        let out = transform(&config, &IdMaps::new(), &[person("P-1")], &filter).unwrap();
        assert!(out.is_empty());
    }
}
