//! Identity resolution: source ids to native target ids, built per batch

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::Value as Json;

use crate::error::{Result, SyncError};
use crate::mapping::{MappingConfig, ObjectConfig, ObjectFilter, Value};
use crate::pipeline::TargetStore;

use super::OutputRecord;
use super::resolve::{Resolution, branch_value, branches_at, relative_to, resolve_source};

/// Source id -> native target id for one object
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HashedIdMap {
    /// Target field holding the source id
    pub id_field: String,
    /// Target field holding the native id
    pub native_field: String,
    ids: HashMap<String, String>,
}

impl HashedIdMap {
    pub fn new(id_field: impl Into<String>, native_field: impl Into<String>) -> Self {
        HashedIdMap {
            id_field: id_field.into(),
            native_field: native_field.into(),
            ids: HashMap::new(),
        }
    }

    pub fn insert(&mut self, source_id: impl Into<String>, native_id: impl Into<String>) {
        self.ids.insert(source_id.into(), native_id.into());
    }

    pub fn get(&self, source_id: &str) -> Option<&str> {
        self.ids.get(source_id).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Stamp identity onto an output record
    ///
    /// The source id always goes into `id_field` (the upsert key). The native
    /// id is stamped only when the target already knows the record (update
    /// path); otherwise the field is left out (insert path).
    pub fn set_id(&self, record: &mut OutputRecord, source_id: &str) {
        record.insert(self.id_field.clone(), Value::String(source_id.to_string()));
        match self.get(source_id).filter(|native| !native.is_empty()) {
            Some(native) => {
                record.insert(self.native_field.clone(), Value::String(native.to_string()));
            }
            None => {
                record.remove(&self.native_field);
            }
        }
    }
}

/// Id maps for every object in a pass, keyed by object name
pub type IdMaps = BTreeMap<String, HashedIdMap>;

/// Builds per-batch id maps with one bulk lookup per object
pub struct IdentityResolver;

impl IdentityResolver {
    /// Look up every reachable source id of the batch in the target store
    pub async fn build(
        mapping: &MappingConfig,
        filter: &ObjectFilter,
        records: &[Json],
        target: &dyn TargetStore,
    ) -> Result<IdMaps> {
        let mut maps = IdMaps::new();

        for (object, _) in mapping.plan(filter) {
            let mut map = HashedIdMap::new(object.target_id_field(), object.native_id_field());
            let values: Vec<String> = Self::collect_source_ids(object, records)
                .into_iter()
                .collect();

            if !values.is_empty() {
                let found = target
                    .bulk_lookup_ids(&object.name, &map.id_field, &map.native_field, &values)
                    .await
                    .map_err(SyncError::target)?;
                for (source_id, native_id) in found {
                    map.insert(source_id, native_id);
                }
            }

            log::debug!(
                "Id map for '{}': {} source ids, {} known to target",
                object.name,
                values.len(),
                map.len()
            );
            maps.insert(object.name.clone(), map);
        }

        Ok(maps)
    }

    /// Every source id value any candidate path reaches, branches included
    pub fn collect_source_ids(object: &ObjectConfig, records: &[Json]) -> BTreeSet<String> {
        let mut ids = BTreeSet::new();

        for record in records {
            match object.branch_list() {
                Some(list) => {
                    for branch in branches_at(record, list) {
                        for path in &object.id_mapping.source {
                            if let Some(key) = branch_value(branch, relative_to(path, list))
                                .and_then(|v| v.as_key())
                            {
                                ids.insert(key);
                            }
                        }
                    }
                }
                None => {
                    for path in &object.id_mapping.source {
                        if let Resolution::Found(value) = resolve_source(record, path) {
                            if let Some(key) = value.as_key() {
                                ids.insert(key);
                            }
                        }
                    }
                }
            }
        }

        ids
    }
}

/// Source id of one output record; the first resolving candidate wins
///
/// For branched objects `branch` is the branch the record is built from.
/// `Ok(None)` means a single-candidate id did not resolve and the record is
/// skipped; several candidates none of which resolve is an error.
pub fn source_id(object: &ObjectConfig, record: &Json, branch: Option<&Json>) -> Result<Option<String>> {
    let candidates = &object.id_mapping.source;

    for path in candidates {
        let value = match (branch, object.branch_list()) {
            (Some(branch), Some(list)) => branch_value(branch, relative_to(path, list)),
            _ => match resolve_source(record, path) {
                Resolution::Found(value) => Some(value),
                _ => None,
            },
        };
        if let Some(key) = value.and_then(|v| v.as_key()) {
            return Ok(Some(key));
        }
    }

    if candidates.len() > 1 {
        let candidates: Vec<String> = candidates.iter().map(|p| p.to_string()).collect();
        return Err(SyncError::AmbiguousIdMapping {
            object: object.name.clone(),
            candidates: candidates.join(", "),
        });
    }

    log::warn!(
        "No source id at '{}' for '{}', record skipped",
        candidates[0],
        object.name
    );
    Ok(None)
}
