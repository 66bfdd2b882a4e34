//! Transformation of nested source records into flat target records

use std::collections::BTreeMap;

use crate::mapping::Value;

mod branch;
mod engine;
mod identity;
mod resolve;

pub use branch::{BranchCache, BranchSelector};
pub use engine::RecordTransformer;
pub use identity::{HashedIdMap, IdMaps, IdentityResolver, source_id};
pub use resolve::{Resolution, SelfView, branch_value, branches_at, resolve_source};

/// One target record: field name -> value
pub type OutputRecord = BTreeMap<String, Value>;

/// Output records of a transform pass, keyed by target object
pub type TransformOutput = BTreeMap<String, Vec<OutputRecord>>;
