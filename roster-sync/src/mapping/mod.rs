//! Declarative mapping model: values, paths, rules and object configs

mod config;
mod graph;
mod path;
mod rule;
mod value;

pub use config::{
    IdMapping, MappingConfig, ObjectConfig, ObjectFilter, Role, SourceSchema,
    DEFAULT_ORDERING_FIELD, DEFAULT_SOURCE,
};
pub use graph::{CycleError, DependencyGraph};
pub use path::{FieldPath, FieldPathError, PathRoot, SELF_PREFIXES};
pub use rule::{Allowed, FieldRule, When};
pub use value::Value;
