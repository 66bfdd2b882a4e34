//! HTTP collaborators: the paginated HR source and the Dataverse target

mod dataverse;
mod entity_set;
mod http_source;
mod retry;

pub use dataverse::{DataverseConfig, DataverseTarget};
pub use entity_set::{EntityNames, pluralize};
pub use http_source::{HttpSource, HttpSourceConfig};
pub use retry::{RetryPolicy, Retryable, is_retryable_status};
