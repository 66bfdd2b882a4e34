//! Target store contract

use std::collections::HashMap;

use async_trait::async_trait;

use crate::transform::OutputRecord;

/// Bulk write and id lookup against the target record store
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Upsert records of one object, keyed by `id_field`
    ///
    /// `Ok(false)` reports a failure the run may continue past; `Err` fails
    /// the batch.
    async fn bulk_upsert(
        &self,
        object: &str,
        records: &[OutputRecord],
        id_field: &str,
    ) -> anyhow::Result<bool>;

    /// Map source id values (stored in `id_field`) to native target ids
    ///
    /// Values with no target record are simply absent from the result.
    async fn bulk_lookup_ids(
        &self,
        object: &str,
        id_field: &str,
        native_field: &str,
        values: &[String],
    ) -> anyhow::Result<HashMap<String, String>>;
}
