//! Incremental, mapping-driven sync of HR records into Microsoft Dynamics 365
//!
//! A [`mapping::MappingConfig`] declares how one source record fans out into
//! target objects. [`transform::RecordTransformer`] applies it to a batch,
//! [`pipeline::SyncOrchestrator`] drives a watermarked run of paginated
//! batches through a bounded worker pool, and [`clients`] holds the HTTP
//! source and Dataverse target.

pub mod clients;
pub mod error;
pub mod mapping;
pub mod pipeline;
pub mod settings;
pub mod transform;

pub use error::{Result, SyncError};
