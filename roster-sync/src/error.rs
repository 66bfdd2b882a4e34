//! Error taxonomy for mapping, transform and sync runs

use std::time::Duration;

use thiserror::Error;

use crate::mapping::{CycleError, FieldPathError};

/// All fatal conditions the engine can raise.
///
/// Config errors surface at startup. Record-level errors (branch, id mapping,
/// cross reference) fail the batch that contains the record. Everything else
/// aborts the whole run without advancing the watermark.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid branch reference: '{path}' is absent on every branch of '{list}'")]
    InvalidBranchReference { list: String, path: String },

    #[error("ambiguous id mapping for '{object}': none of [{candidates}] resolved")]
    AmbiguousIdMapping { object: String, candidates: String },

    #[error("required cross reference '{path}' missing while building '{object}'")]
    RequiredCrossReferenceMissing { object: String, path: String },

    #[error("source drift: total count changed from {initial} to {current} mid-run")]
    SourceDrift { initial: usize, current: usize },

    #[error("backpressure exceeded: memory at {utilization:.1}% (hard limit {limit:.1}%)")]
    BackpressureExceeded { utilization: f64, limit: f64 },

    #[error("batch count anomaly: observed {observed} {unit}, expected at most {allowed}")]
    BatchCountAnomaly {
        observed: usize,
        allowed: usize,
        unit: &'static str,
    },

    #[error("record count mismatch: source reported {expected} records, pagination delivered {received}")]
    RecordCountMismatch { expected: usize, received: usize },

    #[error("drain timeout: {active} worker(s) still active after {waited:?}")]
    DrainTimeout { active: usize, waited: Duration },

    #[error("run exceeded maximum duration of {limit:?}")]
    RunTimeout { limit: Duration },

    #[error("worker for batch {batch} failed: {source}")]
    WorkerFailure {
        batch: usize,
        #[source]
        source: Box<SyncError>,
    },

    #[error("worker panicked: {0}")]
    WorkerPanicked(String),

    #[error("source error: {0}")]
    Source(String),

    #[error("target store error: {0}")]
    Target(String),

    #[error("watermark store error: {0}")]
    Watermark(String),
}

impl SyncError {
    /// Wrap a source collaborator error, keeping the full context chain
    pub fn source(err: anyhow::Error) -> Self {
        SyncError::Source(format!("{:#}", err))
    }

    /// Wrap a target store collaborator error
    pub fn target(err: anyhow::Error) -> Self {
        SyncError::Target(format!("{:#}", err))
    }

    /// Wrap a watermark store collaborator error
    pub fn watermark(err: anyhow::Error) -> Self {
        SyncError::Watermark(format!("{:#}", err))
    }

    /// Whether this error was raised while transforming a single record
    pub fn is_record_level(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidBranchReference { .. }
                | SyncError::AmbiguousIdMapping { .. }
                | SyncError::RequiredCrossReferenceMissing { .. }
        )
    }

    /// Unwrap worker wrapping to reach the originating error
    pub fn root(&self) -> &SyncError {
        match self {
            SyncError::WorkerFailure { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<FieldPathError> for SyncError {
    fn from(err: FieldPathError) -> Self {
        SyncError::Config(err.to_string())
    }
}

impl From<CycleError> for SyncError {
    fn from(err: CycleError) -> Self {
        SyncError::Config(err.to_string())
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::SourceDrift {
            initial: 10,
            current: 12,
        };
        assert_eq!(
            err.to_string(),
            "source drift: total count changed from 10 to 12 mid-run"
        );

        let err = SyncError::InvalidBranchReference {
            list: "names".into(),
            path: "names.kind".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid branch reference: 'names.kind' is absent on every branch of 'names'"
        );
    }

    #[test]
    fn test_root_unwraps_worker_failure() {
        let err = SyncError::WorkerFailure {
            batch: 3,
            source: Box::new(SyncError::RequiredCrossReferenceMissing {
                object: "Names".into(),
                path: "self.Contact.Id".into(),
            }),
        };

        assert!(err.root().is_record_level());
        assert!(!err.is_record_level());
        assert!(err.to_string().starts_with("worker for batch 3 failed"));
    }

    #[test]
    fn test_collaborator_errors_keep_context() {
        let inner = anyhow::anyhow!("connection refused").context("Failed to fetch page 2");
        let err = SyncError::source(inner);
        assert_eq!(
            err.to_string(),
            "source error: Failed to fetch page 2: connection refused"
        );
    }
}
