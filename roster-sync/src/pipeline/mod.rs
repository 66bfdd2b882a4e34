//! Batch sync pipeline: collaborator contracts, buffering, workers, orchestration

mod buffer;
mod memory;
mod orchestrator;
mod pressure;
mod source;
mod target;
mod watermark;
mod worker;

pub use buffer::PaginationBuffer;
pub use memory::{MemorySource, MemoryTarget, MemoryWatermarkStore};
pub use orchestrator::{RunContext, RunSummary, SyncOrchestrator, SyncSettings};
pub use pressure::{BackpressureConfig, PressureGate, PressureGauge, PressureLevel, SystemMemoryGauge};
pub use source::{SourceClient, SourceQuery};
pub use target::TargetStore;
pub use watermark::{SqliteWatermarkStore, WatermarkStore};
pub use worker::{BatchJob, BatchOutcome, PoolStats, WorkerPool, WorkerReport, process_batch};
