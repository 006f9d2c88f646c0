#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Chunked, resumable task execution: work units, the failure boundary, promises
//! and a worker-pool queue.

/// Public API for the work queue.
pub mod api;

/// Failure records and the errors chunk bodies return.
pub mod failure;

/// Write-once result cells.
pub mod promise;

/// The work unit contract and its execution boundary.
pub mod unit;

mod queue;
mod worker;

pub use api::{
    JobHandle, JobId, JobOptions, JobResult, JobStatus, JobSummary, QueueConfig, QueueEvent,
    StatusSnapshot, WorkQueue, WorkerSnapshot, WorkerStage,
};
pub use failure::{ChunkError, FailureKind, FailureRecord};
pub use promise::{NotReady, Promise, PromiseWriter, promise};
pub use unit::{
    ExecutionResult, RunChunk, Step, TeamSlot, WorkUnit, Workspace, drive_to_completion,
};
