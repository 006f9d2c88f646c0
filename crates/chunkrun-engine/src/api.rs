//! Public API types for the `chunkrun` work queue.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chunkrun_core::monitor::{MonitorSnapshot, ProgressMonitor};
use serde::{Deserialize, Serialize};

use crate::failure::{FailureKind, FailureRecord};
use crate::promise::{NotReady, Promise};
use crate::unit::{WorkUnit, Workspace};

/// Configuration for a [`WorkQueue`].
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Number of worker threads. `0` means one.
    pub workers: usize,

    /// Maximum number of finished jobs retained in the snapshot.
    pub recent_jobs_max: usize,

    /// How often the dispatcher samples job monitors to emit progress events.
    pub progress_tick: Duration,
}

impl QueueConfig {
    /// Default progress sampling tick.
    pub const DEFAULT_PROGRESS_TICK: Duration = Duration::from_millis(200);

    /// Default size of the recent-jobs ring buffer.
    pub const DEFAULT_RECENT_JOBS_MAX: usize = 100;

    /// A config for `workers` threads with default sampling and history.
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers,
            ..Self::default()
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            recent_jobs_max: Self::DEFAULT_RECENT_JOBS_MAX,
            progress_tick: Self::DEFAULT_PROGRESS_TICK,
        }
    }
}

/// Identifier of a submitted job, unique within one queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Terminal value of a job: a result (or the "no result" sentinel) or a failure.
pub type JobResult<T> = Result<Option<T>, FailureRecord>;

/// Options for a single submission.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Workers that cooperate on each chunk. `0` means one; values above the pool
    /// size are clamped to it.
    pub team_size: usize,
    /// Workspace handed to every chunk call.
    pub workspace: Workspace,
    /// Monitor updated by every chunk call. A fresh one is created when absent.
    pub monitor: Option<ProgressMonitor>,
}

impl JobOptions {
    /// Options for a team of `team_size`.
    pub fn team(team_size: usize) -> Self {
        Self {
            team_size,
            ..Self::default()
        }
    }

    /// Set the workspace.
    pub fn workspace(mut self, workspace: Workspace) -> Self {
        self.workspace = workspace;
        self
    }

    /// Set the monitor.
    pub fn monitor(mut self, monitor: ProgressMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }
}

/// Caller's view of a submitted job.
#[derive(Debug, Clone)]
pub struct JobHandle<T> {
    pub(crate) id: JobId,
    pub(crate) monitor: ProgressMonitor,
    pub(crate) promise: Promise<JobResult<T>>,
}

impl<T: Clone> JobHandle<T> {
    /// Job identifier.
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Monitor the job's chunks report into.
    pub fn monitor(&self) -> &ProgressMonitor {
        &self.monitor
    }

    /// The promise completed with the terminal result.
    pub fn promise(&self) -> &Promise<JobResult<T>> {
        &self.promise
    }

    /// Whether the job has reached a terminal result.
    pub fn is_complete(&self) -> bool {
        self.promise.is_complete()
    }

    /// Block until the job is terminal and return its result.
    pub fn wait(&self) -> JobResult<T> {
        self.promise.join()
    }

    /// Block for at most `timeout`. Returns whether the job is terminal.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.promise.wait_timeout(timeout)
    }

    /// The terminal result, if there is one yet.
    pub fn result(&self) -> Result<JobResult<T>, NotReady> {
        self.promise.result()
    }
}

/// How a job ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Produced a result (possibly the "no result" sentinel).
    Done,
    /// Ended with a captured failure.
    Failed,
    /// Cancelled before reaching a terminal result.
    Cancelled,
}

/// A lightweight summary of a finished job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSummary {
    /// Job identifier.
    pub job_id: JobId,
    /// Description of the unit as submitted.
    pub unit: String,
    /// Team size used for each chunk.
    pub team_size: usize,
    /// Number of chunks dispatched.
    pub chunks: u64,
    /// Terminal status.
    pub status: JobStatus,
    /// The failure, when `status` is not `Done`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureRecord>,
    /// Monitor state at the time the job finished.
    pub monitor: MonitorSnapshot,
    /// Wall time from submission to terminal result (milliseconds).
    pub total_ms: u64,
    /// When the job reached its terminal result.
    pub finished_at: DateTime<Utc>,
}

impl JobStatus {
    pub(crate) fn of(failure: Option<&FailureRecord>) -> Self {
        match failure.map(|f| f.kind) {
            None => JobStatus::Done,
            Some(FailureKind::Cancelled) => JobStatus::Cancelled,
            Some(_) => JobStatus::Failed,
        }
    }
}

/// Stage of a worker thread.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkerStage {
    /// No chunk assigned.
    Idle,
    /// Running a chunk (or its share of a team chunk).
    Running,
}

/// Snapshot of a single worker's current state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerSnapshot {
    /// Worker index (0-based).
    pub worker_idx: usize,
    /// Current stage.
    pub stage: WorkerStage,
    /// Job whose chunk is running, if any.
    pub job_id: Option<JobId>,
    /// Team slot within that chunk.
    pub team_slot: Option<usize>,
}

/// Work queue event stream payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum QueueEvent {
    /// Dispatcher started.
    Started,
    /// Queue is shutting down.
    StopRequested,
    /// A job was accepted.
    JobQueued {
        /// Job identifier.
        job_id: JobId,
        /// Description of the submitted unit.
        unit: String,
        /// Effective team size.
        team_size: usize,
    },
    /// A chunk was handed to its team.
    ChunkStarted {
        /// Job identifier.
        job_id: JobId,
        /// 1-based chunk number.
        chunk: u64,
        /// Workers running it.
        workers: Vec<usize>,
    },
    /// Every team member finished a chunk and more work remains.
    ChunkFinished {
        /// Job identifier.
        job_id: JobId,
        /// 1-based chunk number.
        chunk: u64,
        /// Wall time of the chunk (milliseconds).
        elapsed_ms: u64,
    },
    /// A job's monitor changed since the last sample.
    JobProgress {
        /// Job identifier.
        job_id: JobId,
        /// Current monitor state.
        monitor: MonitorSnapshot,
    },
    /// A job reached a terminal result.
    JobFinished {
        /// Job summary.
        summary: JobSummary,
    },
    /// A warning from the queue.
    Warning {
        /// Warning message.
        message: String,
    },
    /// A non-fatal error from the queue.
    Error {
        /// Error message.
        message: String,
    },
    /// Dispatcher stopped (all workers joined).
    Stopped,
}

/// Current queue state snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    /// Whether the queue has been asked to shut down.
    pub stop_requested: bool,
    /// Per-worker snapshots.
    pub workers: Vec<WorkerSnapshot>,
    /// Jobs waiting for a free team.
    pub queued_jobs: usize,
    /// Jobs with a chunk in flight.
    pub running_jobs: usize,
    /// Recently finished jobs (newest last).
    pub recent_jobs: Vec<JobSummary>,
}

/// Fixed-size pool of worker threads executing chunked jobs.
///
/// Dropping the queue shuts it down.
pub struct WorkQueue {
    pub(crate) inner: Arc<crate::queue::QueueInner>,
}

impl WorkQueue {
    /// Spawn the worker threads and the dispatcher.
    pub fn new(config: QueueConfig) -> anyhow::Result<Self> {
        crate::queue::start_queue(config)
    }

    /// Number of worker threads.
    pub fn workers(&self) -> usize {
        self.inner.workers
    }

    /// Submit `unit` as a solo job with a fresh monitor.
    pub fn submit<W: WorkUnit>(&self, unit: W) -> JobHandle<W::Output> {
        self.submit_with(unit, JobOptions::default())
    }

    /// Submit `unit` with explicit team size, workspace and monitor.
    ///
    /// Never blocks. If the queue is shutting down the handle completes at once
    /// with a cancellation.
    pub fn submit_with<W: WorkUnit>(&self, unit: W, options: JobOptions) -> JobHandle<W::Output> {
        self.inner.submit(unit, options)
    }

    /// Cancel a job. Returns `false` if it is unknown or already terminal.
    pub fn cancel(&self, job: JobId) -> bool {
        self.inner.cancel(job)
    }

    /// Hold a job at its next safe point and stop dispatching its chunks.
    pub fn pause(&self, job: JobId) -> bool {
        self.inner.pause(job, true)
    }

    /// Undo [`WorkQueue::pause`].
    pub fn resume(&self, job: JobId) -> bool {
        self.inner.pause(job, false)
    }

    /// Subscribe to the queue event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<QueueEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Get the latest queue snapshot.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.snapshot_rx.borrow().clone()
    }

    /// Whether [`WorkQueue::shutdown`] has been requested.
    pub fn is_stopping(&self) -> bool {
        self.inner.should_stop()
    }

    /// Cancel every job, let in-flight chunks return, and join all threads.
    ///
    /// Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("workers", &self.inner.workers)
            .field("stopping", &self.inner.should_stop())
            .finish_non_exhaustive()
    }
}
