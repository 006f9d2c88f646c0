use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Instant;

use chunkrun_core::runloop;
use tokio::sync::mpsc;

use crate::api::JobId;

/// One worker's share of one chunk, already bound to its unit, workspace and monitor.
pub(crate) struct ChunkTask {
    pub(crate) job_id: JobId,
    pub(crate) slot: usize,
    pub(crate) run: Box<dyn FnOnce() + Send>,
}

pub(crate) enum WorkerCommand {
    Chunk(ChunkTask),
    Stop,
}

pub(crate) enum WorkerInternalEvent {
    ChunkDone {
        worker_idx: usize,
        job_id: JobId,
        elapsed_ms: u64,
    },
    Error {
        message: String,
    },
}

pub(crate) fn run_worker_thread(
    worker_idx: usize,
    mut rx: mpsc::Receiver<WorkerCommand>,
    internal_tx: mpsc::UnboundedSender<WorkerInternalEvent>,
) {
    tracing::debug!(worker_idx, "worker started");
    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            WorkerCommand::Stop => break,
            WorkerCommand::Chunk(task) => {
                let started = Instant::now();
                let job_id = task.job_id;
                tracing::trace!(worker_idx, %job_id, slot = task.slot, "chunk started");
                {
                    let _guard = runloop::register_thread();
                    // Chunk bodies are already contained; this only catches engine bugs.
                    if catch_unwind(AssertUnwindSafe(task.run)).is_err() {
                        let _ = internal_tx.send(WorkerInternalEvent::Error {
                            message: format!(
                                "worker {worker_idx}: chunk plumbing panicked ({job_id})"
                            ),
                        });
                    }
                }
                let elapsed_ms = started.elapsed().as_millis().min(u64::MAX as u128) as u64;
                let _ = internal_tx.send(WorkerInternalEvent::ChunkDone {
                    worker_idx,
                    job_id,
                    elapsed_ms,
                });
            }
        }
    }
    tracing::debug!(worker_idx, "worker stopped");
}
