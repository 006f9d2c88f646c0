use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::ThreadId;
use std::time::Instant;

use anyhow::Context;
use chrono::Utc;
use chunkrun_core::monitor::ProgressMonitor;
use chunkrun_core::runloop;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};

use crate::api::{
    JobHandle, JobId, JobOptions, JobResult, JobStatus, JobSummary, QueueConfig, QueueEvent,
    StatusSnapshot, WorkQueue, WorkerSnapshot, WorkerStage,
};
use crate::failure::FailureRecord;
use crate::promise::{PromiseWriter, promise};
use crate::unit::{ExecutionResult, RunChunk, Step, WorkUnit, Workspace, describe};
use crate::worker::{ChunkTask, WorkerCommand, WorkerInternalEvent};

pub(crate) struct QueueInner {
    pub(crate) event_tx: broadcast::Sender<QueueEvent>,
    pub(crate) snapshot_rx: watch::Receiver<StatusSnapshot>,
    pub(crate) workers: usize,
    control_tx: mpsc::UnboundedSender<Control>,
    live: Mutex<HashSet<JobId>>,
    next_job_id: AtomicU64,
    stop_requested: AtomicBool,
    dispatcher: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl QueueInner {
    pub(crate) fn should_stop(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn submit<W: WorkUnit>(&self, unit: W, options: JobOptions) -> JobHandle<W::Output> {
        let id = JobId(self.next_job_id.fetch_add(1, Ordering::SeqCst) + 1);
        let monitor = options.monitor.unwrap_or_else(ProgressMonitor::new);

        let requested = options.team_size.max(1);
        let team_size = requested.min(self.workers);
        if team_size < requested {
            let message = format!(
                "{id}: team size {requested} exceeds the pool of {} worker(s); using {team_size}",
                self.workers
            );
            tracing::warn!("{message}");
            let _ = self.event_tx.send(QueueEvent::Warning { message });
        }

        let (writer, promise) = promise::<JobResult<W::Output>>();
        let fallback_monitor = monitor.clone();
        let writer = writer.with_fallback(move || {
            fallback_monitor.set_health(0.0);
            Err(FailureRecord::cancelled(format!("{id} was dropped by a stopped queue")))
        });
        let handle = JobHandle {
            id,
            monitor: monitor.clone(),
            promise,
        };

        if self.should_stop() {
            monitor.set_health(0.0);
            writer.complete(Err(FailureRecord::cancelled("queue is shut down")));
            return handle;
        }

        let job = JobDriver::new(id, unit, options.workspace, monitor, team_size, writer);
        self.live.lock().insert(id);
        if self.control_tx.send(Control::Submit(Box::new(job))).is_err() {
            // The rejected job is dropped here, completing the promise through its fallback.
            self.live.lock().remove(&id);
        }
        handle
    }

    pub(crate) fn cancel(&self, job: JobId) -> bool {
        if !self.live.lock().contains(&job) {
            return false;
        }
        self.control_tx.send(Control::Cancel(job)).is_ok()
    }

    pub(crate) fn pause(&self, job: JobId, paused: bool) -> bool {
        if !self.live.lock().contains(&job) {
            return false;
        }
        self.control_tx.send(Control::Pause { job, paused }).is_ok()
    }

    pub(crate) fn shutdown(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            let _ = self.event_tx.send(QueueEvent::StopRequested);
            let _ = self.control_tx.send(Control::Shutdown);
        }
        let join = self.dispatcher.lock().take();
        if let Some(join) = join {
            if join.join().is_err() {
                tracing::error!("dispatcher thread panicked");
            }
        }
    }
}

enum Control {
    Submit(Box<dyn ScheduledJob>),
    Cancel(JobId),
    Pause { job: JobId, paused: bool },
    Shutdown,
}

/// A submitted job with its unit type erased.
trait ScheduledJob: Send {
    fn id(&self) -> JobId;
    fn describe(&self) -> &str;
    fn team_size(&self) -> usize;
    fn monitor(&self) -> &ProgressMonitor;
    fn chunks(&self) -> u64;
    fn outstanding(&self) -> usize;
    fn failure(&self) -> Option<&FailureRecord>;
    fn is_finished(&self) -> bool;

    /// Build one task per team slot for the next chunk.
    fn start_chunk(&mut self) -> Vec<ChunkTask>;

    /// A worker returned from one of this job's tasks. Returns `true` when the
    /// chunk barrier completed and another chunk is ready to dispatch.
    fn on_slot_done(&mut self) -> bool;

    fn cancel(&mut self, record: FailureRecord);
}

type SlotResult<W> = (usize, ExecutionResult<W>);

struct JobDriver<W: WorkUnit> {
    id: JobId,
    label: String,
    current: Option<Arc<W>>,
    workspace: Workspace,
    monitor: ProgressMonitor,
    team_size: usize,
    writer: PromiseWriter<JobResult<W::Output>>,
    results_tx: mpsc::UnboundedSender<SlotResult<W>>,
    results_rx: mpsc::UnboundedReceiver<SlotResult<W>>,
    slots: Vec<Option<ExecutionResult<W>>>,
    outstanding: usize,
    chunks: u64,
    abandoned: Arc<AtomicBool>,
    outcome: Option<Option<FailureRecord>>,
}

impl<W: WorkUnit> JobDriver<W> {
    fn new(
        id: JobId,
        unit: W,
        workspace: Workspace,
        monitor: ProgressMonitor,
        team_size: usize,
        writer: PromiseWriter<JobResult<W::Output>>,
    ) -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Self {
            id,
            label: describe(&unit),
            current: Some(Arc::new(unit)),
            workspace,
            monitor,
            team_size,
            writer,
            results_tx,
            results_rx,
            slots: Vec::new(),
            outstanding: 0,
            chunks: 0,
            abandoned: Arc::new(AtomicBool::new(false)),
            outcome: None,
        }
    }

    fn finish(&mut self, result: JobResult<W::Output>) {
        self.abandoned.store(true, Ordering::SeqCst);
        self.current = None;
        self.slots.clear();
        self.outcome = Some(result.as_ref().err().cloned());
        self.writer.complete(result);
    }

    fn complete_barrier(&mut self) -> bool {
        let Some(unit) = self.current.clone() else {
            return false;
        };
        let mut steps: Vec<Step<W>> = Vec::with_capacity(self.slots.len());
        for (slot, result) in std::mem::take(&mut self.slots).into_iter().enumerate() {
            match result.map(ExecutionResult::into_step) {
                Some(Ok(step)) => steps.push(step),
                Some(Err(record)) => {
                    self.finish(Err(record));
                    return false;
                }
                None => {
                    self.monitor.set_health(0.0);
                    self.finish(Err(FailureRecord::invariant(format!(
                        "{}: slot {slot} of chunk {} returned no result",
                        self.id, self.chunks
                    ))));
                    return false;
                }
            }
        }

        let merged = if self.team_size == 1 && steps.len() == 1 {
            ExecutionResult::from(steps.remove(0))
        } else {
            unit.reduce_results(steps, &self.monitor)
        };
        match merged {
            ExecutionResult::Continue(next) => {
                self.current = Some(Arc::new(next));
                true
            }
            ExecutionResult::Done(value) => {
                self.finish(Ok(value));
                false
            }
            ExecutionResult::Failed(record) => {
                self.finish(Err(record));
                false
            }
        }
    }
}

impl<W: WorkUnit> ScheduledJob for JobDriver<W> {
    fn id(&self) -> JobId {
        self.id
    }

    fn describe(&self) -> &str {
        &self.label
    }

    fn team_size(&self) -> usize {
        self.team_size
    }

    fn monitor(&self) -> &ProgressMonitor {
        &self.monitor
    }

    fn chunks(&self) -> u64 {
        self.chunks
    }

    fn outstanding(&self) -> usize {
        self.outstanding
    }

    fn failure(&self) -> Option<&FailureRecord> {
        self.outcome.as_ref().and_then(Option::as_ref)
    }

    fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    fn start_chunk(&mut self) -> Vec<ChunkTask> {
        let Some(unit) = self.current.clone() else {
            return Vec::new();
        };
        self.chunks += 1;
        self.slots = (0..self.team_size).map(|_| None).collect();
        self.outstanding = self.team_size;

        let team = self.team_size;
        (0..team)
            .map(|slot| {
                let unit = Arc::clone(&unit);
                let workspace = self.workspace.clone();
                let monitor = self.monitor.clone();
                let results_tx = self.results_tx.clone();
                let abandoned = Arc::clone(&self.abandoned);
                ChunkTask {
                    job_id: self.id,
                    slot,
                    run: Box::new(move || {
                        if abandoned.load(Ordering::SeqCst) {
                            return;
                        }
                        let result = if team == 1 {
                            unit.run_with_workspace(&workspace, &monitor)
                        } else {
                            unit.run_team_with_workspace(
                                &workspace,
                                slot as i64,
                                team as i64,
                                &monitor,
                            )
                        };
                        let _ = results_tx.send((slot, result));
                    }),
                }
            })
            .collect()
    }

    fn on_slot_done(&mut self) -> bool {
        self.outstanding = self.outstanding.saturating_sub(1);
        while let Ok((slot, result)) = self.results_rx.try_recv() {
            if self.is_finished() {
                continue;
            }
            if let ExecutionResult::Failed(record) = result {
                // First failure wins; the rest of the team's results are discarded.
                self.finish(Err(record));
                continue;
            }
            if let Some(cell) = self.slots.get_mut(slot) {
                *cell = Some(result);
            }
        }

        if self.is_finished() || self.outstanding > 0 {
            return false;
        }
        self.complete_barrier()
    }

    fn cancel(&mut self, record: FailureRecord) {
        if self.is_finished() {
            return;
        }
        self.monitor.set_health(0.0);
        self.finish(Err(record));
    }
}

#[derive(Debug)]
struct WorkerRuntime {
    thread: ThreadId,
    stage: WorkerStage,
    job: Option<JobId>,
    slot: Option<usize>,
}

impl WorkerRuntime {
    fn new(thread: ThreadId) -> Self {
        Self {
            thread,
            stage: WorkerStage::Idle,
            job: None,
            slot: None,
        }
    }

    fn is_idle(&self) -> bool {
        self.stage == WorkerStage::Idle
    }

    fn start_chunk(&mut self, job: JobId, slot: usize) {
        self.stage = WorkerStage::Running;
        self.job = Some(job);
        self.slot = Some(slot);
    }

    fn finish_chunk(&mut self) {
        self.stage = WorkerStage::Idle;
        self.job = None;
        self.slot = None;
    }
}

struct JobEntry {
    job: Box<dyn ScheduledJob>,
    paused: bool,
    submitted_at: Instant,
    chunk_started_at: Option<Instant>,
    last_revision: u64,
}

struct QueueRuntime {
    cfg: QueueConfig,

    workers: Vec<WorkerRuntime>,
    worker_cmds: Vec<mpsc::Sender<WorkerCommand>>,
    worker_join: Vec<std::thread::JoinHandle<()>>,
    internal_rx: mpsc::UnboundedReceiver<WorkerInternalEvent>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    control_open: bool,
    shutting_down: bool,

    jobs: HashMap<JobId, JobEntry>,
    ready: VecDeque<JobId>,

    recent_jobs: VecDeque<JobSummary>,
    snapshot_tx: watch::Sender<StatusSnapshot>,
    inner: Arc<QueueInner>,
}

impl QueueRuntime {
    fn build_snapshot(&self) -> StatusSnapshot {
        let workers = self
            .workers
            .iter()
            .enumerate()
            .map(|(idx, w)| WorkerSnapshot {
                worker_idx: idx,
                stage: w.stage,
                job_id: w.job,
                team_slot: w.slot,
            })
            .collect();

        StatusSnapshot {
            stop_requested: self.inner.should_stop(),
            workers,
            queued_jobs: self.ready.len(),
            running_jobs: self
                .jobs
                .values()
                .filter(|e| !e.job.is_finished() && e.job.outstanding() > 0)
                .count(),
            recent_jobs: self.recent_jobs.iter().cloned().collect(),
        }
    }

    fn push_snapshot(&self) {
        let snap = self.build_snapshot();
        let _ = self.snapshot_tx.send(snap);
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.inner.event_tx.send(event);
    }

    fn all_idle(&self) -> bool {
        self.workers.iter().all(WorkerRuntime::is_idle)
    }

    async fn assign_chunks(&mut self) -> anyhow::Result<()> {
        let mut snapshot_dirty = false;
        let mut pos = 0;
        while pos < self.ready.len() {
            let job_id = self.ready[pos];
            let Some(entry) = self.jobs.get(&job_id) else {
                self.ready.remove(pos);
                continue;
            };
            if entry.paused {
                pos += 1;
                continue;
            }

            // Strict FIFO: a job waiting for a larger team blocks the jobs behind it.
            let team = entry.job.team_size();
            let idle: Vec<usize> = self
                .workers
                .iter()
                .enumerate()
                .filter(|(_, w)| w.is_idle())
                .map(|(idx, _)| idx)
                .take(team)
                .collect();
            if idle.len() < team {
                break;
            }

            self.ready.remove(pos);
            self.start_chunk(job_id, idle).await?;
            snapshot_dirty = true;
        }

        if snapshot_dirty {
            self.push_snapshot();
        }
        Ok(())
    }

    async fn start_chunk(&mut self, job_id: JobId, idle: Vec<usize>) -> anyhow::Result<()> {
        let Some(entry) = self.jobs.get_mut(&job_id) else {
            return Ok(());
        };
        let tasks = entry.job.start_chunk();
        let chunk = entry.job.chunks();
        entry.chunk_started_at = Some(Instant::now());

        tracing::debug!(%job_id, chunk, workers = ?idle, "dispatching chunk");
        for (task, &worker_idx) in tasks.into_iter().zip(&idle) {
            if let Some(worker) = self.workers.get_mut(worker_idx) {
                worker.start_chunk(job_id, task.slot);
            }
            self.worker_cmds
                .get(worker_idx)
                .ok_or_else(|| anyhow::anyhow!("no command sender for worker {worker_idx}"))?
                .send(WorkerCommand::Chunk(task))
                .await
                .map_err(|_| anyhow::anyhow!("worker {worker_idx} command channel closed"))?;
        }

        self.emit(QueueEvent::ChunkStarted {
            job_id,
            chunk,
            workers: idle,
        });
        Ok(())
    }

    fn handle_internal_event(&mut self, ev: WorkerInternalEvent) {
        match ev {
            WorkerInternalEvent::ChunkDone {
                worker_idx,
                job_id,
                elapsed_ms,
            } => {
                if let Some(worker) = self.workers.get_mut(worker_idx) {
                    worker.finish_chunk();
                }
                tracing::trace!(worker_idx, %job_id, elapsed_ms, "slot returned");
                self.on_slot_done(job_id);
                self.push_snapshot();
            }
            WorkerInternalEvent::Error { message } => {
                tracing::error!("{message}");
                self.emit(QueueEvent::Error { message });
            }
        }
    }

    fn on_slot_done(&mut self, job_id: JobId) {
        let Some(entry) = self.jobs.get_mut(&job_id) else {
            return;
        };
        let was_finished = entry.job.is_finished();
        let next_chunk = entry.job.on_slot_done();
        if next_chunk {
            let chunk = entry.job.chunks();
            let elapsed_ms = entry
                .chunk_started_at
                .take()
                .map(|at| at.elapsed().as_millis().min(u64::MAX as u128) as u64)
                .unwrap_or(0);
            self.emit(QueueEvent::ChunkFinished {
                job_id,
                chunk,
                elapsed_ms,
            });
            if self.shutting_down {
                self.cancel_job(job_id, "queue is shutting down");
            } else {
                self.ready.push_back(job_id);
            }
            return;
        }
        if !was_finished && entry.job.is_finished() {
            self.record_finished(job_id);
        }
        self.reap(job_id);
    }

    fn reap(&mut self, job_id: JobId) {
        let done = self
            .jobs
            .get(&job_id)
            .is_some_and(|e| e.job.is_finished() && e.job.outstanding() == 0);
        if done {
            self.jobs.remove(&job_id);
        }
    }

    fn record_finished(&mut self, job_id: JobId) {
        let Some(entry) = self.jobs.get(&job_id) else {
            return;
        };
        let failure = entry.job.failure().cloned();
        let summary = JobSummary {
            job_id,
            unit: entry.job.describe().to_string(),
            team_size: entry.job.team_size(),
            chunks: entry.job.chunks(),
            status: JobStatus::of(failure.as_ref()),
            failure,
            monitor: entry.job.monitor().snapshot(),
            total_ms: entry.submitted_at.elapsed().as_millis().min(u64::MAX as u128) as u64,
            finished_at: Utc::now(),
        };

        match &summary.failure {
            None => tracing::info!(%job_id, chunks = summary.chunks, "job done"),
            Some(failure) => {
                tracing::info!(%job_id, chunks = summary.chunks, "job ended: {failure}")
            }
        }

        self.inner.live.lock().remove(&job_id);
        self.ready.retain(|id| *id != job_id);
        self.recent_jobs.push_back(summary.clone());
        while self.recent_jobs.len() > self.cfg.recent_jobs_max.max(1) {
            self.recent_jobs.pop_front();
        }
        self.emit(QueueEvent::JobFinished { summary });
    }

    fn cancel_job(&mut self, job_id: JobId, reason: &str) {
        let Some(entry) = self.jobs.get_mut(&job_id) else {
            return;
        };
        if entry.job.is_finished() {
            return;
        }
        entry
            .job
            .cancel(FailureRecord::cancelled(format!("{job_id}: {reason}")));
        for worker in self.workers.iter().filter(|w| w.job == Some(job_id)) {
            runloop::request_stop(worker.thread);
        }
        self.record_finished(job_id);
        self.reap(job_id);
    }

    fn set_paused(&mut self, job_id: JobId, paused: bool) {
        let Some(entry) = self.jobs.get_mut(&job_id) else {
            return;
        };
        if entry.paused == paused {
            return;
        }
        entry.paused = paused;
        tracing::debug!(%job_id, paused, "job pause state changed");
        for worker in self.workers.iter().filter(|w| w.job == Some(job_id)) {
            if paused {
                runloop::request_pause(worker.thread);
            } else {
                runloop::request_resume(worker.thread);
            }
        }
    }

    fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        let mut ids: Vec<JobId> = self.jobs.keys().copied().collect();
        ids.sort();
        for job_id in ids {
            self.cancel_job(job_id, "queue is shutting down");
        }
        self.ready.clear();
    }

    fn handle_control(&mut self, ctl: Control) {
        match ctl {
            Control::Submit(job) => self.accept(job),
            Control::Cancel(job_id) => self.cancel_job(job_id, "cancelled by caller"),
            Control::Pause { job, paused } => self.set_paused(job, paused),
            Control::Shutdown => self.begin_shutdown(),
        }
        self.push_snapshot();
    }

    fn accept(&mut self, job: Box<dyn ScheduledJob>) {
        let job_id = job.id();
        let unit = job.describe().to_string();
        let team_size = job.team_size();
        tracing::debug!(%job_id, team_size, "job queued: {unit}");

        let last_revision = job.monitor().snapshot().revision;
        self.jobs.insert(
            job_id,
            JobEntry {
                job,
                paused: false,
                submitted_at: Instant::now(),
                chunk_started_at: None,
                last_revision,
            },
        );
        self.emit(QueueEvent::JobQueued {
            job_id,
            unit,
            team_size,
        });

        if self.shutting_down {
            self.cancel_job(job_id, "queue is shutting down");
        } else {
            self.ready.push_back(job_id);
        }
    }

    fn sample_progress(&mut self) {
        let mut events = Vec::new();
        for (job_id, entry) in self.jobs.iter_mut() {
            if entry.job.is_finished() {
                continue;
            }
            let monitor = entry.job.monitor().snapshot();
            if monitor.revision == entry.last_revision {
                continue;
            }
            entry.last_revision = monitor.revision;
            events.push(QueueEvent::JobProgress {
                job_id: *job_id,
                monitor,
            });
        }
        for event in events {
            self.emit(event);
        }
    }

    async fn shutdown_workers(&mut self) {
        for tx in &self.worker_cmds {
            let _ = tx.send(WorkerCommand::Stop).await;
        }
        for handle in self.worker_join.drain(..) {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }

    async fn run(mut self) {
        tracing::debug!(workers = self.workers.len(), "work queue started");
        self.emit(QueueEvent::Started);
        self.push_snapshot();

        let mut progress_tick = tokio::time::interval(self.cfg.progress_tick);
        progress_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if self.shutting_down && self.all_idle() {
                break;
            }

            if let Err(err) = self.assign_chunks().await {
                let message = format!("work queue error: {err:#}");
                tracing::error!("{message}");
                self.emit(QueueEvent::Error { message });
                self.begin_shutdown();
                continue;
            }

            tokio::select! {
                _ = progress_tick.tick() => self.sample_progress(),
                ev_opt = self.internal_rx.recv() => match ev_opt {
                    Some(ev) => self.handle_internal_event(ev),
                    None => {
                        let message = "all worker threads exited".to_string();
                        tracing::error!("{message}");
                        self.emit(QueueEvent::Error { message });
                        for worker in &mut self.workers {
                            worker.finish_chunk();
                        }
                        self.begin_shutdown();
                    }
                },
                ctl_opt = self.control_rx.recv(), if self.control_open => match ctl_opt {
                    Some(ctl) => self.handle_control(ctl),
                    None => {
                        self.control_open = false;
                        self.begin_shutdown();
                    }
                },
            }
        }

        self.sample_progress();
        self.shutdown_workers().await;
        tracing::debug!("work queue stopped");
        self.emit(QueueEvent::Stopped);
        self.push_snapshot();
    }
}

pub(crate) fn start_queue(mut cfg: QueueConfig) -> anyhow::Result<WorkQueue> {
    if cfg.workers == 0 {
        cfg.workers = 1;
    }
    if cfg.progress_tick.is_zero() {
        cfg.progress_tick = QueueConfig::DEFAULT_PROGRESS_TICK;
    }
    if cfg.recent_jobs_max == 0 {
        cfg.recent_jobs_max = QueueConfig::DEFAULT_RECENT_JOBS_MAX;
    }

    let (event_tx, _) = broadcast::channel::<QueueEvent>(1024);
    let (snapshot_tx, snapshot_rx) = watch::channel(StatusSnapshot::default());
    let (control_tx, control_rx) = mpsc::unbounded_channel::<Control>();
    let (internal_tx, internal_rx) = mpsc::unbounded_channel::<WorkerInternalEvent>();

    let mut worker_cmds = Vec::with_capacity(cfg.workers);
    let mut worker_join = Vec::with_capacity(cfg.workers);
    let mut workers = Vec::with_capacity(cfg.workers);
    for worker_idx in 0..cfg.workers {
        let (tx, rx) = mpsc::channel::<WorkerCommand>(1);
        let internal_tx = internal_tx.clone();
        let handle = std::thread::Builder::new()
            .name(format!("chunkrun-worker-{worker_idx}"))
            .spawn(move || crate::worker::run_worker_thread(worker_idx, rx, internal_tx))
            .with_context(|| format!("spawn worker thread {worker_idx}"))?;
        workers.push(WorkerRuntime::new(handle.thread().id()));
        worker_cmds.push(tx);
        worker_join.push(handle);
    }
    drop(internal_tx);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .context("build dispatcher runtime")?;

    let inner = Arc::new(QueueInner {
        event_tx,
        snapshot_rx,
        workers: cfg.workers,
        control_tx,
        live: Mutex::new(HashSet::new()),
        next_job_id: AtomicU64::new(0),
        stop_requested: AtomicBool::new(false),
        dispatcher: Mutex::new(None),
    });

    let dispatcher = QueueRuntime {
        cfg,
        workers,
        worker_cmds,
        worker_join,
        internal_rx,
        control_rx,
        control_open: true,
        shutting_down: false,
        jobs: HashMap::new(),
        ready: VecDeque::new(),
        recent_jobs: VecDeque::new(),
        snapshot_tx,
        inner: Arc::clone(&inner),
    };
    dispatcher.push_snapshot();

    let join = std::thread::Builder::new()
        .name("chunkrun-dispatcher".to_string())
        .spawn(move || runtime.block_on(dispatcher.run()))
        .context("spawn dispatcher thread")?;
    *inner.dispatcher.lock() = Some(join);

    Ok(WorkQueue { inner })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    use tokio::sync::broadcast::error::RecvError;

    use crate::failure::{ChunkError, FailureKind};
    use crate::unit::TeamSlot;

    #[derive(Debug, Clone)]
    struct Counter {
        current: u64,
        target: u64,
        chunk: u64,
    }

    impl WorkUnit for Counter {
        type Output = u64;

        fn run_chunk(
            &self,
            _workspace: &Workspace,
            monitor: &ProgressMonitor,
        ) -> Result<Step<Self>, ChunkError> {
            let next = (self.current + self.chunk).min(self.target);
            monitor.add_throughput(next - self.current);
            if next == self.target {
                Ok(Step::Done(Some(next)))
            } else {
                Ok(Step::Continue(Self {
                    current: next,
                    ..self.clone()
                }))
            }
        }
    }

    #[derive(Debug, Clone)]
    struct TeamSum {
        next: u64,
        end: u64,
        chunk: u64,
        acc: u64,
    }

    impl TeamSum {
        fn new(end: u64, chunk: u64) -> Self {
            Self {
                next: 0,
                end,
                chunk,
                acc: 0,
            }
        }

        fn stop(&self) -> u64 {
            (self.next + self.chunk).min(self.end)
        }

        fn advance(&self, sum: u64) -> Step<Self> {
            let acc = self.acc + sum;
            if self.stop() >= self.end {
                Step::Done(Some(acc))
            } else {
                Step::Continue(Self {
                    next: self.stop(),
                    acc,
                    ..self.clone()
                })
            }
        }
    }

    impl WorkUnit for TeamSum {
        type Output = u64;

        fn run_chunk(
            &self,
            _workspace: &Workspace,
            monitor: &ProgressMonitor,
        ) -> Result<Step<Self>, ChunkError> {
            monitor.add_throughput(self.stop() - self.next);
            Ok(self.advance((self.next..self.stop()).sum()))
        }

        fn run_team_chunk(
            &self,
            _workspace: &Workspace,
            slot: TeamSlot,
            monitor: &ProgressMonitor,
        ) -> Result<Step<Self>, ChunkError> {
            let share = slot.share(self.next..self.stop());
            monitor.add_throughput(share.end - share.start);
            Ok(Step::Done(Some(share.sum())))
        }

        fn reduce(
            &self,
            results: Vec<Step<Self>>,
            _monitor: &ProgressMonitor,
        ) -> Result<Step<Self>, ChunkError> {
            let sum = results
                .into_iter()
                .map(|step| match step {
                    Step::Done(Some(partial)) => partial,
                    _ => 0,
                })
                .sum();
            Ok(self.advance(sum))
        }
    }

    /// Fails on chunk `fail_at` (1-based), either as a domain error or a panic.
    #[derive(Debug, Clone)]
    struct FailsAt {
        chunk: u64,
        fail_at: u64,
        panic: bool,
    }

    impl WorkUnit for FailsAt {
        type Output = u64;

        fn run_chunk(
            &self,
            _workspace: &Workspace,
            _monitor: &ProgressMonitor,
        ) -> Result<Step<Self>, ChunkError> {
            let chunk = self.chunk + 1;
            if chunk == self.fail_at {
                if self.panic {
                    panic!("chunk {chunk} blew up");
                }
                return Err(ChunkError::domain(format!("chunk {chunk} rejected")));
            }
            Ok(Step::Continue(Self {
                chunk,
                ..self.clone()
            }))
        }
    }

    /// Panics when asked for a description.
    #[derive(Debug)]
    struct BadDescribe;

    impl WorkUnit for BadDescribe {
        type Output = u8;

        fn describe(&self) -> String {
            panic!("no description available")
        }

        fn run_chunk(
            &self,
            _workspace: &Workspace,
            _monitor: &ProgressMonitor,
        ) -> Result<Step<Self>, ChunkError> {
            Ok(Step::Done(Some(7)))
        }
    }

    type HitTable = Mutex<Vec<u64>>;

    /// Each chunk bumps the caller-owned hit table once per team slot.
    #[derive(Debug, Clone)]
    struct Tally {
        chunks_left: u32,
        acc: u64,
    }

    impl Tally {
        fn hit(
            workspace: &Workspace,
            slot: usize,
            monitor: &ProgressMonitor,
        ) -> Result<(), ChunkError> {
            let table = workspace
                .downcast_ref::<HitTable>()
                .ok_or_else(|| ChunkError::domain("no hit table in workspace"))?;
            table.lock()[slot] += 1;
            monitor.add_throughput(1);
            Ok(())
        }

        fn advance(&self, partial: u64) -> Step<Self> {
            let acc = self.acc + partial;
            if self.chunks_left <= 1 {
                Step::Done(Some(acc))
            } else {
                Step::Continue(Self {
                    chunks_left: self.chunks_left - 1,
                    acc,
                })
            }
        }
    }

    impl WorkUnit for Tally {
        type Output = u64;

        fn run_chunk(
            &self,
            workspace: &Workspace,
            monitor: &ProgressMonitor,
        ) -> Result<Step<Self>, ChunkError> {
            Self::hit(workspace, 0, monitor)?;
            Ok(self.advance(1))
        }

        fn run_team_chunk(
            &self,
            workspace: &Workspace,
            slot: TeamSlot,
            monitor: &ProgressMonitor,
        ) -> Result<Step<Self>, ChunkError> {
            Self::hit(workspace, slot.id, monitor)?;
            Ok(Step::Done(Some(1)))
        }

        fn reduce(
            &self,
            results: Vec<Step<Self>>,
            _monitor: &ProgressMonitor,
        ) -> Result<Step<Self>, ChunkError> {
            let partial = results
                .iter()
                .map(|step| match step {
                    Step::Done(Some(n)) => *n,
                    _ => 0,
                })
                .sum();
            Ok(self.advance(partial))
        }
    }

    /// Spins on the run loop until told to stop.
    #[derive(Debug)]
    struct Spinner;

    impl WorkUnit for Spinner {
        type Output = ();

        fn run_chunk(
            &self,
            _workspace: &Workspace,
            _monitor: &ProgressMonitor,
        ) -> Result<Step<Self>, ChunkError> {
            for _ in 0..5_000 {
                if !runloop::should_continue() {
                    return Err(ChunkError::cancelled("interrupted"));
                }
                thread::sleep(Duration::from_millis(1));
            }
            Ok(Step::Done(Some(())))
        }
    }

    /// `chunks` chunks of `steps` interruptible steps each.
    #[derive(Debug, Clone)]
    struct Stepper {
        chunks_left: u32,
        steps: u32,
    }

    impl WorkUnit for Stepper {
        type Output = u32;

        fn run_chunk(
            &self,
            _workspace: &Workspace,
            monitor: &ProgressMonitor,
        ) -> Result<Step<Self>, ChunkError> {
            for _ in 0..self.steps {
                if !runloop::should_continue() {
                    return Err(ChunkError::cancelled("interrupted"));
                }
                thread::sleep(Duration::from_millis(2));
                monitor.add_throughput(1);
            }
            if self.chunks_left <= 1 {
                return Ok(Step::Done(Some(self.steps)));
            }
            Ok(Step::Continue(Self {
                chunks_left: self.chunks_left - 1,
                ..self.clone()
            }))
        }
    }

    fn queue(workers: usize) -> WorkQueue {
        WorkQueue::new(QueueConfig {
            workers,
            recent_jobs_max: 10,
            progress_tick: Duration::from_millis(5),
        })
        .unwrap()
    }

    fn wait_for(
        rx: &mut broadcast::Receiver<QueueEvent>,
        mut pred: impl FnMut(&QueueEvent) -> bool,
    ) -> QueueEvent {
        loop {
            match rx.blocking_recv() {
                Ok(ev) if pred(&ev) => return ev,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("event stream closed"),
            }
        }
    }

    fn finished_summary(rx: &mut broadcast::Receiver<QueueEvent>, job: JobId) -> JobSummary {
        let finished = |ev: &QueueEvent| {
            matches!(ev, QueueEvent::JobFinished { summary } if summary.job_id == job)
        };
        match wait_for(rx, finished) {
            QueueEvent::JobFinished { summary } => summary,
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn counts_to_target_in_three_chunks() {
        let queue = queue(2);
        let mut rx = queue.subscribe();
        let handle = queue.submit(Counter {
            current: 0,
            target: 25,
            chunk: 10,
        });

        assert_eq!(handle.wait(), Ok(Some(25)));
        assert_eq!(handle.wait(), Ok(Some(25)));
        assert_eq!(handle.monitor().throughput(), 25);
        assert_eq!(handle.monitor().throughput_history().len(), 3);
        assert_eq!(handle.monitor().health(), 100.0);

        let summary = finished_summary(&mut rx, handle.id());
        assert_eq!(summary.chunks, 3);
        assert_eq!(summary.status, JobStatus::Done);
        assert_eq!(summary.team_size, 1);
        assert_eq!(summary.monitor.throughput, 25);
    }

    #[test]
    fn team_reduce_matches_solo_execution() {
        let queue = queue(4);
        let solo = queue.submit(TeamSum::new(1_000, 96));
        let team = queue.submit_with(TeamSum::new(1_000, 96), JobOptions::team(4));

        let expected = Some((0..1_000_u64).sum::<u64>());
        assert_eq!(solo.wait(), Ok(expected));
        assert_eq!(team.wait(), Ok(expected));
        assert_eq!(team.monitor().throughput(), 1_000);
    }

    #[test]
    fn default_team_body_runs_once_per_chunk() {
        let queue = queue(3);
        let handle = queue.submit_with(
            Counter {
                current: 0,
                target: 25,
                chunk: 10,
            },
            JobOptions::team(3),
        );
        assert_eq!(handle.wait(), Ok(Some(25)));
        assert_eq!(handle.monitor().throughput(), 25);
        assert_eq!(handle.monitor().throughput_history().len(), 3);
    }

    #[test]
    fn failures_end_the_job() {
        let queue = queue(2);
        let mut rx = queue.subscribe();

        let domain = queue.submit(FailsAt {
            chunk: 0,
            fail_at: 2,
            panic: false,
        });
        let err = domain.wait().unwrap_err();
        assert_eq!(err.kind, FailureKind::Domain);
        assert_eq!(err.message, "chunk 2 rejected");
        assert_eq!(domain.monitor().health(), 0.0);
        let summary = finished_summary(&mut rx, domain.id());
        assert_eq!(summary.status, JobStatus::Failed);
        assert_eq!(summary.chunks, 2);

        let panicky = queue.submit_with(
            FailsAt {
                chunk: 0,
                fail_at: 1,
                panic: true,
            },
            JobOptions::team(2),
        );
        let err = panicky.wait().unwrap_err();
        assert_eq!(err.kind, FailureKind::Runtime);
        assert!(err.message.contains("chunk 1 blew up"));
    }

    #[test]
    fn jobs_run_in_submission_order_on_a_single_worker() {
        let queue = queue(1);
        let mut rx = queue.subscribe();
        let handles: Vec<_> = (0..3)
            .map(|_| {
                queue.submit(Counter {
                    current: 0,
                    target: 6,
                    chunk: 2,
                })
            })
            .collect();
        for handle in &handles {
            assert_eq!(handle.wait(), Ok(Some(6)));
        }

        let mut order = Vec::new();
        while order.len() < 3 {
            if let QueueEvent::JobFinished { summary } = wait_for(&mut rx, |ev| {
                matches!(ev, QueueEvent::JobFinished { .. })
            }) {
                order.push(summary.job_id);
            }
        }
        let ids: Vec<JobId> = handles.iter().map(JobHandle::id).collect();
        assert_eq!(order, ids);
    }

    #[test]
    fn oversized_teams_are_clamped_to_the_pool() {
        let queue = queue(2);
        let mut rx = queue.subscribe();
        let handle = queue.submit_with(TeamSum::new(50, 10), JobOptions::team(8));
        assert_eq!(handle.wait(), Ok(Some((0..50_u64).sum())));

        wait_for(&mut rx, |ev| matches!(ev, QueueEvent::Warning { .. }));
        let summary = finished_summary(&mut rx, handle.id());
        assert_eq!(summary.team_size, 2);
    }

    #[test]
    fn cancel_interrupts_the_running_chunk() {
        let queue = queue(2);
        let mut rx = queue.subscribe();
        let handle = queue.submit(Spinner);
        wait_for(&mut rx, |ev| {
            matches!(ev, QueueEvent::ChunkStarted { job_id, .. } if *job_id == handle.id())
        });

        assert!(queue.cancel(handle.id()));
        let err = handle.wait().unwrap_err();
        assert_eq!(err.kind, FailureKind::Cancelled);
        assert_eq!(handle.monitor().health(), 0.0);

        let summary = finished_summary(&mut rx, handle.id());
        assert_eq!(summary.status, JobStatus::Cancelled);
        assert!(!queue.cancel(handle.id()));
        assert!(!queue.cancel(JobId(999)));
    }

    #[test]
    fn pause_holds_a_job_until_resumed() {
        let queue = queue(1);
        let handle = queue.submit(Stepper {
            chunks_left: 10,
            steps: 5,
        });
        while handle.monitor().throughput() == 0 {
            thread::sleep(Duration::from_millis(1));
        }

        assert!(queue.pause(handle.id()));
        thread::sleep(Duration::from_millis(40));
        let held = handle.monitor().throughput();
        thread::sleep(Duration::from_millis(40));
        assert_eq!(handle.monitor().throughput(), held);
        assert!(!handle.is_complete());

        assert!(queue.resume(handle.id()));
        assert_eq!(handle.wait(), Ok(Some(5)));
        assert_eq!(handle.monitor().throughput(), 50);
    }

    #[test]
    fn shutdown_cancels_outstanding_work() {
        let queue = queue(1);
        let mut rx = queue.subscribe();
        let running = queue.submit(Spinner);
        let waiting = queue.submit(Counter {
            current: 0,
            target: 5,
            chunk: 1,
        });
        wait_for(&mut rx, |ev| matches!(ev, QueueEvent::ChunkStarted { .. }));

        queue.shutdown();
        assert_eq!(
            running.result().map(|r| r.map_err(|e| e.kind)),
            Ok(Err(FailureKind::Cancelled))
        );
        assert_eq!(
            waiting.result().map(|r| r.map_err(|e| e.kind)),
            Ok(Err(FailureKind::Cancelled))
        );
        assert!(queue.snapshot().stop_requested);
        wait_for(&mut rx, |ev| matches!(ev, QueueEvent::Stopped));

        let late = queue.submit(Counter {
            current: 0,
            target: 1,
            chunk: 1,
        });
        let err = late.result().unwrap().unwrap_err();
        assert_eq!(err.kind, FailureKind::Cancelled);
        assert_eq!(late.monitor().health(), 0.0);
    }

    #[test]
    fn snapshot_reports_recent_jobs() {
        let queue = queue(2);
        let mut rx = queue.subscribe();
        let handle = queue.submit(Counter {
            current: 0,
            target: 3,
            chunk: 1,
        });
        handle.wait().unwrap();
        finished_summary(&mut rx, handle.id());

        let snap = queue.snapshot();
        assert_eq!(snap.workers.len(), 2);
        assert_eq!(snap.queued_jobs, 0);
        assert!(snap.recent_jobs.iter().any(|s| s.job_id == handle.id()));
    }

    #[test]
    fn panicking_describe_is_contained_at_submit() {
        let queue = queue(1);
        let mut rx = queue.subscribe();
        let handle = queue.submit(BadDescribe);
        assert_eq!(handle.wait(), Ok(Some(7)));

        let summary = finished_summary(&mut rx, handle.id());
        assert!(summary.unit.ends_with("BadDescribe"), "{}", summary.unit);
        assert_eq!(summary.status, JobStatus::Done);
    }

    #[test]
    fn team_shares_the_callers_workspace_and_monitor() {
        let queue = queue(4);
        let hits: Arc<HitTable> = Arc::new(Mutex::new(vec![0; 4]));
        let monitor = ProgressMonitor::new();
        let options = JobOptions::team(4)
            .workspace(Workspace::from_arc(Arc::clone(&hits)))
            .monitor(monitor.clone());
        let handle = queue.submit_with(
            Tally {
                chunks_left: 10,
                acc: 0,
            },
            options,
        );

        assert_eq!(handle.wait(), Ok(Some(40)));
        assert_eq!(handle.monitor(), &monitor);
        assert_eq!(monitor.throughput(), 40);
        assert_eq!(*hits.lock(), vec![10; 4]);

        let bare = queue.submit(Tally {
            chunks_left: 1,
            acc: 0,
        });
        assert_eq!(bare.wait().map_err(|e| e.kind), Err(FailureKind::Domain));
        assert_eq!(bare.monitor().health(), 0.0);
    }
}
