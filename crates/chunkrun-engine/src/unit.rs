//! The resumable unit of computation and its execution boundary.
//!
//! A [`WorkUnit`] is immutable: every chunk maps the current value to a successor
//! value, a terminal result, or a failure. Implementors only write chunk bodies
//! (and optionally a team body and a reduce); the [`RunChunk`] entry points wrap
//! those bodies so that nothing they raise escapes.

use std::any::Any;
use std::fmt;
use std::ops::Range;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use chunkrun_core::monitor::ProgressMonitor;
use chunkrun_core::runloop;
use serde::{Deserialize, Serialize};

use crate::failure::{ChunkError, FailureRecord};

/// Opaque, cheaply clonable capability shared by every chunk call of a job.
///
/// The engine never looks inside; synchronising access to the contents is the
/// owner's responsibility.
#[derive(Clone, Default)]
pub struct Workspace(Option<Arc<dyn Any + Send + Sync>>);

impl Workspace {
    /// The "no workspace" value.
    pub fn none() -> Self {
        Self(None)
    }

    /// Wrap `value` as a workspace.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Some(Arc::new(value)))
    }

    /// Share an existing allocation as a workspace.
    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self(Some(value))
    }

    /// `true` for the "no workspace" value.
    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }

    /// Borrow the contents as `T`, if that is what this workspace holds.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_deref()?.downcast_ref::<T>()
    }
}

impl fmt::Debug for Workspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            None => f.write_str("Workspace(none)"),
            Some(_) => f.write_str("Workspace(..)"),
        }
    }
}

/// A worker's clamped position inside a team.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TeamSlot {
    /// Worker id, `0..count`.
    pub id: usize,
    /// Team size, at least 1.
    pub count: usize,
}

impl TeamSlot {
    /// The single slot of a solo execution.
    pub const SOLO: TeamSlot = TeamSlot { id: 0, count: 1 };

    /// Clamp a caller-supplied position.
    ///
    /// `count <= 0` is treated as 1 and `id < 0` as 0; an id that is still outside
    /// the team is an invariant violation.
    pub fn clamped(id: i64, count: i64) -> Result<Self, FailureRecord> {
        let count = count.max(1);
        let id = id.max(0);
        if id >= count {
            return Err(FailureRecord::invariant(format!(
                "worker id {id} is outside a team of {count}"
            )));
        }
        Ok(Self {
            id: id as usize,
            count: count as usize,
        })
    }

    /// Whether this slot is worker 0.
    pub fn is_leader(&self) -> bool {
        self.id == 0
    }

    /// This slot's contiguous share of `range`. Earlier slots take the remainder.
    pub fn share(&self, range: Range<u64>) -> Range<u64> {
        let len = range.end.saturating_sub(range.start);
        let count = self.count.max(1) as u64;
        let id = self.id as u64;
        let base = len / count;
        let extra = len % count;
        let start = range.start + id * base + id.min(extra);
        let size = base + u64::from(id < extra);
        start..start + size
    }
}

/// What a chunk body produces when it does not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum Step<W: WorkUnit> {
    /// More work remains; carries the successor state.
    Continue(W),
    /// Finished. `None` is the "no result" sentinel.
    Done(Option<W::Output>),
}

impl<W: WorkUnit> Step<W> {
    /// `true` for `Done(None)`.
    pub fn is_sentinel(&self) -> bool {
        matches!(self, Step::Done(None))
    }
}

/// Outcome of one boundary call.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult<W: WorkUnit> {
    /// More work remains; carries the successor state.
    Continue(W),
    /// Terminal result. `None` is the "no result" sentinel.
    Done(Option<W::Output>),
    /// Captured failure. The monitor's health has already been set to 0.
    Failed(FailureRecord),
}

impl<W: WorkUnit> ExecutionResult<W> {
    /// Anything but `Continue`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionResult::Continue(_))
    }

    /// `true` for `Failed`.
    pub fn is_failed(&self) -> bool {
        matches!(self, ExecutionResult::Failed(_))
    }

    /// The captured failure, if any.
    pub fn failure(&self) -> Option<&FailureRecord> {
        match self {
            ExecutionResult::Failed(record) => Some(record),
            _ => None,
        }
    }

    /// Split into a step or the failure.
    pub fn into_step(self) -> Result<Step<W>, FailureRecord> {
        match self {
            ExecutionResult::Continue(next) => Ok(Step::Continue(next)),
            ExecutionResult::Done(value) => Ok(Step::Done(value)),
            ExecutionResult::Failed(record) => Err(record),
        }
    }
}

impl<W: WorkUnit> From<Step<W>> for ExecutionResult<W> {
    fn from(step: Step<W>) -> Self {
        match step {
            Step::Continue(next) => ExecutionResult::Continue(next),
            Step::Done(value) => ExecutionResult::Done(value),
        }
    }
}

/// A resumable computation executed in bounded chunks.
///
/// Only [`WorkUnit::run_chunk`] is required. Team execution defaults to "worker 0
/// runs the solo body, everyone else reports the sentinel", and the default reduce
/// keeps the first non-sentinel result in worker-id order.
pub trait WorkUnit: fmt::Debug + Send + Sync + Sized + 'static {
    /// Terminal result type.
    type Output: Clone + fmt::Debug + Send + Sync + 'static;

    /// Identity used in failure records.
    fn describe(&self) -> String {
        format!("{self:?}")
    }

    /// Execute one chunk alone.
    fn run_chunk(
        &self,
        workspace: &Workspace,
        monitor: &ProgressMonitor,
    ) -> Result<Step<Self>, ChunkError>;

    /// Execute this worker's share of a team chunk.
    fn run_team_chunk(
        &self,
        workspace: &Workspace,
        slot: TeamSlot,
        monitor: &ProgressMonitor,
    ) -> Result<Step<Self>, ChunkError> {
        if slot.is_leader() {
            self.run_chunk(workspace, monitor)
        } else {
            Ok(Step::Done(None))
        }
    }

    /// Combine the per-worker results of one team chunk (ordered by worker id).
    fn reduce(
        &self,
        results: Vec<Step<Self>>,
        monitor: &ProgressMonitor,
    ) -> Result<Step<Self>, ChunkError> {
        let _ = monitor;
        Ok(results
            .into_iter()
            .find(|step| !step.is_sentinel())
            .unwrap_or(Step::Done(None)))
    }
}

/// Boundary entry points available on every [`WorkUnit`].
///
/// None of these panic or return an error: failures come back as
/// [`ExecutionResult::Failed`] with the monitor's health forced to 0.
pub trait RunChunk: WorkUnit {
    /// Solo execution without a workspace.
    fn run(&self, monitor: &ProgressMonitor) -> ExecutionResult<Self> {
        self.run_with_workspace(&Workspace::none(), monitor)
    }

    /// Solo execution with a workspace.
    fn run_with_workspace(
        &self,
        workspace: &Workspace,
        monitor: &ProgressMonitor,
    ) -> ExecutionResult<Self> {
        guarded(self, monitor, || self.run_chunk(workspace, monitor))
    }

    /// This worker's slice of a team execution, without a workspace.
    fn run_team(
        &self,
        worker_id: i64,
        worker_count: i64,
        monitor: &ProgressMonitor,
    ) -> ExecutionResult<Self> {
        self.run_team_with_workspace(&Workspace::none(), worker_id, worker_count, monitor)
    }

    /// This worker's slice of a team execution, with a workspace.
    fn run_team_with_workspace(
        &self,
        workspace: &Workspace,
        worker_id: i64,
        worker_count: i64,
        monitor: &ProgressMonitor,
    ) -> ExecutionResult<Self> {
        match TeamSlot::clamped(worker_id, worker_count) {
            Ok(slot) => guarded(self, monitor, || {
                self.run_team_chunk(workspace, slot, monitor)
            }),
            Err(record) => fail(monitor, record),
        }
    }

    /// Fan-in of one team chunk.
    fn reduce_results(
        &self,
        results: Vec<Step<Self>>,
        monitor: &ProgressMonitor,
    ) -> ExecutionResult<Self> {
        guarded(self, monitor, || self.reduce(results, monitor))
    }
}

impl<W: WorkUnit> RunChunk for W {}

fn guarded<W: WorkUnit>(
    unit: &W,
    monitor: &ProgressMonitor,
    body: impl FnOnce() -> Result<Step<W>, ChunkError>,
) -> ExecutionResult<W> {
    let record = match catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(step)) => return step.into(),
        Ok(Err(err)) => FailureRecord::from_chunk_error(err, || describe(unit)),
        Err(payload) => FailureRecord::from_panic(payload, || describe(unit)),
    };
    fail(monitor, record)
}

/// `unit.describe()`, falling back to the type name if it panics.
pub(crate) fn describe<W: WorkUnit>(unit: &W) -> String {
    catch_unwind(AssertUnwindSafe(|| unit.describe()))
        .unwrap_or_else(|_| std::any::type_name::<W>().to_string())
}

pub(crate) fn fail<W: WorkUnit>(
    monitor: &ProgressMonitor,
    record: FailureRecord,
) -> ExecutionResult<W> {
    monitor.set_health(0.0);
    tracing::warn!(
        kind = %record.kind,
        unit = record.unit.as_deref().unwrap_or("-"),
        "chunk failed: {}",
        record.message
    );
    ExecutionResult::Failed(record)
}

/// Drive `unit` to a terminal result on the calling thread.
///
/// Feeds every `Continue` back into the solo entry point and returns the terminal
/// result together with the number of chunks executed. If the calling thread is
/// registered with the run loop and gets stopped, the job ends as cancelled.
pub fn drive_to_completion<W: WorkUnit>(
    unit: W,
    workspace: &Workspace,
    monitor: &ProgressMonitor,
) -> (ExecutionResult<W>, u64) {
    let mut current = unit;
    let mut chunks = 0_u64;
    loop {
        if !runloop::should_continue() {
            let record = FailureRecord::cancelled(format!("stopped after {chunks} chunk(s)"));
            return (fail(monitor, record), chunks);
        }
        chunks += 1;
        match current.run_with_workspace(workspace, monitor) {
            ExecutionResult::Continue(next) => current = next,
            terminal => return (terminal, chunks),
        }
    }
}
