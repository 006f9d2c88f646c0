//! Demo work units driven by the CLI.

use std::hint::black_box;
use std::time::Instant;

use chunkrun_core::{ProgressMonitor, runloop};
use chunkrun_engine::{ChunkError, Step, TeamSlot, WorkUnit, Workspace};

use crate::constants::STEPS_PER_CHECK;

fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    done as f64 * 100.0 / total as f64
}

/// Counts from `current` to `target`, `chunk_size` steps per chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountTo {
    pub current: u64,
    pub target: u64,
    pub chunk_size: u64,
}

impl CountTo {
    pub fn new(target: u64, chunk_size: u64) -> Self {
        Self {
            current: 0,
            target,
            chunk_size,
        }
    }
}

impl WorkUnit for CountTo {
    type Output = u64;

    fn describe(&self) -> String {
        format!("count {}/{} by {}", self.current, self.target, self.chunk_size)
    }

    fn run_chunk(
        &self,
        _workspace: &Workspace,
        monitor: &ProgressMonitor,
    ) -> Result<Step<Self>, ChunkError> {
        if self.chunk_size == 0 {
            return Err(ChunkError::domain("chunk size must be at least 1"));
        }
        if self.current > self.target {
            return Err(ChunkError::domain(format!(
                "counter {} is past its target {}",
                self.current, self.target
            )));
        }

        let stop = self.current.saturating_add(self.chunk_size).min(self.target);
        let mut n = self.current;
        while n < stop {
            if n % STEPS_PER_CHECK == 0 && !runloop::should_continue() {
                return Err(ChunkError::cancelled(format!("stopped at {n}")));
            }
            n = black_box(n + 1);
        }

        monitor.add_throughput(stop - self.current);
        monitor.set_progress(percent(stop, self.target));
        if stop == self.target {
            Ok(Step::Done(Some(stop)))
        } else {
            Ok(Step::Continue(Self {
                current: stop,
                ..self.clone()
            }))
        }
    }
}

/// Sums `0..end`. Team chunks split the chunk's range and reduce by addition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSum {
    pub next: u64,
    pub end: u64,
    pub chunk_size: u64,
    pub acc: u128,
}

impl RangeSum {
    pub fn new(end: u64, chunk_size: u64) -> Self {
        Self {
            next: 0,
            end,
            chunk_size,
            acc: 0,
        }
    }

    fn chunk_end(&self) -> u64 {
        self.next.saturating_add(self.chunk_size.max(1)).min(self.end)
    }

    fn advance(&self, partial: u128, monitor: &ProgressMonitor) -> Step<Self> {
        let stop = self.chunk_end();
        let acc = self.acc + partial;
        monitor.set_progress(percent(stop, self.end));
        if stop >= self.end {
            Step::Done(Some(acc))
        } else {
            Step::Continue(Self {
                next: stop,
                acc,
                ..self.clone()
            })
        }
    }

    fn sum_range(
        range: std::ops::Range<u64>,
        monitor: &ProgressMonitor,
    ) -> Result<u128, ChunkError> {
        let started = Instant::now();
        let len = range.end.saturating_sub(range.start);
        let mut sum = 0_u128;
        for n in range {
            if n % STEPS_PER_CHECK == 0 && !runloop::should_continue() {
                return Err(ChunkError::cancelled(format!("stopped at {n}")));
            }
            sum += u128::from(black_box(n));
        }
        monitor.add_throughput(len);
        monitor.add_cost(started.elapsed().as_secs_f64());
        Ok(sum)
    }
}

impl WorkUnit for RangeSum {
    type Output = u128;

    fn describe(&self) -> String {
        format!("sum {}..{} by {}", self.next, self.end, self.chunk_size)
    }

    fn run_chunk(
        &self,
        _workspace: &Workspace,
        monitor: &ProgressMonitor,
    ) -> Result<Step<Self>, ChunkError> {
        if self.chunk_size == 0 {
            return Err(ChunkError::domain("chunk size must be at least 1"));
        }
        let sum = Self::sum_range(self.next..self.chunk_end(), monitor)?;
        Ok(self.advance(sum, monitor))
    }

    fn run_team_chunk(
        &self,
        _workspace: &Workspace,
        slot: TeamSlot,
        monitor: &ProgressMonitor,
    ) -> Result<Step<Self>, ChunkError> {
        if self.chunk_size == 0 {
            return Err(ChunkError::domain("chunk size must be at least 1"));
        }
        let share = slot.share(self.next..self.chunk_end());
        Ok(Step::Done(Some(Self::sum_range(share, monitor)?)))
    }

    fn reduce(
        &self,
        results: Vec<Step<Self>>,
        monitor: &ProgressMonitor,
    ) -> Result<Step<Self>, ChunkError> {
        let mut partial = 0_u128;
        for step in results {
            match step {
                Step::Done(Some(p)) => partial += p,
                Step::Done(None) => {}
                Step::Continue(_) => {
                    return Err(ChunkError::domain("team member returned a continuation"));
                }
            }
        }
        Ok(self.advance(partial, monitor))
    }
}
