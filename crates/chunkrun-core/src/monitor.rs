//! Shared, append-only telemetry for one logical job.
//!
//! A [`ProgressMonitor`] is a cheap handle: cloning it aliases the same state, so
//! every chunk of a job (on any worker thread) records into one place. Mutation is
//! serialized by a single lock that is only held for one counter update plus one
//! history append.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Health reported by a freshly created monitor.
pub const INITIAL_HEALTH: f64 = 100.0;

/// One time-stamped history entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Sample<T> {
    /// When the value was recorded.
    pub at: DateTime<Utc>,
    /// Recorded delta (counters) or new value (percentages).
    pub value: T,
}

impl<T> Sample<T> {
    fn now(value: T) -> Self {
        Self {
            at: Utc::now(),
            value,
        }
    }
}

#[derive(Debug)]
struct MonitorState {
    throughput: u64,
    cost: f64,
    health: f64,
    progress: f64,
    throughput_history: Vec<Sample<u64>>,
    cost_history: Vec<Sample<f64>>,
    health_history: Vec<Sample<f64>>,
    progress_history: Vec<Sample<f64>>,
    revision: u64,
}

impl MonitorState {
    fn new() -> Self {
        Self {
            throughput: 0,
            cost: 0.0,
            health: INITIAL_HEALTH,
            progress: 0.0,
            throughput_history: Vec::new(),
            cost_history: Vec::new(),
            health_history: Vec::new(),
            progress_history: Vec::new(),
            revision: 0,
        }
    }
}

/// Point-in-time view of a monitor's current values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorSnapshot {
    /// Cumulative throughput.
    pub throughput: u64,
    /// Cumulative cost / energy.
    pub cost: f64,
    /// Current health percentage.
    pub health: f64,
    /// Current progress percentage.
    pub progress: f64,
    /// Number of recorded throughput additions.
    pub throughput_samples: usize,
    /// Number of recorded cost additions.
    pub cost_samples: usize,
    /// Number of recorded health updates.
    pub health_samples: usize,
    /// Number of recorded progress updates.
    pub progress_samples: usize,
    /// Total number of mutations applied so far.
    pub revision: u64,
}

impl Default for MonitorSnapshot {
    fn default() -> Self {
        Self {
            throughput: 0,
            cost: 0.0,
            health: INITIAL_HEALTH,
            progress: 0.0,
            throughput_samples: 0,
            cost_samples: 0,
            health_samples: 0,
            progress_samples: 0,
            revision: 0,
        }
    }
}

/// Thread-safe, reference-counted recorder of throughput, cost, health and progress.
///
/// Equality is identity: two handles are equal iff they alias the same state.
/// A handle whose state has been released (see [`ProgressMonitor::detached`] and
/// [`ProgressMonitor::release`]) silently ignores every mutation.
#[derive(Clone, Default)]
pub struct ProgressMonitor {
    inner: Option<Arc<Mutex<MonitorState>>>,
}

impl ProgressMonitor {
    /// Create a monitor with throughput 0, cost 0, health 100 and progress 0.
    pub fn new() -> Self {
        Self {
            inner: Some(Arc::new(Mutex::new(MonitorState::new()))),
        }
    }

    /// A handle with no backing state. All mutations are no-ops.
    pub fn detached() -> Self {
        Self { inner: None }
    }

    /// Drop this handle's reference to the shared state.
    ///
    /// Other handles keep working; this one turns into a detached handle.
    pub fn release(&mut self) {
        self.inner = None;
    }

    /// Whether this handle still references live state.
    pub fn is_attached(&self) -> bool {
        self.inner.is_some()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MonitorState) -> R) -> Option<R> {
        let inner = self.inner.as_ref()?;
        let mut state = inner.lock();
        Some(f(&mut state))
    }

    /// Add `n` to the cumulative throughput counter.
    pub fn add_throughput(&self, n: u64) {
        self.with_state(|s| {
            s.throughput = s.throughput.saturating_add(n);
            s.throughput_history.push(Sample::now(n));
            s.revision += 1;
        });
    }

    /// Add `delta` to the cumulative cost counter.
    ///
    /// Negative or non-finite deltas are recorded as `0.0`.
    pub fn add_cost(&self, delta: f64) {
        let delta = if delta.is_finite() && delta > 0.0 {
            delta
        } else {
            0.0
        };
        self.with_state(|s| {
            s.cost += delta;
            s.cost_history.push(Sample::now(delta));
            s.revision += 1;
        });
    }

    /// Overwrite the current health percentage.
    pub fn set_health(&self, percent: f64) {
        self.with_state(|s| {
            s.health = percent;
            s.health_history.push(Sample::now(percent));
            s.revision += 1;
        });
    }

    /// Overwrite the current progress percentage.
    pub fn set_progress(&self, percent: f64) {
        self.with_state(|s| {
            s.progress = percent;
            s.progress_history.push(Sample::now(percent));
            s.revision += 1;
        });
    }

    /// Cumulative throughput.
    pub fn throughput(&self) -> u64 {
        self.with_state(|s| s.throughput).unwrap_or(0)
    }

    /// Cumulative cost.
    pub fn cost(&self) -> f64 {
        self.with_state(|s| s.cost).unwrap_or(0.0)
    }

    /// Current health percentage.
    pub fn health(&self) -> f64 {
        self.with_state(|s| s.health).unwrap_or(INITIAL_HEALTH)
    }

    /// Current progress percentage.
    pub fn progress(&self) -> f64 {
        self.with_state(|s| s.progress).unwrap_or(0.0)
    }

    /// `true` once health has been driven to zero.
    pub fn is_failed(&self) -> bool {
        self.health() == 0.0
    }

    /// Copy of the throughput history.
    pub fn throughput_history(&self) -> Vec<Sample<u64>> {
        self.with_state(|s| s.throughput_history.clone())
            .unwrap_or_default()
    }

    /// Copy of the cost history.
    pub fn cost_history(&self) -> Vec<Sample<f64>> {
        self.with_state(|s| s.cost_history.clone()).unwrap_or_default()
    }

    /// Copy of the health history.
    pub fn health_history(&self) -> Vec<Sample<f64>> {
        self.with_state(|s| s.health_history.clone()).unwrap_or_default()
    }

    /// Copy of the progress history.
    pub fn progress_history(&self) -> Vec<Sample<f64>> {
        self.with_state(|s| s.progress_history.clone())
            .unwrap_or_default()
    }

    /// Current values plus history lengths, taken under one lock.
    pub fn snapshot(&self) -> MonitorSnapshot {
        self.with_state(|s| MonitorSnapshot {
            throughput: s.throughput,
            cost: s.cost,
            health: s.health,
            progress: s.progress,
            throughput_samples: s.throughput_history.len(),
            cost_samples: s.cost_history.len(),
            health_samples: s.health_history.len(),
            progress_samples: s.progress_history.len(),
            revision: s.revision,
        })
        .unwrap_or_default()
    }
}

impl PartialEq for ProgressMonitor {
    fn eq(&self, other: &Self) -> bool {
        match (&self.inner, &other.inner) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl Eq for ProgressMonitor {}

impl fmt::Debug for ProgressMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            None => f.write_str("ProgressMonitor(detached)"),
            Some(_) => {
                let snap = self.snapshot();
                f.debug_struct("ProgressMonitor")
                    .field("throughput", &snap.throughput)
                    .field("cost", &snap.cost)
                    .field("health", &snap.health)
                    .field("progress", &snap.progress)
                    .finish()
            }
        }
    }
}
