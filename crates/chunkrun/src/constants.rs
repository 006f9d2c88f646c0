use std::time::Duration;

pub const PROGRESS_BAR_STEPS: u64 = 1_000; // Report every 0.1%
pub const UI_REFRESH_INTERVAL: Duration = Duration::from_millis(250);

pub const DEFAULT_TARGET: u64 = 200_000_000;
pub const DEFAULT_CHUNK_SIZE: u64 = 2_000_000;
pub const DEFAULT_LOG_FILTER: &str = "warn";

/// Run-loop safe points are checked once per this many steps.
pub const STEPS_PER_CHECK: u64 = 1 << 16;
