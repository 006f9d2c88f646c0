#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Leaf primitives shared by the `chunkrun` engine and CLI.

/// Shared progress / health / throughput telemetry.
pub mod monitor;

/// Process-wide cooperative pause / resume / stop registry.
pub mod runloop;

/// On-disk defaults for the CLI.
pub mod settings;

pub use monitor::{MonitorSnapshot, ProgressMonitor, Sample};
pub use runloop::{RunLoopGuard, RunState};
pub use settings::Settings;
