use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use chunkrun_core::Settings;
use chunkrun_engine::QueueConfig;

use crate::constants::{DEFAULT_CHUNK_SIZE, DEFAULT_TARGET};

pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(512)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Workload {
    /// Count from zero to the target (default).
    Count,
    /// Sum the integers below the target, split across the team.
    Sum,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "chunkrun", version, about = "Chunked, resumable workloads on a worker pool")]
pub struct Cli {
    /// Number of worker threads (defaults to the settings file, then the CPU count).
    #[arg(
        short = 'p',
        long,
        env = "CHUNKRUN_WORKERS",
        value_parser = clap::value_parser!(u16).range(1..=512)
    )]
    pub parallel: Option<u16>,

    /// Workers cooperating on each chunk.
    #[arg(
        short = 't',
        long = "team",
        env = "CHUNKRUN_TEAM_SIZE",
        value_parser = clap::value_parser!(u16).range(1..=512)
    )]
    pub team_size: Option<u16>,

    /// Workload size.
    #[arg(long, default_value_t = DEFAULT_TARGET)]
    pub target: u64,

    /// Steps per chunk.
    #[arg(
        long,
        default_value_t = DEFAULT_CHUNK_SIZE,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub chunk_size: u64,

    /// Workload to run.
    #[arg(long, value_enum, default_value_t = Workload::Count)]
    pub workload: Workload,

    /// Print plain lines instead of a progress bar.
    #[arg(long, env = "CHUNKRUN_NO_PROGRESS", default_value_t = false)]
    pub no_progress: bool,

    /// Drive the job on a single thread instead of the worker pool.
    #[arg(long, default_value_t = false)]
    pub inline: bool,

    /// Run the team speed-up benchmark and exit.
    #[arg(long, default_value_t = false)]
    pub bench: bool,

    /// Settings file (defaults to `$XDG_CONFIG_HOME/chunkrun/config.json`).
    #[arg(long, env = "CHUNKRUN_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Store the effective `--parallel` / `--team` in the settings file and exit.
    #[arg(long, default_value_t = false)]
    pub save_config: bool,
}

/// Effective options after merging flags, environment and the settings file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub workers: usize,
    pub team_size: usize,
    pub progress_tick: Duration,
}

impl Cli {
    pub fn resolve(&self, settings: &Settings) -> RunOptions {
        let workers = self
            .parallel
            .map(usize::from)
            .or(settings.workers)
            .unwrap_or_else(default_workers)
            .max(1);
        let team_size = self
            .team_size
            .map(usize::from)
            .or(settings.team_size)
            .unwrap_or(1)
            .max(1);
        let progress_tick = settings
            .progress_tick_ms
            .map(Duration::from_millis)
            .unwrap_or(QueueConfig::DEFAULT_PROGRESS_TICK);
        RunOptions {
            workers,
            team_size,
            progress_tick,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("chunkrun").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn flags_override_settings() {
        let settings = Settings {
            workers: Some(3),
            team_size: Some(2),
            log_filter: None,
            progress_tick_ms: Some(50),
        };

        let opts = parse(&["-p", "8", "--team", "4"]).resolve(&settings);
        assert_eq!(opts.workers, 8);
        assert_eq!(opts.team_size, 4);
        assert_eq!(opts.progress_tick, Duration::from_millis(50));

        let opts = parse(&[]).resolve(&settings);
        assert_eq!(opts.workers, 3);
        assert_eq!(opts.team_size, 2);
    }

    #[test]
    fn defaults_apply_without_settings() {
        let cli = parse(&["--workload", "sum", "--target", "100", "--chunk-size", "7"]);
        assert_eq!(cli.workload, Workload::Sum);
        assert_eq!(cli.target, 100);
        assert_eq!(cli.chunk_size, 7);

        let opts = cli.resolve(&Settings::default());
        assert_eq!(opts.team_size, 1);
        assert!(opts.workers >= 1);
        assert_eq!(opts.progress_tick, QueueConfig::DEFAULT_PROGRESS_TICK);
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let argv = |a: &[&'static str]| {
            std::iter::once("chunkrun")
                .chain(a.iter().copied())
                .collect::<Vec<_>>()
        };
        assert!(Cli::try_parse_from(argv(&["--parallel", "0"])).is_err());
        assert!(Cli::try_parse_from(argv(&["--chunk-size", "0"])).is_err());
    }
}
