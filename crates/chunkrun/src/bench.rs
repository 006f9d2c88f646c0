use std::time::{Duration, Instant};

use anyhow::Context;

use chunkrun_engine::{JobOptions, QueueConfig, WorkQueue};

use crate::format::{format_duration, format_number, format_rate};
use crate::units::RangeSum;

const BENCH_END: u64 = 400_000_000;
const BENCH_CHUNK_SIZE: u64 = 8_000_000;

fn expected_sum(end: u64) -> u128 {
    let end = u128::from(end);
    end * end.saturating_sub(1) / 2
}

/// Sum `0..BENCH_END` solo and with the whole pool as one team.
pub fn run_benchmark(workers: usize) -> anyhow::Result<()> {
    let workers = workers.max(1);
    let queue = WorkQueue::new(QueueConfig::with_workers(workers)).context("start work queue")?;

    println!("Benchmark: sum 0..{}", format_number(BENCH_END));
    println!("Chunk size: {}", format_number(BENCH_CHUNK_SIZE));
    println!("Workers: {}", format_number(workers as u64));

    let mut teams = vec![1];
    if workers > 1 {
        teams.push(workers);
    }

    let mut baseline: Option<Duration> = None;
    for team in teams {
        let started_at = Instant::now();
        let handle = queue.submit_with(
            RangeSum::new(BENCH_END, BENCH_CHUNK_SIZE),
            JobOptions::team(team),
        );
        let sum = match handle.wait() {
            Ok(Some(sum)) => sum,
            Ok(None) => anyhow::bail!("benchmark job (team {team}) produced no result"),
            Err(failure) => anyhow::bail!("benchmark job (team {team}) failed: {failure}"),
        };
        let duration = started_at.elapsed();
        validate_sum(sum, BENCH_END)?;

        let speedup = baseline
            .map(|base| format!(" ({:.2}x)", base.as_secs_f64() / duration.as_secs_f64().max(1e-9)))
            .unwrap_or_default();
        baseline.get_or_insert(duration);
        println!(
            "Team {team}: {} {}{speedup}",
            format_duration(duration),
            format_rate(BENCH_END, duration),
        );
    }

    queue.shutdown();
    Ok(())
}

fn validate_sum(sum: u128, end: u64) -> anyhow::Result<()> {
    let expected = expected_sum(end);
    if sum != expected {
        anyhow::bail!("benchmark sum mismatch (got {sum}, expected {expected})");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::validate_sum;

    #[test]
    fn validate_sum_checks_the_closed_form() {
        assert!(validate_sum(45, 10).is_ok());
        assert!(validate_sum(0, 0).is_ok());
        assert!(validate_sum(44, 10).is_err());
    }
}
