mod bench;
mod cli;
mod constants;
mod format;
mod shutdown;
mod ui;
mod units;

use std::fmt::Display;
use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use chunkrun_core::settings::{load_settings, load_settings_from, save_settings, save_settings_to};
use chunkrun_core::{ProgressMonitor, Settings, runloop};
use chunkrun_engine::{
    ExecutionResult, JobOptions, QueueConfig, QueueEvent, WorkQueue, WorkUnit, WorkerStage,
    Workspace, drive_to_completion,
};

use crate::bench::run_benchmark;
use crate::cli::{Cli, RunOptions, Workload};
use crate::constants::{DEFAULT_LOG_FILTER, UI_REFRESH_INTERVAL};
use crate::format::{format_duration, format_job_done_line, format_number};
use crate::shutdown::{ShutdownController, ShutdownEvent, spawn_ctrl_c_handler};
use crate::ui::Ui;
use crate::units::{CountTo, RangeSum};

const STOP_MESSAGE: &str = concat!(
    "Stop requested: cancelling the job at its next safe point ",
    "(press CTRL+C again to exit immediately)."
);
const EXIT_MESSAGE: &str = "Stop requested again: exiting immediately.";

fn init_tracing(settings: &Settings) {
    let fallback = settings.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn read_settings(cli: &Cli) -> Settings {
    let loaded = match &cli.config {
        Some(path) => load_settings_from(path),
        None => load_settings(),
    };
    match loaded {
        Ok(settings) => settings.unwrap_or_default(),
        Err(err) => {
            eprintln!("warning: failed to read settings: {err:#}");
            Settings::default()
        }
    }
}

fn write_settings(cli: &Cli, mut settings: Settings, opts: &RunOptions) -> anyhow::Result<()> {
    settings.workers = Some(opts.workers);
    settings.team_size = Some(opts.team_size);
    match &cli.config {
        Some(path) => save_settings_to(path, &settings)?,
        None => save_settings(&settings)?,
    }
    println!(
        "saved settings: workers={} team={}",
        opts.workers, opts.team_size
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = read_settings(&cli);
    init_tracing(&settings);
    let opts = cli.resolve(&settings);

    if cli.save_config {
        return write_settings(&cli, settings, &opts);
    }

    if cli.bench {
        run_benchmark(opts.workers)?;
        return Ok(());
    }

    let show_progress = !cli.no_progress && std::io::stdout().is_terminal();
    match cli.workload {
        Workload::Count => {
            let unit = CountTo::new(cli.target, cli.chunk_size);
            if cli.inline {
                run_inline(unit).await
            } else {
                run_on_queue(unit, &opts, show_progress).await
            }
        }
        Workload::Sum => {
            let unit = RangeSum::new(cli.target, cli.chunk_size);
            if cli.inline {
                run_inline(unit).await
            } else {
                run_on_queue(unit, &opts, show_progress).await
            }
        }
    }
}

async fn run_inline<W>(unit: W) -> anyhow::Result<()>
where
    W: WorkUnit,
    W::Output: Display,
{
    let label = unit.describe();
    println!("chunkrun {} inline: {label}", env!("CARGO_PKG_VERSION"));

    let shutdown = Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_ctrl_c_handler(shutdown, shutdown_tx);

    let (thread_tx, thread_rx) = tokio::sync::oneshot::channel();
    let monitor = ProgressMonitor::new();
    let job_monitor = monitor.clone();
    let started_at = std::time::Instant::now();
    let mut job = tokio::task::spawn_blocking(move || {
        let guard = runloop::register_thread();
        let _ = thread_tx.send(guard.thread_id());
        drive_to_completion(unit, &Workspace::none(), &job_monitor)
    });
    let thread = thread_rx.await.ok();

    let (result, chunks) = loop {
        tokio::select! {
            ev_opt = shutdown_rx.recv() => match ev_opt {
                Some(ShutdownEvent::Graceful) => {
                    eprintln!("{STOP_MESSAGE}");
                    if let Some(thread) = thread {
                        runloop::request_stop(thread);
                    }
                }
                Some(ShutdownEvent::Immediate) => {
                    eprintln!("{EXIT_MESSAGE}");
                    std::process::exit(130);
                }
                None => {}
            },
            res = &mut job => break res?,
        }
    };

    let elapsed = started_at.elapsed();
    println!(
        "{} item(s) in {chunks} chunk(s), {}",
        format_number(monitor.throughput()),
        format_duration(elapsed)
    );
    report(result)
}

fn report<W>(result: ExecutionResult<W>) -> anyhow::Result<()>
where
    W: WorkUnit,
    W::Output: Display,
{
    match result {
        ExecutionResult::Done(Some(value)) => {
            println!("result: {value}");
            Ok(())
        }
        ExecutionResult::Done(None) => {
            println!("result: none");
            Ok(())
        }
        ExecutionResult::Continue(_) => anyhow::bail!("job stopped before reaching a result"),
        ExecutionResult::Failed(failure) => anyhow::bail!("job ended: {failure}"),
    }
}

async fn run_on_queue<W>(unit: W, opts: &RunOptions, show_progress: bool) -> anyhow::Result<()>
where
    W: WorkUnit,
    W::Output: Display,
{
    let queue = WorkQueue::new(QueueConfig {
        workers: opts.workers,
        recent_jobs_max: 0,
        progress_tick: opts.progress_tick,
    })?;
    let mut events = queue.subscribe();

    let shutdown = Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_ctrl_c_handler(shutdown, shutdown_tx);

    let label = unit.describe();
    let handle = queue.submit_with(unit, JobOptions::team(opts.team_size));

    let startup = format!(
        "chunkrun {} workers={} team={}: {label}",
        env!("CARGO_PKG_VERSION"),
        opts.workers,
        opts.team_size
    );
    let mut ui = show_progress.then(|| Ui::new(&handle.id().to_string()));
    match &ui {
        Some(ui) => ui.println(&startup),
        None => println!("{startup}"),
    }

    let mut ticker = tokio::time::interval(UI_REFRESH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut chunks_done = 0_u64;
    let mut immediate_exit = false;

    loop {
        tokio::select! {
            ev_opt = shutdown_rx.recv() => match ev_opt {
                Some(ShutdownEvent::Graceful) => {
                    match &mut ui {
                        Some(ui) => ui.set_stop_message(STOP_MESSAGE),
                        None => eprintln!("{STOP_MESSAGE}"),
                    }
                    queue.cancel(handle.id());
                }
                Some(ShutdownEvent::Immediate) => {
                    match &mut ui {
                        Some(ui) => ui.set_stop_message(EXIT_MESSAGE),
                        None => eprintln!("{EXIT_MESSAGE}"),
                    }
                    immediate_exit = true;
                    break;
                }
                None => {}
            },
            _ = ticker.tick(), if show_progress => {
                if let Some(ui) = &ui {
                    let snap = queue.snapshot();
                    let busy = snap
                        .workers
                        .iter()
                        .filter(|w| w.stage == WorkerStage::Running)
                        .count();
                    ui.tick_global(busy, snap.workers.len(), chunks_done);
                }
            }
            evt = events.recv() => {
                let evt = match evt {
                    Ok(v) => v,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };

                match evt {
                    QueueEvent::JobProgress { monitor, .. } => {
                        if let Some(ui) = &mut ui {
                            ui.set_job_progress(&monitor);
                        }
                    }
                    QueueEvent::ChunkFinished { job_id, chunk, elapsed_ms } => {
                        chunks_done = chunks_done.max(chunk);
                        tracing::debug!(%job_id, chunk, elapsed_ms, "chunk finished");
                    }
                    QueueEvent::JobFinished { summary } => {
                        if let Some(ui) = &mut ui {
                            ui.set_job_progress(&summary.monitor);
                        }
                        let line = format_job_done_line(&summary);
                        match &ui {
                            Some(ui) => ui.println(&line),
                            None => println!("{line}"),
                        }
                        if summary.job_id == handle.id() {
                            break;
                        }
                    }
                    QueueEvent::Warning { message } | QueueEvent::Error { message } => {
                        match &ui {
                            Some(ui) => ui.println(&message),
                            None => eprintln!("{message}"),
                        }
                    }
                    QueueEvent::Stopped => break,
                    QueueEvent::Started
                    | QueueEvent::StopRequested
                    | QueueEvent::JobQueued { .. }
                    | QueueEvent::ChunkStarted { .. } => {}
                }
            }
        }
    }

    if let Some(ui) = &ui {
        ui.freeze();
    }

    if immediate_exit {
        std::process::exit(130);
    }

    // The job is terminal here, so this does not block for long.
    let outcome = handle
        .wait_timeout(Duration::from_secs(5))
        .then(|| handle.result().ok())
        .flatten();
    queue.shutdown();
    match outcome {
        Some(Ok(Some(value))) => {
            println!("result: {value}");
            Ok(())
        }
        Some(Ok(None)) => {
            println!("result: none");
            Ok(())
        }
        Some(Err(failure)) => anyhow::bail!("job ended: {failure}"),
        None => anyhow::bail!("{} did not reach a result", handle.id()),
    }
}
