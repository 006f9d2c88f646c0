use std::io::Write;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use chunkrun_core::MonitorSnapshot;

use crate::constants::PROGRESS_BAR_STEPS;
use crate::format::format_number;

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template).unwrap_or_else(|_| ProgressStyle::default_bar())
}

pub(crate) struct Ui {
    mp: MultiProgress,
    global_pb: ProgressBar,
    job_pb: ProgressBar,
    stop_pb: ProgressBar,
    last_step: u64,
}

impl Ui {
    pub(crate) fn new(label: &str) -> Self {
        let mp = MultiProgress::new();
        mp.set_draw_target(ProgressDrawTarget::stdout());
        mp.set_move_cursor(true);

        let global_pb = mp.add(ProgressBar::new(0));
        global_pb.set_style(style("{msg}\u{1b}[0K"));
        global_pb.set_message("Workers: starting");

        let job_pb = mp.add(ProgressBar::new(PROGRESS_BAR_STEPS));
        job_pb.set_style(
            style("{prefix} {bar:30.cyan/blue} {msg}\u{1b}[0K").progress_chars("#--"),
        );
        job_pb.set_prefix(label.to_string());
        job_pb.set_message("queued");

        let stop_pb = mp.add(ProgressBar::new(0));
        stop_pb.set_style(style("{msg}\u{1b}[0K"));
        stop_pb.set_message(" ");

        Self {
            mp,
            global_pb,
            job_pb,
            stop_pb,
            last_step: 0,
        }
    }

    pub(crate) fn println(&self, msg: &str) {
        let _ = self.mp.println(msg);
    }

    pub(crate) fn set_job_progress(&mut self, monitor: &MonitorSnapshot) {
        let step = calc_progress_step(monitor.progress);
        if step != self.last_step {
            self.last_step = step;
            self.job_pb.set_position(step);
        }
        self.job_pb.set_message(format!(
            "{:.1}% {} items, health {:.0}",
            monitor.progress,
            format_number(monitor.throughput),
            monitor.health
        ));
    }

    pub(crate) fn set_stop_message(&mut self, msg: &str) {
        self.stop_pb.set_message(msg.to_string());
    }

    pub(crate) fn tick_global(&self, busy: usize, total: usize, chunks: u64) {
        self.global_pb.set_message(format!(
            "Workers: running {busy}/{total}, {} chunk(s) done",
            format_number(chunks)
        ));
    }

    pub(crate) fn freeze(&self) {
        self.mp.set_move_cursor(false);
        self.job_pb.abandon();
        self.global_pb.abandon();
        self.stop_pb.abandon();
        let _ = std::io::stdout().write_all(b"\n");
    }
}

fn calc_progress_step(percent: f64) -> u64 {
    if !percent.is_finite() || percent <= 0.0 {
        return 0;
    }
    ((percent / 100.0 * PROGRESS_BAR_STEPS as f64).round() as u64).min(PROGRESS_BAR_STEPS)
}
