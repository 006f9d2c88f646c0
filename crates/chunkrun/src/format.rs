use std::time::Duration;

use chunkrun_engine::{JobStatus, JobSummary};

pub fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h{:02}m{:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{:.2}s", d.as_secs_f64())
    }
}

pub fn format_rate(items: u64, d: Duration) -> String {
    let secs = d.as_secs_f64();
    if secs <= 0.0 {
        return "-".to_string();
    }
    format!("{} items/s", format_number((items as f64 / secs).round() as u64))
}

pub fn format_job_done_line(summary: &JobSummary) -> String {
    let duration = Duration::from_millis(summary.total_ms);
    let status = match (&summary.status, &summary.failure) {
        (JobStatus::Done, _) => "done".to_string(),
        (_, Some(failure)) => failure.to_string(),
        (JobStatus::Failed, None) => "failed".to_string(),
        (JobStatus::Cancelled, None) => "cancelled".to_string(),
    };
    format!(
        "{} {status}: {} items in {} chunk(s), team {}, {} ({})",
        summary.job_id,
        format_number(summary.monitor.throughput),
        summary.chunks,
        summary.team_size,
        format_duration(duration),
        format_rate(summary.monitor.throughput, duration),
    )
}
