//! One-line rendering of a task's status.

use autorun::status::TaskStatus;
use chrono::{DateTime, Duration, Utc};

const BAR_WIDTH: usize = 20;

/// `[#####---------------]` for `percentage` of `width` cells.
pub fn progress_bar(percentage: u32, width: usize) -> String {
    let percentage = percentage.min(100) as usize;
    let filled = percentage * width / 100;
    format!("[{}{}]", "#".repeat(filled), "-".repeat(width - filled))
}

/// `1h 2m 3s`, `2m 3s` or `3s`. Negative spans render as `0s`.
pub fn format_duration(span: Duration) -> String {
    let secs = span.num_seconds().max(0);
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

pub fn render_frame(status: &TaskStatus, now: DateTime<Utc>) -> String {
    let mut line = format!(
        "{} {} {}/{} {:>3}%  {}  count {}",
        status.task,
        progress_bar(status.progress.percentage, BAR_WIDTH),
        status.current_stage,
        status.total_stages,
        status.progress.percentage,
        status.status,
        status.count,
    );
    if let Some(safety) = status.safety.as_ref().filter(|s| s.limit > 0) {
        line.push_str(&format!("/{}", safety.limit));
    }
    line.push_str(&format!(
        "  updated {} ago",
        format_duration(now - status.last_executed)
    ));
    if let Some(error) = &status.last_error {
        line.push_str(&format!("\n  error: {error}"));
    }
    line
}
