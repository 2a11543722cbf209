//! Progress reporting for workers and the run summary
//!
//! Provides real-time worker progress using indicatif spinners.

use crate::control::Phase;
use crate::coordinator::RunSummary;
use crate::worker::{WorkerProgress, WorkerRunStats};
use console::style;
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Spinner showing a worker's progress through the current phase
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();

        if let Ok(template) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}") {
            bar.set_style(template.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"));
        }
        bar.enable_steady_tick(Duration::from_millis(100));

        Self { bar }
    }

    /// Update the progress display
    pub fn update(&self, progress: &WorkerProgress) {
        let secs = progress.elapsed.as_secs_f64();
        let rate = if secs > 0.0 {
            (progress.items_ok + progress.items_failed) as f64 / secs
        } else {
            0.0
        };

        let mut msg = format!(
            "{} | OK: {} | Failed: {} | Size: {} | Rate: {:.0}/s",
            style(progress.phase).cyan(),
            format_number(progress.items_ok),
            format_number(progress.items_failed),
            format_size(progress.bytes, BINARY),
            rate,
        );
        if let Some(item) = &progress.current_item {
            msg.push_str(&format!(" | {}", item));
        }

        self.bar.set_message(msg);
    }

    pub fn set_status(&self, status: &str) {
        self.bar.set_message(status.to_string());
    }

    pub fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a number with thousands separators
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let bytes: Vec<_> = s.bytes().rev().collect();

    let chunks: Vec<String> = bytes
        .chunks(3)
        .map(|chunk| chunk.iter().rev().map(|&b| b as char).collect::<String>())
        .collect();

    chunks.into_iter().rev().collect::<Vec<_>>().join(",")
}

fn format_duration(duration: Option<Duration>) -> String {
    match duration {
        Some(d) => format!("{:.1}s", d.as_secs_f64()),
        None => "-".to_string(),
    }
}

/// Print the orchestrator's final view of the run
pub fn print_run_summary(summary: &RunSummary) {
    let title = if summary.phase == Phase::Shutdown && summary.write_failures + summary.validate_failures == 0 {
        style("Run Complete").green().bold()
    } else {
        style("Run Ended").yellow().bold()
    };

    println!();
    println!("{}", title);
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Phase:").bold(), summary.phase);
    println!(
        "  {} {}/{}",
        style("Workers:").bold(),
        summary.registered,
        summary.expected_workers
    );
    if let Some(entries) = summary.manifest_entries {
        println!("  {} {}", style("Manifest:").bold(), format_number(entries as u64));
    }
    println!(
        "  {} {} ({}) in {}",
        style("Written:").bold(),
        format_number(summary.written),
        format_size(summary.bytes_written, BINARY),
        format_duration(summary.timings.write_duration())
    );
    println!(
        "  {} {} in {}",
        style("Validated:").bold(),
        format_number(summary.validated),
        format_duration(summary.timings.validate_duration())
    );
    let failures = summary.write_failures + summary.validate_failures;
    if failures > 0 {
        println!(
            "  {} {} write, {} validate",
            style("Failures:").yellow().bold(),
            format_number(summary.write_failures),
            format_number(summary.validate_failures)
        );
    }
    if summary.monitor_errors > 0 {
        println!(
            "  {} {}",
            style("Monitor errors:").yellow().bold(),
            format_number(summary.monitor_errors)
        );
    }
    println!("  {} {:.1}s", style("Duration:").bold(), summary.elapsed.as_secs_f64());
    println!();
}

/// Print a worker's totals at exit
pub fn print_worker_summary(address: &str, stats: &WorkerRunStats) {
    println!();
    println!("{} {}", style("Worker Finished").green().bold(), address);
    println!("{}", style("─".repeat(50)).dim());
    println!(
        "  {} {} ok, {} failed ({})",
        style("Write:").bold(),
        format_number(stats.write.ok),
        format_number(stats.write.failed),
        format_size(stats.write.bytes, BINARY)
    );
    println!(
        "  {} {} ok, {} failed",
        style("Validate:").bold(),
        format_number(stats.validate.ok),
        format_number(stats.validate.failed)
    );
    if stats.failures > 0 {
        println!("  {} {}", style("Failed items:").yellow().bold(), stats.failures);
    }
    println!("  {} {}", style("Logs archived:").bold(), stats.archived);
    println!("  {} {:.1}s", style("Duration:").bold(), stats.duration.as_secs_f64());
    println!();
}

/// Print a header at startup
pub fn print_header(role: &str, redis: &str, detail: &str) {
    println!();
    println!(
        "{} {} {}",
        style("bucket-loader").cyan().bold(),
        env!("CARGO_PKG_VERSION"),
        style(role).bold()
    );
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Redis:").bold(), redis);
    println!("  {}", detail);
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234567), "1,234,567");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(None), "-");
        assert_eq!(format_duration(Some(Duration::from_millis(1500))), "1.5s");
    }
}
