//! Output formatting utilities

use crate::types::{DownloadReport, UploadReport};
use std::time::Duration;

/// Format file size in human-readable format
pub fn format_size(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

/// Format duration in human-readable format
pub fn format_duration(duration: Duration) -> String {
    format_duration_secs(duration.as_secs_f64())
}

/// Format duration from seconds
pub fn format_duration_secs(secs: f64) -> String {
    if secs < 1.0 {
        format!("{:.0}ms", secs * 1000.0)
    } else if secs < 60.0 {
        format!("{:.1}s", secs)
    } else if secs < 3600.0 {
        let mins = (secs / 60.0).floor();
        let remaining = secs - mins * 60.0;
        format!("{}m {:.0}s", mins as u64, remaining)
    } else {
        let hours = (secs / 3600.0).floor();
        let remaining = secs - hours * 3600.0;
        let mins = (remaining / 60.0).floor();
        format!("{}h {}m", hours as u64, mins as u64)
    }
}

/// Format transfer rate in human-readable format
pub fn format_rate(bytes_per_sec: f64) -> String {
    format!("{}/s", human_bytes::human_bytes(bytes_per_sec))
}

/// Format percentage
pub fn format_percent(value: f64) -> String {
    format!("{:.1}%", value)
}

/// Format a block count
pub fn format_blocks(count: usize) -> String {
    if count == 1 {
        "1 block".to_string()
    } else {
        format!("{} blocks", count)
    }
}

fn percent_of(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

/// Summary printed after an upload
pub fn format_upload(report: &UploadReport, elapsed: Duration) -> String {
    let mut lines = vec!["=== Upload Complete ===".to_string(), String::new()];

    lines.push(format!("Duration:   {}", format_duration(elapsed)));
    lines.push(format!("Blob size:  {}", format_size(report.total_size)));
    lines.push(format!(
        "Uploaded:   {} ({})",
        format_size(report.bytes_uploaded),
        format_blocks(report.blocks_uploaded)
    ));
    lines.push(format!(
        "Reused:     {} ({})",
        format_size(report.bytes_reused),
        format_blocks(report.blocks_reused)
    ));
    if report.blocks_deduplicated > 0 {
        lines.push(format!("Duplicates: {}", format_blocks(report.blocks_deduplicated)));
    }
    lines.push(format!("Savings:    {}", format_percent(report.savings_percent())));

    let secs = elapsed.as_secs_f64();
    if secs > 0.0 && report.bytes_uploaded > 0 {
        lines.push(format!("Rate:       {}", format_rate(report.bytes_uploaded as f64 / secs)));
    }

    lines.join("\n")
}

/// Summary printed after a download
pub fn format_download(report: &DownloadReport, elapsed: Duration) -> String {
    let total = report.bytes_downloaded + report.bytes_reused;
    let mut lines = vec!["=== Download Complete ===".to_string(), String::new()];

    lines.push(format!("Duration:   {}", format_duration(elapsed)));
    lines.push(format!("File size:  {}", format_size(total)));
    lines.push(format!(
        "Downloaded: {} in {} range requests",
        format_size(report.bytes_downloaded),
        report.range_requests
    ));
    lines.push(format!(
        "Reused:     {} ({})",
        format_size(report.bytes_reused),
        format_percent(percent_of(report.bytes_reused, total))
    ));

    let secs = elapsed.as_secs_f64();
    if secs > 0.0 && report.bytes_downloaded > 0 {
        lines.push(format!("Rate:       {}", format_rate(report.bytes_downloaded as f64 / secs)));
    }

    lines.join("\n")
}
