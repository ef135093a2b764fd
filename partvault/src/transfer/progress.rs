//! Throughput measurement and human-readable formatting for transfer logs.

use std::time::{Duration, Instant};

/// Measures bytes moved and elapsed time for one operation.
#[derive(Debug, Clone)]
pub struct TransferMeter {
    start_time: Instant,
    bytes: u64,
    items: usize,
}

impl Default for TransferMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferMeter {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            bytes: 0,
            items: 0,
        }
    }

    /// Record one completed item (partition) of `bytes` length
    pub fn record(&mut self, bytes: u64) {
        self.bytes += bytes;
        self.items += 1;
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn items(&self) -> usize {
        self.items
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average speed since start, in bytes per second
    pub fn average_speed(&self) -> u64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (self.bytes as f64 / elapsed) as u64
        } else {
            0
        }
    }

    /// One-line summary for the end-of-operation log.
    pub fn summary(&self) -> String {
        format!(
            "{} in {} ({})",
            format_bytes(self.bytes),
            format_duration(self.elapsed().as_secs()),
            format_speed(self.average_speed())
        )
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
