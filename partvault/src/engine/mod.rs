//! Backup, restore and flash engines.
//!
//! Each engine borrows a [`DeviceIo`](crate::device::DeviceIo) for the
//! duration of one operation and processes partitions strictly one at a time.
//! Progress is reported synchronously from the worker; cancellation is polled
//! at partition boundaries only.

pub mod backup;
pub mod flash;
pub mod restore;
pub mod validate;

use serde::Serialize;
use std::sync::Arc;

/// What an engine does after a single-partition failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Count the failure and continue with the next partition
    #[default]
    BestEffort,
    /// Stop the whole operation at the first failure
    FailFast,
}

impl FailurePolicy {
    pub fn should_abort(&self) -> bool {
        matches!(self, FailurePolicy::FailFast)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressLevel {
    Info,
    Warn,
    Error,
}

/// One observer-facing progress step. Never consulted for control flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressUpdate {
    /// 0-100
    pub percent: u8,
    pub message: String,
    pub level: ProgressLevel,
}

impl ProgressUpdate {
    pub fn info(percent: u8, message: impl Into<String>) -> Self {
        Self::with_level(percent, message, ProgressLevel::Info)
    }

    pub fn warn(percent: u8, message: impl Into<String>) -> Self {
        Self::with_level(percent, message, ProgressLevel::Warn)
    }

    pub fn error(percent: u8, message: impl Into<String>) -> Self {
        Self::with_level(percent, message, ProgressLevel::Error)
    }

    fn with_level(percent: u8, message: impl Into<String>, level: ProgressLevel) -> Self {
        Self {
            percent: percent.min(100),
            message: message.into(),
            level,
        }
    }
}

/// Progress observer
pub type ProgressCallback = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;

/// Forwards updates to the observer and keeps a copy of each one.
#[derive(Clone, Default)]
pub(crate) struct Reporter {
    callback: Option<ProgressCallback>,
    events: Vec<ProgressUpdate>,
}

impl Reporter {
    pub(crate) fn set_callback(&mut self, callback: ProgressCallback) {
        self.callback = Some(callback);
    }

    pub(crate) fn report(&mut self, update: ProgressUpdate) {
        if let Some(callback) = &self.callback {
            callback(&update);
        }
        self.events.push(update);
    }

    pub(crate) fn info(&mut self, percent: u8, message: impl Into<String>) {
        self.report(ProgressUpdate::info(percent, message));
    }

    pub(crate) fn warn(&mut self, percent: u8, message: impl Into<String>) {
        self.report(ProgressUpdate::warn(percent, message));
    }

    pub(crate) fn error(&mut self, percent: u8, message: impl Into<String>) {
        self.report(ProgressUpdate::error(percent, message));
    }

    pub(crate) fn take_events(&mut self) -> Vec<ProgressUpdate> {
        std::mem::take(&mut self.events)
    }
}

/// `base + completed/total * span`, as a whole percentage.
pub(crate) fn step_percent(completed: usize, total: usize, span: u8, base: u8) -> u8 {
    if total == 0 {
        return base;
    }
    let fraction = completed as f64 / total as f64;
    (base as f64 + fraction * span as f64).min(100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_failure_policy() {
        assert!(!FailurePolicy::BestEffort.should_abort());
        assert!(FailurePolicy::FailFast.should_abort());
        assert_eq!(FailurePolicy::default(), FailurePolicy::BestEffort);
    }

    #[test]
    fn test_step_percent() {
        assert_eq!(step_percent(0, 4, 90, 5), 5);
        assert_eq!(step_percent(2, 4, 90, 5), 50);
        assert_eq!(step_percent(4, 4, 90, 5), 95);
        assert_eq!(step_percent(0, 0, 90, 10), 10);
    }

    #[test]
    fn test_reporter_forwards_and_records() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let mut reporter = Reporter::default();
        reporter.set_callback(Arc::new(move |u: &ProgressUpdate| {
            sink.lock().unwrap().push(u.percent);
        }));

        reporter.info(5, "Reading partition table...");
        reporter.warn(50, "No data read from misc");
        reporter.error(150, "boom");

        assert_eq!(*seen.lock().unwrap(), vec![5, 50, 100]);
        let events = reporter.take_events();
        assert_eq!(events[1].level, ProgressLevel::Warn);
        assert!(reporter.take_events().is_empty());
    }
}
