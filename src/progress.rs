//! Progress reporting.
//!
//! The pool only ever calls [`ProgressSink::set_max`] once per job and then
//! [`ProgressSink::set_progress`] with the summed worker progress. Anything
//! that can display a bar implements the trait; [`ProgressBarSink`] wraps an
//! `indicatif` bar for terminal use.

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Minimum interval between two non-forced progress updates from a worker.
pub const PROGRESS_THROTTLE: Duration = Duration::from_millis(200);

/// Receiver of job progress.
pub trait ProgressSink: Send + Sync {
    /// Set the expected maximum (the job's range size).
    fn set_max(&self, max: u64);

    /// Set the current progress value.
    fn set_progress(&self, value: u64);
}

/// Progress sink backed by an `indicatif` progress bar.
pub struct ProgressBarSink {
    bar: ProgressBar,
}

impl ProgressBarSink {
    /// Create a hidden-length bar with the standard style.
    pub fn new(message: impl Into<String>) -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▓▒░  "),
        );
        bar.set_message(message.into());
        Self { bar }
    }

    /// Wrap an existing bar (e.g. one added to a `MultiProgress`).
    pub fn from_bar(bar: ProgressBar) -> Self {
        Self { bar }
    }

    /// Finish and leave the bar on screen.
    pub fn finish(&self) {
        self.bar.finish();
    }
}

impl ProgressSink for ProgressBarSink {
    fn set_max(&self, max: u64) {
        self.bar.set_length(max);
        self.bar.set_position(0);
    }

    fn set_progress(&self, value: u64) {
        self.bar.set_position(value);
    }
}

/// Sink that records every call, used by tests and for polling callers.
#[derive(Debug, Default)]
pub struct RecordingSink {
    state: Mutex<(u64, Vec<u64>)>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last value passed to `set_max`.
    pub fn max(&self) -> u64 {
        self.state.lock().map(|s| s.0).unwrap_or(0)
    }

    /// All values passed to `set_progress`, in order.
    pub fn updates(&self) -> Vec<u64> {
        self.state.lock().map(|s| s.1.clone()).unwrap_or_default()
    }

    /// Most recent progress value.
    pub fn last(&self) -> Option<u64> {
        self.state.lock().ok().and_then(|s| s.1.last().copied())
    }
}

impl ProgressSink for RecordingSink {
    fn set_max(&self, max: u64) {
        if let Ok(mut state) = self.state.lock() {
            state.0 = max;
        }
    }

    fn set_progress(&self, value: u64) {
        if let Ok(mut state) = self.state.lock() {
            state.1.push(value);
        }
    }
}

/// Rate limiter for progress updates.
///
/// The clock starts at construction, so unforced updates within the first
/// interval of a job are dropped too.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last: Instant,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Instant::now(),
        }
    }

    /// Whether an update may go out now; records the time if so.
    pub fn ready(&mut self, force: bool) -> bool {
        let now = Instant::now();
        if force || now.duration_since(self.last) >= self.interval {
            self.last = now;
            true
        } else {
            false
        }
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new(PROGRESS_THROTTLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_limits_updates() {
        let mut throttle = Throttle::new(Duration::from_secs(60));
        assert!(!throttle.ready(false));
        assert!(!throttle.ready(false));
        assert!(!throttle.ready(false));
        assert!(throttle.ready(true));
    }

    #[test]
    fn test_throttle_opens_after_interval() {
        let mut throttle = Throttle::new(Duration::from_millis(20));
        assert!(!throttle.ready(false));
        std::thread::sleep(Duration::from_millis(30));
        assert!(throttle.ready(false));
        assert!(!throttle.ready(false));
    }

    #[test]
    fn test_throttle_zero_interval() {
        let mut throttle = Throttle::new(Duration::ZERO);
        assert!(throttle.ready(false));
        assert!(throttle.ready(false));
    }

    #[test]
    fn test_recording_sink() {
        let sink = RecordingSink::new();
        sink.set_max(100);
        sink.set_progress(10);
        sink.set_progress(40);
        assert_eq!(sink.max(), 100);
        assert_eq!(sink.updates(), vec![10, 40]);
        assert_eq!(sink.last(), Some(40));
    }

    #[test]
    fn test_progress_bar_sink() {
        let sink = ProgressBarSink::from_bar(ProgressBar::hidden());
        sink.set_max(20);
        sink.set_progress(5);
        assert_eq!(sink.bar.length(), Some(20));
        assert_eq!(sink.bar.position(), 5);
        sink.finish();
    }
}
