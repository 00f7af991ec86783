//! Scan feedback and progress reporting.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Cooperative yield point for the scanner.
///
/// Called once per directory entry before it is processed. Returning
/// `false` requests cancellation; the scanner unwinds with
/// [`ScanError::Interrupted`](blockscope_core::ScanError::Interrupted)
/// after at most one further entry.
pub trait ScanFeedback {
    fn tick(&mut self, path: &Path) -> bool;
}

/// Feedback hook that never cancels.
#[derive(Debug, Default)]
pub struct NullFeedback;

impl ScanFeedback for NullFeedback {
    fn tick(&mut self, _path: &Path) -> bool {
        true
    }
}

/// Progress counters accumulated during a scan.
#[derive(Debug)]
pub struct ProgressTracker {
    start_time: Instant,
    items_scanned: u64,
    current_path: PathBuf,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            items_scanned: 0,
            current_path: PathBuf::new(),
        }
    }

    /// Number of directory entries visited so far.
    pub fn items_scanned(&self) -> u64 {
        self.items_scanned
    }

    /// The entry most recently visited.
    pub fn current_path(&self) -> &Path {
        &self.current_path
    }

    /// Time elapsed since the tracker was created.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Scan rate in items per second.
    pub fn items_per_second(&self) -> f64 {
        if self.elapsed().as_secs_f64() > 0.0 {
            self.items_scanned as f64 / self.elapsed().as_secs_f64()
        } else {
            0.0
        }
    }
}

impl ScanFeedback for ProgressTracker {
    fn tick(&mut self, path: &Path) -> bool {
        self.items_scanned += 1;
        self.current_path.clear();
        self.current_path.push(path);
        true
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}
