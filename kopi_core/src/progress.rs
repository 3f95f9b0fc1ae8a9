//! Throughput counters and a periodic progress reporter.
//!
//! Counters are bumped by the worker with relaxed atomics and sampled by the
//! reporter thread; snapshots are approximate.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Shared progress counters for one run.
#[derive(Debug)]
pub struct Progress {
    total_files: u64,
    total_bytes: u64,
    files_done: AtomicU64,
    bytes_done: AtomicU64,
    started: Instant,
}

/// A point-in-time view of the counters.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub files_done: u64,
    pub total_files: u64,
    pub bytes_done: u64,
    pub total_bytes: u64,
    pub elapsed: Duration,
}

impl Progress {
    pub fn new(total_files: u64, total_bytes: u64) -> Self {
        Self {
            total_files,
            total_bytes,
            files_done: AtomicU64::new(0),
            bytes_done: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// Record one finished file of `bytes` bytes.
    pub fn record(&self, bytes: u64) {
        self.files_done.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .bytes_done
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |done| {
                Some(done.saturating_add(bytes))
            });
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            files_done: self.files_done.load(Ordering::Relaxed),
            total_files: self.total_files,
            bytes_done: self.bytes_done.load(Ordering::Relaxed).min(self.total_bytes),
            total_bytes: self.total_bytes,
            elapsed: self.started.elapsed(),
        }
    }
}

impl ProgressSnapshot {
    /// Percentage of files processed.
    pub fn file_percent(&self) -> f64 {
        percent(self.files_done, self.total_files)
    }

    /// Percentage of bytes processed.
    pub fn byte_percent(&self) -> f64 {
        percent(self.bytes_done, self.total_bytes)
    }

    /// Estimated time remaining: the larger of the file-rate and byte-rate
    /// estimates. `None` until some work has been measured.
    pub fn remaining(&self) -> Option<Duration> {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return None;
        }

        let estimate = |done: u64, total: u64| -> Option<f64> {
            if done == 0 {
                return if total == 0 { Some(0.0) } else { None };
            }
            let rate = done as f64 / secs;
            Some(total.saturating_sub(done) as f64 / rate)
        };

        let by_files = estimate(self.files_done, self.total_files)?;
        let by_bytes = estimate(self.bytes_done, self.total_bytes)?;
        Duration::try_from_secs_f64(by_files.max(by_bytes).round()).ok()
    }

    /// Emit this snapshot as a tracing event.
    pub fn log(&self) {
        tracing::info!(
            files_done = self.files_done,
            total_files = self.total_files,
            file_percent = round2(self.file_percent()),
            bytes_done = self.bytes_done,
            total_bytes = self.total_bytes,
            byte_percent = round2(self.byte_percent()),
            elapsed_secs = self.elapsed.as_secs(),
            remaining_secs = self.remaining().map(|d| d.as_secs()),
            "progress"
        );
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        100.0 * done as f64 / total as f64
    }
}

/// Background thread that logs a progress snapshot every `interval`.
///
/// Stopped (and joined) on drop.
pub struct ProgressReporter {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    pub fn spawn(progress: Arc<Progress>, interval: Duration) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = std::thread::spawn(move || {
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => progress.snapshot().log(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        });

        Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let progress = Progress::new(3, 300);
        progress.record(100);
        progress.record(50);

        let snap = progress.snapshot();
        assert_eq!(snap.files_done, 2);
        assert_eq!(snap.bytes_done, 150);
        assert!((snap.byte_percent() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_bytes_clamped_to_total() {
        let progress = Progress::new(1, 10);
        progress.record(25);
        assert_eq!(progress.snapshot().bytes_done, 10);
    }

    #[test]
    fn test_remaining_uses_slower_estimate() {
        let snap = ProgressSnapshot {
            files_done: 5,
            total_files: 10,
            bytes_done: 100,
            total_bytes: 1000,
            elapsed: Duration::from_secs(10),
        };
        // Files: 5 left at 0.5/s = 10s. Bytes: 900 left at 10/s = 90s.
        assert_eq!(snap.remaining(), Some(Duration::from_secs(90)));
    }

    #[test]
    fn test_remaining_unknown_before_progress() {
        let snap = ProgressSnapshot {
            files_done: 0,
            total_files: 10,
            bytes_done: 0,
            total_bytes: 1000,
            elapsed: Duration::from_secs(3),
        };
        assert_eq!(snap.remaining(), None);
    }

    #[test]
    fn test_huge_totals_do_not_overflow() {
        let progress = Progress::new(2, u64::MAX);
        progress.record(u64::MAX);
        progress.record(u64::MAX);
        assert_eq!(progress.snapshot().bytes_done, u64::MAX);

        let snap = ProgressSnapshot {
            files_done: 1,
            total_files: 1,
            bytes_done: 1,
            total_bytes: u64::MAX,
            elapsed: Duration::from_secs(u64::MAX / 4),
        };
        assert_eq!(snap.remaining(), None);
    }

    #[test]
    fn test_empty_run_is_complete() {
        let snap = Progress::new(0, 0).snapshot();
        assert_eq!(snap.file_percent(), 100.0);
        assert_eq!(snap.byte_percent(), 100.0);
    }

    #[test]
    fn test_reporter_stops_on_drop() {
        let progress = Arc::new(Progress::new(1, 1));
        let reporter = ProgressReporter::spawn(Arc::clone(&progress), Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(20));
        drop(reporter);
        // Only the test's handle remains once the thread has been joined
        assert_eq!(Arc::strong_count(&progress), 1);
    }
}
