//! Per-worker seek latency accumulators.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// Latency accumulator for one worker thread.
///
/// All fields are atomics so recording never takes a lock; merging across
/// workers happens only when a report is requested.
#[derive(Debug)]
pub struct SeekTimer {
    /// Index assigned by the registry at creation time.
    worker: usize,
    /// Number of recorded seeks.
    count: AtomicU64,
    /// Sum of recorded latencies (in microseconds).
    total_micros: AtomicU64,
    /// Minimum recorded latency.
    min_micros: AtomicU64,
    /// Maximum recorded latency.
    max_micros: AtomicU64,
}

impl SeekTimer {
    fn new(worker: usize) -> Self {
        Self {
            worker,
            count: AtomicU64::new(0),
            total_micros: AtomicU64::new(0),
            min_micros: AtomicU64::new(u64::MAX),
            max_micros: AtomicU64::new(0),
        }
    }

    /// The worker index this timer was registered under.
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Record one seek's wall-clock cost.
    pub fn record(&self, elapsed: Duration) {
        let micros = elapsed.as_micros() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);

        let mut current_min = self.min_micros.load(Ordering::Relaxed);
        while micros < current_min {
            match self.min_micros.compare_exchange_weak(
                current_min,
                micros,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(v) => current_min = v,
            }
        }

        let mut current_max = self.max_micros.load(Ordering::Relaxed);
        while micros > current_max {
            match self.max_micros.compare_exchange_weak(
                current_max,
                micros,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(v) => current_max = v,
            }
        }
    }

    /// Number of recorded seeks.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Snapshot this timer as a summary.
    pub fn summary(&self) -> SeekTimerSummary {
        SeekTimerSummary {
            count: self.count.load(Ordering::Relaxed),
            total_micros: self.total_micros.load(Ordering::Relaxed),
            min_micros: self.min_micros.load(Ordering::Relaxed),
            max_micros: self.max_micros.load(Ordering::Relaxed),
        }
    }

    /// Human-readable one-line report for this worker.
    pub fn report(&self) -> String {
        format!("worker {}: {}", self.worker, self.summary())
    }
}

/// Merged view over one or more seek timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekTimerSummary {
    count: u64,
    total_micros: u64,
    min_micros: u64,
    max_micros: u64,
}

impl SeekTimerSummary {
    fn empty() -> Self {
        Self {
            count: 0,
            total_micros: 0,
            min_micros: u64::MAX,
            max_micros: 0,
        }
    }

    fn merge(&mut self, other: &SeekTimerSummary) {
        self.count += other.count;
        self.total_micros += other.total_micros;
        self.min_micros = self.min_micros.min(other.min_micros);
        self.max_micros = self.max_micros.max(other.max_micros);
    }

    /// Number of seeks in this summary.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Sum of seek latencies in microseconds.
    pub fn total_micros(&self) -> u64 {
        self.total_micros
    }

    /// Mean seek latency in microseconds.
    pub fn mean_micros(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_micros as f64 / self.count as f64
        }
    }

    /// Minimum seek latency, if any seek was recorded.
    pub fn min_micros(&self) -> Option<u64> {
        if self.count == 0 {
            None
        } else {
            Some(self.min_micros)
        }
    }

    /// Maximum seek latency, if any seek was recorded.
    pub fn max_micros(&self) -> Option<u64> {
        if self.count == 0 {
            None
        } else {
            Some(self.max_micros)
        }
    }
}

impl std::fmt::Display for SeekTimerSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.count == 0 {
            return write!(f, "no seeks recorded");
        }
        write!(
            f,
            "{} seeks, total {}us, mean {:.1}us, min {}us, max {}us",
            self.count,
            self.total_micros,
            self.mean_micros(),
            self.min_micros,
            self.max_micros
        )
    }
}

/// Registry of per-worker seek timers.
///
/// Sized dynamically: each worker asks for its own timer at creation time
/// instead of indexing into a fixed array with a hard-coded worker count.
#[derive(Debug, Default)]
pub struct SeekTimerRegistry {
    timers: Mutex<Vec<Arc<SeekTimer>>>,
}

impl SeekTimerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new worker and hand back its timer.
    pub fn register_worker(&self) -> Arc<SeekTimer> {
        let mut timers = self.timers.lock();
        let timer = Arc::new(SeekTimer::new(timers.len()));
        timers.push(Arc::clone(&timer));
        timer
    }

    /// Number of registered workers.
    pub fn workers(&self) -> usize {
        self.timers.lock().len()
    }

    /// Merge all workers into one cumulative summary.
    pub fn merged(&self) -> SeekTimerSummary {
        let timers = self.timers.lock();
        let mut summary = SeekTimerSummary::empty();
        for timer in timers.iter() {
            summary.merge(&timer.summary());
        }
        summary
    }

    /// Cumulative human-readable report across all workers.
    pub fn cumulative_report(&self) -> String {
        format!("cumulative seek latency: {}", self.merged())
    }

    /// One report line per worker.
    pub fn individual_reports(&self) -> String {
        let timers = self.timers.lock();
        let mut out = String::new();
        for timer in timers.iter() {
            let _ = writeln!(out, "{}", timer.report());
        }
        out
    }
}
