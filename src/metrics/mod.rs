//! Seek-latency instrumentation for the read path.
//!
//! Each worker thread records into its own accumulator; nothing is shared on
//! the hot path. Reports merge the per-worker accumulators on demand.

mod seek_timer;

pub use seek_timer::{SeekTimer, SeekTimerRegistry, SeekTimerSummary};
