//! Per-display pipeline statistics

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::pool::PoolStats;

/// Counters updated from host threads and the dispatch worker
#[derive(Debug, Default)]
pub struct ClusterCounters {
    pub acquired: AtomicU64,
    pub dropped: AtomicU64,
    pub pool_exhausted: AtomicU64,
    pub not_dirty: AtomicU64,
    pub skipped: AtomicU64,
    pub enqueued: AtomicU64,
    pub composed: AtomicU64,
    pub discarded: AtomicU64,
    pub errors: AtomicU64,
    pub forced_drains: AtomicU64,
    pub software_frames: AtomicU64,
    busy_nanos: AtomicU64,
}

impl ClusterCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_busy(&self, elapsed: Duration) {
        self.busy_nanos
            .fetch_add(elapsed.as_nanos().min(u64::MAX as u128) as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, pool: PoolStats, queue_depth: usize) -> ClusterStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        ClusterStats {
            acquired: load(&self.acquired),
            dropped: load(&self.dropped),
            pool_exhausted: load(&self.pool_exhausted),
            not_dirty: load(&self.not_dirty),
            skipped: load(&self.skipped),
            enqueued: load(&self.enqueued),
            composed: load(&self.composed),
            discarded: load(&self.discarded),
            errors: load(&self.errors),
            forced_drains: load(&self.forced_drains),
            software_frames: load(&self.software_frames),
            busy: Duration::from_nanos(load(&self.busy_nanos)),
            queue_depth,
            pool_outstanding: pool.outstanding,
            pool_peak: pool.peak_outstanding,
            pool_rejected: pool.rejected,
            fences_closed_on_release: pool.fences_closed,
        }
    }
}

/// Point-in-time view of one display's pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClusterStats {
    /// Jobs handed out by `get_job`
    pub acquired: u64,
    /// Frames refused by vsync backpressure
    pub dropped: u64,
    /// Frames failed on an empty pool
    pub pool_exhausted: u64,
    /// Jobs released unqueued because nothing changed
    pub not_dirty: u64,
    /// Frames skipped with `post_state = error`
    pub skipped: u64,
    pub enqueued: u64,
    /// Jobs submitted to the hardware
    pub composed: u64,
    /// Jobs thrown away on the ignore path
    pub discarded: u64,
    /// Handler, finalizer or release failures
    pub errors: u64,
    /// Enqueues that had to drain the worker first
    pub forced_drains: u64,
    /// Frames composed entirely in software after a rejected placement
    pub software_frames: u64,
    /// Total worker processing time
    #[serde(skip)]
    pub busy: Duration,
    pub queue_depth: usize,
    pub pool_outstanding: usize,
    pub pool_peak: usize,
    pub pool_rejected: u64,
    pub fences_closed_on_release: u64,
}

impl ClusterStats {
    /// Dropped and exhausted frames over all frame attempts, in percent
    pub fn drop_rate(&self) -> f32 {
        let attempts = self.acquired + self.dropped + self.pool_exhausted;
        if attempts == 0 {
            return 0.0;
        }
        ((self.dropped + self.pool_exhausted) as f32 / attempts as f32) * 100.0
    }

    /// Mean worker time per processed job
    pub fn avg_process_time(&self) -> Duration {
        let processed = self.composed + self.discarded;
        if processed == 0 {
            return Duration::ZERO;
        }
        let nanos = self.busy.as_nanos() / u128::from(processed);
        Duration::from_nanos(nanos.min(u128::from(u64::MAX)) as u64)
    }
}
