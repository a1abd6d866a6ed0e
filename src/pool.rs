//! Bounded per-display job pool
//!
//! Each display owns a fixed set of [`CompositionJob`]s allocated on
//! hotplug. Frames borrow one through [`JobPool::acquire`] and hand it back
//! with [`JobPool::release`], which resets it and closes any fence left
//! inside. The pool never grows and never blocks: an empty pool means the
//! pipeline is stalled and the frame is failed.
//!
//! # Usage
//!
//! ```
//! use hwc_dispatch::display::DisplayId;
//! use hwc_dispatch::pool::JobPool;
//!
//! let mut pool = JobPool::new(DisplayId(0), 4, 5);
//! let job = pool.acquire().unwrap();
//! assert_eq!(job.max_inputs(), 4);
//! pool.release(job).unwrap();
//! ```

use log::{debug, error, trace};
use std::collections::VecDeque;

use crate::display::DisplayId;
use crate::error::{DispatchError, Result};
use crate::job::{CompositionJob, JobState};

/// Default number of jobs per display
pub const DEFAULT_POOL_SIZE: usize = 5;

/// Statistics about pool usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Successful acquisitions
    pub acquisitions: u64,
    /// Jobs returned
    pub releases: u64,
    /// Acquisitions refused because every job was in flight
    pub exhausted: u64,
    /// Releases rejected (double or foreign release)
    pub rejected: u64,
    /// Jobs currently in flight
    pub outstanding: usize,
    /// Highest number of jobs in flight at once
    pub peak_outstanding: usize,
    /// Fences the pool had to close itself on release
    pub fences_closed: u64,
}

impl PoolStats {
    /// Share of acquisitions refused, in percent
    pub fn exhaustion_rate(&self) -> f32 {
        let attempts = self.acquisitions + self.exhausted;
        if attempts == 0 {
            return 0.0;
        }
        (self.exhausted as f32 / attempts as f32) * 100.0
    }
}

/// Fixed-capacity set of reusable jobs for one display
#[derive(Debug)]
pub struct JobPool {
    display: DisplayId,
    max_inputs: usize,
    capacity: usize,
    free: VecDeque<Box<CompositionJob>>,
    /// Generation of the outstanding job per slot index
    outstanding: Vec<Option<u64>>,
    next_sequence: u64,
    next_generation: u64,
    stats: PoolStats,
}

impl JobPool {
    /// Allocates `capacity` jobs with `max_inputs` layer slots each
    pub fn new(display: DisplayId, max_inputs: usize, capacity: usize) -> Self {
        let free = (0..capacity)
            .map(|index| Box::new(CompositionJob::pooled(display, max_inputs, index)))
            .collect();
        debug!(
            "📦 job pool for display {}: {} jobs, {} inputs each",
            display, capacity, max_inputs
        );
        Self {
            display,
            max_inputs,
            capacity,
            free,
            outstanding: vec![None; capacity],
            next_sequence: 0,
            next_generation: 0,
            stats: PoolStats::default(),
        }
    }

    pub fn display(&self) -> DisplayId {
        self.display
    }

    pub fn max_inputs(&self) -> usize {
        self.max_inputs
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Jobs sitting in the free set
    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    /// Takes a free job and assigns it the next sequence number
    pub fn acquire(&mut self) -> Result<Box<CompositionJob>> {
        let Some(mut job) = self.free.pop_front() else {
            self.stats.exhausted += 1;
            error!(
                "🚫 job pool of display {} exhausted: all {} jobs in flight, failing frame",
                self.display, self.capacity
            );
            return Err(DispatchError::PoolExhausted {
                display: self.display,
                capacity: self.capacity,
            });
        };

        self.next_sequence += 1;
        self.next_generation += 1;
        job.begin(self.next_sequence, self.next_generation);
        self.outstanding[job.pool_index()] = Some(self.next_generation);

        self.stats.acquisitions += 1;
        self.stats.outstanding += 1;
        self.stats.peak_outstanding = self.stats.peak_outstanding.max(self.stats.outstanding);

        trace!(
            "display {}: acquired job #{} (slot {}, {} free)",
            self.display,
            job.sequence(),
            job.pool_index(),
            self.free.len()
        );
        Ok(job)
    }

    /// Resets `job` and returns it to the free set.
    ///
    /// A job that does not belong to this pool, or whose slot is not
    /// outstanding under the same generation, is rejected and dropped.
    pub fn release(&mut self, mut job: Box<CompositionJob>) -> Result<()> {
        if job.display() != self.display {
            self.stats.rejected += 1;
            return Err(DispatchError::ForeignJob {
                job_display: job.display(),
                pool_display: self.display,
            });
        }

        let index = job.pool_index();
        let generation = job.generation();
        match self.outstanding.get(index).copied().flatten() {
            Some(outstanding) if outstanding == generation => {}
            _ => {
                self.stats.rejected += 1;
                error!(
                    "🚫 display {}: release of job slot {} (generation {}) which is not outstanding",
                    self.display, index, generation
                );
                return Err(DispatchError::NotAcquired {
                    display: self.display,
                    index,
                    generation,
                });
            }
        }

        job.set_state(JobState::Released);
        let sequence = job.sequence();
        let closed = job.reset();
        self.outstanding[index] = None;
        self.free.push_back(job);

        self.stats.releases += 1;
        self.stats.outstanding -= 1;
        self.stats.fences_closed += closed as u64;

        trace!(
            "display {}: released job #{} ({} free)",
            self.display,
            sequence,
            self.free.len()
        );
        Ok(())
    }
}
