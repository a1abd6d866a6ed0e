//! Per-display dispatch worker
//!
//! One OS thread per display owns a strict FIFO of finalized jobs. Host
//! threads [`enqueue`](DispatchWorker::enqueue) and the worker processes
//! them in order: CPU placement for the job's class, then the
//! [`JobProcessor`] (composition dispatch and the finalizer's `finish`),
//! then release back to the pool. A job is always released, whatever
//! processing returned.
//!
//! # Backpressure
//!
//! - Depth above the **low watermark** is checked by the cluster when a
//!   vsync-paced display asks for a new job; that frame is dropped.
//! - Depth above the **high watermark** at enqueue time makes the caller
//!   drain the worker synchronously before its job goes in.
//!
//! # Ignore path
//!
//! A display being torn down sets the ignore flag. Queued jobs are then
//! discarded: only their category cancel hooks run before release.

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::config::{CpuConfig, QueueConfig};
use crate::cpu::CpuGovernor;
use crate::display::DisplayId;
use crate::error::{DispatchError, Result};
use crate::job::{CompositionJob, JobState};
use crate::logging::FrameSpan;
use crate::stats::ClusterCounters;

/// Work done on a job once it leaves the FIFO
pub trait JobProcessor: Send + Sync + 'static {
    /// Composes and submits the job
    fn process(&self, job: &mut CompositionJob) -> Result<()>;

    /// Minimal cleanup for a job that will not be composed
    fn discard(&self, job: &mut CompositionJob);

    /// Returns the job to its pool
    fn release(&self, job: Box<CompositionJob>);
}

/// FIFO depth thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub low: usize,
    pub high: usize,
}

impl Default for Watermarks {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for Watermarks {
    fn from(config: &QueueConfig) -> Self {
        Self {
            low: config.low_watermark,
            high: config.high_watermark,
        }
    }
}

/// Whether the worker has anything to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Triggered,
}

#[derive(Default)]
struct QueueState {
    fifo: VecDeque<Box<CompositionJob>>,
    busy: bool,
    exit: bool,
    ignore: bool,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.fifo.is_empty() && !self.busy
    }
}

struct Shared {
    display: DisplayId,
    watermarks: Watermarks,
    state: Mutex<QueueState>,
    work_ready: Condvar,
    progress: Condvar,
    counters: Arc<ClusterCounters>,
    processor: Arc<dyn JobProcessor>,
}

/// Dispatch thread of one display
pub struct DispatchWorker {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl DispatchWorker {
    /// Starts the worker thread
    pub fn spawn(
        display: DisplayId,
        watermarks: Watermarks,
        cpu: CpuConfig,
        counters: Arc<ClusterCounters>,
        processor: Arc<dyn JobProcessor>,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            display,
            watermarks,
            state: Mutex::new(QueueState::default()),
            work_ready: Condvar::new(),
            progress: Condvar::new(),
            counters,
            processor,
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("dispatch-{}", display))
            .spawn(move || run(thread_shared, CpuGovernor::new(cpu)))
            .map_err(|error| DispatchError::WorkerSpawn { display, error })?;

        debug!("🧵 dispatch worker for display {} started", display);
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    pub fn display(&self) -> DisplayId {
        self.shared.display
    }

    pub fn watermarks(&self) -> Watermarks {
        self.shared.watermarks
    }

    /// Jobs waiting in the FIFO, not counting the one being processed
    pub fn depth(&self) -> usize {
        self.shared.state.lock().fifo.len()
    }

    pub fn state(&self) -> WorkerState {
        if self.shared.state.lock().is_idle() {
            WorkerState::Idle
        } else {
            WorkerState::Triggered
        }
    }

    /// Appends `job` to the FIFO and wakes the worker.
    ///
    /// Blocks in [`drain`](Self::drain) first when the FIFO is above the
    /// high watermark. A stopped worker discards and releases the job.
    pub fn enqueue(&self, mut job: Box<CompositionJob>) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock();

        if state.fifo.len() > shared.watermarks.high && !state.exit {
            warn!(
                "⏳ display {}: {} jobs queued (high watermark {}), draining before enqueue",
                shared.display,
                state.fifo.len(),
                shared.watermarks.high
            );
            ClusterCounters::bump(&shared.counters.forced_drains);
            while !state.is_idle() && !state.exit {
                shared.progress.wait(&mut state);
            }
        }

        if state.exit {
            drop(state);
            warn!(
                "⚠️ display {}: worker stopped, discarding job #{}",
                shared.display,
                job.sequence()
            );
            shared.processor.discard(&mut job);
            shared.processor.release(job);
            return Err(DispatchError::WorkerStopped(shared.display));
        }

        job.set_state(JobState::Enqueued);
        state.fifo.push_back(job);
        ClusterCounters::bump(&shared.counters.enqueued);
        shared.work_ready.notify_one();
        Ok(())
    }

    /// Blocks until the FIFO is empty and the worker idle
    pub fn drain(&self) {
        let mut state = self.shared.state.lock();
        while !state.is_idle() {
            self.shared.progress.wait(&mut state);
        }
    }

    /// Switches the discard path on or off
    pub fn set_ignore(&self, ignore: bool) {
        self.shared.state.lock().ignore = ignore;
    }

    /// Processes what is queued, then stops and joins the thread
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        {
            let mut state = self.shared.state.lock();
            state.exit = true;
        }
        self.shared.work_ready.notify_all();
        self.shared.progress.notify_all();

        if handle.join().is_err() {
            warn!("⚠️ dispatch worker of display {} panicked", self.shared.display);
        }
        info!("🛑 dispatch worker for display {} stopped", self.shared.display);
    }
}

impl Drop for DispatchWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: Arc<Shared>, mut governor: CpuGovernor) {
    loop {
        let (mut job, ignore) = {
            let mut state = shared.state.lock();
            loop {
                if let Some(job) = state.fifo.pop_front() {
                    state.busy = true;
                    break (job, state.ignore);
                }
                if state.exit {
                    return;
                }
                shared.work_ready.wait(&mut state);
            }
        };

        job.set_state(JobState::Processing);

        if ignore {
            debug!("🗑️ display {}: discarding job #{}", shared.display, job.sequence());
            shared.processor.discard(&mut job);
            ClusterCounters::bump(&shared.counters.discarded);
        } else {
            governor.apply_or_warn(job.cpu_class);
            let span = FrameSpan::start(shared.display, job.sequence());
            match shared.processor.process(&mut job) {
                Ok(()) => ClusterCounters::bump(&shared.counters.composed),
                Err(e) => {
                    warn!(
                        "⚠️ display {}: job #{} failed: {}",
                        shared.display,
                        job.sequence(),
                        e
                    );
                    ClusterCounters::bump(&shared.counters.errors);
                }
            }
            shared.counters.add_busy(span.finish());
        }

        shared.processor.release(job);

        let mut state = shared.state.lock();
        state.busy = false;
        shared.progress.notify_all();
    }
}
