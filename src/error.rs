//! Error types for the dispatch pipeline
//!
//! Per-frame failures are reported through [`DispatchError`] and stay
//! contained within one display's pipeline. Invariant violations are not
//! errors: they abort through [`invariant_violation`].

use std::time::Duration;
use thiserror::Error;

use crate::display::DisplayId;

/// Errors produced by the scheduler and its per-display clusters
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The display has not been plugged in (or was already plugged out)
    #[error("display {0} is not connected")]
    DisplayNotConnected(DisplayId),

    /// `on_plug_in` was called twice for the same display
    #[error("display {0} is already connected")]
    DisplayAlreadyConnected(DisplayId),

    /// Every job of the display's pool is in flight
    #[error("job pool of display {display} exhausted ({capacity} jobs in flight)")]
    PoolExhausted { display: DisplayId, capacity: usize },

    /// A job was released that the pool does not consider outstanding
    #[error("job slot {index} (generation {generation}) is not outstanding in the pool of display {display}")]
    NotAcquired {
        display: DisplayId,
        index: usize,
        generation: u64,
    },

    /// A job was handed to the pool of another display
    #[error("job of display {job_display} released into the pool of display {pool_display}")]
    ForeignJob {
        job_display: DisplayId,
        pool_display: DisplayId,
    },

    /// Backpressure refused to create a job for this cycle
    #[error("frame dropped on display {display}: {depth} jobs queued")]
    FrameDropped { display: DisplayId, depth: usize },

    /// The operation needs a job acquired with `get_job`
    #[error("no job acquired for display {0}")]
    NoJob(DisplayId),

    /// `trigger` was called before `set_job`
    #[error("job of display {0} has not been finalized")]
    NotFinalized(DisplayId),

    /// The hardware-resource manager rejected a request
    #[error("hardware resource manager: {0}")]
    Hardware(String),

    /// Fence duplication or waiting failed at the OS level
    #[error("fence operation failed: {0}")]
    Fence(#[from] std::io::Error),

    /// The mirror source never published its output for this frame
    #[error("mirror source {source_display} published no output within {waited:?}")]
    MirrorTimeout {
        source_display: DisplayId,
        waited: Duration,
    },

    /// The mirror source could not produce an output buffer this frame
    #[error("mirror source {0} has no output buffer for this frame")]
    MirrorUnavailable(DisplayId),

    /// A session-mode request that cannot be honored
    #[error("display {display} cannot mirror {source_display}: {reason}")]
    InvalidMirror {
        display: DisplayId,
        source_display: DisplayId,
        reason: &'static str,
    },

    /// A virtual display was finalized without an output buffer
    #[error("virtual display {0} has no output buffer")]
    MissingOutputBuffer(DisplayId),

    /// The dispatch worker thread is gone
    #[error("dispatch worker of display {0} has stopped")]
    WorkerStopped(DisplayId),

    /// The OS refused to start the dispatch worker thread
    #[error("failed to spawn dispatch worker for display {display}: {error}")]
    WorkerSpawn {
        display: DisplayId,
        error: std::io::Error,
    },
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Aborts on a broken model invariant.
///
/// Continuing after one of these would program the hardware with a
/// corrupted layer configuration on the next frame.
#[track_caller]
pub(crate) fn invariant_violation(args: std::fmt::Arguments<'_>) -> ! {
    log::error!("💥 invariant violation: {}", args);
    panic!("invariant violation: {}", args);
}
